/* Offline queue (§4.6) and the hourly cleanup sweep (§4.7): operations submitted against an
 * unreachable device land here and get replayed through the engine once it comes back online. */
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use crate::ctx::Ctx;
use crate::domain::{DeviceStatus, OfflineOperation};
use crate::engine::Engine;
use crate::store::{DeviceStore, HealthStore, OfflineStore, OperationStore};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;
const OPERATION_RETENTION_DAYS: i64 = 30;
const OFFLINE_RETENTION_DAYS: i64 = 7;
const HEALTH_SAMPLE_RETENTION_DAYS: i64 = 90;

/// Replays queued operations against the engine once their device is back
/// online, and runs the hourly retention sweep across operations/offline
/// entries/health samples (§4.7).
pub struct OfflineSync {
    devices: Arc<dyn DeviceStore>,
    offline: Arc<dyn OfflineStore>,
    operations: Arc<dyn OperationStore>,
    health: Arc<dyn HealthStore>,
    engine: Arc<Engine>,
    sync_interval: Duration,
    max_attempts: u32,
}

impl OfflineSync {
    pub fn new(
        devices: Arc<dyn DeviceStore>,
        offline: Arc<dyn OfflineStore>,
        operations: Arc<dyn OperationStore>,
        health: Arc<dyn HealthStore>,
        engine: Arc<Engine>,
    ) -> Self {
        Self {
            devices,
            offline,
            operations,
            health,
            engine,
            sync_interval: Duration::from_secs(30),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Spawn the sync loop; returns a handle the caller can abort on shutdown.
    pub fn spawn_sync_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.sync_interval);
            loop {
                ticker.tick().await;
                self.run_sync_tick().await;
            }
        })
    }

    /// Spawn the hourly cleanup loop.
    pub fn spawn_cleanup_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(3600));
            loop {
                ticker.tick().await;
                self.run_cleanup_tick().await;
            }
        })
    }

    /// One sync pass: fetch all pending entries ordered `(device, priority
    /// ASC, created_at ASC)` (§4.6), then dispatch per device sequentially so
    /// FIFO-within-device is preserved while different devices replay
    /// concurrently.
    async fn run_sync_tick(&self) {
        let pending = match self.offline.get_pending_operations(self.max_attempts).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("offline sync failed to list pending entries: {e}");
                return;
            }
        };
        if pending.is_empty() {
            return;
        }

        let mut by_device: std::collections::HashMap<uuid::Uuid, Vec<OfflineOperation>> = std::collections::HashMap::new();
        for entry in pending {
            by_device.entry(entry.device_id).or_default().push(entry);
        }

        let mut tasks = Vec::with_capacity(by_device.len());
        for (device_id, entries) in by_device {
            let devices = self.devices.clone();
            let offline = self.offline.clone();
            let engine = self.engine.clone();
            let max_attempts = self.max_attempts;
            tasks.push(tokio::spawn(async move {
                sync_device_queue(devices, offline, engine, device_id, entries, max_attempts).await;
            }));
        }
        for task in tasks {
            if let Err(e) = task.await {
                warn!("offline sync worker panicked: {e}");
            }
        }
    }

    async fn run_cleanup_tick(&self) {
        let now = Utc::now();

        let op_cutoff = now - chrono::Duration::days(OPERATION_RETENTION_DAYS);
        match self.operations.delete_old_operations(op_cutoff).await {
            Ok(n) if n > 0 => info!("cleanup: deleted {n} operations older than {OPERATION_RETENTION_DAYS} days"),
            Ok(_) => {}
            Err(e) => warn!("cleanup: failed to delete old operations: {e}"),
        }

        // §4.7: offline entries older than 7 days OR past their own expires_at.
        let offline_cutoff = now - chrono::Duration::days(OFFLINE_RETENTION_DAYS);
        match self.offline.delete_expired(now, offline_cutoff).await {
            Ok(n) if n > 0 => info!("cleanup: deleted {n} offline entries past retention/expiry"),
            Ok(_) => {}
            Err(e) => warn!("cleanup: failed to delete expired offline entries: {e}"),
        }

        let health_cutoff = now - chrono::Duration::days(HEALTH_SAMPLE_RETENTION_DAYS);
        match self.health.delete_older_than(health_cutoff).await {
            Ok(n) if n > 0 => info!("cleanup: deleted {n} health samples older than {HEALTH_SAMPLE_RETENTION_DAYS} days"),
            Ok(_) => {}
            Err(e) => warn!("cleanup: failed to delete old health samples: {e}"),
        }
    }
}

async fn sync_device_queue(
    devices: Arc<dyn DeviceStore>,
    offline: Arc<dyn OfflineStore>,
    engine: Arc<Engine>,
    device_id: uuid::Uuid,
    mut entries: Vec<OfflineOperation>,
    max_attempts: u32,
) {
    entries.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.created_at.cmp(&b.created_at)));

    let device = match devices.get_by_id(device_id).await {
        Ok(Some(d)) => d,
        Ok(None) => {
            warn!("offline sync: device {device_id} no longer exists, skipping its queue");
            return;
        }
        Err(e) => {
            warn!("offline sync: failed to load device {device_id}: {e}");
            return;
        }
    };
    if device.status != DeviceStatus::Online {
        return;
    }

    let ctx = Ctx::background();
    for entry in entries {
        let request = entry.as_request();
        match engine.execute(&ctx, request).await {
            Ok(response) if response.success => {
                if let Err(e) = offline.mark_synced(entry.id).await {
                    warn!("offline sync: failed to mark entry {} synced: {e}", entry.id);
                }
            }
            Ok(response) => {
                let attempts = entry.sync_attempts + 1;
                if let Err(e) = offline.mark_failed(entry.id, attempts).await {
                    warn!("offline sync: failed to record attempt for entry {}: {e}", entry.id);
                }
                warn!(
                    "offline sync: entry {} failed ({:?}), attempt {attempts}/{max_attempts}",
                    entry.id, response.error_code
                );
                // Stop replaying this device's queue once one entry fails to
                // preserve ordering: a later entry succeeding out of turn
                // would violate the FIFO guarantee (§4.6 / P6).
                break;
            }
            Err(e) => {
                warn!("offline sync: engine execute errored for entry {}: {e}", entry.id);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        Capability, ConnectionType, Device, DeviceType, OperationRequest, OperationType, PRIORITY_HIGH, PRIORITY_MAX,
    };
    use crate::driver::{ConnectionState, DeviceDriver, DeviceInfoSnapshot, DriverFactory, EventHandler};
    use crate::error::Result;
    use crate::registry::DriverRegistry;
    use crate::store::memory::{InMemoryDeviceStore, InMemoryHealthStore, InMemoryOfflineStore, InMemoryOperationStore};
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex as StdMutex;

    struct RecordingDriver {
        state: ConnectionState,
        seen: Arc<StdMutex<Vec<serde_json::Value>>>,
    }

    #[async_trait]
    impl DeviceDriver for RecordingDriver {
        fn name(&self) -> &str {
            "recording"
        }
        async fn connect(&mut self, _ctx: &Ctx, _device: &Device) -> Result<()> {
            self.state = ConnectionState::Connected;
            Ok(())
        }
        async fn disconnect(&mut self, _ctx: &Ctx) -> Result<()> {
            self.state = ConnectionState::Disconnected;
            Ok(())
        }
        fn connection_state(&self) -> ConnectionState {
            self.state
        }
        fn capabilities(&self) -> HashSet<Capability> {
            HashSet::new()
        }
        async fn device_info(&self, _ctx: &Ctx) -> Result<DeviceInfoSnapshot> {
            Ok(DeviceInfoSnapshot::default())
        }
        async fn status(&self, _ctx: &Ctx) -> Result<DeviceStatus> {
            Ok(DeviceStatus::Online)
        }
        async fn execute_operation(&self, _ctx: &Ctx, op: &crate::domain::Operation) -> Result<serde_json::Value> {
            self.seen.lock().unwrap().push(op.data.clone());
            Ok(serde_json::json!({ "ok": true }))
        }
        async fn ping(&self, _ctx: &Ctx) -> Result<()> {
            Ok(())
        }
        async fn configure(&mut self, _ctx: &Ctx, _settings: &HashMap<String, String>) -> Result<()> {
            Ok(())
        }
        async fn reset(&mut self, _ctx: &Ctx) -> Result<()> {
            Ok(())
        }
        fn set_event_handler(&mut self, _handler: Arc<dyn EventHandler>) {}
    }

    struct RecordingFactory {
        seen: Arc<StdMutex<Vec<serde_json::Value>>>,
    }
    impl DriverFactory for RecordingFactory {
        fn create(&self) -> Box<dyn DeviceDriver> {
            Box::new(RecordingDriver {
                state: ConnectionState::Disconnected,
                seen: self.seen.clone(),
            })
        }
    }

    #[tokio::test]
    async fn sync_replays_entries_in_fifo_order() {
        let devices: Arc<dyn DeviceStore> = Arc::new(InMemoryDeviceStore::new());
        let offline: Arc<dyn OfflineStore> = Arc::new(InMemoryOfflineStore::new());
        let operations: Arc<dyn OperationStore> = Arc::new(InMemoryOperationStore::new());
        let health: Arc<dyn HealthStore> = Arc::new(InMemoryHealthStore::new());
        let registry = Arc::new(DriverRegistry::new());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        registry.register(
            "EPSON",
            DeviceType::Printer,
            crate::domain::MODEL_WILDCARD,
            Arc::new(RecordingFactory { seen: seen.clone() }),
        );

        let device = Device {
            id: uuid::Uuid::new_v4(),
            external_id: "EXT-1".into(),
            device_type: DeviceType::Printer,
            brand: "EPSON".into(),
            model: "TM-T88V".into(),
            firmware: None,
            connection_type: ConnectionType::Tcp,
            connection_config: HashMap::new(),
            capabilities: HashSet::new(),
            status: DeviceStatus::Online,
            last_ping: None,
            error_info: None,
            performance_metrics: Default::default(),
        };
        devices.create(device.clone()).await.unwrap();

        let engine = Arc::new(Engine::new(devices.clone(), operations.clone(), registry));

        let base = Utc::now();
        let mk = |seq: u8, offset_ms: i64| {
            let req = OperationRequest {
                device_id: device.id,
                op_type: OperationType::Print,
                data: serde_json::json!({ "seq": seq }),
                priority: PRIORITY_MAX,
                correlation_id: None,
            };
            OfflineOperation::from_request(req, base + chrono::Duration::milliseconds(offset_ms), None)
        };
        offline.enqueue(mk(1, 0)).await.unwrap();
        offline.enqueue(mk(2, 1)).await.unwrap();
        offline.enqueue(mk(3, 2)).await.unwrap();

        let sync = OfflineSync::new(devices, offline, operations, health, engine);
        sync.run_sync_tick().await;

        let recorded = seen.lock().unwrap().clone();
        let seqs: Vec<u8> = recorded.iter().map(|v| v["seq"].as_u64().unwrap() as u8).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn sync_skips_offline_device() {
        let devices: Arc<dyn DeviceStore> = Arc::new(InMemoryDeviceStore::new());
        let offline: Arc<dyn OfflineStore> = Arc::new(InMemoryOfflineStore::new());
        let operations: Arc<dyn OperationStore> = Arc::new(InMemoryOperationStore::new());
        let health: Arc<dyn HealthStore> = Arc::new(InMemoryHealthStore::new());
        let registry = Arc::new(DriverRegistry::new());

        let device = Device {
            id: uuid::Uuid::new_v4(),
            external_id: "EXT-2".into(),
            device_type: DeviceType::Printer,
            brand: "EPSON".into(),
            model: "TM-T88V".into(),
            firmware: None,
            connection_type: ConnectionType::Tcp,
            connection_config: HashMap::new(),
            capabilities: HashSet::new(),
            status: DeviceStatus::Offline,
            last_ping: None,
            error_info: None,
            performance_metrics: Default::default(),
        };
        devices.create(device.clone()).await.unwrap();

        let req = OperationRequest {
            device_id: device.id,
            op_type: OperationType::Print,
            data: serde_json::Value::Null,
            priority: PRIORITY_HIGH,
            correlation_id: None,
        };
        let entry = OfflineOperation::from_request(req, Utc::now(), None);
        let entry_id = entry.id;
        offline.enqueue(entry).await.unwrap();

        let engine = Arc::new(Engine::new(devices.clone(), operations.clone(), registry));
        let sync = OfflineSync::new(devices, offline.clone(), operations, health, engine);
        sync.run_sync_tick().await;

        let size = offline.get_queue_size(device.id).await.unwrap();
        assert_eq!(size, 1, "entry for offline device must stay queued, not {entry_id}");
    }
}
