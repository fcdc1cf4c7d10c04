/* Health monitor (§4.5): a single long-lived task ticking at `health_check_interval`, pinging
 * every ONLINE device through a bounded worker pool sized per the REDESIGN FLAG in §9. */
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::ctx::Ctx;
use crate::domain::{DeviceStatus, HealthSample};
use crate::driver::DriverHandle;
use crate::registry::DriverRegistry;
use crate::store::{DeviceStore, HealthStore};

const MAX_WORKERS: usize = 32;
const TICK_BUDGET: Duration = Duration::from_secs(30);

pub struct HealthMonitor {
    devices: Arc<dyn DeviceStore>,
    health: Arc<dyn HealthStore>,
    registry: Arc<DriverRegistry>,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(devices: Arc<dyn DeviceStore>, health: Arc<dyn HealthStore>, registry: Arc<DriverRegistry>) -> Self {
        Self {
            devices,
            health,
            registry,
            interval: Duration::from_secs(10),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Spawn the ticking loop; returns a handle the caller can abort on shutdown.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                self.run_tick().await;
            }
        })
    }

    async fn run_tick(&self) {
        let online = match self.devices.list_by_status(DeviceStatus::Online).await {
            Ok(devices) => devices,
            Err(e) => {
                warn!("health monitor failed to list online devices: {e}");
                return;
            }
        };
        if online.is_empty() {
            return;
        }

        let pool_size = online.len().min(MAX_WORKERS).max(1);
        let semaphore = Arc::new(Semaphore::new(pool_size));
        let ctx = Ctx::background().with_timeout(TICK_BUDGET);

        let mut tasks = Vec::with_capacity(online.len());
        for device in online {
            let permit = semaphore.clone().acquire_owned().await;
            let Ok(permit) = permit else { continue };
            let devices = self.devices.clone();
            let health = self.health.clone();
            let registry = self.registry.clone();
            let ctx = ctx.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = permit;
                ping_one(devices, health, registry, ctx, device.id, &device.brand, device.device_type, &device.model, &device.connection_config).await
            }));
        }

        for task in tasks {
            if let Err(e) = task.await {
                warn!("health check worker panicked: {e}");
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn ping_one(
    devices: Arc<dyn DeviceStore>,
    health: Arc<dyn HealthStore>,
    registry: Arc<DriverRegistry>,
    ctx: Ctx,
    device_id: uuid::Uuid,
    brand: &str,
    device_type: crate::domain::DeviceType,
    model: &str,
    connection_config: &std::collections::HashMap<String, String>,
) {
    let Some(factory_driver) = registry.resolve(brand, device_type, model) else {
        warn!("health monitor: no driver registered for device {device_id}");
        return;
    };
    let handle = DriverHandle::new(factory_driver);

    let device = crate::domain::Device {
        id: device_id,
        external_id: String::new(),
        device_type,
        brand: brand.to_string(),
        model: model.to_string(),
        firmware: None,
        connection_type: crate::domain::ConnectionType::Tcp,
        connection_config: connection_config.clone(),
        capabilities: Default::default(),
        status: DeviceStatus::Online,
        last_ping: None,
        error_info: None,
        performance_metrics: Default::default(),
    };

    let started = std::time::Instant::now();
    let outcome = async {
        handle.connect(&ctx, &device).await?;
        let result = handle.ping(&ctx).await;
        let _ = handle.disconnect(&ctx).await;
        result
    }
    .await;
    let elapsed = started.elapsed();

    match outcome {
        Ok(()) => {
            if let Err(e) = devices.update_last_ping(device_id, Utc::now()).await {
                warn!("failed to record last_ping for {device_id}: {e}");
            }
            let sample = HealthSample {
                device_id,
                health_score: 100,
                response_time_ms: elapsed.as_millis() as u64,
                error_rate: 0.0,
                uptime: 1.0,
                recorded_at: Utc::now(),
            };
            if let Err(e) = health.record_sample(sample).await {
                warn!("failed to record health sample for {device_id}: {e}");
            }
            debug!("health check ok for {device_id} in {elapsed:?}");
        }
        Err(e) => {
            warn!("health check failed for {device_id}: {e}");
            if let Err(store_err) = devices.update_status(device_id, DeviceStatus::Error).await {
                warn!("failed to mark {device_id} ERROR after failed ping: {store_err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Capability, ConnectionType, Device, DeviceType, Operation};
    use crate::driver::{ConnectionState, DeviceDriver, DeviceInfoSnapshot, DriverFactory, EventHandler};
    use crate::error::Result;
    use crate::store::memory::{InMemoryDeviceStore, InMemoryHealthStore};
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};

    struct FlakyDriver {
        state: ConnectionState,
        fail_ping: bool,
    }

    #[async_trait]
    impl DeviceDriver for FlakyDriver {
        fn name(&self) -> &str {
            "flaky"
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
        async fn execute_operation(&self, _ctx: &Ctx, _op: &Operation) -> Result<serde_json::Value> {
            Ok(serde_json::Value::Null)
        }
        async fn ping(&self, _ctx: &Ctx) -> Result<()> {
            if self.fail_ping {
                Err(crate::error::CoreError::Timeout)
            } else {
                Ok(())
            }
        }
        async fn configure(&mut self, _ctx: &Ctx, _settings: &HashMap<String, String>) -> Result<()> {
            Ok(())
        }
        async fn reset(&mut self, _ctx: &Ctx) -> Result<()> {
            Ok(())
        }
        fn set_event_handler(&mut self, _handler: Arc<dyn EventHandler>) {}
    }

    struct FlakyFactory {
        fail_ping: bool,
    }
    impl DriverFactory for FlakyFactory {
        fn create(&self) -> Box<dyn DeviceDriver> {
            Box::new(FlakyDriver {
                state: ConnectionState::Disconnected,
                fail_ping: self.fail_ping,
            })
        }
    }

    #[tokio::test]
    async fn successful_ping_records_sample_and_last_ping() {
        let devices: Arc<dyn DeviceStore> = Arc::new(InMemoryDeviceStore::new());
        let health: Arc<dyn HealthStore> = Arc::new(InMemoryHealthStore::new());
        let registry = Arc::new(DriverRegistry::new());
        registry.register(
            "EPSON",
            DeviceType::Printer,
            crate::domain::MODEL_WILDCARD,
            Arc::new(FlakyFactory { fail_ping: false }),
        );

        let device = Device {
            id: uuid::Uuid::new_v4(),
            external_id: "E1".into(),
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

        let monitor = HealthMonitor::new(devices.clone(), health.clone(), registry);
        monitor.run_tick().await;

        let updated = devices.get_by_id(device.id).await.unwrap().unwrap();
        assert!(updated.last_ping.is_some());
        let samples = health.get_samples(device.id, 10).await.unwrap();
        assert_eq!(samples.len(), 1);
    }

    #[tokio::test]
    async fn failed_ping_marks_device_error() {
        let devices: Arc<dyn DeviceStore> = Arc::new(InMemoryDeviceStore::new());
        let health: Arc<dyn HealthStore> = Arc::new(InMemoryHealthStore::new());
        let registry = Arc::new(DriverRegistry::new());
        registry.register(
            "EPSON",
            DeviceType::Printer,
            crate::domain::MODEL_WILDCARD,
            Arc::new(FlakyFactory { fail_ping: true }),
        );

        let device = Device {
            id: uuid::Uuid::new_v4(),
            external_id: "E2".into(),
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

        let monitor = HealthMonitor::new(devices.clone(), health, registry);
        monitor.run_tick().await;

        let updated = devices.get_by_id(device.id).await.unwrap().unwrap();
        assert_eq!(updated.status, DeviceStatus::Error);
    }
}
