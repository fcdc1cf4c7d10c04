/* Store ports (§6): DeviceStore/OperationStore/OfflineStore/HealthStore are external
 * collaborators in the original scope; this module defines the ports plus in-memory
 * implementations used by tests and the demo binary — not a production persistence layer. */
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::domain::{Device, DeviceStatus, HealthSample, OfflineOperation, Operation, OperationFilter, OperationStatus, SyncStatus};
use crate::error::Result;

#[async_trait]
pub trait DeviceStore: Send + Sync {
    async fn create(&self, device: Device) -> Result<Device>;
    async fn update(&self, device: Device) -> Result<Device>;
    async fn update_status(&self, id: Uuid, status: DeviceStatus) -> Result<()>;
    async fn update_last_ping(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Device>>;
    async fn get_by_external_id(&self, external_id: &str) -> Result<Option<Device>>;
    async fn list_by_status(&self, status: DeviceStatus) -> Result<Vec<Device>>;
    async fn list(&self) -> Result<Vec<Device>>;
    async fn delete(&self, id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait OperationStore: Send + Sync {
    async fn create(&self, op: Operation) -> Result<Operation>;
    async fn update(&self, op: Operation) -> Result<Operation>;
    /// Persist `op` unless the currently stored record is already terminal
    /// (§4.4 P2: terminal states are monotonic). Returns `Ok(false)` without
    /// writing when the existing record has already settled — used to keep a
    /// late-finishing `execute()` from clobbering a concurrent `cancel()`.
    async fn update_if_not_terminal(&self, op: Operation) -> Result<bool>;
    async fn update_status(&self, id: Uuid, status: OperationStatus) -> Result<()>;
    async fn get_by_id(&self, id: Uuid) -> Result<Option<Operation>>;
    async fn list(&self, filter: OperationFilter) -> Result<(Vec<Operation>, u64)>;
    async fn delete_old_operations(&self, before: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait OfflineStore: Send + Sync {
    async fn enqueue(&self, entry: OfflineOperation) -> Result<OfflineOperation>;
    /// Oldest-first entries for one device, capped at `limit`.
    async fn dequeue(&self, device_id: Uuid, limit: usize) -> Result<Vec<OfflineOperation>>;
    /// All pending entries across every device with `sync_attempts < max_attempts`,
    /// ordered `(priority ASC, created_at ASC)` within each device (§4.6).
    async fn get_pending_operations(&self, max_attempts: u32) -> Result<Vec<OfflineOperation>>;
    async fn mark_synced(&self, id: Uuid) -> Result<()>;
    async fn mark_failed(&self, id: Uuid, attempts: u32) -> Result<()>;
    /// Delete entries past their own `expires_at` OR older than
    /// `retention_cutoff` by `created_at` (§4.7) — the two conditions are
    /// independent, not substitutes for each other.
    async fn delete_expired(&self, now: DateTime<Utc>, retention_cutoff: DateTime<Utc>) -> Result<u64>;
    async fn get_queue_size(&self, device_id: Uuid) -> Result<usize>;
    async fn clear_queue(&self, device_id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait HealthStore: Send + Sync {
    async fn record_sample(&self, sample: HealthSample) -> Result<()>;
    async fn get_samples(&self, device_id: Uuid, limit: usize) -> Result<Vec<HealthSample>>;
    async fn delete_older_than(&self, before: DateTime<Utc>) -> Result<u64>;
}

pub mod memory {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct InMemoryDeviceStore {
        devices: Mutex<HashMap<Uuid, Device>>,
    }

    impl InMemoryDeviceStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl DeviceStore for InMemoryDeviceStore {
        async fn create(&self, device: Device) -> Result<Device> {
            let mut guard = self.devices.lock().unwrap();
            guard.insert(device.id, device.clone());
            Ok(device)
        }

        async fn update(&self, device: Device) -> Result<Device> {
            let mut guard = self.devices.lock().unwrap();
            guard.insert(device.id, device.clone());
            Ok(device)
        }

        async fn update_status(&self, id: Uuid, status: DeviceStatus) -> Result<()> {
            let mut guard = self.devices.lock().unwrap();
            if let Some(d) = guard.get_mut(&id) {
                d.set_status(status);
            }
            Ok(())
        }

        async fn update_last_ping(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
            let mut guard = self.devices.lock().unwrap();
            if let Some(d) = guard.get_mut(&id) {
                d.last_ping = Some(at);
            }
            Ok(())
        }

        async fn get_by_id(&self, id: Uuid) -> Result<Option<Device>> {
            Ok(self.devices.lock().unwrap().get(&id).cloned())
        }

        async fn get_by_external_id(&self, external_id: &str) -> Result<Option<Device>> {
            Ok(self
                .devices
                .lock()
                .unwrap()
                .values()
                .find(|d| d.external_id == external_id)
                .cloned())
        }

        async fn list_by_status(&self, status: DeviceStatus) -> Result<Vec<Device>> {
            Ok(self
                .devices
                .lock()
                .unwrap()
                .values()
                .filter(|d| d.status == status)
                .cloned()
                .collect())
        }

        async fn list(&self) -> Result<Vec<Device>> {
            Ok(self.devices.lock().unwrap().values().cloned().collect())
        }

        async fn delete(&self, id: Uuid) -> Result<()> {
            self.devices.lock().unwrap().remove(&id);
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct InMemoryOperationStore {
        ops: Mutex<HashMap<Uuid, Operation>>,
    }

    impl InMemoryOperationStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    fn matches_filter(op: &Operation, filter: &OperationFilter) -> bool {
        if let Some(device_id) = filter.device_id {
            if op.device_id != device_id {
                return false;
            }
        }
        if let Some(op_type) = filter.op_type {
            if op.op_type != op_type {
                return false;
            }
        }
        if let Some(status) = filter.status {
            if op.status != status {
                return false;
            }
        }
        if let Some(priority) = filter.priority {
            if op.priority != priority {
                return false;
            }
        }
        if let Some(correlation_id) = &filter.correlation_id {
            if op.correlation_id.as_deref() != Some(correlation_id.as_str()) {
                return false;
            }
        }
        if let Some(start) = filter.start_date {
            if op.created_at < start {
                return false;
            }
        }
        if let Some(end) = filter.end_date {
            if op.created_at >= end {
                return false;
            }
        }
        true
    }

    #[async_trait]
    impl OperationStore for InMemoryOperationStore {
        async fn create(&self, op: Operation) -> Result<Operation> {
            let mut guard = self.ops.lock().unwrap();
            guard.insert(op.id, op.clone());
            Ok(op)
        }

        async fn update(&self, op: Operation) -> Result<Operation> {
            let mut guard = self.ops.lock().unwrap();
            guard.insert(op.id, op.clone());
            Ok(op)
        }

        async fn update_if_not_terminal(&self, op: Operation) -> Result<bool> {
            let mut guard = self.ops.lock().unwrap();
            let already_terminal = guard.get(&op.id).map(|existing| existing.status.is_terminal()).unwrap_or(false);
            if already_terminal {
                return Ok(false);
            }
            guard.insert(op.id, op);
            Ok(true)
        }

        async fn update_status(&self, id: Uuid, status: OperationStatus) -> Result<()> {
            let mut guard = self.ops.lock().unwrap();
            if let Some(op) = guard.get_mut(&id) {
                op.status = status;
            }
            Ok(())
        }

        async fn get_by_id(&self, id: Uuid) -> Result<Option<Operation>> {
            Ok(self.ops.lock().unwrap().get(&id).cloned())
        }

        async fn list(&self, filter: OperationFilter) -> Result<(Vec<Operation>, u64)> {
            let filter = filter.normalized();
            let guard = self.ops.lock().unwrap();
            let mut matched: Vec<Operation> = guard.values().filter(|op| matches_filter(op, &filter)).cloned().collect();
            matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            let total = matched.len() as u64;
            let start = ((filter.page.saturating_sub(1)) as usize) * filter.per_page as usize;
            let page = matched.into_iter().skip(start).take(filter.per_page as usize).collect();
            Ok((page, total))
        }

        async fn delete_old_operations(&self, before: DateTime<Utc>) -> Result<u64> {
            let mut guard = self.ops.lock().unwrap();
            let before_count = guard.len();
            guard.retain(|_, op| op.created_at >= before);
            Ok((before_count - guard.len()) as u64)
        }
    }

    #[derive(Default)]
    pub struct InMemoryOfflineStore {
        entries: Mutex<HashMap<Uuid, OfflineOperation>>,
    }

    impl InMemoryOfflineStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl OfflineStore for InMemoryOfflineStore {
        async fn enqueue(&self, entry: OfflineOperation) -> Result<OfflineOperation> {
            let mut guard = self.entries.lock().unwrap();
            guard.insert(entry.id, entry.clone());
            Ok(entry)
        }

        async fn dequeue(&self, device_id: Uuid, limit: usize) -> Result<Vec<OfflineOperation>> {
            let guard = self.entries.lock().unwrap();
            let mut matched: Vec<OfflineOperation> = guard
                .values()
                .filter(|e| e.device_id == device_id && e.sync_status == SyncStatus::Pending)
                .cloned()
                .collect();
            matched.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.created_at.cmp(&b.created_at)));
            matched.truncate(limit);
            Ok(matched)
        }

        async fn get_pending_operations(&self, max_attempts: u32) -> Result<Vec<OfflineOperation>> {
            let guard = self.entries.lock().unwrap();
            let mut matched: Vec<OfflineOperation> = guard
                .values()
                .filter(|e| e.sync_status == SyncStatus::Pending && e.sync_attempts < max_attempts)
                .cloned()
                .collect();
            matched.sort_by(|a, b| {
                a.device_id
                    .cmp(&b.device_id)
                    .then(a.priority.cmp(&b.priority))
                    .then(a.created_at.cmp(&b.created_at))
            });
            Ok(matched)
        }

        async fn mark_synced(&self, id: Uuid) -> Result<()> {
            let mut guard = self.entries.lock().unwrap();
            if let Some(e) = guard.get_mut(&id) {
                e.sync_status = SyncStatus::Synced;
                e.last_sync_attempt = Some(Utc::now());
            }
            Ok(())
        }

        async fn mark_failed(&self, id: Uuid, attempts: u32) -> Result<()> {
            let mut guard = self.entries.lock().unwrap();
            if let Some(e) = guard.get_mut(&id) {
                e.sync_attempts = attempts;
                e.last_sync_attempt = Some(Utc::now());
            }
            Ok(())
        }

        async fn delete_expired(&self, now: DateTime<Utc>, retention_cutoff: DateTime<Utc>) -> Result<u64> {
            let mut guard = self.entries.lock().unwrap();
            let before_count = guard.len();
            guard.retain(|_, e| {
                let past_expiry = e.expires_at.map(|exp| exp <= now).unwrap_or(false);
                let too_old = e.created_at < retention_cutoff;
                !(past_expiry || too_old)
            });
            Ok((before_count - guard.len()) as u64)
        }

        async fn get_queue_size(&self, device_id: Uuid) -> Result<usize> {
            Ok(self
                .entries
                .lock()
                .unwrap()
                .values()
                .filter(|e| e.device_id == device_id && e.sync_status == SyncStatus::Pending)
                .count())
        }

        async fn clear_queue(&self, device_id: Uuid) -> Result<()> {
            self.entries.lock().unwrap().retain(|_, e| e.device_id != device_id);
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct InMemoryHealthStore {
        samples: Mutex<Vec<HealthSample>>,
    }

    impl InMemoryHealthStore {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl HealthStore for InMemoryHealthStore {
        async fn record_sample(&self, sample: HealthSample) -> Result<()> {
            self.samples.lock().unwrap().push(sample);
            Ok(())
        }

        async fn get_samples(&self, device_id: Uuid, limit: usize) -> Result<Vec<HealthSample>> {
            let guard = self.samples.lock().unwrap();
            Ok(guard
                .iter()
                .rev()
                .filter(|s| s.device_id == device_id)
                .take(limit)
                .cloned()
                .collect())
        }

        async fn delete_older_than(&self, before: DateTime<Utc>) -> Result<u64> {
            let mut guard = self.samples.lock().unwrap();
            let before_count = guard.len();
            guard.retain(|s| s.recorded_at >= before);
            Ok((before_count - guard.len()) as u64)
        }
    }

}
