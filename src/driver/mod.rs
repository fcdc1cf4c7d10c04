/* Driver framework (§4.3): the DeviceDriver trait every protocol implementation satisfies,
 * the per-driver concurrency wrapper, and the event-notification hooks the engine wires up. */
pub mod escpos;

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::ctx::Ctx;
use crate::domain::{Capability, Device, DeviceStatus, Operation};
use crate::error::{CoreError, Result};

/// Connection lifecycle a driver's internal transport moves through.
/// `Connect` only ever leaves a driver in `Connected` or `Disconnected`
/// (§4.3): a failed connect attempt resets to `Disconnected` rather than
/// leaving the driver stuck mid-handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Metadata a driver can read back from the physical device once connected.
#[derive(Debug, Clone, Default)]
pub struct DeviceInfoSnapshot {
    pub firmware: Option<String>,
    pub serial_number: Option<String>,
}

/// Notification hooks the engine and health monitor register against a
/// driver so callers can react to state changes without polling.
///
/// All methods have no-op defaults; implementors override only what they
/// need.
pub trait EventHandler: Send + Sync {
    fn on_connected(&self, _device_id: Uuid) {}
    fn on_disconnected(&self, _device_id: Uuid) {}
    fn on_status_changed(&self, _device_id: Uuid, _status: DeviceStatus) {}
    fn on_operation_complete(&self, _device_id: Uuid, _operation_id: Uuid, _success: bool) {}
    fn on_error(&self, _device_id: Uuid, _error: &CoreError) {}
}

/// The protocol-specific behavior every driver implements (§4.3).
///
/// A driver owns exactly one device's transport. The engine never calls
/// these directly — it goes through [`DriverHandle`], which provides the
/// locking discipline described there.
#[async_trait]
pub trait DeviceDriver: Send + Sync {
    /// Driver identifier for logging (e.g. `"escpos"`).
    fn name(&self) -> &str;

    /// Open the transport and run whatever handshake the protocol requires.
    /// Idempotent: a connected driver returns `Ok(())` immediately.
    async fn connect(&mut self, ctx: &Ctx, device: &Device) -> Result<()>;

    /// Close the transport. Idempotent.
    async fn disconnect(&mut self, ctx: &Ctx) -> Result<()>;

    fn connection_state(&self) -> ConnectionState;

    fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Capabilities this driver actually implements, independent of what the
    /// device record claims — the engine intersects the two (§4.3 "Driver
    /// capability mismatch").
    fn capabilities(&self) -> HashSet<Capability>;

    /// Read firmware/serial metadata from the live device, when supported.
    /// Takes `&self` (§5 "observers take the read lock") — implementors put
    /// their transport handle behind interior mutability.
    async fn device_info(&self, ctx: &Ctx) -> Result<DeviceInfoSnapshot>;

    /// Query live device status beyond the cached `DeviceStatus` (§4.3
    /// "GetStatus"). Drivers that cannot probe this return the last known
    /// connection state. Takes `&self` (§5 observer).
    async fn status(&self, ctx: &Ctx) -> Result<DeviceStatus>;

    /// Run one operation against the device and return its JSON result
    /// payload (§4.3 "ExecuteOperation"). Returns
    /// `CoreError::UnsupportedOperation` for operation types this driver
    /// does not implement. Takes `&self`: per §5, `ExecuteOperation` runs
    /// under the read lock alongside status/capability queries, not the
    /// write lock.
    async fn execute_operation(&self, ctx: &Ctx, op: &Operation) -> Result<Value>;

    /// Transport-level liveness probe, independent of a full operation.
    /// Takes `&self` (§5 observer).
    async fn ping(&self, ctx: &Ctx) -> Result<()>;

    /// Apply a configuration change (e.g. print density, cash-drawer pulse
    /// width) without a full reconnect.
    async fn configure(&mut self, ctx: &Ctx, settings: &HashMap<String, String>) -> Result<()>;

    /// Reset the device to its power-on defaults.
    async fn reset(&mut self, ctx: &Ctx) -> Result<()>;

    /// Install the handler the driver should notify of state changes it
    /// detects on its own (e.g. an unsolicited status byte).
    fn set_event_handler(&mut self, handler: Arc<dyn EventHandler>);
}

/// Constructs a fresh [`DeviceDriver`] instance for one registry slot.
/// Registered once per `(brand, device_type, model)` key; invoked every
/// time that key resolves, since each device gets its own driver instance.
pub trait DriverFactory: Send + Sync {
    fn create(&self) -> Box<dyn DeviceDriver>;
}

/// Per-device concurrency wrapper around a boxed [`DeviceDriver`] (§5).
///
/// `state` is a reader/writer lock: `IsConnected`/`GetStatus`/capability
/// queries and `ExecuteOperation` all take the *read* lock (so a status
/// query never blocks behind an in-flight operation, and multiple
/// observers run concurrently), while `Connect`/`Disconnect`/`Configure`/
/// `Reset` take the write lock, since those mutate the driver's transport
/// state directly. `op_lock` is acquired for the full duration of
/// `execute_operation` *before* the read lock, so operations queued
/// against the same device still run strictly one at a time, in
/// submission order, rather than relying on the read lock's own
/// (unspecified) fairness.
pub struct DriverHandle {
    state: RwLock<Box<dyn DeviceDriver>>,
    op_lock: Mutex<()>,
}

impl DriverHandle {
    pub fn new(driver: Box<dyn DeviceDriver>) -> Self {
        Self {
            state: RwLock::new(driver),
            op_lock: Mutex::new(()),
        }
    }

    pub async fn connect(&self, ctx: &Ctx, device: &Device) -> Result<()> {
        let mut guard = self.state.write().await;
        guard.connect(ctx, device).await
    }

    pub async fn disconnect(&self, ctx: &Ctx) -> Result<()> {
        let mut guard = self.state.write().await;
        guard.disconnect(ctx).await
    }

    pub async fn is_connected(&self) -> bool {
        let guard = self.state.read().await;
        guard.is_connected()
    }

    pub async fn capabilities(&self) -> HashSet<Capability> {
        let guard = self.state.read().await;
        guard.capabilities()
    }

    pub async fn status(&self, ctx: &Ctx) -> Result<DeviceStatus> {
        let guard = self.state.read().await;
        guard.status(ctx).await
    }

    pub async fn ping(&self, ctx: &Ctx) -> Result<()> {
        let guard = self.state.read().await;
        guard.ping(ctx).await
    }

    pub async fn configure(&self, ctx: &Ctx, settings: &HashMap<String, String>) -> Result<()> {
        let mut guard = self.state.write().await;
        guard.configure(ctx, settings).await
    }

    pub async fn reset(&self, ctx: &Ctx) -> Result<()> {
        let mut guard = self.state.write().await;
        guard.reset(ctx).await
    }

    pub async fn set_event_handler(&self, handler: Arc<dyn EventHandler>) {
        let mut guard = self.state.write().await;
        guard.set_event_handler(handler);
    }

    /// Run `op` against the device, serialized against any other operation
    /// in flight on this same driver (see struct docs).
    pub async fn execute_operation(&self, ctx: &Ctx, op: &Operation) -> Result<Value> {
        let _op_guard = self.op_lock.lock().await;
        let guard = self.state.read().await;
        guard.execute_operation(ctx, op).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::escpos::EscPosDriver;
    use crate::domain::{ConnectionType, OperationRequest, OperationType, PRIORITY_HIGH};
    use std::collections::HashMap as Map;

    fn sample_device() -> Device {
        let mut config = Map::new();
        config.insert("host".to_string(), "127.0.0.1".to_string());
        Device {
            id: Uuid::new_v4(),
            external_id: "POS-1".into(),
            device_type: crate::domain::DeviceType::Printer,
            brand: "EPSON".into(),
            model: "TM-T88V".into(),
            firmware: None,
            connection_type: ConnectionType::Tcp,
            connection_config: config,
            capabilities: HashSet::new(),
            status: DeviceStatus::Offline,
            last_ping: None,
            error_info: None,
            performance_metrics: Default::default(),
        }
    }

    #[tokio::test]
    async fn execute_operation_is_unsupported_before_connect() {
        let handle = DriverHandle::new(Box::new(EscPosDriver::new()));
        let ctx = Ctx::background();
        let req = OperationRequest {
            device_id: Uuid::new_v4(),
            op_type: OperationType::StatusCheck,
            data: Value::Null,
            priority: PRIORITY_HIGH,
            correlation_id: None,
        };
        let op = Operation::new(req, chrono::Utc::now());
        assert!(matches!(
            handle.execute_operation(&ctx, &op).await,
            Err(CoreError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn capabilities_readable_without_connecting() {
        let handle = DriverHandle::new(Box::new(EscPosDriver::new()));
        assert!(handle.capabilities().await.contains(&Capability::Print));
    }

    #[test]
    fn sample_device_builds() {
        let d = sample_device();
        assert_eq!(d.brand, "EPSON");
    }
}
