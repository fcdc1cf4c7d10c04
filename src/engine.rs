/* Operation lifecycle engine (§4.4): Execute/Cancel/Get/List against the PENDING -> PROCESSING
 * -> terminal state machine, with per-type deadlines and a panic boundary around driver I/O. */
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::ctx::Ctx;
use crate::domain::{
    Device, DeviceStatus, Operation, OperationFilter, OperationRequest, OperationResponse, OperationStatus, OperationType,
};
use crate::driver::DriverHandle;
use crate::error::{CoreError, Result};
use crate::registry::DriverRegistry;
use crate::store::{DeviceStore, OperationStore};

fn timeout_for(op_type: OperationType, default_timeout: Duration) -> Duration {
    match op_type {
        OperationType::Payment => Duration::from_secs(60),
        OperationType::Print | OperationType::Scan => Duration::from_secs(30),
        _ => default_timeout,
    }
}

/// Ties a device record to its live [`DriverHandle`] for the duration of one
/// operation. Per §3, driver instances are transient and engine-owned — the
/// engine resolves a fresh one per call rather than caching across operations,
/// since the registry may be reconfigured and devices may change transport.
pub struct Engine {
    devices: Arc<dyn DeviceStore>,
    operations: Arc<dyn OperationStore>,
    registry: Arc<DriverRegistry>,
    default_timeout: Duration,
    /// Cancellation handle for every in-flight operation, keyed by operation
    /// id. Registered for the full lifetime of `execute()` (§4.4 `Cancel`
    /// must actually interrupt in-flight driver I/O, not just flip the
    /// stored status) and removed once the operation reaches a terminal
    /// state.
    cancellations: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl Engine {
    pub fn new(devices: Arc<dyn DeviceStore>, operations: Arc<dyn OperationStore>, registry: Arc<DriverRegistry>) -> Self {
        Self {
            devices,
            operations,
            registry,
            default_timeout: Duration::from_secs(15),
            cancellations: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// §4.4 `Execute`: the seven-step flow from request to terminal response.
    pub async fn execute(&self, parent: &Ctx, request: OperationRequest) -> Result<OperationResponse> {
        let now = Utc::now();
        let mut op = Operation::new(request, now);
        op = self.operations.create(op).await?;
        self.cancellations.lock().unwrap().insert(op.id, parent.token());

        let device = match self.devices.get_by_id(op.device_id).await? {
            Some(d) => d,
            None => return self.finalize_failed(op, "device not found").await,
        };

        if device.status != DeviceStatus::Online {
            return self.finalize_failed(op, "device not online").await;
        }

        let driver = match self.registry.resolve(&device.brand, device.device_type, &device.model) {
            Some(d) => Arc::new(DriverHandle::new(d)),
            None => return self.finalize_failed(op, "unsupported device").await,
        };

        op.status = OperationStatus::Processing;
        op.started_at = Some(Utc::now());
        op = self.operations.update(op).await?;

        let deadline = timeout_for(op.op_type, self.default_timeout);
        let ctx = parent.with_timeout(deadline);

        let connect_result = driver.connect(&ctx, &device).await;
        let outcome = match connect_result {
            Ok(()) => self.run_with_panic_boundary(driver.clone(), &ctx, op.clone()).await,
            Err(e) => Err(e),
        };
        let _ = driver.disconnect(&ctx).await;

        let finished = self.settle(op, outcome).await?;

        if finished.op_type == OperationType::Payment {
            info!(
                operation_id = %finished.id,
                device_id = %finished.device_id,
                status = ?finished.status,
                "payment audit trail"
            );
        }

        Ok(to_response(&finished))
    }

    /// Runs `driver.execute_operation` on a spawned task so a panic inside
    /// driver code surfaces as a `JoinError` instead of taking the engine
    /// down with it (§7 "Panics in driver code must be caught at the engine
    /// boundary").
    async fn run_with_panic_boundary(&self, driver: Arc<DriverHandle>, ctx: &Ctx, op: Operation) -> Result<serde_json::Value> {
        let task_ctx = ctx.clone();
        let handle = tokio::spawn(async move { driver.execute_operation(&task_ctx, &op).await });

        ctx.run(async move {
            match handle.await {
                Ok(result) => result,
                Err(join_err) if join_err.is_panic() => Err(CoreError::Transport {
                    device: "driver".to_string(),
                    source: std::io::Error::other(format!("driver panicked: {join_err}")),
                }),
                Err(_join_err) => Err(CoreError::Cancelled),
            }
        })
        .await
    }

    async fn settle(&self, mut op: Operation, outcome: Result<serde_json::Value>) -> Result<Operation> {
        let completed_at = Utc::now();
        let duration_ms = op
            .started_at
            .map(|s| (completed_at - s).num_milliseconds().max(0) as u64)
            .unwrap_or(0);

        op.completed_at = Some(completed_at);
        op.duration_ms = Some(duration_ms);

        match outcome {
            Ok(result) => {
                op.status = OperationStatus::Success;
                op.result = Some(result);
            }
            Err(CoreError::Cancelled) => {
                op.status = OperationStatus::Cancelled;
                op.error_code = Some(CoreError::Cancelled.code().to_string());
                op.error_message = Some("operation cancelled".to_string());
            }
            Err(CoreError::Timeout) => {
                op.status = OperationStatus::Timeout;
                op.error_code = Some(CoreError::Timeout.code().to_string());
                op.error_message = Some("operation exceeded its deadline".to_string());
            }
            Err(e) => {
                op.status = OperationStatus::Failed;
                op.error_code = Some(e.code().to_string());
                op.error_message = Some(e.to_string());
            }
        }

        self.cancellations.lock().unwrap().remove(&op.id);

        // A concurrent cancel() may have already written CANCELLED while this
        // operation was still running; don't let a late success/failure
        // clobber it (§4.4 P2 terminal states are monotonic).
        match self.operations.update_if_not_terminal(op.clone()).await {
            Ok(true) => {}
            Ok(false) => {
                if let Ok(Some(stored)) = self.operations.get_by_id(op.id).await {
                    op = stored;
                }
            }
            Err(store_err) => {
                // Store writes in error paths are best-effort (§7): log, don't re-raise.
                warn!("failed to persist terminal operation state: {store_err}");
            }
        }

        if op.status == OperationStatus::Success || op.status == OperationStatus::Failed {
            self.record_health_metrics(&op, completed_at).await;
        }

        Ok(op)
    }

    async fn record_health_metrics(&self, op: &Operation, completed_at: chrono::DateTime<Utc>) {
        let duration = op.duration_ms.map(Duration::from_millis).unwrap_or_default();
        let mut device = match self.devices.get_by_id(op.device_id).await {
            Ok(Some(d)) => d,
            Ok(None) => return,
            Err(e) => {
                warn!("failed to load device {} to record health metrics: {e}", op.device_id);
                return;
            }
        };
        device
            .performance_metrics
            .record(op.status == OperationStatus::Success, duration, completed_at);
        if let Err(e) = self.devices.update(device).await {
            warn!("failed to persist health metrics for device {}: {e}", op.device_id);
        }
    }

    async fn finalize_failed(&self, mut op: Operation, reason: &str) -> Result<OperationResponse> {
        op.status = OperationStatus::Failed;
        op.completed_at = Some(Utc::now());
        op.duration_ms = Some(0);
        op.error_code = Some(if reason.contains("not online") {
            CoreError::DeviceNotOnline.code().to_string()
        } else {
            "UNSUPPORTED_DEVICE".to_string()
        });
        op.error_message = Some(reason.to_string());
        self.cancellations.lock().unwrap().remove(&op.id);
        if let Err(e) = self.operations.update(op.clone()).await {
            warn!("failed to persist failed operation state: {e}");
        }
        Ok(to_response(&op))
    }

    /// §4.4 `Cancel`: only PENDING/PROCESSING may transition; terminal
    /// statuses reject with `InvalidTransition`.
    pub async fn cancel(&self, id: Uuid, reason: &str) -> Result<()> {
        let Some(mut op) = self.operations.get_by_id(id).await? else {
            return Err(CoreError::InvalidArgument(format!("unknown operation {id}")));
        };
        if op.status.is_terminal() {
            return Err(CoreError::InvalidTransition(format!(
                "cannot cancel operation {id} in terminal state {:?}",
                op.status
            )));
        }
        op.status = OperationStatus::Cancelled;
        op.error_code = Some(CoreError::Cancelled.code().to_string());
        op.error_message = Some(reason.to_string());
        op.completed_at = Some(Utc::now());

        // Flip the stored record only if `settle()` hasn't already finished
        // and written a terminal state first — otherwise we'd resurrect a
        // finished operation as CANCELLED (§4.4 P2).
        if !self.operations.update_if_not_terminal(op).await? {
            return Err(CoreError::InvalidTransition(format!(
                "cannot cancel operation {id}: already settled"
            )));
        }

        // Interrupt whatever in-flight transport I/O is still running.
        if let Some(token) = self.cancellations.lock().unwrap().get(&id) {
            token.cancel();
        }
        Ok(())
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<Operation>> {
        self.operations.get_by_id(id).await
    }

    pub async fn list(&self, filter: OperationFilter) -> Result<(Vec<Operation>, u64)> {
        self.operations.list(filter).await
    }
}

fn to_response(op: &Operation) -> OperationResponse {
    OperationResponse {
        operation_id: op.id,
        success: op.status == OperationStatus::Success,
        error_code: op.error_code.clone(),
        error_message: op.error_message.clone(),
        duration_ms: op.duration_ms.unwrap_or(0),
        timestamp: op.completed_at.unwrap_or_else(Utc::now),
        result: op.result.clone(),
    }
}
