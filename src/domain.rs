/* Shared domain vocabulary: device/operation/offline-entry/health-sample records and the enums
 * that classify them. Plain data — no I/O, no locking; the engine and stores move these around. */
use std::collections::HashMap;
use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Brand name reserved for the generic/fallback driver tier (§4.2 dispatch order).
pub const GENERIC_BRAND: &str = "GENERIC";
/// Model wildcard used in registry keys to mean "any model of this brand/type".
pub const MODEL_WILDCARD: &str = "*";

/// Peripheral classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceType {
    Printer,
    Pos,
    Scanner,
    CashRegister,
    CashDrawer,
    Display,
}

/// Transport selector declared on the device record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionType {
    Serial,
    Usb,
    Tcp,
    Bluetooth,
}

/// A capability a device may declare and a driver may actually support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Capability {
    Print,
    Cut,
    Drawer,
    Display,
    Payment,
    Scan,
    Status,
    Beep,
    Logo,
    Barcode,
    Qr,
}

/// Runtime device state. Transitions only through the rules in §4.3 / `Device::set_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceStatus {
    Online,
    Offline,
    Error,
    Maintenance,
    Connecting,
}

/// Running health counters updated after every operation (§4.3 "Health metrics update").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_operations: u64,
    pub errors: u64,
    pub success_rate: f64,
    pub health_score: i32,
    pub last_success_time: Option<DateTime<Utc>>,
    pub last_error_time: Option<DateTime<Utc>>,
}

impl Default for PerformanceMetrics {
    fn default() -> Self {
        Self {
            total_operations: 0,
            errors: 0,
            success_rate: 1.0,
            health_score: 100,
            last_success_time: None,
            last_error_time: None,
        }
    }
}

impl PerformanceMetrics {
    /// Fold the outcome of one operation into the running counters.
    ///
    /// `health_score = floor(success_rate * 100) - (10 if response_time > 5s)`,
    /// clamped to `[0, 100]`.
    pub fn record(&mut self, success: bool, response_time: std::time::Duration, now: DateTime<Utc>) {
        self.total_operations += 1;
        if success {
            self.last_success_time = Some(now);
        } else {
            self.errors += 1;
            self.last_error_time = Some(now);
        }
        self.success_rate = (self.total_operations - self.errors) as f64 / self.total_operations as f64;

        let mut score = (self.success_rate * 100.0).floor() as i32;
        if response_time > std::time::Duration::from_secs(5) {
            score -= 10;
        }
        self.health_score = score.clamp(0, 100);
    }
}

/// A POS peripheral record, owned by `DeviceStore`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: Uuid,
    pub external_id: String,
    pub device_type: DeviceType,
    pub brand: String,
    pub model: String,
    pub firmware: Option<String>,
    pub connection_type: ConnectionType,
    pub connection_config: HashMap<String, String>,
    pub capabilities: HashSet<Capability>,
    pub status: DeviceStatus,
    pub last_ping: Option<DateTime<Utc>>,
    pub error_info: Option<String>,
    pub performance_metrics: PerformanceMetrics,
}

impl Device {
    /// Valid status transitions per §3 ("status transitions only through the
    /// state machine in §4.3"). We keep this permissive beyond the driver's
    /// own CONNECTED/DISCONNECTED machine: any status may move to any other
    /// except that a device cannot transition to its own current value being
    /// treated as a no-op change (still allowed, just inert).
    pub fn set_status(&mut self, new_status: DeviceStatus) {
        self.status = new_status;
    }
}

/// One discrete unit of work dispatched against a device (§3 Operation).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationType {
    Print,
    Cut,
    OpenDrawer,
    StatusCheck,
    Beep,
    Payment,
    Scan,
}

/// Lifecycle status. Monotonic: PENDING -> PROCESSING -> one terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OperationStatus {
    Pending,
    Processing,
    Success,
    Failed,
    Timeout,
    Cancelled,
}

impl OperationStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperationStatus::Success
                | OperationStatus::Failed
                | OperationStatus::Timeout
                | OperationStatus::Cancelled
        )
    }
}

/// Priority band. `1` is reserved for payment responses/emergency stops,
/// `2` for receipt printing/drawer, `3..=5` normal/low/background.
pub type Priority = u8;

pub const PRIORITY_CRITICAL: Priority = 1;
pub const PRIORITY_HIGH: Priority = 2;
pub const PRIORITY_MIN: Priority = 1;
pub const PRIORITY_MAX: Priority = 5;

/// Caller-submitted request to `Engine::execute`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    pub device_id: Uuid,
    pub op_type: OperationType,
    pub data: serde_json::Value,
    pub priority: Priority,
    pub correlation_id: Option<String>,
}

/// Stored operation record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: Uuid,
    pub device_id: Uuid,
    pub op_type: OperationType,
    pub data: serde_json::Value,
    pub priority: Priority,
    pub status: OperationStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub correlation_id: Option<String>,
    pub result: Option<serde_json::Value>,
}

impl Operation {
    pub fn new(req: OperationRequest, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: req.device_id,
            op_type: req.op_type,
            data: req.data,
            priority: req.priority.clamp(PRIORITY_MIN, PRIORITY_MAX),
            status: OperationStatus::Pending,
            created_at: now,
            started_at: None,
            completed_at: None,
            duration_ms: None,
            error_code: None,
            error_message: None,
            retry_count: 0,
            correlation_id: req.correlation_id,
            result: None,
        }
    }
}

/// Client-facing mirror of the terminal operation outcome (§7).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResponse {
    pub operation_id: Uuid,
    pub success: bool,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub result: Option<serde_json::Value>,
}

/// Sync state of an offline-queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    Pending,
    Synced,
    Conflict,
    Expired,
}

/// Mirror of `Operation` durably queued while a device is unreachable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineOperation {
    pub id: Uuid,
    pub device_id: Uuid,
    pub op_type: OperationType,
    pub data: serde_json::Value,
    pub priority: Priority,
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub sync_status: SyncStatus,
    pub sync_attempts: u32,
    pub last_sync_attempt: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl OfflineOperation {
    pub fn from_request(req: OperationRequest, now: DateTime<Utc>, ttl: Option<chrono::Duration>) -> Self {
        Self {
            id: Uuid::new_v4(),
            device_id: req.device_id,
            op_type: req.op_type,
            data: req.data,
            priority: req.priority.clamp(PRIORITY_MIN, PRIORITY_MAX),
            correlation_id: req.correlation_id,
            created_at: now,
            sync_status: SyncStatus::Pending,
            sync_attempts: 0,
            last_sync_attempt: None,
            expires_at: ttl.map(|d| now + d),
        }
    }

    pub fn as_request(&self) -> OperationRequest {
        OperationRequest {
            device_id: self.device_id,
            op_type: self.op_type,
            data: self.data.clone(),
            priority: self.priority,
            correlation_id: self.correlation_id.clone(),
        }
    }
}

/// Append-only health-check sample (§3 HealthSample). Retained <= 90 days.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSample {
    pub device_id: Uuid,
    pub health_score: u8,
    pub response_time_ms: u64,
    pub error_rate: f64,
    pub uptime: f64,
    pub recorded_at: DateTime<Utc>,
}

/// Query filter for `OperationStore::list` (§4.4 `List(filter)`).
#[derive(Debug, Clone)]
pub struct OperationFilter {
    pub device_id: Option<Uuid>,
    pub op_type: Option<OperationType>,
    pub status: Option<OperationStatus>,
    pub priority: Option<Priority>,
    pub correlation_id: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub page: u32,
    pub per_page: u32,
}

impl OperationFilter {
    /// Apply the default sort/pagination (`created_at DESC`, page=1,
    /// per_page=20, capped at 100) documented in §4.4.
    pub fn normalized(mut self) -> Self {
        if self.page == 0 {
            self.page = 1;
        }
        if self.per_page == 0 {
            self.per_page = 20;
        }
        self.per_page = self.per_page.min(100);
        self
    }
}

impl Default for OperationFilter {
    fn default() -> Self {
        Self {
            device_id: None,
            op_type: None,
            status: None,
            priority: None,
            correlation_id: None,
            start_date: None,
            end_date: None,
            page: 1,
            per_page: 20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn performance_metrics_clamps_health_score() {
        let mut m = PerformanceMetrics::default();
        let now = Utc::now();
        for _ in 0..10 {
            m.record(false, std::time::Duration::from_millis(10), now);
        }
        assert_eq!(m.health_score, 0);
    }

    #[test]
    fn performance_metrics_penalizes_slow_success() {
        let mut m = PerformanceMetrics::default();
        let now = Utc::now();
        m.record(true, std::time::Duration::from_secs(6), now);
        // success_rate = 1.0 -> floor(100) - 10 = 90
        assert_eq!(m.health_score, 90);
    }

    #[test]
    fn operation_filter_normalizes_defaults() {
        let f = OperationFilter {
            page: 0,
            per_page: 0,
            ..Default::default()
        }
        .normalized();
        assert_eq!(f.page, 1);
        assert_eq!(f.per_page, 20);
    }

    #[test]
    fn operation_filter_caps_per_page() {
        let f = OperationFilter {
            per_page: 500,
            ..Default::default()
        }
        .normalized();
        assert_eq!(f.per_page, 100);
    }

    #[test]
    fn operation_priority_clamped_on_construction() {
        let req = OperationRequest {
            device_id: Uuid::new_v4(),
            op_type: OperationType::Print,
            data: serde_json::Value::Null,
            priority: 9,
            correlation_id: None,
        };
        let op = Operation::new(req, Utc::now());
        assert_eq!(op.priority, PRIORITY_MAX);
    }
}
