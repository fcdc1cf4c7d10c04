/* Shared error taxonomy for the device control plane: CoreError aggregates transport, driver,
 * registry, and engine failures into the ten kinds the engine classifies against. */
use thiserror::Error;

/// Errors that may occur anywhere in the device control plane.
///
/// Variants are explicit rather than opaque strings so the engine can take
/// structured action (classify `Cancelled` vs `Timeout` vs everything else
/// into the terminal operation status) instead of pattern-matching on
/// messages.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("config error: {0}")]
    Config(String),

    #[error("transport error on {device}: {source}")]
    Transport {
        device: String,
        #[source]
        source: std::io::Error,
    },

    #[error("driver not connected")]
    NotConnected,

    #[error("unsupported device: brand={brand} type={device_type:?} model={model}")]
    UnsupportedDevice {
        brand: String,
        device_type: crate::domain::DeviceType,
        model: String,
    },

    #[error("unsupported operation: {0:?}")]
    UnsupportedOperation(crate::domain::OperationType),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("device not online")]
    DeviceNotOnline,

    #[error("operation timed out")]
    Timeout,

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid status transition: {0}")]
    InvalidTransition(String),

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl CoreError {
    /// Stable machine-readable tag, used as `Operation::error_code` and in
    /// logs. Matches the kind names in the error-handling taxonomy.
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Config(_) => "CONFIG_ERROR",
            CoreError::Transport { .. } => "TRANSPORT_ERROR",
            CoreError::NotConnected => "NOT_CONNECTED",
            CoreError::UnsupportedDevice { .. } => "UNSUPPORTED_DEVICE",
            CoreError::UnsupportedOperation(_) => "UNSUPPORTED_OPERATION",
            CoreError::InvalidArgument(_) => "INVALID_ARGUMENT",
            CoreError::DeviceNotOnline => "DEVICE_NOT_ONLINE",
            CoreError::Timeout => "TIMEOUT",
            CoreError::Cancelled => "CANCELLED",
            CoreError::InvalidTransition(_) => "INVALID_TRANSITION",
            CoreError::Store(_) => "STORE_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
