//! Device control plane for POS peripherals: driver registry and dispatch,
//! a transport layer over USB/serial/TCP, an operation lifecycle engine, an
//! offline replay queue, and a background health monitor, plus an ESC/POS
//! thermal-printer reference driver.

pub mod ctx;
pub mod domain;
pub mod driver;
pub mod engine;
pub mod error;
pub mod health;
pub mod offline;
pub mod registry;
pub mod store;
pub mod transport;

pub use ctx::Ctx;
pub use domain::{Device, Operation, OperationRequest, OperationResponse};
pub use engine::Engine;
pub use error::{CoreError, Result};
pub use health::HealthMonitor;
pub use offline::OfflineSync;
pub use registry::DriverRegistry;
