/* pos-devicectl entrypoint: sets up tracing, wires the in-memory stores and driver registry,
 * and starts the engine's background health monitor and offline sync loops. */
use std::sync::Arc;

use anyhow::Result;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pos_devicectl::domain::{DeviceType, GENERIC_BRAND, MODEL_WILDCARD};
use pos_devicectl::driver::escpos::EscPosFactory;
use pos_devicectl::engine::Engine;
use pos_devicectl::health::HealthMonitor;
use pos_devicectl::offline::OfflineSync;
use pos_devicectl::registry::DriverRegistry;
use pos_devicectl::store::memory::{InMemoryDeviceStore, InMemoryHealthStore, InMemoryOfflineStore, InMemoryOperationStore};
use pos_devicectl::store::{DeviceStore, HealthStore, OfflineStore, OperationStore};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("starting pos-devicectl version {}", env!("CARGO_PKG_VERSION"));

    let devices: Arc<dyn DeviceStore> = Arc::new(InMemoryDeviceStore::new());
    let operations: Arc<dyn OperationStore> = Arc::new(InMemoryOperationStore::new());
    let offline: Arc<dyn OfflineStore> = Arc::new(InMemoryOfflineStore::new());
    let health: Arc<dyn HealthStore> = Arc::new(InMemoryHealthStore::new());

    let registry = Arc::new(DriverRegistry::new());
    // ESC/POS covers most thermal receipt printers; register it as both the
    // EPSON-specific entry and the generic printer fallback (§4.2 tier 3).
    registry.register("EPSON", DeviceType::Printer, MODEL_WILDCARD, Arc::new(EscPosFactory));
    registry.register(GENERIC_BRAND, DeviceType::Printer, MODEL_WILDCARD, Arc::new(EscPosFactory));

    let engine = Arc::new(Engine::new(devices.clone(), operations.clone(), registry.clone()));

    let monitor = Arc::new(HealthMonitor::new(devices.clone(), health.clone(), registry.clone()));
    let _health_task = monitor.spawn();

    let sync = Arc::new(OfflineSync::new(devices, offline, operations, health, engine.clone()));
    let _sync_task = sync.clone().spawn_sync_loop();
    let _cleanup_task = sync.spawn_cleanup_loop();

    info!("pos-devicectl running; health monitor and offline sync active");

    // Block forever; a real deployment would sit behind a request-handling
    // surface (gRPC/HTTP) calling into `engine` — out of scope here (§2 Non-goals).
    std::future::pending::<()>().await;
    Ok(())
}
