/* USB transport (§4.1): matches a device by vendor/product id (optionally serial number),
 * claims the configured interface, and speaks bulk transfers through `rusb` on spawn_blocking. */
use std::sync::Arc;

use async_trait::async_trait;
use rusb::{Context, DeviceHandle, UsbContext};
use tracing::{debug, warn};

use crate::ctx::Ctx;
use crate::domain::ConnectionType;
use crate::error::{CoreError, Result};

use super::config::UsbConfig;
use super::{incomplete_write_error, DeviceProtocol, ProtocolStats};

pub struct UsbProtocol {
    cfg: UsbConfig,
    handle: Option<Arc<DeviceHandle<Context>>>,
    stats: ProtocolStats,
}

fn transport_err(device: &str, source: rusb::Error) -> CoreError {
    CoreError::Transport {
        device: device.to_string(),
        source: std::io::Error::other(source),
    }
}

fn device_label(cfg: &UsbConfig) -> String {
    format!("usb:{:04x}:{:04x}", cfg.vendor_id, cfg.product_id)
}

/// Find the first attached device matching vendor/product id (and serial
/// number, if constrained), claim its configured interface, and return an
/// open handle. When more than one device matches, the first enumerated
/// wins and the rest are left untouched (§4.1 "multiple matching devices").
fn open_blocking(cfg: &UsbConfig) -> std::result::Result<DeviceHandle<Context>, rusb::Error> {
    let context = Context::new()?;
    let devices = context.devices()?;

    for device in devices.iter() {
        let desc = match device.device_descriptor() {
            Ok(d) => d,
            Err(_) => continue,
        };
        if desc.vendor_id() != cfg.vendor_id || desc.product_id() != cfg.product_id {
            continue;
        }

        let handle = match device.open() {
            Ok(h) => h,
            Err(_) => continue,
        };

        if let Some(expected_serial) = &cfg.serial_number {
            let matches = handle
                .read_serial_number_string_ascii(&desc)
                .map(|s| &s == expected_serial)
                .unwrap_or(false);
            if !matches {
                continue;
            }
        }

        if handle.kernel_driver_active(cfg.interface).unwrap_or(false) {
            let _ = handle.detach_kernel_driver(cfg.interface);
        }
        handle.claim_interface(cfg.interface)?;
        return Ok(handle);
    }

    Err(rusb::Error::NoDevice)
}

impl UsbProtocol {
    pub fn new(cfg: UsbConfig) -> Self {
        Self {
            cfg,
            handle: None,
            stats: ProtocolStats::default(),
        }
    }
}

#[async_trait]
impl DeviceProtocol for UsbProtocol {
    async fn open(&mut self, _ctx: &Ctx) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        let cfg = self.cfg.clone();
        let label = device_label(&self.cfg);
        let handle = tokio::task::spawn_blocking(move || open_blocking(&cfg))
            .await
            .map_err(|e| CoreError::Transport {
                device: label.clone(),
                source: std::io::Error::other(e),
            })?
            .map_err(|e| transport_err(&label, e))?;

        self.handle = Some(Arc::new(handle));
        self.stats.is_connected = true;
        debug!("USB transport open: {label}");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(handle) = self.handle.take() {
            if let Ok(handle) = Arc::try_unwrap(handle) {
                let interface = self.cfg.interface;
                let _ = tokio::task::spawn_blocking(move || {
                    let _ = handle.release_interface(interface);
                })
                .await;
            } else {
                warn!("USB handle still referenced at close; interface not released");
            }
        }
        self.stats.is_connected = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    async fn write(&mut self, ctx: &Ctx, bytes: &[u8]) -> Result<()> {
        let Some(handle) = self.handle.clone() else {
            return Err(CoreError::NotConnected);
        };
        let label = device_label(&self.cfg);
        let endpoint = self.cfg.endpoint;
        let buf = bytes.to_vec();
        let timeout = self.cfg.timeout;
        let deadline_ctx = ctx.with_timeout(timeout);

        let result = deadline_ctx
            .run(async {
                let label_inner = label.clone();
                tokio::task::spawn_blocking(move || {
                    handle
                        .write_bulk(endpoint, &buf, timeout)
                        .map_err(|e| transport_err(&label_inner, e))
                })
                .await
                .map_err(|e| CoreError::Transport {
                    device: label.clone(),
                    source: std::io::Error::other(e),
                })?
            })
            .await;

        match result {
            Ok(n) if n == bytes.len() => {
                self.stats.record_write(n);
                Ok(())
            }
            Ok(n) => {
                self.stats.record_error();
                Err(incomplete_write_error(&device_label(&self.cfg), bytes.len(), n))
            }
            Err(e) => {
                self.stats.record_error();
                Err(e)
            }
        }
    }

    async fn read(&mut self, ctx: &Ctx, max_bytes: usize) -> Result<Vec<u8>> {
        let Some(handle) = self.handle.clone() else {
            return Err(CoreError::NotConnected);
        };
        let Some(in_endpoint) = self.cfg.in_endpoint else {
            return Err(CoreError::Transport {
                device: device_label(&self.cfg),
                source: std::io::Error::new(std::io::ErrorKind::Unsupported, "no in_endpoint configured for USB read"),
            });
        };
        let label = device_label(&self.cfg);
        let timeout = self.cfg.timeout;
        let deadline_ctx = ctx.with_timeout(timeout);

        let result = deadline_ctx
            .run(async {
                let label_inner = label.clone();
                tokio::task::spawn_blocking(move || {
                    let mut buf = vec![0u8; max_bytes];
                    handle
                        .read_bulk(in_endpoint, &mut buf, timeout)
                        .map(|n| {
                            buf.truncate(n);
                            buf
                        })
                        .map_err(|e| transport_err(&label_inner, e))
                })
                .await
                .map_err(|e| CoreError::Transport {
                    device: label.clone(),
                    source: std::io::Error::other(e),
                })?
            })
            .await;

        match result {
            Ok(buf) => {
                self.stats.record_read(buf.len());
                Ok(buf)
            }
            Err(e) => {
                self.stats.record_error();
                Err(e)
            }
        }
    }

    fn protocol_type(&self) -> ConnectionType {
        ConnectionType::Usb
    }

    fn stats(&self) -> ProtocolStats {
        self.stats.clone()
    }
}
