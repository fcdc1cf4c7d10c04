/* Serial transport (§4.1): wraps the `serialport` crate's blocking API, pushed onto
 * spawn_blocking so the async engine never stalls on a tty read/write. */
use std::io::{Read, Write};

use async_trait::async_trait;
use tracing::debug;

use crate::ctx::Ctx;
use crate::domain::ConnectionType;
use crate::error::{CoreError, Result};

use super::config::{Parity, SerialConfig};
use super::{incomplete_write_error, DeviceProtocol, ProtocolStats};

pub struct SerialProtocol {
    cfg: SerialConfig,
    port: Option<Box<dyn serialport::SerialPort>>,
    stats: ProtocolStats,
}

fn to_serialport_parity(p: Parity) -> serialport::Parity {
    match p {
        Parity::None => serialport::Parity::None,
        Parity::Odd => serialport::Parity::Odd,
        Parity::Even => serialport::Parity::Even,
    }
}

fn to_serialport_data_bits(bits: u8) -> Result<serialport::DataBits> {
    match bits {
        5 => Ok(serialport::DataBits::Five),
        6 => Ok(serialport::DataBits::Six),
        7 => Ok(serialport::DataBits::Seven),
        8 => Ok(serialport::DataBits::Eight),
        other => Err(CoreError::Config(format!("unsupported data_bits {other}"))),
    }
}

fn to_serialport_stop_bits(bits: u8) -> Result<serialport::StopBits> {
    match bits {
        1 => Ok(serialport::StopBits::One),
        2 => Ok(serialport::StopBits::Two),
        other => Err(CoreError::Config(format!("unsupported stop_bits {other}"))),
    }
}

fn transport_err(device: &str, source: std::io::Error) -> CoreError {
    CoreError::Transport {
        device: device.to_string(),
        source,
    }
}

impl SerialProtocol {
    pub fn new(cfg: SerialConfig) -> Self {
        Self {
            cfg,
            port: None,
            stats: ProtocolStats::default(),
        }
    }
}

#[async_trait]
impl DeviceProtocol for SerialProtocol {
    async fn open(&mut self, _ctx: &Ctx) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }
        let cfg = self.cfg.clone();
        let opened = tokio::task::spawn_blocking(move || -> std::result::Result<_, std::io::Error> {
            serialport::new(&cfg.port, cfg.baud_rate)
                .data_bits(to_serialport_data_bits(cfg.data_bits).map_err(std::io::Error::other)?)
                .stop_bits(to_serialport_stop_bits(cfg.stop_bits).map_err(std::io::Error::other)?)
                .parity(to_serialport_parity(cfg.parity))
                .timeout(cfg.timeout)
                .open()
        })
        .await
        .map_err(|e| transport_err(&self.cfg.port, std::io::Error::other(e)))?
        .map_err(|e| transport_err(&self.cfg.port, e))?;

        self.port = Some(opened);
        self.stats.is_connected = true;
        debug!("serial transport open: {} @ {}bps", self.cfg.port, self.cfg.baud_rate);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.port = None;
        self.stats.is_connected = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    async fn write(&mut self, ctx: &Ctx, bytes: &[u8]) -> Result<()> {
        let Some(mut port) = self.port.take() else {
            return Err(CoreError::NotConnected);
        };
        let device = self.cfg.port.clone();
        let buf = bytes.to_vec();
        let deadline_ctx = ctx.with_timeout(self.cfg.timeout);
        let result = deadline_ctx
            .run(async {
                tokio::task::spawn_blocking(move || {
                    let res = port.write_all(&buf).map(|_| buf.len());
                    (port, res)
                })
                .await
                .map_err(|e| transport_err(&device, std::io::Error::other(e)))
            })
            .await;

        match result {
            Ok((port, Ok(n))) => {
                self.port = Some(port);
                if n == bytes.len() {
                    self.stats.record_write(n);
                    Ok(())
                } else {
                    self.stats.record_error();
                    Err(incomplete_write_error(&self.cfg.port, bytes.len(), n))
                }
            }
            Ok((port, Err(e))) => {
                self.port = Some(port);
                self.stats.record_error();
                Err(transport_err(&self.cfg.port, e))
            }
            Err(e) => {
                self.stats.record_error();
                Err(e)
            }
        }
    }

    async fn read(&mut self, ctx: &Ctx, max_bytes: usize) -> Result<Vec<u8>> {
        let Some(mut port) = self.port.take() else {
            return Err(CoreError::NotConnected);
        };
        let device = self.cfg.port.clone();
        let deadline_ctx = ctx.with_timeout(self.cfg.timeout);
        let result = deadline_ctx
            .run(async {
                tokio::task::spawn_blocking(move || {
                    let mut buf = vec![0u8; max_bytes];
                    let res = port.read(&mut buf).map(|n| {
                        buf.truncate(n);
                        buf
                    });
                    (port, res)
                })
                .await
                .map_err(|e| transport_err(&device, std::io::Error::other(e)))
            })
            .await;

        match result {
            Ok((port, Ok(buf))) => {
                self.port = Some(port);
                self.stats.record_read(buf.len());
                Ok(buf)
            }
            Ok((port, Err(e))) if e.kind() == std::io::ErrorKind::TimedOut => {
                self.port = Some(port);
                Err(CoreError::Timeout)
            }
            Ok((port, Err(e))) => {
                self.port = Some(port);
                self.stats.record_error();
                Err(transport_err(&self.cfg.port, e))
            }
            Err(e) => {
                self.stats.record_error();
                Err(e)
            }
        }
    }

    fn protocol_type(&self) -> ConnectionType {
        ConnectionType::Serial
    }

    fn stats(&self) -> ProtocolStats {
        self.stats.clone()
    }
}
