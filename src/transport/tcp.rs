/* TCP transport (§4.1): dials host:port with a connect timeout, optionally wraps in TLS with
 * server name = host, enables keepalive when configured, applies read/write deadlines per op. */
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};
use tracing::{debug, warn};

use crate::ctx::Ctx;
use crate::domain::ConnectionType;
use crate::error::{CoreError, Result};

use super::config::TcpConfig;
use super::{incomplete_write_error, DeviceProtocol, ProtocolStats};

enum Stream {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

pub struct TcpProtocol {
    cfg: TcpConfig,
    stream: Option<Stream>,
    stats: ProtocolStats,
}

fn transport_err(label: &str, source: std::io::Error) -> CoreError {
    CoreError::Transport {
        device: label.to_string(),
        source,
    }
}

impl TcpProtocol {
    pub fn new(cfg: TcpConfig) -> Self {
        Self {
            cfg,
            stream: None,
            stats: ProtocolStats::default(),
        }
    }

    fn label(&self) -> String {
        format!("{}:{}", self.cfg.host, self.cfg.port)
    }

    fn tls_connector() -> TlsConnector {
        let mut roots = tokio_rustls::rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let config = tokio_rustls::rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        TlsConnector::from(Arc::new(config))
    }
}

#[async_trait]
impl DeviceProtocol for TcpProtocol {
    async fn open(&mut self, ctx: &Ctx) -> Result<()> {
        if self.is_open() {
            return Ok(());
        }

        let label = self.label();
        let connect_fut = TcpStream::connect(&label);
        let tcp = match tokio::time::timeout(self.cfg.timeout, connect_fut).await {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(e)) => {
                self.stats.record_error();
                return Err(transport_err(&label, e));
            }
            Err(_) => {
                self.stats.record_error();
                return Err(CoreError::Timeout);
            }
        };

        if self.cfg.keep_alive {
            let sock_ref = socket2::SockRef::from(&tcp);
            let keepalive = socket2::TcpKeepalive::new().with_time(std::time::Duration::from_secs(30));
            if let Err(e) = sock_ref.set_tcp_keepalive(&keepalive) {
                warn!("failed to enable TCP keepalive on {label}: {e}");
            }
        }

        let ssl = self.cfg.ssl;
        let host = self.cfg.host.clone();

        let stream = if ssl {
            let connector = Self::tls_connector();
            let server_name = rustls_pki_types::ServerName::try_from(host.clone())
                .map_err(|e| CoreError::Config(format!("invalid TLS server name `{host}`: {e}")))?
                .to_owned();
            let deadline_ctx = ctx.with_timeout(self.cfg.timeout);
            let label_for_err = label.clone();
            match deadline_ctx
                .run(async move {
                    connector
                        .connect(server_name, tcp)
                        .await
                        .map_err(|e| transport_err(&label_for_err, e))
                })
                .await
            {
                Ok(tls) => Stream::Tls(Box::new(tls)),
                Err(e) => {
                    self.stats.record_error();
                    return Err(e);
                }
            }
        } else {
            Stream::Plain(tcp)
        };

        self.stream = Some(stream);
        self.stats.is_connected = true;
        debug!("TCP transport open: {label} (ssl={ssl})");
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.stream = None;
        self.stats.is_connected = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    async fn write(&mut self, ctx: &Ctx, bytes: &[u8]) -> Result<()> {
        let label = self.label();
        let write_timeout = self.cfg.write_timeout;
        let Some(stream) = self.stream.as_mut() else {
            return Err(CoreError::NotConnected);
        };

        let deadline_ctx = ctx.with_timeout(write_timeout);
        let result = deadline_ctx
            .run(async {
                let res = match stream {
                    Stream::Plain(s) => s.write_all(bytes).await,
                    Stream::Tls(s) => s.write_all(bytes).await,
                };
                res.map(|_| bytes.len()).map_err(|e| transport_err(&label, e))
            })
            .await;

        match result {
            Ok(n) if n == bytes.len() => {
                self.stats.record_write(n);
                Ok(())
            }
            Ok(n) => {
                self.stats.record_error();
                Err(incomplete_write_error(&label, bytes.len(), n))
            }
            Err(e) => {
                self.stats.record_error();
                Err(e)
            }
        }
    }

    async fn read(&mut self, ctx: &Ctx, max_bytes: usize) -> Result<Vec<u8>> {
        let label = self.label();
        let read_timeout = self.cfg.read_timeout;
        let Some(stream) = self.stream.as_mut() else {
            return Err(CoreError::NotConnected);
        };

        let mut buf = vec![0u8; max_bytes];
        let deadline_ctx = ctx.with_timeout(read_timeout);
        let n = deadline_ctx
            .run(async {
                let res = match stream {
                    Stream::Plain(s) => s.read(&mut buf).await,
                    Stream::Tls(s) => s.read(&mut buf).await,
                };
                res.map_err(|e| transport_err(&label, e))
            })
            .await?;

        buf.truncate(n);
        self.stats.record_read(n);
        Ok(buf)
    }

    fn protocol_type(&self) -> ConnectionType {
        ConnectionType::Tcp
    }

    fn stats(&self) -> ProtocolStats {
        self.stats.clone()
    }
}
