/* In-memory transport for driver/engine tests: records every write and serves queued read
 * responses, grounded in the pack's own libpafe `transport::mock::MockTransport`. */
use async_trait::async_trait;

use crate::ctx::Ctx;
use crate::domain::ConnectionType;
use crate::error::{CoreError, Result};

use super::{DeviceProtocol, ProtocolStats};

/// Records every `write` call and serves `read` from a pre-seeded queue.
#[derive(Debug, Default)]
pub struct MockProtocol {
    pub open: bool,
    pub written: Vec<Vec<u8>>,
    pub responses: std::collections::VecDeque<Vec<u8>>,
    pub stats: ProtocolStats,
    pub fail_open: bool,
    pub fail_next_write: bool,
}

impl MockProtocol {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&mut self, resp: Vec<u8>) {
        self.responses.push_back(resp);
    }

    pub fn all_written(&self) -> Vec<u8> {
        self.written.iter().flatten().copied().collect()
    }
}

#[async_trait]
impl DeviceProtocol for MockProtocol {
    async fn open(&mut self, _ctx: &Ctx) -> Result<()> {
        if self.fail_open {
            return Err(CoreError::Transport {
                device: "mock".into(),
                source: std::io::Error::other("forced open failure"),
            });
        }
        self.open = true;
        self.stats.is_connected = true;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        self.stats.is_connected = false;
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open
    }

    async fn write(&mut self, _ctx: &Ctx, bytes: &[u8]) -> Result<()> {
        if self.fail_next_write {
            self.fail_next_write = false;
            self.stats.record_error();
            return Err(CoreError::Transport {
                device: "mock".into(),
                source: std::io::Error::other("forced write failure"),
            });
        }
        self.written.push(bytes.to_vec());
        self.stats.record_write(bytes.len());
        Ok(())
    }

    async fn read(&mut self, _ctx: &Ctx, max_bytes: usize) -> Result<Vec<u8>> {
        match self.responses.pop_front() {
            Some(mut resp) => {
                resp.truncate(max_bytes);
                self.stats.record_read(resp.len());
                Ok(resp)
            }
            None => Err(CoreError::Timeout),
        }
    }

    fn protocol_type(&self) -> ConnectionType {
        ConnectionType::Tcp
    }

    fn stats(&self) -> ProtocolStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let mut m = MockProtocol::new();
        let ctx = Ctx::background();
        m.open(&ctx).await.unwrap();
        m.push_response(vec![0xaa, 0xbb]);
        m.write(&ctx, &[0x01]).await.unwrap();
        assert_eq!(m.written, vec![vec![0x01]]);
        let resp = m.read(&ctx, 16).await.unwrap();
        assert_eq!(resp, vec![0xaa, 0xbb]);
    }

    #[tokio::test]
    async fn read_with_no_queued_response_times_out() {
        let mut m = MockProtocol::new();
        let ctx = Ctx::background();
        m.open(&ctx).await.unwrap();
        assert!(matches!(m.read(&ctx, 16).await, Err(CoreError::Timeout)));
    }

    #[tokio::test]
    async fn forced_open_failure_leaves_closed() {
        let mut m = MockProtocol::new();
        m.fail_open = true;
        let ctx = Ctx::background();
        assert!(m.open(&ctx).await.is_err());
        assert!(!m.is_open());
    }
}
