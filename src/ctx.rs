/* Cooperative cancellation: a small Ctx bundling a CancellationToken with an optional deadline,
 * threaded through every blocking transport/driver call per the concurrency model in §5. */
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::CoreError;

/// Scoped cancel + deadline token passed into every blocking call.
///
/// Cloning a `Ctx` shares the same cancellation token (child operations can
/// be cancelled together) but each clone keeps its own deadline so a tighter
/// sub-deadline (e.g. a single read inside a multi-step operation) can be
/// derived with [`Ctx::with_timeout`].
#[derive(Clone)]
pub struct Ctx {
    token: CancellationToken,
    deadline: Option<std::time::Instant>,
}

impl Ctx {
    /// A context with no deadline and a fresh, independent cancellation token.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// Derive a child context that expires after `timeout`, whichever of the
    /// parent's deadline or the new one comes first.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = std::time::Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            token: self.token.clone(),
            deadline: Some(deadline),
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Time remaining before the deadline elapses, or `None` if unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(std::time::Instant::now()))
    }

    /// Race `fut` against cancellation and the deadline. Returns
    /// `CoreError::Cancelled` if the token fired first, `CoreError::Timeout`
    /// if the deadline elapsed first, otherwise the future's own result.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, CoreError>
    where
        F: std::future::Future<Output = Result<T, CoreError>>,
    {
        match self.remaining() {
            Some(remaining) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => Err(CoreError::Cancelled),
                    _ = tokio::time::sleep(remaining) => Err(CoreError::Timeout),
                    res = fut => res,
                }
            }
            None => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => Err(CoreError::Cancelled),
                    res = fut => res,
                }
            }
        }
    }
}

impl Default for Ctx {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_returns_ok_when_future_completes_first() {
        let ctx = Ctx::background();
        let result = ctx.run(async { Ok::<_, CoreError>(42) }).await;
        assert!(matches!(result, Ok(42)));
    }

    #[tokio::test]
    async fn run_times_out() {
        let ctx = Ctx::background().with_timeout(Duration::from_millis(10));
        let result = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, CoreError>(())
            })
            .await;
        assert!(matches!(result, Err(CoreError::Timeout)));
    }

    #[tokio::test]
    async fn run_observes_cancellation() {
        let ctx = Ctx::background();
        let token = ctx.token();
        let handle = tokio::spawn({
            let ctx = ctx.clone();
            async move {
                ctx.run(async {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok::<_, CoreError>(())
                })
                .await
            }
        });
        tokio::time::sleep(Duration::from_millis(5)).await;
        token.cancel();
        let result = handle.await.unwrap();
        assert!(matches!(result, Err(CoreError::Cancelled)));
    }
}
