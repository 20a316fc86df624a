use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

/// Gatekeeper for model calls during a run.
///
/// Once the token is cancelled no new call starts; a call already in flight
/// gets `drain` to finish before it is abandoned.
#[derive(Debug, Clone, Default)]
pub struct RunGuard {
    token: CancellationToken,
    drain: Duration,
}

impl RunGuard {
    pub fn new(token: CancellationToken, drain: Duration) -> Self {
        Self { token, drain }
    }

    /// A guard that is never cancelled.
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Run `fut` unless cancelled. `None` means the call was skipped or abandoned.
    pub async fn run<F, T>(&self, fut: F) -> Option<T>
    where
        F: Future<Output = T>,
    {
        if self.token.is_cancelled() {
            return None;
        }
        tokio::pin!(fut);
        let finished = tokio::select! {
            biased;
            out = &mut fut => Some(out),
            _ = self.token.cancelled() => None,
        };
        if finished.is_some() || self.drain.is_zero() {
            return finished;
        }
        tracing::debug!(
            drain_ms = self.drain.as_millis() as u64,
            "draining in-flight call"
        );
        tokio::time::timeout(self.drain, fut).await.ok()
    }
}
