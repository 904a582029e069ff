use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// A boolean that flips from unset to set exactly once and can be awaited.
///
/// Clones share state. Each signal has any number of observers but the
/// harness gives it a single writer, so setting it twice is harmless.
#[derive(Debug, Clone, Default)]
pub struct Signal {
    token: CancellationToken,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the signal and wake every waiter. Idempotent.
    pub fn set(&self) {
        self.token.cancel();
    }

    pub fn is_set(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolve once the signal is set (immediately if it already is).
    pub async fn wait(&self) {
        self.token.cancelled().await;
    }

    /// Owned wait future, for storage inside a poll-based type.
    pub(crate) fn wait_owned(&self) -> WaitForCancellationFutureOwned {
        self.token.clone().cancelled_owned()
    }
}
