use thiserror::Error;

/// Why a send was rejected or rolled back. Fetch failures are not errors at
/// this level: the poller logs them and retries on its next tick.
#[derive(Debug, Error)]
pub enum SendError {
    #[error("message is empty")]
    EmptyMessage,
    #[error("no room selected")]
    NoActiveRoom,
    #[error("a send is already pending for room {0}")]
    Busy(i64),
    #[error("room changed while the send was in flight; response discarded")]
    Superseded,
    #[error("send timed out")]
    Timeout,
    #[error("send failed: {0}")]
    Network(String),
}
