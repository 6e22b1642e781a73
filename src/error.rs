use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("line longer than {0} bytes")]
    LineTooLong(usize),

    #[error("invalid screen name: {0}")]
    InvalidName(String),

    #[error("delivery failed: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Why a line could not be queued on a session's sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The session's writer task has exited; the peer is gone.
    #[error("recipient connection is closed")]
    Closed,

    /// The session's outbound queue is full; the peer is not reading.
    #[error("recipient is not keeping up")]
    Lagging,
}
