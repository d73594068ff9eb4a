use thiserror::Error;

/// Errors raised by the worker pool, the router registry and the SFU collaborator.
///
/// Payloads are strings so that a single failed router creation can be handed
/// to every caller that was waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SfuError {
    #[error("Worker pool exhausted: no live worker available")]
    PoolExhausted,

    #[error("Router not found for broadcast: {0}")]
    RouterNotFound(String),

    #[error("Producer not found: {0}")]
    ProducerNotFound(String),

    #[error("Unsupported codec: {0}")]
    UnsupportedCodec(String),

    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Router error: {0}")]
    Router(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Resource closed: {0}")]
    Closed(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type SfuResult<T> = Result<T, SfuError>;
