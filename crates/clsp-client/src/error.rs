//! Error kinds surfaced by the session core (spec.md §7).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClspError {
    #[error("invalid stream URL: {0}")]
    InvalidUrl(String),

    #[error("changeSrc called without a URL or stream configuration")]
    MissingUrl,

    #[error("no rendering surface could be established")]
    NoSurface,

    #[error("unsupported environment: {0}")]
    UnsupportedEnvironment(String),

    #[error("component already destroyed")]
    AlreadyDestroyed,

    #[error("changeSrc failed: {0}")]
    ChangeSrcFailed(String),

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("buffer error: {0}")]
    BufferError(String),

    #[error("unknown event name: {0}")]
    UnknownEvent(String),

    #[error("subscribe called without a handler")]
    MissingHandler,
}

pub type ClspResult<T> = Result<T, ClspError>;
