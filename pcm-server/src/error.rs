use thiserror::Error;

/// Matches spec.md §7 `Protocol`: a malformed request gets a 400 and the
/// connection continues if keep-alive was negotiated; nothing here is
/// ever fatal to the listener.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("missing Host header")]
    MissingHost,

    #[error("unsupported method")]
    UnsupportedMethod,

    #[error("/persecond/{0} is out of range (1..=30)")]
    OutOfRange(u32),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;
