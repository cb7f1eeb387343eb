use thiserror::Error;

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("failed to create shared-memory segment at {path}: {source}")]
    Create {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to map shared-memory segment: {source}")]
    Map {
        #[source]
        source: std::io::Error,
    },

    #[error("shared-memory segment version mismatch: segment has {found:?}, expected {expected:?}")]
    VersionMismatch { found: [u8; 12], expected: [u8; 12] },

    #[error("reader gave up after {0} retries without observing a stable snapshot")]
    TornRead(u32),
}

pub type Result<T> = std::result::Result<T, IpcError>;
