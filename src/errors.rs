use crate::config::StoreConfigError;

/// Failures while turning a byte buffer back into a [`VisitorCookie`](crate::cookie::VisitorCookie).
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Stream requires reader version {found}, this reader supports up to {supported}")]
    VersionIncompatible { found: u8, supported: u8 },

    #[error("Buffer truncated: needed {needed} bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },

    #[error("Malformed cookie stream: {0}")]
    Malformed(String),

    #[error("Invalid UTF-8 string at offset {offset}")]
    InvalidUtf8 { offset: usize },
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Store lock poisoned")]
    LockPoisoned,

    #[error("Invalid store configuration: {0}")]
    Config(#[from] StoreConfigError),
}

#[cfg(feature = "sqlite_cookie_store")]
impl From<r2d2::Error> for StoreError {
    fn from(e: r2d2::Error) -> Self {
        StoreError::BackendUnavailable(e.to_string())
    }
}

#[cfg(feature = "sqlite_cookie_store")]
impl From<r2d2_sqlite::rusqlite::Error> for StoreError {
    fn from(e: r2d2_sqlite::rusqlite::Error) -> Self {
        StoreError::BackendUnavailable(e.to_string())
    }
}
