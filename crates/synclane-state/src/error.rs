//! Persistence error types.

/// Errors produced by [`SyncPersistence`](crate::SyncPersistence) operations.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// Underlying `SQLite` failure.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// File-system I/O failure (e.g. creating the database directory).
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored checkpoint or summary could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Internal mutex was poisoned by a panicked thread.
    #[error("persistence lock poisoned")]
    LockPoisoned,
}

/// Convenience alias used throughout this crate.
pub type Result<T> = std::result::Result<T, StateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sqlite_error_displays_context() {
        let inner = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(1),
            Some("table not found".into()),
        );
        let err = StateError::Sqlite(inner);
        assert!(err.to_string().contains("sqlite"));
    }

    #[test]
    fn serde_error_wraps() {
        let inner = serde_json::from_str::<u32>("nope").unwrap_err();
        let err = StateError::from(inner);
        assert!(err.to_string().starts_with("serialization error"));
    }

    #[test]
    fn lock_poisoned_displays() {
        assert_eq!(StateError::LockPoisoned.to_string(), "persistence lock poisoned");
    }
}
