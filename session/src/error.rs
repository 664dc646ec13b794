use thiserror::Error;

use crate::StatusCode;

/// Failures reported by a [`RecordStore`](crate::store::RecordStore) verb.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store connection failed: {0}")]
    Connection(String),

    #[error("Store schema setup failed: {0}")]
    Schema(String),

    #[error("Store query failed: {0}")]
    Query(String),

    #[error("Store is not connected")]
    NotConnected,

    #[error("Injected failure for {0}")]
    Injected(&'static str),
}

#[cfg(feature = "mysql-backend")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Query(err.to_string())
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Session manager is not initialized")]
    NotInitialized,

    #[error("File {path:?} is occupied by session {session_id}")]
    FileOccupied { path: String, session_id: String },

    #[error("Persisting session for {path:?} failed: {source}")]
    Persistence {
        path: String,
        #[source]
        source: StoreError,
    },

    #[error("Session identity mismatch for {path:?}")]
    IdentityMismatch { path: String },

    #[error("Ambiguous persisted sessions for {path:?}: {count} rows share create time {create_time_us}")]
    DuplicateSession {
        path: String,
        count: usize,
        create_time_us: i64,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl Error {
    /// Status reported to the service layer for this failure.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::FileOccupied { .. } => StatusCode::FileOccupied,
            Error::IdentityMismatch { .. } => StatusCode::IdentityMismatch,
            Error::Config(_)
            | Error::NotInitialized
            | Error::Persistence { .. }
            | Error::DuplicateSession { .. }
            | Error::Store(_) => StatusCode::InternalError,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_code_mapping() {
        let occupied = Error::FileOccupied {
            path: "/file1".to_string(),
            session_id: "s1".to_string(),
        };
        assert_eq!(occupied.status_code(), StatusCode::FileOccupied);

        let mismatch = Error::IdentityMismatch { path: "/file1".to_string() };
        assert_eq!(mismatch.status_code(), StatusCode::IdentityMismatch);

        let persistence = Error::Persistence {
            path: "/file1".to_string(),
            source: StoreError::Injected("insert"),
        };
        assert_eq!(persistence.status_code(), StatusCode::InternalError);
        assert_eq!(Error::NotInitialized.status_code(), StatusCode::InternalError);
    }
}
