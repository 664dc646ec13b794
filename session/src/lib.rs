#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions, clippy::missing_errors_doc)]

//! Exclusive, time-bounded file sessions for the metadata server.

pub mod config;
pub mod error;
pub mod lease;
pub mod manager;
pub mod reaper;
pub mod recovery;
pub mod registry;
pub mod store;
pub mod time;

pub use config::{SessionOptions, StoreOptions};
pub use error::{Error, Result, StoreError};
pub use lease::{Lease, LeaseStatus};
pub use manager::SessionManager;

use serde::{Deserialize, Serialize};

/// Outcome reported to clients of the session service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StatusCode {
    Ok,
    FileOccupied,
    InternalError,
    IdentityMismatch,
}

impl StatusCode {
    pub fn of<T>(result: &Result<T>) -> Self {
        match result {
            Ok(_) => StatusCode::Ok,
            Err(e) => e.status_code(),
        }
    }
}
