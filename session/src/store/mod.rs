pub mod memory;
#[cfg(feature = "mysql-backend")]
pub mod mysql;

use async_trait::async_trait;

use crate::{config::StoreOptions, error::StoreResult, lease::Lease};

pub use memory::{MemoryRecordStore, StoreCall, StoreOp};
#[cfg(feature = "mysql-backend")]
pub use mysql::MysqlRecordStore;

#[async_trait]
pub trait RecordStore: Send + Sync + std::fmt::Debug {
    async fn connect(&self, options: &StoreOptions) -> StoreResult<()>;

    /// Creates the database if it does not exist.
    async fn create_schema(&self) -> StoreResult<()>;

    /// Makes the configured database the target of later verbs.
    async fn select_schema(&self) -> StoreResult<()>;

    async fn create_tables(&self) -> StoreResult<()>;

    async fn load_all(&self) -> StoreResult<Vec<Lease>>;

    async fn insert(&self, lease: &Lease) -> StoreResult<()>;

    /// Deleting a row that does not exist is not an error.
    /// Overwrites status and create time of an existing row. A missing row
    /// is left missing.
    async fn update(&self, lease: &Lease) -> StoreResult<()>;

    async fn delete(&self, path: &str, session_id: &str) -> StoreResult<()>;

    async fn query(&self, path: &str, session_id: &str) -> StoreResult<Option<Lease>>;
}
