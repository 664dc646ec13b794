//! MySQL realization of [`RecordStore`](super::RecordStore), one row per
//! session in the `session` table keyed by `(path, session_id)`.

use async_trait::async_trait;
use parking_lot::RwLock;
use sqlx::mysql::{MySqlConnectOptions, MySqlPool, MySqlPoolOptions, MySqlRow};
use sqlx::Row;
use tracing::{debug, info, instrument};

use super::RecordStore;
use crate::{
    config::StoreOptions,
    error::{StoreError, StoreResult},
    lease::{Lease, LeaseStatus},
};

const MAX_CONNECTIONS: u32 = 8;
const DEFAULT_PORT: u16 = 3306;

const CREATE_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS session (
  path VARCHAR(255) NOT NULL,
  session_id VARCHAR(64) NOT NULL,
  token VARCHAR(128) NOT NULL,
  client_ip VARCHAR(64) NOT NULL,
  lease_time_us BIGINT NOT NULL,
  tolerance_time_us BIGINT NOT NULL,
  create_time_us BIGINT NOT NULL,
  status VARCHAR(16) NOT NULL,
  PRIMARY KEY (path, session_id)
)";

const SELECT_COLUMNS: &str = "SELECT path, session_id, token, client_ip, lease_time_us, \
     tolerance_time_us, create_time_us, status FROM session";

#[derive(Debug, Default)]
pub struct MysqlRecordStore {
    pool: RwLock<Option<MySqlPool>>,
    options: RwLock<Option<StoreOptions>>,
}

impl MysqlRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn pool(&self) -> StoreResult<MySqlPool> {
        self.pool.read().clone().ok_or(StoreError::NotConnected)
    }

    fn options(&self) -> StoreResult<StoreOptions> {
        self.options.read().clone().ok_or(StoreError::NotConnected)
    }

    fn connect_options(options: &StoreOptions) -> StoreResult<MySqlConnectOptions> {
        let (host, port) = match options.url.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|e| {
                    StoreError::Connection(format!("invalid port in {:?}: {e}", options.url))
                })?;
                (host, port)
            }
            None => (options.url.as_str(), DEFAULT_PORT),
        };

        Ok(MySqlConnectOptions::new()
            .host(host)
            .port(port)
            .username(&options.user)
            .password(&options.password))
    }

    async fn open(connect: MySqlConnectOptions) -> StoreResult<MySqlPool> {
        MySqlPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(connect)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))
    }

    fn lease_from_row(row: &MySqlRow) -> StoreResult<Lease> {
        let status: String = row.try_get("status")?;
        let status = LeaseStatus::parse(&status)
            .ok_or_else(|| StoreError::Query(format!("unknown session status {status:?}")))?;

        Ok(Lease {
            path: row.try_get("path")?,
            session_id: row.try_get("session_id")?,
            token: row.try_get("token")?,
            client_ip: row.try_get("client_ip")?,
            lease_time_us: row.try_get("lease_time_us")?,
            tolerance_time_us: row.try_get("tolerance_time_us")?,
            create_time_us: row.try_get("create_time_us")?,
            status,
        })
    }
}

#[async_trait]
impl RecordStore for MysqlRecordStore {
    #[instrument(skip(self, options), fields(url = %options.url, db = %options.db_name))]
    async fn connect(&self, options: &StoreOptions) -> StoreResult<()> {
        let pool = Self::open(Self::connect_options(options)?).await?;
        *self.options.write() = Some(options.clone());
        let previous = self.pool.write().replace(pool);
        if let Some(previous) = previous {
            previous.close().await;
        }
        info!("Connected to session store");
        Ok(())
    }

    async fn create_schema(&self) -> StoreResult<()> {
        let pool = self.pool()?;
        let db_name = self.options()?.db_name;
        // Identifiers cannot be bound; db_name is validated by SessionOptions.
        sqlx::query(&format!("CREATE DATABASE IF NOT EXISTS `{db_name}`"))
            .execute(&pool)
            .await
            .map_err(|e| StoreError::Schema(e.to_string()))?;
        Ok(())
    }

    async fn select_schema(&self) -> StoreResult<()> {
        let options = self.options()?;
        let connect = Self::connect_options(&options)?.database(&options.db_name);
        let pool = Self::open(connect)
            .await
            .map_err(|e| StoreError::Schema(e.to_string()))?;

        let previous = self.pool.write().replace(pool);
        if let Some(previous) = previous {
            previous.close().await;
        }
        debug!("Selected database {}", options.db_name);
        Ok(())
    }

    async fn create_tables(&self) -> StoreResult<()> {
        let pool = self.pool()?;
        sqlx::query(CREATE_TABLE)
            .execute(&pool)
            .await
            .map_err(|e| StoreError::Schema(e.to_string()))?;
        Ok(())
    }

    async fn load_all(&self) -> StoreResult<Vec<Lease>> {
        let pool = self.pool()?;
        let rows = sqlx::query(SELECT_COLUMNS).fetch_all(&pool).await?;
        rows.iter().map(Self::lease_from_row).collect()
    }

    async fn insert(&self, lease: &Lease) -> StoreResult<()> {
        let pool = self.pool()?;
        sqlx::query(
            "INSERT INTO session (path, session_id, token, client_ip, lease_time_us, \
             tolerance_time_us, create_time_us, status) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&lease.path)
        .bind(&lease.session_id)
        .bind(&lease.token)
        .bind(&lease.client_ip)
        .bind(lease.lease_time_us)
        .bind(lease.tolerance_time_us)
        .bind(lease.create_time_us)
        .bind(lease.status.as_str())
        .execute(&pool)
        .await?;
        Ok(())
    }

    async fn update(&self, lease: &Lease) -> StoreResult<()> {
        let pool = self.pool()?;
        sqlx::query(
            "UPDATE session SET status = ?, create_time_us = ? WHERE path = ? AND session_id = ?",
        )
        .bind(lease.status.as_str())
        .bind(lease.create_time_us)
        .bind(&lease.path)
        .bind(&lease.session_id)
        .execute(&pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, path: &str, session_id: &str) -> StoreResult<()> {
        let pool = self.pool()?;
        sqlx::query("DELETE FROM session WHERE path = ? AND session_id = ?")
            .bind(path)
            .bind(session_id)
            .execute(&pool)
            .await?;
        Ok(())
    }

    async fn query(&self, path: &str, session_id: &str) -> StoreResult<Option<Lease>> {
        let pool = self.pool()?;
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE path = ? AND session_id = ?"))
            .bind(path)
            .bind(session_id)
            .fetch_optional(&pool)
            .await?;
        row.as_ref().map(Self::lease_from_row).transpose()
    }
}
