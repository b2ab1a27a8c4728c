//! `PostgreSQL` implementation of [`RegistryStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use concord_types::{ServerId, ServerRecord, ServerStatus};
use sqlx::FromRow;
use sqlx::postgres::PgRow;

use crate::codec::{count_from_db, count_to_db, port_from_db};
use crate::error::DbError;
use crate::pool::{PoolManager, SqlValue};
use crate::store::RegistryStore;

const SERVER_COLUMNS: &str =
    "server_id, name, address, port, capacity, current_load, last_heartbeat, status";

/// A row from `server_registry`.
#[derive(Debug, Clone, FromRow)]
pub struct ServerRow {
    /// Server id.
    pub server_id: String,
    /// Display name.
    pub name: String,
    /// Advertised host.
    pub address: String,
    /// Advertised port.
    pub port: i64,
    /// Player capacity.
    pub capacity: i64,
    /// Players currently connected.
    pub current_load: i64,
    /// Last announce time.
    pub last_heartbeat: DateTime<Utc>,
    /// `ONLINE` or `OFFLINE`.
    pub status: String,
}

impl From<ServerRow> for ServerRecord {
    fn from(row: ServerRow) -> Self {
        Self {
            server_id: ServerId::from_stored(row.server_id),
            name: row.name,
            address: row.address,
            port: port_from_db(row.port),
            capacity: count_from_db(row.capacity),
            current_load: count_from_db(row.current_load),
            last_heartbeat: row.last_heartbeat,
            status: ServerStatus::from_db(&row.status),
        }
    }
}

fn server_row(row: &PgRow) -> Result<ServerRecord, sqlx::Error> {
    ServerRow::from_row(row).map(ServerRecord::from)
}

/// [`RegistryStore`] over the shared pool.
#[derive(Debug, Clone)]
pub struct PgRegistryStore {
    pool: PoolManager,
}

impl PgRegistryStore {
    /// Create a store bound to the pool.
    pub const fn new(pool: PoolManager) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl RegistryStore for PgRegistryStore {
    async fn upsert_server(&self, record: &ServerRecord) -> Result<(), DbError> {
        let params = [
            SqlValue::from(record.server_id.as_str()),
            SqlValue::from(record.name.as_str()),
            SqlValue::from(record.address.as_str()),
            SqlValue::Int(i64::from(record.port)),
            SqlValue::Int(count_to_db(record.capacity)),
            SqlValue::Int(count_to_db(record.current_load)),
            SqlValue::Timestamp(record.last_heartbeat),
            SqlValue::from(record.status.as_str()),
        ];
        self.pool
            .execute(
                r"INSERT INTO server_registry (server_id, name, address, port, capacity, current_load, last_heartbeat, status)
                  VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                  ON CONFLICT (server_id) DO UPDATE SET
                      name = EXCLUDED.name,
                      address = EXCLUDED.address,
                      port = EXCLUDED.port,
                      capacity = EXCLUDED.capacity,
                      current_load = EXCLUDED.current_load,
                      last_heartbeat = GREATEST(server_registry.last_heartbeat, EXCLUDED.last_heartbeat),
                      status = EXCLUDED.status",
                &params,
            )
            .await?;
        Ok(())
    }

    async fn fresh_peers(
        &self,
        exclude: &ServerId,
        fresh_since: DateTime<Utc>,
    ) -> Result<Vec<ServerRecord>, DbError> {
        let sql = format!(
            "SELECT {SERVER_COLUMNS} FROM server_registry
             WHERE server_id <> $1 AND status = 'ONLINE' AND last_heartbeat >= $2
             ORDER BY server_id"
        );
        self.pool
            .query(
                &sql,
                &[
                    SqlValue::from(exclude.as_str()),
                    SqlValue::Timestamp(fresh_since),
                ],
                server_row,
            )
            .await
    }

    async fn mark_stale_offline(&self, cutoff: DateTime<Utc>) -> Result<u64, DbError> {
        self.pool
            .execute(
                "UPDATE server_registry SET status = 'OFFLINE'
                 WHERE status = 'ONLINE' AND last_heartbeat < $1",
                &[SqlValue::Timestamp(cutoff)],
            )
            .await
    }

    async fn set_status(&self, server_id: &ServerId, status: ServerStatus) -> Result<(), DbError> {
        self.pool
            .execute(
                "UPDATE server_registry SET status = $2 WHERE server_id = $1",
                &[
                    SqlValue::from(server_id.as_str()),
                    SqlValue::from(status.as_str()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn list_servers(&self) -> Result<Vec<ServerRecord>, DbError> {
        let sql = format!("SELECT {SERVER_COLUMNS} FROM server_registry ORDER BY server_id");
        self.pool.query(&sql, &[], server_row).await
    }
}
