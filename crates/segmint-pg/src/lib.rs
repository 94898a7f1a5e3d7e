//! PostgreSQL implementation of the segmint segment store.
//!
//! Every mutation is a single-statement atomic update; the unique index on
//! (business_type, time_key, role) arbitrates racing creators and the
//! advance-only predicate on `max_value` arbitrates racing refills. Nothing
//! here needs a transaction spanning more than one row.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use segmint::{Error, NodeRecord, NodeStatus, Result, Role, Segment, SegmentStore};
use tokio_postgres::{Client, NoTls, Row};

/// DDL for the two shared tables. Idempotent; applied by
/// [`PgStore::ensure_schema`] at startup.
pub const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS id_segments (
    id            BIGSERIAL PRIMARY KEY,
    business_type TEXT        NOT NULL,
    time_key      TEXT        NOT NULL,
    role          SMALLINT    NOT NULL,
    max_value     BIGINT      NOT NULL,
    step_size     INTEGER     NOT NULL,
    created_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at    TIMESTAMPTZ NOT NULL DEFAULT now(),
    CONSTRAINT uk_business_time_role UNIQUE (business_type, time_key, role)
);

CREATE TABLE IF NOT EXISTS id_nodes (
    id             BIGSERIAL PRIMARY KEY,
    node_id        TEXT        NOT NULL,
    role           SMALLINT    NOT NULL,
    status         SMALLINT    NOT NULL,
    last_heartbeat TIMESTAMPTZ NOT NULL DEFAULT now(),
    created_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
    CONSTRAINT uk_node_id UNIQUE (node_id)
);
"#;

#[derive(Debug, thiserror::Error)]
enum PgStoreError {
    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),
    #[error("{0}")]
    Inconsistent(String),
}

fn store_err(err: impl Into<PgStoreError>) -> Error {
    Error::store(err.into())
}

/// Segment store backed by a shared PostgreSQL database.
pub struct PgStore {
    client: Client,
}

impl PgStore {
    /// Connect with a `tokio-postgres` connection string (for example
    /// `host=db user=segmint dbname=segmint`) or a `postgres://` URL. The
    /// connection driver is spawned onto the runtime; a broken connection
    /// surfaces as store errors on subsequent calls.
    pub async fn connect(conn_str: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(conn_str, NoTls)
            .await
            .map_err(store_err)?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                tracing::warn!(error = %err, "postgres connection terminated");
            }
        });
        Ok(Self { client })
    }

    /// Create the tables if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<()> {
        self.client.batch_execute(SCHEMA).await.map_err(store_err)
    }

    fn segment_from_row(row: &Row) -> Result<Segment> {
        let code: i16 = row.get("role");
        let role = Role::from_code(code).ok_or_else(|| {
            store_err(PgStoreError::Inconsistent(format!(
                "segment row carries unknown role code {code}"
            )))
        })?;
        Ok(Segment {
            business_type: row.get("business_type"),
            time_key: row.get("time_key"),
            role,
            max_value: row.get("max_value"),
            step_size: row.get("step_size"),
            updated_at: row.get("updated_at"),
        })
    }

    fn node_from_row(row: &Row) -> Result<NodeRecord> {
        let code: i16 = row.get("role");
        let role = Role::from_code(code).ok_or_else(|| {
            store_err(PgStoreError::Inconsistent(format!(
                "node row carries unknown role code {code}"
            )))
        })?;
        let status: i16 = row.get("status");
        Ok(NodeRecord {
            node_id: row.get("node_id"),
            role,
            status: NodeStatus::from_code(status),
            last_heartbeat: row.get("last_heartbeat"),
        })
    }

    fn segments_from_rows(rows: Vec<Row>) -> Result<Vec<Segment>> {
        rows.iter().map(Self::segment_from_row).collect()
    }
}

#[async_trait]
impl SegmentStore for PgStore {
    async fn get_segment(
        &self,
        business_type: &str,
        time_key: &str,
        role: Role,
    ) -> Result<Option<Segment>> {
        let rows = self
            .client
            .query(
                "SELECT business_type, time_key, role, max_value, step_size, updated_at \
                 FROM id_segments \
                 WHERE business_type = $1 AND time_key = $2 AND role = $3",
                &[&business_type, &time_key, &role.code()],
            )
            .await
            .map_err(store_err)?;
        rows.first().map(Self::segment_from_row).transpose()
    }

    async fn create_segment(
        &self,
        business_type: &str,
        time_key: &str,
        role: Role,
        initial_max: i64,
        step: i32,
    ) -> Result<(Segment, bool)> {
        let inserted = self
            .client
            .query(
                "INSERT INTO id_segments (business_type, time_key, role, max_value, step_size) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT ON CONSTRAINT uk_business_time_role DO NOTHING \
                 RETURNING business_type, time_key, role, max_value, step_size, updated_at",
                &[&business_type, &time_key, &role.code(), &initial_max, &step],
            )
            .await
            .map_err(store_err)?;
        if let Some(row) = inserted.first() {
            return Ok((Self::segment_from_row(row)?, true));
        }
        self.get_segment(business_type, time_key, role)
            .await?
            .map(|segment| (segment, false))
            .ok_or_else(|| {
                store_err(PgStoreError::Inconsistent(format!(
                    "segment {business_type}:{time_key} vanished between insert and read"
                )))
            })
    }

    async fn set_max_value(
        &self,
        business_type: &str,
        time_key: &str,
        role: Role,
        new_max: i64,
    ) -> Result<u64> {
        self.client
            .execute(
                "UPDATE id_segments SET max_value = $4, updated_at = now() \
                 WHERE business_type = $1 AND time_key = $2 AND role = $3 \
                   AND max_value < $4",
                &[&business_type, &time_key, &role.code(), &new_max],
            )
            .await
            .map_err(store_err)
    }

    async fn set_max_value_and_step(
        &self,
        business_type: &str,
        time_key: &str,
        role: Role,
        new_max: i64,
        new_step: i32,
    ) -> Result<u64> {
        self.client
            .execute(
                "UPDATE id_segments SET max_value = $4, step_size = $5, updated_at = now() \
                 WHERE business_type = $1 AND time_key = $2 AND role = $3 \
                   AND max_value < $4",
                &[&business_type, &time_key, &role.code(), &new_max, &new_step],
            )
            .await
            .map_err(store_err)
    }

    async fn list_segments(
        &self,
        business_type: &str,
        time_key: Option<&str>,
    ) -> Result<Vec<Segment>> {
        let rows = match time_key {
            Some(time_key) => {
                self.client
                    .query(
                        "SELECT business_type, time_key, role, max_value, step_size, updated_at \
                         FROM id_segments \
                         WHERE business_type = $1 AND time_key = $2 \
                         ORDER BY time_key, role",
                        &[&business_type, &time_key],
                    )
                    .await
            }
            None => {
                self.client
                    .query(
                        "SELECT business_type, time_key, role, max_value, step_size, updated_at \
                         FROM id_segments \
                         WHERE business_type = $1 \
                         ORDER BY time_key, role",
                        &[&business_type],
                    )
                    .await
            }
        }
        .map_err(store_err)?;
        Self::segments_from_rows(rows)
    }

    async fn list_role_segments(&self, role: Role) -> Result<Vec<Segment>> {
        let rows = self
            .client
            .query(
                "SELECT business_type, time_key, role, max_value, step_size, updated_at \
                 FROM id_segments \
                 WHERE role = $1 \
                 ORDER BY business_type, time_key",
                &[&role.code()],
            )
            .await
            .map_err(store_err)?;
        Self::segments_from_rows(rows)
    }

    async fn list_business_types(&self) -> Result<Vec<String>> {
        let rows = self
            .client
            .query(
                "SELECT DISTINCT business_type FROM id_segments ORDER BY business_type",
                &[],
            )
            .await
            .map_err(store_err)?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn delete_expired(&self, cutoff: &str) -> Result<u64> {
        self.client
            .execute("DELETE FROM id_segments WHERE time_key < $1", &[&cutoff])
            .await
            .map_err(store_err)
    }

    async fn sum_max_value(&self, role: Role) -> Result<i64> {
        let row = self
            .client
            .query_one(
                "SELECT COALESCE(SUM(max_value), 0)::BIGINT FROM id_segments WHERE role = $1",
                &[&role.code()],
            )
            .await
            .map_err(store_err)?;
        Ok(row.get(0))
    }

    async fn upsert_node(&self, node_id: &str, role: Role) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO id_nodes (node_id, role, status) VALUES ($1, $2, 1) \
                 ON CONFLICT ON CONSTRAINT uk_node_id \
                 DO UPDATE SET role = EXCLUDED.role, status = 1, last_heartbeat = now()",
                &[&node_id, &role.code()],
            )
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn touch_heartbeat(&self, node_id: &str) -> Result<u64> {
        self.client
            .execute(
                "UPDATE id_nodes SET last_heartbeat = now() WHERE node_id = $1",
                &[&node_id],
            )
            .await
            .map_err(store_err)
    }

    async fn set_node_status(&self, node_id: &str, status: NodeStatus) -> Result<u64> {
        self.client
            .execute(
                "UPDATE id_nodes SET status = $2, last_heartbeat = now() WHERE node_id = $1",
                &[&node_id, &status.code()],
            )
            .await
            .map_err(store_err)
    }

    async fn count_online(&self, role: Role) -> Result<i64> {
        let row = self
            .client
            .query_one(
                "SELECT COUNT(*) FROM id_nodes WHERE role = $1 AND status = 1",
                &[&role.code()],
            )
            .await
            .map_err(store_err)?;
        Ok(row.get(0))
    }

    async fn mark_stale_offline(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        self.client
            .execute(
                "UPDATE id_nodes SET status = 0 \
                 WHERE status = 1 AND last_heartbeat < $1",
                &[&cutoff],
            )
            .await
            .map_err(store_err)
    }

    async fn list_nodes(&self) -> Result<Vec<NodeRecord>> {
        let rows = self
            .client
            .query(
                "SELECT node_id, role, status, last_heartbeat FROM id_nodes ORDER BY node_id",
                &[],
            )
            .await
            .map_err(store_err)?;
        rows.iter().map(Self::node_from_row).collect()
    }
}
