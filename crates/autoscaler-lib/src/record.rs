//! VM metadata persistence
//!
//! Every cloned VM is written to the `vms` table right after the clone
//! succeeds. Writes are retried until they land; a failed write is
//! followed by an idempotent schema re-creation in case the table was
//! dropped underneath us.
//!
//! Rows are never removed when a VM is rolled back, and the hypervisor
//! hands out the lowest free vmid, so a later clone often reuses the id of
//! a destroyed VM. Writes are therefore upserts keyed on vmid.

use crate::models::VmRecord;
use crate::retry::RetryPolicy;
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgSslMode};
use sqlx::{ConnectOptions, Connection, PgConnection};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Default wait between persistence attempts
pub const DEFAULT_PERSIST_INTERVAL: Duration = Duration::from_secs(5);

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS vms (
    vmid SERIAL PRIMARY KEY,
    node VARCHAR(50) NOT NULL,
    pool VARCHAR(50),
    vmtype VARCHAR(50),
    memory INTEGER NOT NULL,
    cores INTEGER NOT NULL
)";

// `xmax` is non-zero only when the conflict branch rewrote an existing row
const UPSERT_VM: &str = "INSERT INTO vms (vmid, node, pool, vmtype, memory, cores) \
     VALUES ($1, $2, $3, $4, $5, $6) \
     ON CONFLICT (vmid) DO UPDATE SET node = EXCLUDED.node, pool = EXCLUDED.pool, \
     vmtype = EXCLUDED.vmtype, memory = EXCLUDED.memory, cores = EXCLUDED.cores \
     RETURNING vmid, (xmax::text <> '0') AS superseded";

/// Result of writing one record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredRecord {
    pub vmid: u32,
    /// An older row with the same vmid was overwritten
    pub superseded: bool,
}

/// Storage backend for VM records
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Create the records table if it does not exist
    async fn ensure_schema(&self) -> Result<()>;

    /// Insert a record, replacing any row with the same vmid
    async fn upsert(&self, record: &VmRecord) -> Result<StoredRecord>;
}

/// Persists VM records with unbounded retry
pub struct RecordKeeper {
    store: Arc<dyn RecordStore>,
    policy: RetryPolicy,
}

impl RecordKeeper {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self {
            store,
            policy: RetryPolicy::unbounded(DEFAULT_PERSIST_INTERVAL),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.policy = RetryPolicy::unbounded(interval);
        self
    }

    /// Check the store is reachable and the schema exists
    pub async fn prepare(&self) -> Result<()> {
        self.store
            .ensure_schema()
            .await
            .context("Failed to prepare VM record store")
    }

    /// Write `record`, retrying until the store accepts it
    pub async fn persist(&self, record: &VmRecord) -> u32 {
        let store = self.store.as_ref();

        let stored = self
            .policy
            .run_forever("persist_record", move |_| async move {
                match store.upsert(record).await {
                    Ok(stored) => Ok(stored),
                    Err(e) => {
                        warn!(
                            vmid = record.vmid,
                            error = %e,
                            "Failed to insert VM record, re-creating vms table if missing"
                        );
                        match store.ensure_schema().await {
                            Ok(()) => warn!(
                                "vms table ensured; older VM records are lost if the table had been dropped"
                            ),
                            Err(schema_err) => {
                                error!(error = %schema_err, "Failed to re-create vms table")
                            }
                        }
                        Err(e)
                    }
                }
            })
            .await;

        if stored.superseded {
            warn!(
                vmid = stored.vmid,
                node = %record.node,
                "Replaced stale VM record left by a destroyed VM with the same vmid"
            );
        }
        info!(vmid = stored.vmid, node = %record.node, "Saved VM record");
        stored.vmid
    }
}

/// Postgres connection settings
#[derive(Debug, Clone)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
}

impl PostgresConfig {
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .port(self.port)
            .database(&self.database)
            .username(&self.user)
            .password(&self.password)
            .ssl_mode(PgSslMode::Disable)
    }
}

/// [`RecordStore`] on Postgres, opening a fresh connection per call
pub struct PgRecordStore {
    options: PgConnectOptions,
}

impl PgRecordStore {
    pub fn new(config: &PostgresConfig) -> Self {
        Self {
            options: config.connect_options(),
        }
    }

    async fn connect(&self) -> Result<PgConnection> {
        self.options
            .connect()
            .await
            .context("Failed to connect to Postgres")
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn ensure_schema(&self) -> Result<()> {
        let mut conn = self.connect().await?;
        sqlx::query(CREATE_TABLE)
            .execute(&mut conn)
            .await
            .context("Failed to create vms table")?;
        conn.close().await.ok();
        Ok(())
    }

    async fn upsert(&self, record: &VmRecord) -> Result<StoredRecord> {
        let mut conn = self.connect().await?;
        let (vmid, superseded): (i32, bool) = sqlx::query_as(UPSERT_VM)
            .bind(record.vmid as i32)
            .bind(&record.node)
            .bind(record.pool.as_deref())
            .bind(&record.vmtype)
            .bind(record.memory)
            .bind(record.cores)
            .fetch_one(&mut conn)
            .await
            .context("Failed to write VM record")?;
        conn.close().await.ok();
        Ok(StoredRecord {
            vmid: vmid as u32,
            superseded,
        })
    }
}
