pub mod error;
pub mod queries;
pub mod tables;

pub use error::{DbError, MAX_TX_RETRIES};

use log::info;
use sqlx::{MySql, Pool};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Facade over the replicated cluster store.
///
/// Holds the connection pool plus this member's identity; every read returns
/// owned row values, so nothing borrowed crosses a transaction boundary.
pub struct ClusterDb {
    pool: Pool<MySql>,
    local_member: String,
    local_address: String,
}

impl ClusterDb {
    pub async fn connect(
        url: &str,
        local_member: &str,
        local_address: &str,
    ) -> Result<Arc<Self>, DbError> {
        let pool = sqlx::mysql::MySqlPoolOptions::new()
            .max_connections(16)
            .connect(url)
            .await?;

        let db = Arc::new(Self {
            pool,
            local_member: local_member.to_string(),
            local_address: local_address.to_string(),
        });
        db.ensure_schema().await?;
        Ok(db)
    }

    /// Pool handle for the query modules.
    pub fn pool(&self) -> &Pool<MySql> {
        &self.pool
    }

    /// Facade over a lazily connected pool: nothing touches the network until
    /// a query runs. Used by tests exercising driver-only paths.
    #[cfg(test)]
    pub(crate) fn stub(local_member: &str) -> Arc<Self> {
        let pool = sqlx::mysql::MySqlPoolOptions::new()
            .connect_lazy("mysql://stub@127.0.0.1:1/stub")
            .expect("lazy pool from static url");
        Arc::new(Self {
            pool,
            local_member: local_member.to_string(),
            local_address: "127.0.0.1:0".to_string(),
        })
    }

    /// Name of the member this daemon runs as.
    pub fn local_member(&self) -> &str {
        &self.local_member
    }

    /// Address peers use to reach this member.
    pub fn get_local_node_address(&self) -> &str {
        &self.local_address
    }

    pub async fn get_node_id(&self) -> Result<i64, DbError> {
        queries::member::get_node_id(&self.pool, &self.local_member).await
    }

    /// Runs `op` and re-runs it while the store reports a serialization
    /// conflict, up to the bounded retry count.
    pub async fn with_retry<T, F, Fut>(&self, mut op: F) -> Result<T, DbError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DbError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Err(err) if err.is_retry() && attempt < MAX_TX_RETRIES => {
                    attempt += 1;
                    tokio::time::sleep(Duration::from_millis(25 * u64::from(attempt))).await;
                }
                other => return other,
            }
        }
    }

    /// Creates the schema the core relies on. Idempotent; the replicated
    /// store applies it on whichever member connects first.
    async fn ensure_schema(&self) -> Result<(), DbError> {
        for ddl in SCHEMA {
            sqlx::query(ddl).execute(&self.pool).await?;
        }
        info!("Cluster database schema ready");
        Ok(())
    }
}

const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS cluster_members (
        id           BIGINT PRIMARY KEY AUTO_INCREMENT,
        name         VARCHAR(255) NOT NULL UNIQUE,
        address      VARCHAR(255) NOT NULL,
        architecture VARCHAR(64)  NOT NULL,
        member_group VARCHAR(255) NOT NULL DEFAULT 'default',
        status       VARCHAR(32)  NOT NULL DEFAULT 'online',
        heartbeat    TIMESTAMP    NOT NULL DEFAULT CURRENT_TIMESTAMP
    )"#,
    r#"CREATE TABLE IF NOT EXISTS projects (
        id     BIGINT PRIMARY KEY AUTO_INCREMENT,
        name   VARCHAR(255) NOT NULL UNIQUE,
        config JSON NOT NULL
    )"#,
    r#"INSERT IGNORE INTO projects (name, config) VALUES ('default', '{}')"#,
    r#"CREATE TABLE IF NOT EXISTS storage_pools (
        id     BIGINT PRIMARY KEY AUTO_INCREMENT,
        name   VARCHAR(255) NOT NULL UNIQUE,
        driver VARCHAR(64)  NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS instances (
        id               BIGINT PRIMARY KEY AUTO_INCREMENT,
        project          VARCHAR(255) NOT NULL,
        name             VARCHAR(255) NOT NULL,
        type             VARCHAR(32)  NOT NULL,
        architecture     VARCHAR(64)  NOT NULL,
        node_id          BIGINT       NOT NULL,
        pool_id          BIGINT       NOT NULL,
        ephemeral        BOOLEAN      NOT NULL DEFAULT FALSE,
        stateful         BOOLEAN      NOT NULL DEFAULT FALSE,
        status           VARCHAR(32)  NOT NULL DEFAULT 'stopped',
        local_config     JSON NOT NULL,
        devices          JSON NOT NULL,
        expanded_devices JSON NOT NULL,
        profiles         JSON NOT NULL,
        created_at       TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        UNIQUE KEY project_name (project, name)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS storage_volumes (
        id           BIGINT PRIMARY KEY AUTO_INCREMENT,
        project      VARCHAR(255) NOT NULL,
        name         VARCHAR(255) NOT NULL,
        type         VARCHAR(32)  NOT NULL,
        pool_id      BIGINT       NOT NULL,
        node_id      BIGINT       NULL,
        content_type VARCHAR(32)  NOT NULL DEFAULT 'filesystem',
        description  VARCHAR(512) NOT NULL DEFAULT '',
        config       JSON NOT NULL,
        expiry       TIMESTAMP    NULL,
        created_at   TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP,
        UNIQUE KEY pool_project_type_name (pool_id, project, type, name)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS instance_backups (
        id          BIGINT PRIMARY KEY AUTO_INCREMENT,
        instance_id BIGINT NOT NULL,
        name        VARCHAR(255) NOT NULL,
        created_at  TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
    )"#,
];
