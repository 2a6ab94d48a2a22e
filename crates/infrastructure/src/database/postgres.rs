use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info};

use rudder_core::{DatabaseConfig, RudderResult};
use rudder_domain::{DebugFlag, DebugRegistry, GlobalDebugRepository, ScopedDebugRepository};

/// PostgreSQL后端的调试标记存储（集群部署）
pub struct PostgresDebugStore {
    pool: PgPool,
}

impl PostgresDebugStore {
    pub async fn connect(config: &DatabaseConfig) -> RudderResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds))
            .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
            .connect(&config.url)
            .await?;
        info!("调试标记存储已连接 (postgres)");
        Ok(Self { pool })
    }

    /// 幂等建表
    pub async fn apply_schema(&self) -> RudderResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS resource_debug (
                id BIGSERIAL PRIMARY KEY,
                uuid TEXT NOT NULL,
                reason TEXT,
                UNIQUE(uuid)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tenant_debug (
                id BIGSERIAL PRIMARY KEY,
                uuid TEXT NOT NULL,
                reason TEXT,
                UNIQUE(uuid)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS global_debug (
                id BIGSERIAL PRIMARY KEY,
                status TEXT NOT NULL,
                reason TEXT,
                UNIQUE(status)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;
        debug!("调试标记表就绪");
        Ok(())
    }

    pub fn registry(&self) -> DebugRegistry {
        DebugRegistry::new(
            Arc::new(PostgresScopedRepository {
                pool: self.pool.clone(),
                table: "resource_debug",
            }),
            Arc::new(PostgresScopedRepository {
                pool: self.pool.clone(),
                table: "tenant_debug",
            }),
            Arc::new(PostgresGlobalRepository {
                pool: self.pool.clone(),
            }),
        )
    }
}

struct PostgresScopedRepository {
    pool: PgPool,
    table: &'static str,
}

#[async_trait]
impl ScopedDebugRepository for PostgresScopedRepository {
    async fn enable(&self, uuid: &str, reason: Option<&str>) -> RudderResult<()> {
        // 唯一约束兜底并发开启，重复插入被DO NOTHING静默吞掉
        let sql = format!(
            "INSERT INTO {} (uuid, reason) VALUES ($1, $2) ON CONFLICT (uuid) DO NOTHING",
            self.table
        );
        sqlx::query(&sql)
            .bind(uuid)
            .bind(reason)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn disable(&self, uuid: &str) -> RudderResult<()> {
        let sql = format!("DELETE FROM {} WHERE uuid = $1", self.table);
        sqlx::query(&sql).bind(uuid).execute(&self.pool).await?;
        Ok(())
    }

    async fn status(&self, uuid: &str) -> RudderResult<(bool, Option<String>)> {
        let sql = format!("SELECT reason FROM {} WHERE uuid = $1", self.table);
        let row = sqlx::query(&sql)
            .bind(uuid)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok((true, row.try_get("reason")?)),
            None => Ok((false, None)),
        }
    }

    async fn list(&self) -> RudderResult<Vec<DebugFlag>> {
        let sql = format!("SELECT uuid, reason FROM {} ORDER BY uuid", self.table);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.into_iter()
            .map(|row| {
                Ok(DebugFlag {
                    uuid: row.try_get("uuid")?,
                    reason: row.try_get("reason")?,
                })
            })
            .collect()
    }
}

struct PostgresGlobalRepository {
    pool: PgPool,
}

const GLOBAL_STATUS: &str = "enabled";

#[async_trait]
impl GlobalDebugRepository for PostgresGlobalRepository {
    async fn enable(&self, reason: Option<&str>) -> RudderResult<()> {
        sqlx::query(
            "INSERT INTO global_debug (status, reason) VALUES ($1, $2) ON CONFLICT (status) DO NOTHING",
        )
        .bind(GLOBAL_STATUS)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn disable(&self) -> RudderResult<()> {
        sqlx::query("DELETE FROM global_debug WHERE status = $1")
            .bind(GLOBAL_STATUS)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn status(&self) -> RudderResult<(bool, Option<String>)> {
        let row = sqlx::query("SELECT reason FROM global_debug WHERE status = $1")
            .bind(GLOBAL_STATUS)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok((true, row.try_get("reason")?)),
            None => Ok((false, None)),
        }
    }
}
