pub mod postgres;
pub mod sqlite;

pub use postgres::PostgresDebugStore;
pub use sqlite::SqliteDebugStore;

use rudder_core::{DatabaseConfig, RudderResult};
use rudder_domain::DebugRegistry;

/// 按数据库URL选择后端并装配调试标记注册表
pub async fn build_debug_registry(config: &DatabaseConfig) -> RudderResult<DebugRegistry> {
    if config.url.starts_with("postgres://") || config.url.starts_with("postgresql://") {
        let store = PostgresDebugStore::connect(config).await?;
        store.apply_schema().await?;
        Ok(store.registry())
    } else {
        let store = SqliteDebugStore::connect(config).await?;
        store.apply_schema().await?;
        Ok(store.registry())
    }
}
