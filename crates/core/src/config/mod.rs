pub mod models;

use std::path::Path;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};

use crate::errors::{RudderError, RudderResult};

pub use models::{
    AppConfig, CoordinationConfig, DatabaseConfig, NotificationConfig, ObservabilityConfig,
    SchedulerConfig,
};

impl AppConfig {
    /// 加载应用配置
    ///
    /// 优先级从低到高：内置默认值 < TOML配置文件 < RUDDER__ 前缀的环境变量。
    pub fn load(config_path: Option<&str>) -> RudderResult<Self> {
        let mut builder = ConfigBuilder::builder();

        let defaults = AppConfig::default();
        builder = builder
            .set_default("database.url", defaults.database.url.clone())
            .and_then(|b| b.set_default("database.max_connections", 10))
            .and_then(|b| b.set_default("database.min_connections", 1))
            .and_then(|b| b.set_default("database.connection_timeout_seconds", 30))
            .and_then(|b| b.set_default("database.idle_timeout_seconds", 600))
            .and_then(|b| b.set_default("notifications.url", defaults.notifications.url.clone()))
            .and_then(|b| b.set_default("notifications.queue", defaults.notifications.queue.clone()))
            .and_then(|b| {
                b.set_default("notifications.exchange", defaults.notifications.exchange.clone())
            })
            .and_then(|b| {
                b.set_default(
                    "notifications.binding_keys",
                    defaults.notifications.binding_keys.clone(),
                )
            })
            .and_then(|b| b.set_default("notifications.reconnect_max_attempts", 10))
            .and_then(|b| b.set_default("notifications.reconnect_delay_seconds", 2))
            .and_then(|b| b.set_default("scheduler.worker_count", 16))
            .and_then(|b| b.set_default("scheduler.max_attempts", 3))
            .and_then(|b| b.set_default("scheduler.requeue_delay_seconds", 10))
            .and_then(|b| b.set_default("coordination.enabled", true))
            .and_then(|b| b.set_default("coordination.url", defaults.coordination.url.clone()))
            .and_then(|b| {
                b.set_default("coordination.group_id", defaults.coordination.group_id.clone())
            })
            .and_then(|b| b.set_default("coordination.heartbeat_interval_seconds", 1))
            .and_then(|b| b.set_default("coordination.liveness_multiplier", 5))
            .and_then(|b| {
                b.set_default("observability.log_level", defaults.observability.log_level.clone())
            })
            .and_then(|b| b.set_default("observability.metrics_enabled", false))
            .and_then(|b| {
                b.set_default(
                    "observability.metrics_bind_address",
                    defaults.observability.metrics_bind_address.clone(),
                )
            })
            .map_err(|e| RudderError::Configuration(format!("设置默认配置失败: {e}")))?;

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(RudderError::Configuration(format!("配置文件不存在: {path}")));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else {
            // 未显式指定时按惯例路径探测，找不到就使用默认值
            for path in ["config/rudder.toml", "rudder.toml", "/etc/rudder/config.toml"] {
                if Path::new(path).exists() {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                    break;
                }
            }
        }

        let config = builder
            .add_source(Environment::with_prefix("RUDDER").separator("__"))
            .build()
            .map_err(|e| RudderError::Configuration(format!("构建配置失败: {e}")))?
            .try_deserialize::<AppConfig>()
            .map_err(|e| RudderError::Configuration(format!("解析配置失败: {e}")))?;

        config.validate()?;
        Ok(config)
    }
}
