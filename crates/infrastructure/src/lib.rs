pub mod amqp;
pub mod database;
pub mod redis_coordination;

pub use amqp::AmqpNotificationSource;
pub use database::{build_debug_registry, PostgresDebugStore, SqliteDebugStore};
pub use redis_coordination::RedisCoordinationBackend;
