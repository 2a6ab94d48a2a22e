use thiserror::Error;

/// 编排器统一错误类型定义
#[derive(Debug, Error)]
pub enum RudderError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("消息队列错误: {0}")]
    MessageQueue(String),

    #[error("集群协调错误: {0}")]
    Coordination(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("任务执行错误: {0}")]
    TaskExecution(String),

    #[error("队列已关闭: {0}")]
    QueueClosed(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

/// 统一的Result类型
pub type RudderResult<T> = std::result::Result<T, RudderError>;

impl RudderError {
    /// 判断错误是否属于可重试的瞬时故障
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            RudderError::Database(_)
                | RudderError::MessageQueue(_)
                | RudderError::Coordination(_)
                | RudderError::TaskExecution(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RudderError::MessageQueue("conn reset".to_string()).is_transient());
        assert!(RudderError::TaskExecution("boom".to_string()).is_transient());
        assert!(!RudderError::Configuration("bad".to_string()).is_transient());
        assert!(!RudderError::Internal("bad".to_string()).is_transient());
    }

    #[test]
    fn test_error_display_contains_detail() {
        let err = RudderError::Coordination("join failed".to_string());
        assert!(err.to_string().contains("join failed"));
    }
}
