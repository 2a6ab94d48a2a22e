use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use rudder_domain::{Event, Resource};

/// 调和失败的分类，决定任务队列的重试行为
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// 明确放弃本次调和，不重试
    #[error("reconciliation aborted: {0}")]
    Abort(String),

    /// 瞬时故障，可在重试预算内再次尝试
    #[error("transient reconciliation failure: {0}")]
    Transient(String),
}

/// 单资源调和的外部协作者边界
///
/// 设备侧的实际动作（构建配置、下发到appliance、调用云平台API）
/// 由驱动层实现该trait接入，本子系统只负责把事件可靠地送到这里。
#[async_trait]
pub trait Reconciler: Send + Sync {
    async fn reconcile(&self, resource: &Resource, event: &Event) -> Result<(), ReconcileError>;
}

/// 只记日志的调和器，用于未接入驱动层时的空载运行和测试
pub struct LoggingReconciler;

#[async_trait]
impl Reconciler for LoggingReconciler {
    async fn reconcile(&self, resource: &Resource, event: &Event) -> Result<(), ReconcileError> {
        info!(
            "reconcile {:?} for {} {} (tenant {})",
            event.crud, resource.kind, resource.id, resource.tenant_id
        );
        Ok(())
    }
}
