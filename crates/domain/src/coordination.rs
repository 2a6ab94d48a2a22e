use async_trait::async_trait;

use rudder_core::RudderResult;

/// 协调组成员变化
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEvent {
    MemberJoined(String),
    MemberLeft(String),
}

/// 集群协调后端契约
///
/// 任何满足该契约的成员/锁服务都可以接入；当前仓库内置Redis实现。
/// `create_group` 与 `join_group` 要求幂等："已存在"与"已是成员"
/// 都不算错误。
#[async_trait]
pub trait CoordinationBackend: Send + Sync {
    async fn create_group(&self, group: &str) -> RudderResult<()>;

    async fn join_group(&self, group: &str, member: &str) -> RudderResult<()>;

    async fn leave_group(&self, group: &str, member: &str) -> RudderResult<()>;

    async fn get_members(&self, group: &str) -> RudderResult<Vec<String>>;

    /// 当前leader，组为空时返回None
    async fn get_leader(&self, group: &str) -> RudderResult<Option<String>>;

    async fn heartbeat(&self, group: &str, member: &str) -> RudderResult<()>;

    /// 开始关注成员加入
    async fn watch_join_group(&self, group: &str) -> RudderResult<()>;

    /// 开始关注成员离开
    async fn watch_leave_group(&self, group: &str) -> RudderResult<()>;

    /// 停止关注成员变化
    async fn unwatch_group(&self, group: &str) -> RudderResult<()>;

    /// 取走自上次调用以来累积的成员变化，由协调器在心跳节拍里派发
    async fn pending_events(&self, group: &str) -> RudderResult<Vec<GroupEvent>>;

    /// 主动让出leader身份，后端不支持时保持默认的无操作
    async fn stand_down(&self, _group: &str, _member: &str) -> RudderResult<()> {
        Ok(())
    }
}
