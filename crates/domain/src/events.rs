use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// 广播哨兵：路由键或资源ID为该值时事件发往所有worker
pub const WILDCARD: &str = "*";
/// 历史遗留的错误哨兵，等价于通配符广播
pub const ERROR_SENTINEL: &str = "error";

/// 受管的网络设备资源标识
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resource {
    /// 资源唯一标识（UUID字符串）。`*` 与 `error` 为保留哨兵，表示广播
    pub id: String,
    /// 所属租户ID，`*` 表示通配
    pub tenant_id: String,
    /// 资源类型（router / loadbalancer），`*` 表示集群级事件
    pub kind: String,
}

impl Resource {
    pub fn new(id: impl Into<String>, tenant_id: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tenant_id: tenant_id.into(),
            kind: kind.into(),
        }
    }

    /// 路由器资源
    pub fn router(id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self::new(id, tenant_id, "router")
    }

    /// 通配资源，面向所有worker
    pub fn wildcard() -> Self {
        Self::new(WILDCARD, WILDCARD, WILDCARD)
    }

    pub fn is_broadcast(&self) -> bool {
        self.id == WILDCARD || self.id == ERROR_SENTINEL
    }
}

/// 事件动作类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Crud {
    Create,
    Update,
    Delete,
    /// 无条件重新核对资源当前状态
    Poll,
    /// 运维指令
    Command,
    /// 集群成员变化，重新推导归属
    Rebalance,
}

/// 贯穿整个流水线的不可变事件
///
/// 由通知归一化器或集群协调器构造一次，之后只读；
/// 恰好被一个worker消费，广播场景下每个worker处理各自独立的副本。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub resource: Resource,
    pub crud: Crud,
    pub body: Value,
}

impl Event {
    pub fn new(resource: Resource, crud: Crud, body: Value) -> Self {
        Self { resource, crud, body }
    }

    /// 全局poll事件，始终广播
    pub fn poll() -> Self {
        Self::new(Resource::wildcard(), Crud::Poll, Value::Null)
    }

    /// 集群rebalance事件，携带当前成员快照
    pub fn rebalance(members: &[String], node_bootstrap: bool) -> Self {
        let body = RebalanceBody {
            members: members.to_vec(),
            node_bootstrap,
        };
        Self::new(
            Resource::wildcard(),
            Crud::Rebalance,
            serde_json::to_value(&body).unwrap_or(Value::Null),
        )
    }

    /// 推导路由键：广播类事件用通配哨兵，其余用租户ID
    pub fn routing_key(&self) -> String {
        if matches!(self.crud, Crud::Poll | Crud::Rebalance) || self.resource.is_broadcast() {
            WILDCARD.to_string()
        } else {
            self.resource.tenant_id.clone()
        }
    }
}

/// REBALANCE 事件的body结构
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RebalanceBody {
    pub members: Vec<String>,
    #[serde(default)]
    pub node_bootstrap: bool,
}

/// 把路由键解析为128位标识，解析失败返回None
pub fn parse_identifier(key: &str) -> Option<u128> {
    Uuid::parse_str(key).ok().map(|u| u.as_u128())
}

/// 在排好序的成员列表中确定资源归属的节点
///
/// 各节点独立计算，同样的成员快照必然得到同样的归属结论。
pub fn owner_of<'a>(resource_id: &str, members: &'a [String]) -> Option<&'a str> {
    if members.is_empty() {
        return None;
    }
    let id = parse_identifier(resource_id)?;
    let mut sorted: Vec<&String> = members.iter().collect();
    sorted.sort();
    Some(sorted[(id % sorted.len() as u128) as usize].as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routing_key_uses_tenant() {
        let event = Event::new(
            Resource::router("9774f7d5-df11-46bf-b9a0-4dbbd6c3452e", "tenant-a"),
            Crud::Update,
            Value::Null,
        );
        assert_eq!(event.routing_key(), "tenant-a");
    }

    #[test]
    fn test_poll_and_rebalance_are_broadcast() {
        assert_eq!(Event::poll().routing_key(), WILDCARD);
        let rebalance = Event::rebalance(&["host-a".to_string()], true);
        assert_eq!(rebalance.routing_key(), WILDCARD);
    }

    #[test]
    fn test_error_sentinel_is_broadcast() {
        let event = Event::new(
            Resource::new(ERROR_SENTINEL, "tenant-a", "router"),
            Crud::Update,
            Value::Null,
        );
        assert_eq!(event.routing_key(), WILDCARD);
    }

    #[test]
    fn test_rebalance_body_round_trip() {
        let event = Event::rebalance(&["host-b".to_string(), "host-a".to_string()], false);
        let body: RebalanceBody = serde_json::from_value(event.body).unwrap();
        assert_eq!(body.members.len(), 2);
        assert!(!body.node_bootstrap);
    }

    #[test]
    fn test_parse_identifier() {
        assert!(parse_identifier("9774f7d5-df11-46bf-b9a0-4dbbd6c3452e").is_some());
        assert!(parse_identifier("not-a-uuid").is_none());
        assert!(parse_identifier("").is_none());
    }

    #[test]
    fn test_owner_is_stable_across_member_order() {
        let id = "9774f7d5-df11-46bf-b9a0-4dbbd6c3452e";
        let forward = vec!["host-a".to_string(), "host-b".to_string(), "host-c".to_string()];
        let reversed = vec!["host-c".to_string(), "host-b".to_string(), "host-a".to_string()];
        assert_eq!(owner_of(id, &forward), owner_of(id, &reversed));
        assert!(owner_of(id, &[]).is_none());
    }
}
