use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::{debug, info};

use rudder_core::{RudderError, RudderResult};
use rudder_domain::{CoordinationBackend, GroupEvent};

/// 基于Redis的协调后端
///
/// 成员即带TTL的key，心跳靠刷新TTL续命，错过存活窗口的成员
/// 自然过期离组。成员变化通过心跳节拍间的成员快照差分产生。
/// leader取字典序最小的成员：无需选举协议，同一快照下各节点
/// 结论一致。
pub struct RedisCoordinationBackend {
    manager: ConnectionManager,
    /// 成员key的TTL（秒），心跳间隔×存活倍数
    ttl_seconds: u64,
    watch_join: AtomicBool,
    watch_leave: AtomicBool,
    last_seen: Mutex<HashSet<String>>,
}

impl RedisCoordinationBackend {
    /// 建立到Redis的连接；启动期连不上属于致命错误，由调用方上抛
    pub async fn connect(url: &str, ttl_seconds: u64) -> RudderResult<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| RudderError::Coordination(format!("解析Redis地址失败: {e}")))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| RudderError::Coordination(format!("连接Redis失败: {e}")))?;
        info!("协调后端已连接: {} (member ttl {}s)", url, ttl_seconds);
        Ok(Self {
            manager,
            ttl_seconds: ttl_seconds.max(1),
            watch_join: AtomicBool::new(false),
            watch_leave: AtomicBool::new(false),
            last_seen: Mutex::new(HashSet::new()),
        })
    }

    fn group_key(group: &str) -> String {
        format!("rudder:{group}:group")
    }

    fn member_key(group: &str, member: &str) -> String {
        format!("rudder:{group}:member:{member}")
    }

    fn member_pattern(group: &str) -> String {
        format!("rudder:{group}:member:*")
    }

    async fn register_member(&self, group: &str, member: &str) -> RudderResult<()> {
        let mut conn = self.manager.clone();
        let _: () = conn
            .set_ex(Self::member_key(group, member), member, self.ttl_seconds)
            .await
            .map_err(|e| RudderError::Coordination(format!("写入成员key失败: {e}")))?;
        Ok(())
    }

    async fn current_members(&self, group: &str) -> RudderResult<Vec<String>> {
        let mut conn = self.manager.clone();
        let keys: Vec<String> = conn
            .keys(Self::member_pattern(group))
            .await
            .map_err(|e| RudderError::Coordination(format!("扫描成员key失败: {e}")))?;
        let prefix = format!("rudder:{group}:member:");
        let mut members: Vec<String> = keys
            .into_iter()
            .filter_map(|key| key.strip_prefix(&prefix).map(str::to_string))
            .collect();
        members.sort();
        Ok(members)
    }
}

#[async_trait]
impl CoordinationBackend for RedisCoordinationBackend {
    async fn create_group(&self, group: &str) -> RudderResult<()> {
        // SET天然幂等，"组已存在"不是错误
        let mut conn = self.manager.clone();
        let _: () = conn
            .set(Self::group_key(group), 1u8)
            .await
            .map_err(|e| RudderError::Coordination(format!("创建协调组失败: {e}")))?;
        Ok(())
    }

    async fn join_group(&self, group: &str, member: &str) -> RudderResult<()> {
        // 重复入组只是刷新TTL
        self.register_member(group, member).await
    }

    async fn leave_group(&self, group: &str, member: &str) -> RudderResult<()> {
        let mut conn = self.manager.clone();
        let _: () = conn
            .del(Self::member_key(group, member))
            .await
            .map_err(|e| RudderError::Coordination(format!("删除成员key失败: {e}")))?;
        Ok(())
    }

    async fn get_members(&self, group: &str) -> RudderResult<Vec<String>> {
        self.current_members(group).await
    }

    async fn get_leader(&self, group: &str) -> RudderResult<Option<String>> {
        // 字典序最小的成员即leader，同一成员快照下所有节点结论一致
        Ok(self.current_members(group).await?.into_iter().next())
    }

    async fn heartbeat(&self, group: &str, member: &str) -> RudderResult<()> {
        // 刷新TTL；key已过期时顺带重新注册
        self.register_member(group, member).await
    }

    async fn watch_join_group(&self, group: &str) -> RudderResult<()> {
        self.watch_join.store(true, Ordering::SeqCst);
        // watch起点的快照，之后的差分以此为基准
        let snapshot: HashSet<String> = self.current_members(group).await?.into_iter().collect();
        *self.last_seen.lock().await = snapshot;
        Ok(())
    }

    async fn watch_leave_group(&self, _group: &str) -> RudderResult<()> {
        self.watch_leave.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn unwatch_group(&self, _group: &str) -> RudderResult<()> {
        self.watch_join.store(false, Ordering::SeqCst);
        self.watch_leave.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn pending_events(&self, group: &str) -> RudderResult<Vec<GroupEvent>> {
        let watch_join = self.watch_join.load(Ordering::SeqCst);
        let watch_leave = self.watch_leave.load(Ordering::SeqCst);
        if !watch_join && !watch_leave {
            return Ok(Vec::new());
        }

        let current: HashSet<String> = self.current_members(group).await?.into_iter().collect();
        let mut last_seen = self.last_seen.lock().await;

        let mut events = Vec::new();
        if watch_join {
            for member in current.difference(&last_seen) {
                events.push(GroupEvent::MemberJoined(member.clone()));
            }
        }
        if watch_leave {
            for member in last_seen.difference(&current) {
                events.push(GroupEvent::MemberLeft(member.clone()));
            }
        }
        if !events.is_empty() {
            debug!("检测到 {} 个成员变化", events.len());
        }
        *last_seen = current;
        Ok(events)
    }
}
