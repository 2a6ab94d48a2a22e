//! 集群协调器：维护本节点在协调组里的成员身份，
//! 把成员变动翻译成编排可见的REBALANCE事件。

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use rudder_core::{RudderError, RudderResult};
use rudder_domain::{CoordinationBackend, Event, EventSender, GroupEvent, WILDCARD};

/// 协调器生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Init,
    Joining,
    Active,
    Stopping,
    Stopped,
}

/// 集群协调器
///
/// `start` 完成建组/入组/初始心跳并注册成员watch，随后立刻用当前
/// 成员快照合成一条bootstrap REBALANCE，本节点不用等外部变化就能
/// 种出自己的集群视图。`run` 按心跳间隔驱动，瞬时故障只记日志，
/// 只有专门的停止信号能终止循环。
pub struct ClusterCoordinator {
    backend: Arc<dyn CoordinationBackend>,
    group_id: String,
    host_id: String,
    heartbeat_interval: Duration,
    events: EventSender,
    state: RwLock<CoordinatorState>,
    done_tx: watch::Sender<bool>,
}

impl ClusterCoordinator {
    pub fn new(
        backend: Arc<dyn CoordinationBackend>,
        group_id: impl Into<String>,
        host_id: impl Into<String>,
        heartbeat_interval: Duration,
        events: EventSender,
    ) -> Self {
        let (done_tx, _) = watch::channel(false);
        Self {
            backend,
            group_id: group_id.into(),
            host_id: host_id.into(),
            heartbeat_interval,
            events,
            state: RwLock::new(CoordinatorState::Init),
            done_tx,
        }
    }

    pub async fn state(&self) -> CoordinatorState {
        *self.state.read().await
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// 入组并播种本节点的集群视图；建组/入组失败是致命错误
    pub async fn start(&self) -> RudderResult<()> {
        *self.state.write().await = CoordinatorState::Joining;
        info!(
            "协调器启动: group={} host={} heartbeat={:?}",
            self.group_id, self.host_id, self.heartbeat_interval
        );

        self.backend
            .create_group(&self.group_id)
            .await
            .map_err(|e| RudderError::Coordination(format!("创建协调组失败: {e}")))?;
        self.backend
            .join_group(&self.group_id, &self.host_id)
            .await
            .map_err(|e| RudderError::Coordination(format!("加入协调组失败: {e}")))?;
        self.backend
            .heartbeat(&self.group_id, &self.host_id)
            .await
            .map_err(|e| RudderError::Coordination(format!("初始心跳失败: {e}")))?;
        self.backend.watch_join_group(&self.group_id).await?;
        self.backend.watch_leave_group(&self.group_id).await?;

        let members = self.backend.get_members(&self.group_id).await?;
        self.push_rebalance(&members, true);

        *self.state.write().await = CoordinatorState::Active;
        Ok(())
    }

    /// 心跳循环，直到stop发出专门的停止信号
    pub async fn run(&self) -> RudderResult<()> {
        let mut done_rx = self.done_tx.subscribe();
        let mut ticker = tokio::time::interval(self.heartbeat_interval);

        loop {
            if *done_rx.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.backend.heartbeat(&self.group_id, &self.host_id).await {
                        // 瞬时心跳失败不终止循环
                        warn!("心跳失败: {}", e);
                    }
                    match self.backend.pending_events(&self.group_id).await {
                        Ok(changes) if !changes.is_empty() => {
                            self.handle_membership_changes(&changes).await;
                        }
                        Ok(_) => {}
                        Err(e) => warn!("拉取成员变化失败: {}", e),
                    }
                }
                _ = done_rx.changed() => {
                    debug!("协调器循环收到停止信号");
                    break;
                }
            }
        }

        *self.state.write().await = CoordinatorState::Stopped;
        info!("协调器循环已退出");
        Ok(())
    }

    /// 本节点是否为当前leader；纯信息信号，核心行为不依赖它
    pub async fn is_leader(&self) -> RudderResult<bool> {
        let leader = self.backend.get_leader(&self.group_id).await?;
        Ok(leader.as_deref() == Some(self.host_id.as_str()))
    }

    /// 退组：注销watch、尽力让出leader、离组，再终止run循环
    pub async fn stop(&self) {
        *self.state.write().await = CoordinatorState::Stopping;
        info!("协调器开始停止: group={}", self.group_id);

        if let Err(e) = self.backend.unwatch_group(&self.group_id).await {
            warn!("注销成员watch失败: {}", e);
        }
        if let Err(e) = self.backend.stand_down(&self.group_id, &self.host_id).await {
            debug!("让出leader失败（后端可能不支持）: {}", e);
        }
        if let Err(e) = self.backend.leave_group(&self.group_id, &self.host_id).await {
            warn!("离开协调组失败: {}", e);
        }

        let _ = self.done_tx.send(true);
    }

    async fn handle_membership_changes(&self, changes: &[GroupEvent]) {
        let members = match self.backend.get_members(&self.group_id).await {
            Ok(members) => members,
            Err(e) => {
                warn!("成员变化后刷新成员列表失败: {}", e);
                return;
            }
        };
        for change in changes {
            match change {
                GroupEvent::MemberJoined(member) => info!("集群成员加入: {}", member),
                GroupEvent::MemberLeft(member) => info!("集群成员离开: {}", member),
            }
            self.push_rebalance(&members, false);
        }
    }

    fn push_rebalance(&self, members: &[String], node_bootstrap: bool) {
        counter!("rudder_rebalance_events_total").increment(1);
        info!(
            "发布rebalance事件: members={:?} bootstrap={}",
            members, node_bootstrap
        );
        let event = Event::rebalance(members, node_bootstrap);
        if self
            .events
            .send((WILDCARD.to_string(), event))
            .is_err()
        {
            warn!("摄取队列已关闭，rebalance事件丢失");
        }
    }
}
