use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use rudder_domain::{
    CommandKind, CommandPayload, Crud, DebugRegistry, Event, RebalanceBody, Resource,
    WorkerMessage, WILDCARD,
};

use crate::cache::ResourceCache;
use crate::reconciler::{ReconcileError, Reconciler};
use crate::task_queue::{Task, TaskError, TaskHandler, TaskQueue, TaskQueueHandle};

/// worker构造参数
pub struct WorkerContext {
    /// 在worker池中的槽位
    pub index: usize,
    /// 本节点host id，rebalance归属判定用
    pub host_id: String,
    pub registry: DebugRegistry,
    pub reconciler: Arc<dyn Reconciler>,
    pub max_attempts: u32,
    pub requeue_delay: Duration,
}

/// 事件worker
///
/// 一个独立调度单元：独占自己的收件队列、任务队列和资源缓存，
/// 与其他worker之间不共享任何可变状态。收件循环只把事件转入
/// 任务队列，真正的执行（带重试）发生在任务队列的消费循环里。
pub struct EventWorker;

impl EventWorker {
    /// 启动worker，返回其生命周期句柄；收到毒丸并排空后句柄完成
    pub fn spawn(
        ctx: WorkerContext,
        mut rx: mpsc::UnboundedReceiver<WorkerMessage>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let index = ctx.index;
            let queue = TaskQueue::new(ctx.max_attempts, ctx.requeue_delay);
            let enqueue = queue.handle();
            let handler = Arc::new(ReconcileHandler {
                index,
                host_id: ctx.host_id,
                registry: ctx.registry,
                reconciler: ctx.reconciler,
                cache: Mutex::new(ResourceCache::new()),
                queue: queue.handle(),
            });
            queue.start(handler).await;
            info!("worker {} 启动", index);

            while let Some(message) = rx.recv().await {
                match message {
                    WorkerMessage::Event { routing_key, event } => {
                        counter!("rudder_worker_events_total").increment(1);
                        let reason = Some(format!("{:?}", event.crud));
                        if let Err(e) = enqueue.enqueue((routing_key, event), reason) {
                            error!("worker {} 事件入队失败: {}", index, e);
                        }
                    }
                    WorkerMessage::Stop => {
                        info!("worker {} 收到停止信号，开始排空", index);
                        break;
                    }
                }
            }

            queue.shutdown().await;
            info!("worker {} 已退出", index);
        })
    }
}

/// 任务队列的执行端：对单个事件完成调试检查、缓存维护和调和
struct ReconcileHandler {
    index: usize,
    host_id: String,
    registry: DebugRegistry,
    reconciler: Arc<dyn Reconciler>,
    // 任务串行执行，锁只为满足跨await的Send约束，不存在实际竞争
    cache: Mutex<ResourceCache>,
    queue: TaskQueueHandle,
}

#[async_trait]
impl TaskHandler for ReconcileHandler {
    async fn execute(&self, task: &Task) -> Result<(), TaskError> {
        let (_, event) = &task.data;
        match event.crud {
            Crud::Command => self.apply_command(event).await,
            Crud::Poll if event.resource.is_broadcast() => self.poll_all().await,
            Crud::Rebalance => self.apply_rebalance(event).await,
            _ => self.apply_resource_event(event).await,
        }
    }
}

impl ReconcileHandler {
    /// 全局poll：对本worker已知的每个资源安排一次无条件recheck
    async fn poll_all(&self) -> Result<(), TaskError> {
        let resources = self.cache.lock().await.all();
        debug!("worker {} poll扇出 {} 个资源", self.index, resources.len());
        for resource in resources {
            self.enqueue_recheck(resource, "poll");
        }
        Ok(())
    }

    fn enqueue_recheck(&self, resource: Resource, reason: &str) {
        let key = resource.tenant_id.clone();
        let event = Event::new(resource, Crud::Poll, Value::Null);
        if let Err(e) = self.queue.enqueue((key, event), Some(reason.to_string())) {
            warn!("worker {} recheck入队失败: {}", self.index, e);
        }
    }

    async fn apply_resource_event(&self, event: &Event) -> Result<(), TaskError> {
        let resource = &event.resource;

        // 依赖对象变更可能定位不到具体资源，按租户已知资源做一轮recheck
        if resource.id.is_empty() {
            return self.recheck_tenant(&resource.tenant_id).await;
        }

        match self.registry.reconciliation_blocked(resource).await {
            Ok(None) => {}
            Ok(Some(reason)) => {
                info!(
                    "worker {} 跳过被调试标记的资源 {}: {}",
                    self.index, resource.id, reason
                );
                return Ok(());
            }
            Err(e) => return Err(TaskError::Failed(format!("查询调试标记失败: {e}"))),
        }

        if event.crud == Crud::Delete {
            let known = self.cache.lock().await.remove(&resource.id).is_some();
            // RPC来的删除没有租户上下文，是广播投递的：只有缓存了
            // 该资源的worker负责善后，其余worker直接忽略
            if !known && resource.tenant_id == WILDCARD {
                debug!(
                    "worker {} 未缓存的广播删除 {}，忽略",
                    self.index, resource.id
                );
                return Ok(());
            }
        } else {
            self.cache.lock().await.insert(resource.clone());
        }

        match self.reconciler.reconcile(resource, event).await {
            Ok(()) => Ok(()),
            Err(ReconcileError::Abort(reason)) => Err(TaskError::Abort(reason)),
            Err(ReconcileError::Transient(cause)) => Err(TaskError::Failed(cause)),
        }
    }

    async fn recheck_tenant(&self, tenant_id: &str) -> Result<(), TaskError> {
        let known = self.cache.lock().await.tenant_resources(tenant_id);
        if known.is_empty() {
            debug!("worker {} 租户 {} 没有已知资源，忽略", self.index, tenant_id);
            return Ok(());
        }
        for resource in known {
            self.enqueue_recheck(resource, "tenant-recheck");
        }
        Ok(())
    }

    async fn apply_command(&self, event: &Event) -> Result<(), TaskError> {
        let payload: CommandPayload = match serde_json::from_value(event.body.clone()) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("worker {} 无法解析命令载荷: {}", self.index, e);
                return Ok(());
            }
        };
        let Some(kind) = payload.kind() else {
            warn!("worker {} 忽略未知命令: {:?}", self.index, payload.command);
            return Ok(());
        };

        match kind {
            CommandKind::Poll => self.poll_all().await,
            CommandKind::ResourceDebug => {
                let Some(id) = payload.resource_id.as_deref() else {
                    warn!("resource-debug 缺少resource_id，忽略");
                    return Ok(());
                };
                self.registry
                    .resources
                    .enable(id, payload.reason.as_deref())
                    .await
                    .map_err(|e| TaskError::Failed(e.to_string()))?;
                info!("资源 {} 进入调试模式，暂停自动调和", id);
                Ok(())
            }
            CommandKind::ResourceManage => {
                let Some(id) = payload.resource_id.as_deref() else {
                    warn!("resource-manage 缺少resource_id，忽略");
                    return Ok(());
                };
                self.registry
                    .resources
                    .disable(id)
                    .await
                    .map_err(|e| TaskError::Failed(e.to_string()))?;
                info!("资源 {} 恢复自动调和", id);
                Ok(())
            }
            CommandKind::TenantDebug => {
                let Some(id) = payload.tenant_id.as_deref() else {
                    warn!("tenant-debug 缺少tenant_id，忽略");
                    return Ok(());
                };
                self.registry
                    .tenants
                    .enable(id, payload.reason.as_deref())
                    .await
                    .map_err(|e| TaskError::Failed(e.to_string()))?;
                info!("租户 {} 进入调试模式", id);
                Ok(())
            }
            CommandKind::TenantManage => {
                let Some(id) = payload.tenant_id.as_deref() else {
                    warn!("tenant-manage 缺少tenant_id，忽略");
                    return Ok(());
                };
                self.registry
                    .tenants
                    .disable(id)
                    .await
                    .map_err(|e| TaskError::Failed(e.to_string()))?;
                info!("租户 {} 恢复自动调和", id);
                Ok(())
            }
            CommandKind::GlobalDebug => {
                if payload.enabled == Some(0) {
                    self.registry
                        .global
                        .disable()
                        .await
                        .map_err(|e| TaskError::Failed(e.to_string()))?;
                    info!("全局调试关闭");
                } else {
                    self.registry
                        .global
                        .enable(payload.reason.as_deref())
                        .await
                        .map_err(|e| TaskError::Failed(e.to_string()))?;
                    info!("全局调试开启，所有自动调和暂停");
                }
                Ok(())
            }
            CommandKind::ResourceUpdate | CommandKind::ResourceRebuild => {
                let Some(resource) = self.resolve_command_target(&event.resource).await else {
                    return Ok(());
                };
                let key = resource.tenant_id.clone();
                // body原样带给驱动层，rebuild的image_uuid在里面
                let forced = Event::new(resource, Crud::Update, event.body.clone());
                if let Err(e) = self
                    .queue
                    .enqueue((key, forced), Some(kind.as_str().to_string()))
                {
                    warn!("worker {} {}入队失败: {}", self.index, kind.as_str(), e);
                }
                Ok(())
            }
            CommandKind::ConfigReload => {
                self.cache.lock().await.clear();
                info!("worker {} 收到config-reload，资源缓存已清空", self.index);
                Ok(())
            }
            CommandKind::WorkersDebug => self.report_state().await,
        }
    }

    /// 定向命令的目标解析：未带租户的广播命令只由缓存里认识它的worker处理
    async fn resolve_command_target(&self, resource: &Resource) -> Option<Resource> {
        if resource.is_broadcast() {
            warn!("命令未指定目标资源，忽略");
            return None;
        }
        if resource.tenant_id != WILDCARD {
            return Some(resource.clone());
        }
        let cached = self.cache.lock().await.get(&resource.id).cloned();
        if cached.is_none() {
            debug!(
                "worker {} 不认识资源 {}，交给缓存了它的worker处理",
                self.index, resource.id
            );
        }
        cached
    }

    async fn apply_rebalance(&self, event: &Event) -> Result<(), TaskError> {
        let body: RebalanceBody = match serde_json::from_value(event.body.clone()) {
            Ok(body) => body,
            Err(e) => {
                warn!("worker {} 无法解析rebalance载荷: {}", self.index, e);
                return Ok(());
            }
        };
        if body.members.is_empty() {
            warn!("worker {} rebalance成员列表为空，跳过", self.index);
            return Ok(());
        }

        let (evicted, kept) = {
            let mut cache = self.cache.lock().await;
            let evicted = cache.evict_not_owned(&self.host_id, &body.members);
            (evicted, cache.all())
        };
        info!(
            "worker {} rebalance: members={} evicted={} kept={} bootstrap={}",
            self.index,
            body.members.len(),
            evicted.len(),
            kept.len(),
            body.node_bootstrap
        );

        // 留下的资源安排一轮recheck，确认归属变化后的实际状态
        for resource in kept {
            self.enqueue_recheck(resource, "rebalance");
        }
        Ok(())
    }

    async fn report_state(&self) -> Result<(), TaskError> {
        let cached = self.cache.lock().await.len();
        let resource_flags = self.registry.resources.list().await.unwrap_or_default();
        let tenant_flags = self.registry.tenants.list().await.unwrap_or_default();
        let global = self
            .registry
            .global
            .status()
            .await
            .unwrap_or((false, None));

        info!(
            "worker {} 状态报告: host={} 队列深度={} 缓存资源={} 资源调试标记={} 租户调试标记={} 全局调试={:?}",
            self.index,
            self.host_id,
            self.queue.depth(),
            cached,
            resource_flags.len(),
            tenant_flags.len(),
            global
        );
        Ok(())
    }
}
