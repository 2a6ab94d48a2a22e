use metrics::counter;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use rudder_core::{RudderError, RudderResult};
use rudder_domain::{Event, EventReceiver, WorkerMessage};

use crate::ring::HashRing;

/// 调度器生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Uninitialized,
    Running,
    Stopping,
    Stopped,
}

/// worker的构造工厂：拿到槽位号和收件队列，返回生命周期句柄。
/// 由装配层注入，调度器本身不关心worker内部如何执行。
pub type WorkerFactory =
    Box<dyn Fn(usize, mpsc::UnboundedReceiver<WorkerMessage>) -> JoinHandle<()> + Send + Sync>;

struct WorkerSlot {
    index: usize,
    tx: mpsc::UnboundedSender<WorkerMessage>,
}

/// 调度器：持有固定大小的worker池，按派发规则路由事件
///
/// 每个worker独占一条收件队列；`stop` 向所有队列投毒丸并等待
/// worker排空退出，停止开始后不再接收新事件。
pub struct Scheduler {
    ring: HashRing,
    workers: Vec<WorkerSlot>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    state: RwLock<SchedulerState>,
}

impl Scheduler {
    /// 启动worker池。`worker_count` 必须大于等于1，否则视为致命配置错误。
    pub fn start(worker_count: usize, factory: WorkerFactory) -> RudderResult<Self> {
        if worker_count < 1 {
            return Err(RudderError::Configuration(
                "scheduler.worker_count must be at least 1".to_string(),
            ));
        }

        let mut workers = Vec::with_capacity(worker_count);
        let mut handles = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let (tx, rx) = mpsc::unbounded_channel();
            handles.push(factory(index, rx));
            workers.push(WorkerSlot { index, tx });
        }
        info!("调度器启动，worker池大小: {}", worker_count);

        Ok(Self {
            ring: HashRing::new(worker_count),
            workers,
            handles: Mutex::new(handles),
            state: RwLock::new(SchedulerState::Running),
        })
    }

    pub async fn state(&self) -> SchedulerState {
        *self.state.read().await
    }

    /// 把一个事件投递到派发规则选出的worker集合
    pub async fn dispatch(&self, routing_key: &str, event: Event) -> RudderResult<()> {
        if *self.state.read().await != SchedulerState::Running {
            return Err(RudderError::Internal(
                "scheduler is not running, event rejected".to_string(),
            ));
        }

        let targets = self.ring.targets(routing_key);
        if targets.is_empty() {
            counter!("rudder_events_dropped_total").increment(1);
            return Ok(());
        }

        debug!(
            "派发事件 {:?} (routing_key={}) 到 {} 个worker",
            event.crud,
            routing_key,
            targets.len()
        );
        for index in targets {
            let slot = &self.workers[index];
            let message = WorkerMessage::Event {
                routing_key: routing_key.to_string(),
                event: event.clone(),
            };
            if slot.tx.send(message).is_err() {
                // worker收件队列关闭意味着worker已死，按崩溃策略记录并继续
                error!("worker {} 的收件队列已关闭，事件丢失", slot.index);
            }
        }
        counter!("rudder_events_dispatched_total").increment(1);
        Ok(())
    }

    /// 优雅停止：投毒丸，等全部worker排空退出后返回
    pub async fn stop(&self) {
        {
            let mut state = self.state.write().await;
            if *state != SchedulerState::Running {
                return;
            }
            *state = SchedulerState::Stopping;
        }
        info!("调度器开始停止，向 {} 个worker投递毒丸", self.workers.len());

        for slot in &self.workers {
            if slot.tx.send(WorkerMessage::Stop).is_err() {
                warn!("worker {} 在停止前已退出", slot.index);
            }
        }

        let handles: Vec<JoinHandle<()>> = self.handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!("等待worker退出失败: {}", e);
            }
        }

        *self.state.write().await = SchedulerState::Stopped;
        info!("调度器已停止，所有worker退出");
    }
}

/// 主摄取循环：从共享摄取队列取事件喂给调度器
///
/// 队列关闭或收到关停信号后返回；派发失败只记录，不会中断循环。
pub async fn run_dispatch_loop(
    scheduler: &Scheduler,
    mut events: EventReceiver,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    info!("摄取派发循环启动");
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("摄取派发循环收到关停信号");
                break;
            }
            maybe = events.recv() => {
                match maybe {
                    Some((routing_key, event)) => {
                        if let Err(e) = scheduler.dispatch(&routing_key, event).await {
                            warn!("事件派发被拒绝: {}", e);
                        }
                    }
                    None => {
                        info!("摄取队列已关闭，派发循环退出");
                        break;
                    }
                }
            }
        }
    }
}
