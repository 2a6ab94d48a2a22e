use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use metrics::counter;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use rudder_core::{RudderError, RudderResult};
use rudder_domain::EventEnvelope;

/// 任务执行失败的两种形态
#[derive(Debug)]
pub enum TaskError {
    /// 明确放弃，立即丢弃不重试
    Abort(String),
    /// 瞬时失败，在重试预算内重新入队
    Failed(String),
}

/// 一次可重试的工作单元
#[derive(Debug)]
pub struct Task {
    pub data: EventEnvelope,
    /// 已执行次数，从0开始，每次调用前递增
    pub attempt: u32,
    pub max_attempts: u32,
    pub reason: Option<String>,
}

/// 任务的实际执行者，由worker注入
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn execute(&self, task: &Task) -> Result<(), TaskError>;
}

enum QueueMessage {
    Run(Task),
    /// 毒丸：消费循环排空后退出
    Stop,
}

/// 入队句柄，可廉价克隆给任务处理器做扇出回灌
#[derive(Clone)]
pub struct TaskQueueHandle {
    ready_tx: mpsc::UnboundedSender<QueueMessage>,
    closed: Arc<AtomicBool>,
    pending: Arc<AtomicUsize>,
    default_max_attempts: u32,
}

impl TaskQueueHandle {
    pub fn enqueue(&self, data: EventEnvelope, reason: Option<String>) -> RudderResult<()> {
        self.enqueue_with_attempts(data, self.default_max_attempts, reason)
    }

    pub fn enqueue_with_attempts(
        &self,
        data: EventEnvelope,
        max_attempts: u32,
        reason: Option<String>,
    ) -> RudderResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RudderError::QueueClosed(
                "task queue is shutting down".to_string(),
            ));
        }
        let task = Task {
            data,
            attempt: 0,
            max_attempts,
            reason,
        };
        self.pending.fetch_add(1, Ordering::Relaxed);
        self.ready_tx
            .send(QueueMessage::Run(task))
            .map_err(|_| RudderError::QueueClosed("task queue consumer exited".to_string()))
    }

    /// 就绪队列加延迟队列的当前深度
    pub fn depth(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }
}

/// 通用的"至少一次"重试执行队列
///
/// 单个消费循环串行执行任务，一个队列实例同一时刻最多只有一个任务在跑；
/// 跨资源的并发靠每个worker持有自己的队列实例，而不是队列内并行。
/// 失败任务进入独立的延迟队列，由回灌定时器按 `requeue_delay` 整批
/// 灌回就绪队列（先入先回），保证重试与新工作交错而不是饿死新工作。
pub struct TaskQueue {
    ready_tx: mpsc::UnboundedSender<QueueMessage>,
    ready_rx: Mutex<Option<mpsc::UnboundedReceiver<QueueMessage>>>,
    delayed: Arc<Mutex<VecDeque<Task>>>,
    closed: Arc<AtomicBool>,
    pending: Arc<AtomicUsize>,
    requeue_delay: Duration,
    default_max_attempts: u32,
    consumer: Mutex<Option<JoinHandle<()>>>,
    requeue: Mutex<Option<JoinHandle<()>>>,
}

impl TaskQueue {
    pub fn new(default_max_attempts: u32, requeue_delay: Duration) -> Self {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        Self {
            ready_tx,
            ready_rx: Mutex::new(Some(ready_rx)),
            delayed: Arc::new(Mutex::new(VecDeque::new())),
            closed: Arc::new(AtomicBool::new(false)),
            pending: Arc::new(AtomicUsize::new(0)),
            requeue_delay,
            default_max_attempts,
            consumer: Mutex::new(None),
            requeue: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> TaskQueueHandle {
        TaskQueueHandle {
            ready_tx: self.ready_tx.clone(),
            closed: Arc::clone(&self.closed),
            pending: Arc::clone(&self.pending),
            default_max_attempts: self.default_max_attempts,
        }
    }

    /// 启动消费循环与回灌定时器，重复调用是无操作
    pub async fn start(&self, handler: Arc<dyn TaskHandler>) {
        let mut consumer_slot = self.consumer.lock().await;
        if consumer_slot.is_some() {
            return;
        }

        let Some(mut ready_rx) = self.ready_rx.lock().await.take() else {
            return;
        };
        let delayed = Arc::clone(&self.delayed);
        let pending = Arc::clone(&self.pending);
        *consumer_slot = Some(tokio::spawn(async move {
            while let Some(message) = ready_rx.recv().await {
                match message {
                    QueueMessage::Stop => break,
                    QueueMessage::Run(task) => {
                        pending.fetch_sub(1, Ordering::Relaxed);
                        Self::run_task(task, &handler, &delayed, &pending).await;
                    }
                }
            }
            debug!("任务队列消费循环退出");
        }));

        let delayed = Arc::clone(&self.delayed);
        let ready_tx = self.ready_tx.clone();
        let requeue_delay = self.requeue_delay;
        *self.requeue.lock().await = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(requeue_delay);
            // 第一个tick立即完成，跳过它
            interval.tick().await;
            loop {
                interval.tick().await;
                let drained = Self::drain_delayed(&delayed, &ready_tx).await;
                if drained > 0 {
                    debug!("延迟队列回灌 {} 个任务", drained);
                }
            }
        }));
    }

    /// 把延迟队列整体搬回就绪队列，先进先出
    async fn drain_delayed(
        delayed: &Arc<Mutex<VecDeque<Task>>>,
        ready_tx: &mpsc::UnboundedSender<QueueMessage>,
    ) -> usize {
        let mut drained = 0;
        let mut queue = delayed.lock().await;
        while let Some(task) = queue.pop_front() {
            if ready_tx.send(QueueMessage::Run(task)).is_err() {
                break;
            }
            drained += 1;
        }
        drained
    }

    async fn run_task(
        mut task: Task,
        handler: &Arc<dyn TaskHandler>,
        delayed: &Arc<Mutex<VecDeque<Task>>>,
        pending: &Arc<AtomicUsize>,
    ) {
        task.attempt += 1;
        counter!("rudder_tasks_executed_total").increment(1);

        // catch_unwind隔离处理器panic，消费循环永不因单个任务而死
        let outcome = AssertUnwindSafe(handler.execute(&task)).catch_unwind().await;
        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(TaskError::Failed("task handler panicked".to_string())),
        };

        match result {
            Ok(()) => {}
            Err(TaskError::Abort(cause)) => {
                counter!("rudder_tasks_aborted_total").increment(1);
                warn!(
                    "任务主动放弃，不再重试: {} (task={:?}, routing_key={}, attempt={})",
                    cause, task.reason, task.data.0, task.attempt
                );
            }
            Err(TaskError::Failed(cause)) => {
                if task.attempt < task.max_attempts {
                    counter!("rudder_tasks_retried_total").increment(1);
                    warn!(
                        "任务执行失败，进入延迟队列等待重试: {} (task={:?}, routing_key={}, attempt={}/{})",
                        cause, task.reason, task.data.0, task.attempt, task.max_attempts
                    );
                    pending.fetch_add(1, Ordering::Relaxed);
                    delayed.lock().await.push_back(task);
                } else {
                    counter!("rudder_tasks_exhausted_total").increment(1);
                    error!(
                        "任务重试次数耗尽，放弃本次投递: {} (task={:?}, routing_key={}, attempt={})",
                        cause, task.reason, task.data.0, task.attempt
                    );
                }
            }
        }
    }

    /// 优雅关停：先做最后一轮回灌，再投毒丸等消费循环排空退出
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::Release);

        if let Some(handle) = self.requeue.lock().await.take() {
            handle.abort();
        }

        // 给延迟队列里的任务最后一次执行机会
        Self::drain_delayed(&self.delayed, &self.ready_tx).await;
        let _ = self.ready_tx.send(QueueMessage::Stop);

        if let Some(handle) = self.consumer.lock().await.take() {
            if let Err(e) = handle.await {
                error!("等待任务队列消费循环退出失败: {}", e);
            }
        }

        // 最后一轮中再次失败的任务到此为止，记为终止失败
        let leftover = self.delayed.lock().await.len();
        if leftover > 0 {
            error!("关停时仍有 {} 个任务等待重试，按终止失败处理", leftover);
        } else {
            info!("任务队列已排空退出");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rudder_domain::{Crud, Event, Resource};
    use serde_json::Value;
    use std::sync::atomic::AtomicU32;

    fn envelope(key: &str) -> EventEnvelope {
        (
            key.to_string(),
            Event::new(Resource::router("r1", key), Crud::Update, Value::Null),
        )
    }

    /// 按预设脚本返回结果的处理器
    struct ScriptedHandler {
        executions: AtomicU32,
        attempts: std::sync::Mutex<Vec<u32>>,
        behavior: Behavior,
    }

    impl ScriptedHandler {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                executions: AtomicU32::new(0),
                attempts: std::sync::Mutex::new(Vec::new()),
                behavior,
            })
        }
    }

    enum Behavior {
        AlwaysOk,
        AlwaysFail,
        AlwaysAbort,
        Panic,
    }

    #[async_trait]
    impl TaskHandler for ScriptedHandler {
        async fn execute(&self, task: &Task) -> Result<(), TaskError> {
            self.executions.fetch_add(1, Ordering::SeqCst);
            self.attempts.lock().unwrap().push(task.attempt);
            match self.behavior {
                Behavior::AlwaysOk => Ok(()),
                Behavior::AlwaysFail => Err(TaskError::Failed("scripted failure".to_string())),
                Behavior::AlwaysAbort => Err(TaskError::Abort("scripted abort".to_string())),
                Behavior::Panic => panic!("scripted panic"),
            }
        }
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within timeout");
    }

    #[tokio::test]
    async fn test_success_executes_once() {
        let handler = ScriptedHandler::new(Behavior::AlwaysOk);
        let queue = TaskQueue::new(3, Duration::from_millis(20));
        queue.start(handler.clone()).await;

        queue.handle().enqueue(envelope("t1"), None).unwrap();
        wait_for(|| handler.executions.load(Ordering::SeqCst) == 1).await;

        // 没有重试发生
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handler.executions.load(Ordering::SeqCst), 1);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_retry_bound_respected() {
        let handler = ScriptedHandler::new(Behavior::AlwaysFail);
        let queue = TaskQueue::new(3, Duration::from_millis(20));
        queue.start(handler.clone()).await;

        queue.handle().enqueue(envelope("t1"), None).unwrap();
        wait_for(|| handler.executions.load(Ordering::SeqCst) == 3).await;

        // 到达上限后不再执行，第i次执行时attempt等于i
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(handler.executions.load(Ordering::SeqCst), 3);
        assert_eq!(*handler.attempts.lock().unwrap(), vec![1, 2, 3]);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_abort_discards_immediately() {
        let handler = ScriptedHandler::new(Behavior::AlwaysAbort);
        let queue = TaskQueue::new(3, Duration::from_millis(20));
        queue.start(handler.clone()).await;

        queue.handle().enqueue(envelope("t1"), None).unwrap();
        wait_for(|| handler.executions.load(Ordering::SeqCst) == 1).await;

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(handler.executions.load(Ordering::SeqCst), 1);
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_handler_panic_does_not_kill_loop() {
        let handler = ScriptedHandler::new(Behavior::Panic);
        let queue = TaskQueue::new(1, Duration::from_millis(20));
        queue.start(handler.clone()).await;

        queue.handle().enqueue(envelope("t1"), None).unwrap();
        wait_for(|| handler.executions.load(Ordering::SeqCst) == 1).await;

        // panic后循环仍然活着，还能继续消费
        let ok_handler = handler.executions.load(Ordering::SeqCst);
        queue.handle().enqueue(envelope("t2"), None).unwrap();
        wait_for(|| handler.executions.load(Ordering::SeqCst) > ok_handler).await;
        queue.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_drains_pending_tasks() {
        let handler = ScriptedHandler::new(Behavior::AlwaysOk);
        let queue = TaskQueue::new(3, Duration::from_secs(60));
        queue.start(handler.clone()).await;

        let h = queue.handle();
        for _ in 0..5 {
            h.enqueue(envelope("t1"), None).unwrap();
        }
        queue.shutdown().await;

        assert_eq!(handler.executions.load(Ordering::SeqCst), 5);
        assert_eq!(h.depth(), 0);
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_fails() {
        let handler = ScriptedHandler::new(Behavior::AlwaysOk);
        let queue = TaskQueue::new(3, Duration::from_millis(20));
        queue.start(handler).await;
        let h = queue.handle();
        queue.shutdown().await;

        let err = h.enqueue(envelope("t1"), None).unwrap_err();
        assert!(matches!(err, RudderError::QueueClosed(_)));
    }
}
