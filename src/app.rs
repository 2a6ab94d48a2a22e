use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use rudder_coordinator::ClusterCoordinator;
use rudder_core::AppConfig;
use rudder_dispatcher::{run_dispatch_loop, NotificationPump, Scheduler, WorkerFactory};
use rudder_domain::DebugRegistry;
use rudder_infrastructure::{
    build_debug_registry, AmqpNotificationSource, RedisCoordinationBackend,
};
use rudder_worker::{EventWorker, LoggingReconciler, WorkerContext};

use crate::shutdown::ShutdownManager;

/// 主应用程序：装配摄取通路、worker池与集群协调器并管理其生命周期
pub struct Application {
    config: AppConfig,
    host_id: String,
}

impl Application {
    pub fn new(config: AppConfig) -> Result<Self> {
        let host_id = hostname::get()
            .context("获取主机名失败")?
            .to_string_lossy()
            .into_owned();
        Ok(Self { config, host_id })
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// 启动所有组件并运行到关停信号到来，返回时系统已排空
    pub async fn run(&self, shutdown: &ShutdownManager) -> Result<()> {
        info!("启动编排器, host_id={}", self.host_id);

        // 调试标记注册表（worker执行前查询，命令通道修改）
        let registry = build_debug_registry(&self.config.database)
            .await
            .context("初始化调试标记存储失败")?;

        // 共享摄取队列：归一化器与协调器生产，派发循环消费
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // worker池
        let scheduler = Arc::new(
            Scheduler::start(
                self.config.scheduler.worker_count,
                self.worker_factory(registry.clone()),
            )
            .context("启动调度器失败")?,
        );

        // 通知通路：启动期连不上直接拒绝启动
        let source = Arc::new(AmqpNotificationSource::new(self.config.notifications.clone()));
        source.connect().await.context("连接通知通道失败")?;
        let pump_handle = {
            let pump = NotificationPump::new(source, event_tx.clone());
            let shutdown_rx = shutdown.subscribe().await;
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = pump.run(shutdown_rx).await {
                    // 传输层重连放弃后摄取通路关停，整个进程跟着停
                    error!("摄取通路致命错误: {}", e);
                    shutdown.shutdown().await;
                }
            })
        };

        // 集群协调器
        let coordinator = if self.config.coordination.enabled {
            let coordination = &self.config.coordination;
            let ttl = coordination.heartbeat_interval_seconds * coordination.liveness_multiplier;
            let backend = RedisCoordinationBackend::connect(&coordination.url, ttl)
                .await
                .context("连接协调后端失败")?;
            let coordinator = Arc::new(ClusterCoordinator::new(
                Arc::new(backend),
                coordination.group_id.clone(),
                self.host_id.clone(),
                Duration::from_secs(coordination.heartbeat_interval_seconds),
                event_tx.clone(),
            ));
            coordinator.start().await.context("加入协调组失败")?;
            Some(coordinator)
        } else {
            warn!("集群协调已禁用，本节点按单机运行");
            None
        };
        let coordinator_handle = coordinator.as_ref().map(|coordinator| {
            let coordinator = Arc::clone(coordinator);
            tokio::spawn(async move {
                if let Err(e) = coordinator.run().await {
                    error!("协调器循环异常退出: {}", e);
                }
            })
        });

        // 主摄取循环
        let dispatch_handle = {
            let scheduler = Arc::clone(&scheduler);
            let shutdown_rx = shutdown.subscribe().await;
            tokio::spawn(async move {
                run_dispatch_loop(&scheduler, event_rx, shutdown_rx).await;
            })
        };
        drop(event_tx);

        info!("编排器启动完成");
        let mut shutdown_rx = shutdown.subscribe().await;
        let _ = shutdown_rx.recv().await;
        info!("开始关停流程");

        // 先停进项：协调器退组、摄取泵与派发循环退出
        if let Some(coordinator) = &coordinator {
            coordinator.stop().await;
        }
        if let Some(handle) = coordinator_handle {
            let _ = handle.await;
        }
        let _ = pump_handle.await;
        let _ = dispatch_handle.await;

        // 最后排空worker池，停止开始前入队的事件一个不丢
        scheduler.stop().await;

        info!("编排器已停止");
        Ok(())
    }

    /// worker构造工厂：每个worker独占自己的任务队列与资源缓存
    fn worker_factory(&self, registry: DebugRegistry) -> WorkerFactory {
        let host_id = self.host_id.clone();
        let max_attempts = self.config.scheduler.max_attempts;
        let requeue_delay = Duration::from_secs(self.config.scheduler.requeue_delay_seconds);

        Box::new(move |index, rx| {
            let ctx = WorkerContext {
                index,
                host_id: host_id.clone(),
                registry: registry.clone(),
                // 设备驱动层从这里接入；未接入时空载运行只记日志
                reconciler: Arc::new(LoggingReconciler),
                max_attempts,
                requeue_delay,
            };
            EventWorker::spawn(ctx, rx)
        })
    }
}
