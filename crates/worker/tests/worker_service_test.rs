use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use rudder_core::RudderResult;
use rudder_domain::{
    Crud, DebugFlag, DebugRegistry, Event, GlobalDebugRepository, Resource,
    ScopedDebugRepository, WorkerMessage,
};
use rudder_worker::{EventWorker, ReconcileError, Reconciler, WorkerContext};

/// 记录每次调和调用的测试替身
#[derive(Default)]
struct RecordingReconciler {
    calls: StdMutex<Vec<(String, Crud)>>,
}

impl RecordingReconciler {
    fn calls(&self) -> Vec<(String, Crud)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Reconciler for RecordingReconciler {
    async fn reconcile(&self, resource: &Resource, event: &Event) -> Result<(), ReconcileError> {
        self.calls
            .lock()
            .unwrap()
            .push((resource.id.clone(), event.crud));
        Ok(())
    }
}

#[derive(Default)]
struct MemScopedRepository {
    flags: StdMutex<HashMap<String, Option<String>>>,
}

impl MemScopedRepository {
    fn is_enabled(&self, uuid: &str) -> bool {
        self.flags.lock().unwrap().contains_key(uuid)
    }
}

#[async_trait]
impl ScopedDebugRepository for MemScopedRepository {
    async fn enable(&self, uuid: &str, reason: Option<&str>) -> RudderResult<()> {
        self.flags
            .lock()
            .unwrap()
            .entry(uuid.to_string())
            .or_insert_with(|| reason.map(str::to_string));
        Ok(())
    }

    async fn disable(&self, uuid: &str) -> RudderResult<()> {
        self.flags.lock().unwrap().remove(uuid);
        Ok(())
    }

    async fn status(&self, uuid: &str) -> RudderResult<(bool, Option<String>)> {
        match self.flags.lock().unwrap().get(uuid) {
            Some(reason) => Ok((true, reason.clone())),
            None => Ok((false, None)),
        }
    }

    async fn list(&self) -> RudderResult<Vec<DebugFlag>> {
        Ok(self
            .flags
            .lock()
            .unwrap()
            .iter()
            .map(|(uuid, reason)| DebugFlag {
                uuid: uuid.clone(),
                reason: reason.clone(),
            })
            .collect())
    }
}

#[derive(Default)]
struct MemGlobalRepository {
    flag: StdMutex<Option<Option<String>>>,
}

impl MemGlobalRepository {
    fn is_enabled(&self) -> bool {
        self.flag.lock().unwrap().is_some()
    }
}

#[async_trait]
impl GlobalDebugRepository for MemGlobalRepository {
    async fn enable(&self, reason: Option<&str>) -> RudderResult<()> {
        let mut flag = self.flag.lock().unwrap();
        if flag.is_none() {
            *flag = Some(reason.map(str::to_string));
        }
        Ok(())
    }

    async fn disable(&self) -> RudderResult<()> {
        *self.flag.lock().unwrap() = None;
        Ok(())
    }

    async fn status(&self) -> RudderResult<(bool, Option<String>)> {
        match &*self.flag.lock().unwrap() {
            Some(reason) => Ok((true, reason.clone())),
            None => Ok((false, None)),
        }
    }
}

struct TestHarness {
    tx: mpsc::UnboundedSender<WorkerMessage>,
    handle: tokio::task::JoinHandle<()>,
    reconciler: Arc<RecordingReconciler>,
    resources: Arc<MemScopedRepository>,
    tenants: Arc<MemScopedRepository>,
    global: Arc<MemGlobalRepository>,
}

fn start_worker(host_id: &str) -> TestHarness {
    let reconciler = Arc::new(RecordingReconciler::default());
    let resources = Arc::new(MemScopedRepository::default());
    let tenants = Arc::new(MemScopedRepository::default());
    let global = Arc::new(MemGlobalRepository::default());

    let ctx = WorkerContext {
        index: 0,
        host_id: host_id.to_string(),
        registry: DebugRegistry::new(resources.clone(), tenants.clone(), global.clone()),
        reconciler: reconciler.clone(),
        max_attempts: 3,
        requeue_delay: Duration::from_millis(50),
    };
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = EventWorker::spawn(ctx, rx);
    TestHarness {
        tx,
        handle,
        reconciler,
        resources,
        tenants,
        global,
    }
}

fn update_event(id: &str, tenant: &str) -> WorkerMessage {
    WorkerMessage::Event {
        routing_key: tenant.to_string(),
        event: Event::new(Resource::router(id, tenant), Crud::Update, Value::Null),
    }
}

fn command_event(resource: Resource, body: Value) -> WorkerMessage {
    WorkerMessage::Event {
        routing_key: "*".to_string(),
        event: Event::new(resource, Crud::Command, body),
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

const ID_A: &str = "00000000-0000-0000-0000-000000000002";
const ID_B: &str = "00000000-0000-0000-0000-000000000003";

#[tokio::test]
async fn test_update_event_reconciles_and_drains_on_stop() {
    let harness = start_worker("host-a");
    harness.tx.send(update_event(ID_A, "t1")).unwrap();
    harness.tx.send(WorkerMessage::Stop).unwrap();
    harness.handle.await.unwrap();

    let calls = harness.reconciler.calls();
    assert_eq!(calls, vec![(ID_A.to_string(), Crud::Update)]);
}

#[tokio::test]
async fn test_debug_flagged_resource_is_skipped() {
    let harness = start_worker("host-a");
    harness.resources.enable(ID_A, Some("under repair")).await.unwrap();

    harness.tx.send(update_event(ID_A, "t1")).unwrap();
    harness.tx.send(update_event(ID_B, "t1")).unwrap();
    harness.tx.send(WorkerMessage::Stop).unwrap();
    harness.handle.await.unwrap();

    // 被标记的资源没有触发调和，另一个照常
    let calls = harness.reconciler.calls();
    assert_eq!(calls, vec![(ID_B.to_string(), Crud::Update)]);
}

#[tokio::test]
async fn test_global_debug_blocks_everything() {
    let harness = start_worker("host-a");
    harness.global.enable(Some("maintenance window")).await.unwrap();

    harness.tx.send(update_event(ID_A, "t1")).unwrap();
    harness.tx.send(WorkerMessage::Stop).unwrap();
    harness.handle.await.unwrap();

    assert!(harness.reconciler.calls().is_empty());
}

#[tokio::test]
async fn test_resource_debug_command_toggles_flag() {
    let harness = start_worker("host-a");
    harness.tx.send(command_event(
        Resource::new(ID_A, "*", "router"),
        json!({"command": "resource-debug", "resource_id": ID_A, "reason": "oncall"}),
    ))
    .unwrap();
    wait_for(|| harness.resources.is_enabled(ID_A)).await;

    harness.tx.send(command_event(
        Resource::new(ID_A, "*", "router"),
        json!({"command": "resource-manage", "resource_id": ID_A}),
    ))
    .unwrap();
    harness.tx.send(WorkerMessage::Stop).unwrap();
    harness.handle.await.unwrap();

    let (active, _) = harness.resources.status(ID_A).await.unwrap();
    assert!(!active);
}

#[tokio::test]
async fn test_tenant_debug_command_blocks_tenant() {
    let harness = start_worker("host-a");
    harness.tx.send(command_event(
        Resource::wildcard(),
        json!({"command": "tenant-debug", "tenant_id": "t1", "reason": "billing hold"}),
    ))
    .unwrap();
    wait_for(|| harness.tenants.is_enabled("t1")).await;

    harness.tx.send(update_event(ID_A, "t1")).unwrap();
    harness.tx.send(WorkerMessage::Stop).unwrap();
    harness.handle.await.unwrap();

    assert!(harness.reconciler.calls().is_empty());
}

#[tokio::test]
async fn test_global_debug_command_honors_enabled_flag() {
    let harness = start_worker("host-a");
    harness.tx.send(command_event(
        Resource::wildcard(),
        json!({"command": "global-debug", "enabled": 1, "reason": "drill"}),
    ))
    .unwrap();
    wait_for(|| harness.global.is_enabled()).await;

    harness.tx.send(command_event(
        Resource::wildcard(),
        json!({"command": "global-debug", "enabled": 0}),
    ))
    .unwrap();
    harness.tx.send(WorkerMessage::Stop).unwrap();
    harness.handle.await.unwrap();

    let (active, _) = harness.global.status().await.unwrap();
    assert!(!active);
}

#[tokio::test]
async fn test_poll_fans_out_over_cached_resources() {
    let harness = start_worker("host-a");
    harness.tx.send(update_event(ID_A, "t1")).unwrap();
    harness.tx.send(update_event(ID_B, "t2")).unwrap();
    wait_for(|| harness.reconciler.calls().len() == 2).await;

    harness.tx.send(WorkerMessage::Event {
        routing_key: "*".to_string(),
        event: Event::poll(),
    })
    .unwrap();
    // 两个缓存中的资源都应被poll到
    wait_for(|| {
        let polls: Vec<_> = harness
            .reconciler
            .calls()
            .into_iter()
            .filter(|(_, crud)| *crud == Crud::Poll)
            .collect();
        polls.len() == 2
    })
    .await;

    harness.tx.send(WorkerMessage::Stop).unwrap();
    harness.handle.await.unwrap();
}

#[tokio::test]
async fn test_rebalance_evicts_resources_owned_elsewhere() {
    let harness = start_worker("host-a");
    harness.tx.send(update_event(ID_A, "t1")).unwrap();
    harness.tx.send(update_event(ID_B, "t1")).unwrap();
    wait_for(|| harness.reconciler.calls().len() == 2).await;

    // ID_A落在host-a上，ID_B落在host-b上
    let members = vec!["host-a".to_string(), "host-b".to_string()];
    harness.tx.send(WorkerMessage::Event {
        routing_key: "*".to_string(),
        event: Event::rebalance(&members, false),
    })
    .unwrap();

    // 留下的资源被recheck，被淘汰的不再出现
    wait_for(|| {
        harness
            .reconciler
            .calls()
            .iter()
            .any(|(id, crud)| id == ID_A && *crud == Crud::Poll)
    })
    .await;

    harness.tx.send(WorkerMessage::Event {
        routing_key: "*".to_string(),
        event: Event::poll(),
    })
    .unwrap();
    harness.tx.send(WorkerMessage::Stop).unwrap();
    harness.handle.await.unwrap();

    let poll_ids: Vec<String> = harness
        .reconciler
        .calls()
        .into_iter()
        .filter(|(_, crud)| *crud == Crud::Poll)
        .map(|(id, _)| id)
        .collect();
    assert!(!poll_ids.contains(&ID_B.to_string()));
}

#[tokio::test]
async fn test_config_reload_clears_cache() {
    let harness = start_worker("host-a");
    harness.tx.send(update_event(ID_A, "t1")).unwrap();
    wait_for(|| harness.reconciler.calls().len() == 1).await;

    harness.tx.send(command_event(
        Resource::wildcard(),
        json!({"command": "config-reload"}),
    ))
    .unwrap();
    // 缓存清空后poll不再扇出任何资源
    harness.tx.send(WorkerMessage::Event {
        routing_key: "*".to_string(),
        event: Event::poll(),
    })
    .unwrap();
    harness.tx.send(WorkerMessage::Stop).unwrap();
    harness.handle.await.unwrap();

    let polls = harness
        .reconciler
        .calls()
        .into_iter()
        .filter(|(_, crud)| *crud == Crud::Poll)
        .count();
    assert_eq!(polls, 0);
}
