use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;

use rudder_domain::{Crud, Event, Resource, WorkerMessage};
use rudder_dispatcher::{Scheduler, SchedulerState, WorkerFactory};

const TENANT: &str = "9774f7d5-df11-46bf-b9a0-4dbbd6c3452e";

/// 记录每个worker收到的路由键
type DeliveryLog = Arc<StdMutex<Vec<(usize, String)>>>;

fn recording_factory(log: DeliveryLog) -> WorkerFactory {
    Box::new(move |index, mut rx: mpsc::UnboundedReceiver<WorkerMessage>| {
        let log = Arc::clone(&log);
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                match message {
                    WorkerMessage::Event { routing_key, .. } => {
                        log.lock().unwrap().push((index, routing_key));
                    }
                    WorkerMessage::Stop => break,
                }
            }
        })
    })
}

fn update_event(tenant: &str) -> Event {
    Event::new(
        Resource::router("r1", tenant),
        Crud::Update,
        Value::Null,
    )
}

#[tokio::test]
async fn test_zero_workers_is_fatal() {
    let log: DeliveryLog = Arc::default();
    let result = Scheduler::start(0, recording_factory(log));
    assert!(result.is_err());
}

#[tokio::test]
async fn test_wildcard_event_reaches_every_worker() {
    let log: DeliveryLog = Arc::default();
    let scheduler = Scheduler::start(4, recording_factory(log.clone())).unwrap();

    scheduler.dispatch("*", Event::poll()).await.unwrap();
    scheduler.stop().await;

    let mut indexes: Vec<usize> = log.lock().unwrap().iter().map(|(i, _)| *i).collect();
    indexes.sort_unstable();
    assert_eq!(indexes, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_tenant_key_lands_on_single_stable_worker() {
    let log: DeliveryLog = Arc::default();
    let scheduler = Scheduler::start(4, recording_factory(log.clone())).unwrap();

    for _ in 0..10 {
        scheduler
            .dispatch(TENANT, update_event(TENANT))
            .await
            .unwrap();
    }
    scheduler.stop().await;

    let deliveries = log.lock().unwrap().clone();
    assert_eq!(deliveries.len(), 10);
    let first = deliveries[0].0;
    assert!(deliveries.iter().all(|(index, _)| *index == first));
}

#[tokio::test]
async fn test_malformed_key_is_dropped_not_broadcast() {
    let log: DeliveryLog = Arc::default();
    let scheduler = Scheduler::start(4, recording_factory(log.clone())).unwrap();

    scheduler
        .dispatch("not-a-uuid", update_event("not-a-uuid"))
        .await
        .unwrap();
    scheduler.stop().await;

    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_stop_drains_pending_events() {
    let log: DeliveryLog = Arc::default();
    let scheduler = Scheduler::start(2, recording_factory(log.clone())).unwrap();

    for _ in 0..50 {
        scheduler.dispatch("*", Event::poll()).await.unwrap();
    }
    scheduler.stop().await;

    // 停止前投递的事件一个不丢：50次广播 × 2个worker
    assert_eq!(log.lock().unwrap().len(), 100);
    assert_eq!(scheduler.state().await, SchedulerState::Stopped);
}

#[tokio::test]
async fn test_dispatch_after_stop_is_rejected() {
    let log: DeliveryLog = Arc::default();
    let scheduler = Scheduler::start(2, recording_factory(log.clone())).unwrap();
    scheduler.stop().await;

    let result = scheduler.dispatch("*", Event::poll()).await;
    assert!(result.is_err());

    // 短暂等待确认没有事件溜进worker
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(log.lock().unwrap().is_empty());
}
