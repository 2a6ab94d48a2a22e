use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use rudder_core::RudderResult;

use crate::events::Event;

/// 共享摄取队列上的元素：`(路由键, 事件)` 二元组
pub type EventEnvelope = (String, Event);

/// 摄取队列发送端（多生产者）
pub type EventSender = mpsc::UnboundedSender<EventEnvelope>;
/// 摄取队列接收端（单消费者）
pub type EventReceiver = mpsc::UnboundedReceiver<EventEnvelope>;

/// 调度器投递给worker收件队列的消息
#[derive(Debug, Clone)]
pub enum WorkerMessage {
    Event { routing_key: String, event: Event },
    /// 毒丸：worker排空队列后退出
    Stop,
}

/// 传输层送入的原始消息
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// 传输层的投递凭据，ack/nack时回传
    pub tag: u64,
    pub body: Value,
}

/// 通知通道抽象（AMQP等）
///
/// 实现方负责断线重连与有界退避；`recv` 返回错误表示重连已放弃，
/// 摄取通路应就此关停。
#[async_trait]
pub trait NotificationSource: Send + Sync {
    /// 阻塞等待下一条原始消息
    async fn recv(&self) -> RudderResult<InboundMessage>;

    /// 确认消息，传输层不再重投
    async fn ack(&self, tag: u64) -> RudderResult<()>;

    /// 否定确认并要求重投
    async fn nack(&self, tag: u64) -> RudderResult<()>;
}
