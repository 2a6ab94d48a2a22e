use std::sync::Arc;

use metrics::counter;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use rudder_core::RudderResult;
use rudder_domain::{EventSender, InboundMessage, NotificationSource};

use crate::normalizer::normalize;

/// 通知摄取泵：传输层 → 归一化器 → 共享摄取队列
///
/// 成功归一化的消息一律ack（即使事件被有意丢弃也不再重投）；
/// 处理彻底失败时nack让传输层重投。传输层报不可恢复错误时
/// 摄取通路整体关停。
pub struct NotificationPump {
    source: Arc<dyn NotificationSource>,
    events: EventSender,
}

impl NotificationPump {
    pub fn new(source: Arc<dyn NotificationSource>, events: EventSender) -> Self {
        Self { source, events }
    }

    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> RudderResult<()> {
        info!("通知摄取泵启动");
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("通知摄取泵收到关停信号");
                    return Ok(());
                }
                inbound = self.source.recv() => {
                    match inbound {
                        Ok(message) => self.process(message).await,
                        Err(e) => {
                            error!("通知通道不可恢复，摄取通路关停: {}", e);
                            return Err(e);
                        }
                    }
                }
            }
        }
    }

    async fn process(&self, message: InboundMessage) {
        let tag = message.tag;
        match normalize(&message.body) {
            Some(event) => {
                let routing_key = event.routing_key();
                if self.events.send((routing_key, event)).is_err() {
                    // 摄取队列消费端已不在，退回消息等待重投
                    warn!("摄取队列已关闭，消息退回传输层");
                    if let Err(e) = self.source.nack(tag).await {
                        error!("nack失败: {}", e);
                    }
                    return;
                }
                counter!("rudder_events_ingested_total").increment(1);
            }
            None => {
                debug!("消息不感兴趣，确认后丢弃");
                counter!("rudder_events_discarded_total").increment(1);
            }
        }
        if let Err(e) = self.source.ack(tag).await {
            error!("ack失败: {}", e);
        }
    }
}
