use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    Channel, Connection, ConnectionProperties, Consumer, ExchangeKind,
};
use rand::Rng;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use rudder_core::{NotificationConfig, RudderError, RudderResult};
use rudder_domain::{InboundMessage, NotificationSource};

struct AmqpChannelState {
    connection: Connection,
    channel: Channel,
    consumer: Consumer,
}

/// AMQP通知源
///
/// 声明topic交换机与通知队列并按配置的routing key绑定，手动ack。
/// 断线后带抖动的有界退避重连；连续重连失败超过配置上限时
/// `recv` 返回错误，摄取通路整体关停。
pub struct AmqpNotificationSource {
    config: NotificationConfig,
    state: Mutex<Option<AmqpChannelState>>,
}

impl AmqpNotificationSource {
    pub fn new(config: NotificationConfig) -> Self {
        Self {
            config,
            state: Mutex::new(None),
        }
    }

    /// 预热连接，启动阶段即可暴露配置/连通性问题
    pub async fn connect(&self) -> RudderResult<()> {
        let mut state = self.state.lock().await;
        if state.is_none() {
            *state = Some(Self::establish(&self.config).await?);
        }
        Ok(())
    }

    async fn establish(config: &NotificationConfig) -> RudderResult<AmqpChannelState> {
        let connection = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .map_err(|e| RudderError::MessageQueue(format!("连接AMQP失败: {e}")))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| RudderError::MessageQueue(format!("创建通道失败: {e}")))?;

        channel
            .exchange_declare(
                &config.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                RudderError::MessageQueue(format!("声明交换机 {} 失败: {e}", config.exchange))
            })?;

        channel
            .queue_declare(
                &config.queue,
                QueueDeclareOptions {
                    durable: true,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| RudderError::MessageQueue(format!("声明队列 {} 失败: {e}", config.queue)))?;

        for binding_key in &config.binding_keys {
            channel
                .queue_bind(
                    &config.queue,
                    &config.exchange,
                    binding_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| {
                    RudderError::MessageQueue(format!("绑定routing key {binding_key} 失败: {e}"))
                })?;
        }

        let consumer = channel
            .basic_consume(
                &config.queue,
                "rudder-normalizer",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| RudderError::MessageQueue(format!("创建消费者失败: {e}")))?;

        info!(
            "AMQP通知源就绪: exchange={} queue={}",
            config.exchange, config.queue
        );
        Ok(AmqpChannelState {
            connection,
            channel,
            consumer,
        })
    }

    /// 有界退避重连，放弃后返回错误
    async fn reconnect(&self) -> RudderResult<()> {
        let mut state = self.state.lock().await;
        *state = None;

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            match Self::establish(&self.config).await {
                Ok(fresh) => {
                    info!("AMQP重连成功（第{}次尝试）", attempt);
                    *state = Some(fresh);
                    return Ok(());
                }
                Err(e) if attempt < self.config.reconnect_max_attempts => {
                    // 线性退避加随机抖动，避免整个集群同时重连
                    let jitter_ms: u64 = rand::rng().random_range(0..500);
                    let delay = Duration::from_secs(
                        self.config.reconnect_delay_seconds * u64::from(attempt),
                    ) + Duration::from_millis(jitter_ms);
                    warn!(
                        "AMQP重连失败（第{}/{}次）: {}，{:?}后重试",
                        attempt, self.config.reconnect_max_attempts, e, delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!("AMQP重连放弃（已尝试{}次）: {}", attempt, e);
                    return Err(RudderError::MessageQueue(format!(
                        "通知通道重连失败已达上限: {e}"
                    )));
                }
            }
        }
    }

    /// 在持有连接的前提下执行一次ack/nack
    async fn confirm(&self, tag: u64, ack: bool, requeue: bool) -> RudderResult<()> {
        let state = self.state.lock().await;
        let Some(inner) = state.as_ref() else {
            return Err(RudderError::MessageQueue("AMQP通道未建立".to_string()));
        };
        if ack {
            inner
                .channel
                .basic_ack(tag, BasicAckOptions::default())
                .await
                .map_err(|e| RudderError::MessageQueue(format!("确认消息失败: {e}")))
        } else {
            inner
                .channel
                .basic_nack(
                    tag,
                    BasicNackOptions {
                        requeue,
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| RudderError::MessageQueue(format!("否定确认失败: {e}")))
        }
    }
}

#[async_trait]
impl NotificationSource for AmqpNotificationSource {
    async fn recv(&self) -> RudderResult<InboundMessage> {
        loop {
            if self.state.lock().await.is_none() {
                self.reconnect().await?;
            }

            let delivery = {
                let mut state = self.state.lock().await;
                let Some(inner) = state.as_mut() else {
                    continue;
                };
                match inner.consumer.next().await {
                    Some(Ok(delivery)) => Some(delivery),
                    Some(Err(e)) => {
                        warn!("消费通知失败，准备重连: {}", e);
                        *state = None;
                        None
                    }
                    None => {
                        warn!("AMQP消费者流结束，准备重连");
                        *state = None;
                        None
                    }
                }
            };
            let Some(delivery) = delivery else {
                continue;
            };

            match serde_json::from_slice(&delivery.data) {
                Ok(body) => {
                    return Ok(InboundMessage {
                        tag: delivery.delivery_tag,
                        body,
                    });
                }
                Err(e) => {
                    // 毒消息：拒绝且不重投，否则会永远循环
                    warn!("通知载荷不是合法JSON，拒绝: {}", e);
                    if let Err(e) = self.confirm(delivery.delivery_tag, false, false).await {
                        warn!("拒绝毒消息失败: {}", e);
                    }
                }
            }
        }
    }

    async fn ack(&self, tag: u64) -> RudderResult<()> {
        debug!("ack delivery {}", tag);
        self.confirm(tag, true, false).await
    }

    async fn nack(&self, tag: u64) -> RudderResult<()> {
        debug!("nack delivery {} (requeue)", tag);
        self.confirm(tag, false, true).await
    }
}

impl AmqpNotificationSource {
    /// 连接是否存活
    pub async fn is_connected(&self) -> bool {
        self.state
            .lock()
            .await
            .as_ref()
            .map(|state| state.connection.status().connected())
            .unwrap_or(false)
    }
}
