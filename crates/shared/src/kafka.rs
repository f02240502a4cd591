//! Kafka 基础设施封装
//!
//! 将 rdkafka 的底层 API 封装为业务友好的 Producer/Consumer 抽象，
//! 统一消息序列化、错误映射和手动提交语义，避免各服务重复编写样板代码。
//!
//! 服务层只依赖 [`MessageSource`] 与 [`MessageSink`] 两个 trait，
//! 测试时可以替换为内存实现，无需真实 broker。

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{Offset, TopicPartitionList};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::config::{KafkaConfig, PublisherConfig};
use crate::error::BakeryError;

// ---------------------------------------------------------------------------
// Topic 常量
// ---------------------------------------------------------------------------

/// 默认 topic 名称，实际值以配置为准
pub mod topics {
    pub const ORDERS_CREATED: &str = "orders-created";
    pub const ORDERS_REVIEWED: &str = "orders-reviewed";
}

// ---------------------------------------------------------------------------
// ConsumerMessage
// ---------------------------------------------------------------------------

/// 消费到的 Kafka 消息的统一表示
///
/// 将 rdkafka 的 `BorrowedMessage`（带生命周期约束）转换为拥有所有权的结构体，
/// 使消息可以安全地跨 await 点传递给异步处理函数。
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

impl ConsumerMessage {
    /// 从 rdkafka 的借用消息构造，提取并拥有所有字段
    fn from_borrowed(msg: &BorrowedMessage<'_>) -> Self {
        let key = msg
            .key()
            .and_then(|k| std::str::from_utf8(k).ok())
            .map(String::from);

        let payload = msg.payload().map(|p| p.to_vec()).unwrap_or_default();

        Self {
            topic: msg.topic().to_string(),
            partition: msg.partition(),
            offset: msg.offset(),
            key,
            payload,
        }
    }

    /// 将 JSON 格式负载反序列化为目标类型
    pub fn deserialize_payload<T: DeserializeOwned>(&self) -> Result<T, BakeryError> {
        serde_json::from_slice(&self.payload).map_err(BakeryError::from)
    }
}

// ---------------------------------------------------------------------------
// MessageSource / MessageSink
// ---------------------------------------------------------------------------

/// 入站消息源
///
/// `poll` 在超时内没有消息时返回 `Ok(None)`，这是空闲路径而非错误。
/// `close` 必须幂等，重复调用不产生副作用。
#[async_trait]
pub trait MessageSource: Send + Sync {
    fn subscribe(&self, topics: &[&str]) -> Result<(), BakeryError>;

    async fn poll(&self, timeout: Duration) -> Result<Option<ConsumerMessage>, BakeryError>;

    /// 提交该消息之后的位点
    fn commit(&self, msg: &ConsumerMessage) -> Result<(), BakeryError>;

    fn close(&self);
}

/// 已确认投递的消息位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub partition: i32,
    pub offset: i64,
}

/// 尚未确认的投递结果
pub type PendingDelivery = BoxFuture<'static, Result<DeliveryReport, BakeryError>>;

/// 出站消息通道
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// 将消息放入发送队列，同步返回提交结果，投递结果通过返回的 future 异步获得
    fn submit(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
    ) -> Result<PendingDelivery, BakeryError>;

    /// 等待队列中的消息交给传输层，最多等待 timeout
    async fn flush(&self, timeout: Duration) -> Result<(), BakeryError>;
}

// ---------------------------------------------------------------------------
// KafkaProducer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 生产者
///
/// 封装 `FutureProducer`，内部已派生 Clone（`FutureProducer` 本身是 Arc 包装的）。
#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
}

impl KafkaProducer {
    /// 根据配置创建生产者
    ///
    /// `message.timeout.ms` 决定单条消息在 librdkafka 内部最多停留多久，
    /// 超时后投递结果以失败返回，由发布器的观察任务记录。
    pub fn new(config: &KafkaConfig, publisher: &PublisherConfig) -> Result<Self, BakeryError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", publisher.delivery_timeout_ms.to_string())
            .create()
            .map_err(|e| BakeryError::Kafka(format!("创建生产者失败: {e}")))?;

        info!(brokers = %config.brokers, "Kafka 生产者已初始化");
        Ok(Self { producer })
    }
}

#[async_trait]
impl MessageSink for KafkaProducer {
    fn submit(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
    ) -> Result<PendingDelivery, BakeryError> {
        let mut record = FutureRecord::<str, [u8]>::to(topic).payload(payload);
        if let Some(key) = key {
            record = record.key(key);
        }

        let delivery = self
            .producer
            .send_result(record)
            .map_err(|(e, _)| BakeryError::Kafka(format!("提交消息失败: {e}")))?;

        debug!(topic, key, "消息已进入发送队列");

        Ok(Box::pin(async move {
            match delivery.await {
                // rdkafka 0.39+ 返回 Delivery 结构体而非元组
                Ok(Ok(delivered)) => Ok(DeliveryReport {
                    partition: delivered.partition,
                    offset: delivered.offset,
                }),
                Ok(Err((e, _))) => Err(BakeryError::Kafka(format!("消息投递失败: {e}"))),
                Err(_) => Err(BakeryError::Kafka("投递结果已被丢弃".to_string())),
            }
        }))
    }

    async fn flush(&self, timeout: Duration) -> Result<(), BakeryError> {
        // librdkafka 的 flush 是阻塞调用，放到阻塞线程池避免占用运行时
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| BakeryError::Internal(format!("flush 任务异常: {e}")))?
            .map_err(|e| BakeryError::Kafka(format!("flush 未完成: {e}")))
    }
}

// ---------------------------------------------------------------------------
// KafkaConsumer
// ---------------------------------------------------------------------------

/// 面向业务的 Kafka 消费者
///
/// 关闭自动提交，位点只在调用方处理完消息后通过 [`MessageSource::commit`] 推进。
pub struct KafkaConsumer {
    consumer: StreamConsumer,
    closed: AtomicBool,
}

impl KafkaConsumer {
    /// 创建消费者，消费组取自 `kafka.consumer_group`
    pub fn new(config: &KafkaConfig) -> Result<Self, BakeryError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.consumer_group)
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("enable.auto.commit", "false")
            .create()
            .map_err(|e| BakeryError::Kafka(format!("创建消费者失败: {e}")))?;

        info!(
            brokers = %config.brokers,
            group_id = %config.consumer_group,
            "Kafka 消费者已初始化"
        );
        Ok(Self {
            consumer,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl MessageSource for KafkaConsumer {
    fn subscribe(&self, topics: &[&str]) -> Result<(), BakeryError> {
        self.consumer
            .subscribe(topics)
            .map_err(|e| BakeryError::Kafka(format!("订阅 topic 失败: {e}")))?;
        self.closed.store(false, Ordering::SeqCst);

        info!(?topics, "已订阅 Kafka topics");
        Ok(())
    }

    async fn poll(&self, timeout: Duration) -> Result<Option<ConsumerMessage>, BakeryError> {
        // StreamConsumer::recv 可安全取消，超时丢弃 future 不会丢消息
        match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => Ok(None),
            Ok(Ok(borrowed)) => Ok(Some(ConsumerMessage::from_borrowed(&borrowed))),
            Ok(Err(e)) => Err(BakeryError::Kafka(format!("接收消息出错: {e}"))),
        }
    }

    fn commit(&self, msg: &ConsumerMessage) -> Result<(), BakeryError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&msg.topic, msg.partition, Offset::Offset(msg.offset + 1))
            .map_err(|e| BakeryError::Kafka(format!("构造提交位点失败: {e}")))?;

        self.consumer
            .commit(&tpl, CommitMode::Async)
            .map_err(|e| BakeryError::Kafka(format!("提交位点失败: {e}")))
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.consumer.unsubscribe();
        info!("Kafka 消费者已取消订阅");
    }
}

// ---------------------------------------------------------------------------
// 测试
// ---------------------------------------------------------------------------
