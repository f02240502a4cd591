//! 订单事件发布器
//!
//! 将订单事件序列化为 JSON 写入出站 topic，以订单 id 作为消息 key，
//! 保证同一订单的事件落在同一分区。
//!
//! 发布调用只等待消息进入发送队列并做一次有界 flush，
//! 投递结果由每个发布器独占的后台观察任务异步记录。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bakery_shared::config::PublisherConfig;
use bakery_shared::error::BakeryError;
use bakery_shared::kafka::{MessageSink, PendingDelivery};
use bakery_shared::observability::metrics::{record_delivery, record_publish_failure};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::OrderError;
use crate::model::OrderEvent;

/// 订单事件发布接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderEventPublisher: Send + Sync {
    /// 提交成功后原样返回事件
    async fn publish_order_event(&self, event: OrderEvent) -> Result<OrderEvent, OrderError>;
}

/// 待观察的投递：订单 id 与投递结果
type DeliveryItem = (String, PendingDelivery);

/// 基于 [`MessageSink`] 的发布器实现
pub struct KafkaOrderEventPublisher {
    sink: Arc<dyn MessageSink>,
    topic: String,
    flush_timeout: Duration,
    drain_timeout: Duration,
    /// 关闭后置为 None，后续发布直接返回 PublisherClosed
    deliveries: parking_lot::Mutex<Option<mpsc::Sender<DeliveryItem>>>,
    observer: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl KafkaOrderEventPublisher {
    /// 创建发布器并启动投递结果观察任务，需要在 tokio 运行时内调用
    pub fn new(sink: Arc<dyn MessageSink>, topic: impl Into<String>, config: &PublisherConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.delivery_queue_capacity.max(1));
        let topic = topic.into();
        let observer = tokio::spawn(observe_deliveries(topic.clone(), rx));

        Self {
            sink,
            topic,
            flush_timeout: config.flush_timeout(),
            drain_timeout: Duration::from_millis(config.delivery_timeout_ms),
            deliveries: parking_lot::Mutex::new(Some(tx)),
            observer: tokio::sync::Mutex::new(Some(observer)),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// 关闭发布器
    ///
    /// 先 flush 发送队列，再关闭投递队列并等待观察任务处理完剩余结果后退出。
    /// 重复调用为空操作。
    pub async fn shutdown(&self) {
        let mut observer = self.observer.lock().await;
        let Some(handle) = observer.take() else {
            return;
        };

        if let Err(e) = self.sink.flush(self.drain_timeout).await {
            warn!(topic = %self.topic, error = %e, "关闭时 flush 未完成");
        }

        // 丢弃发送端后观察任务在队列耗尽时自然结束
        self.deliveries.lock().take();

        if let Err(e) = handle.await {
            warn!(topic = %self.topic, error = %e, "投递观察任务异常退出");
        }
        info!(topic = %self.topic, "订单事件发布器已关闭");
    }
}

#[async_trait]
impl OrderEventPublisher for KafkaOrderEventPublisher {
    async fn publish_order_event(&self, event: OrderEvent) -> Result<OrderEvent, OrderError> {
        let Some(sender) = self.deliveries.lock().clone() else {
            record_publish_failure(&self.topic);
            warn!(topic = %self.topic, order_id = %event.order.id, "发布器已关闭，拒绝订单事件");
            return Err(OrderError::PublisherClosed);
        };

        let payload = serde_json::to_vec(&event).map_err(BakeryError::from)?;
        let order_id = event.order.id.clone();

        let pending = self
            .sink
            .submit(&self.topic, Some(&order_id), &payload)
            .inspect_err(|e| {
                record_publish_failure(&self.topic);
                warn!(topic = %self.topic, %order_id, error = %e, "订单事件提交失败");
            })?;

        match sender.try_send((order_id.clone(), pending)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!(topic = %self.topic, %order_id, "投递观察队列已满，丢弃该条投递结果");
            }
            Err(TrySendError::Closed(_)) => {
                warn!(topic = %self.topic, %order_id, "投递观察任务已退出，丢弃该条投递结果");
            }
        }

        // flush 超时只说明消息仍在队列中，投递结果由观察任务记录
        if let Err(e) = self.sink.flush(self.flush_timeout).await {
            debug!(topic = %self.topic, error = %e, "flush 未在超时内完成");
        }

        debug!(topic = %self.topic, %order_id, change_reason = %event.change_reason, "订单事件已提交");
        Ok(event)
    }
}

/// 逐条等待投递结果并记录，队列关闭且耗尽后退出
async fn observe_deliveries(topic: String, mut rx: mpsc::Receiver<DeliveryItem>) {
    while let Some((order_id, pending)) = rx.recv().await {
        match pending.await {
            Ok(report) => {
                record_delivery(true);
                debug!(
                    %topic,
                    %order_id,
                    partition = report.partition,
                    offset = report.offset,
                    "订单事件投递成功"
                );
            }
            Err(e) => {
                record_delivery(false);
                warn!(%topic, %order_id, error = %e, "订单事件投递失败");
            }
        }
    }
    debug!(%topic, "投递观察任务退出");
}
