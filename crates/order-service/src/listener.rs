//! 订单审核事件监听器
//!
//! 状态机：Stopped -> Running -> Stopping -> Stopped，停止后可以再次启动。
//!
//! 每个监听器同一时刻最多只有一个消费任务。消费循环逐条处理消息，
//! 处理失败按线性退避重试，无论最终成功与否都会提交位点，
//! 单条坏消息不会阻塞整个分区。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bakery_shared::kafka::{ConsumerMessage, MessageSource};
use bakery_shared::observability::metrics::record_event_consumed;
use bakery_shared::retry::{RetryPolicy, retry_with_policy};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::OrderError;
use crate::model::{Order, OrderEvent};

/// 审核事件的处理方
#[async_trait]
pub trait ReviewedOrderHandler: Send + Sync {
    async fn handle_reviewed_order(&self, event: OrderEvent) -> Result<Order, OrderError>;
}

/// 消费任务退出信号
///
/// 外部取消或 [`OrderEventListener::stop`] 都会使其完成。
#[derive(Debug, Clone)]
pub struct ListenerDone {
    rx: watch::Receiver<bool>,
}

impl ListenerDone {
    /// 等待消费任务退出
    pub async fn wait(mut self) {
        // 发送端被丢弃同样意味着任务已退出
        let _ = self.rx.wait_for(|done| *done).await.map(|_| ());
    }

    pub fn is_done(&self) -> bool {
        *self.rx.borrow()
    }
}

struct RunningLoop {
    stop_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// 订单审核事件监听器
pub struct OrderEventListener {
    source: Arc<dyn MessageSource>,
    handler: Arc<dyn ReviewedOrderHandler>,
    topic: String,
    poll_timeout: Duration,
    retry_policy: RetryPolicy,
    running: Arc<AtomicBool>,
    /// 启停互斥，保证检查运行标志与启动消费任务是原子的
    lifecycle: tokio::sync::Mutex<Option<RunningLoop>>,
}

impl OrderEventListener {
    pub fn new(
        source: Arc<dyn MessageSource>,
        handler: Arc<dyn ReviewedOrderHandler>,
        topic: impl Into<String>,
        poll_timeout: Duration,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            source,
            handler,
            topic: topic.into(),
            poll_timeout,
            retry_policy,
            running: Arc::new(AtomicBool::new(false)),
            lifecycle: tokio::sync::Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// 订阅入站 topic 并启动消费任务
    ///
    /// 已有消费任务在运行时返回 [`OrderError::AlreadyRunning`]。
    /// `cancel` 变为 true 时消费任务在当前消息处理完后退出。
    pub async fn listen(&self, cancel: watch::Receiver<bool>) -> Result<ListenerDone, OrderError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.is_running() {
            return Err(OrderError::AlreadyRunning);
        }

        self.source.subscribe(&[self.topic.as_str()])?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let (done_tx, done_rx) = watch::channel(false);

        self.running.store(true, Ordering::SeqCst);
        let guard = ExitGuard {
            running: self.running.clone(),
            done: done_tx,
        };

        let consumption = ConsumptionLoop {
            source: self.source.clone(),
            handler: self.handler.clone(),
            topic: self.topic.clone(),
            poll_timeout: self.poll_timeout,
            retry_policy: self.retry_policy.clone(),
        };

        let task = tokio::spawn(async move {
            let _guard = guard;
            consumption.run(cancel, stop_rx).await;
        });

        *lifecycle = Some(RunningLoop { stop_tx, task });
        info!(topic = %self.topic, "订单审核事件监听器已启动");

        Ok(ListenerDone { rx: done_rx })
    }

    /// 停止消费任务并释放订阅
    ///
    /// 从未启动或已经停止过时为空操作。返回时消费任务已经退出。
    ///
    /// 外部取消结束的消费任务不会自行关闭消息源：此时 `is_running()` 已为 false，
    /// 但 `stop` 仍会回收该任务并关闭消息源，释放它留下的订阅。
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(running) = lifecycle.take() else {
            debug!(topic = %self.topic, "监听器未运行，忽略停止请求");
            return;
        };

        running.stop_tx.send_replace(true);
        if let Err(e) = running.task.await {
            warn!(topic = %self.topic, error = %e, "消费任务异常退出");
        }

        self.source.close();
        info!(topic = %self.topic, "订单审核事件监听器已停止");
    }
}

/// 消费任务退出时清除运行标志并通知等待方，任务 panic 时同样生效
struct ExitGuard {
    running: Arc<AtomicBool>,
    done: watch::Sender<bool>,
}

impl Drop for ExitGuard {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.done.send_replace(true);
    }
}

struct ConsumptionLoop {
    source: Arc<dyn MessageSource>,
    handler: Arc<dyn ReviewedOrderHandler>,
    topic: String,
    poll_timeout: Duration,
    retry_policy: RetryPolicy,
}

impl ConsumptionLoop {
    async fn run(self, mut cancel: watch::Receiver<bool>, mut stop: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                biased;

                _ = signalled(&mut cancel) => {
                    info!(topic = %self.topic, "收到取消信号，消费任务退出");
                    break;
                }
                _ = signalled(&mut stop) => {
                    info!(topic = %self.topic, "收到停止信号，消费任务退出");
                    break;
                }
                polled = self.source.poll(self.poll_timeout) => match polled {
                    Ok(None) => {}
                    Ok(Some(msg)) => self.process(&msg).await,
                    Err(e) => warn!(topic = %self.topic, error = %e, "拉取消息失败"),
                },
            }
        }
    }

    async fn process(&self, msg: &ConsumerMessage) {
        let event: OrderEvent = match msg.deserialize_payload() {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    partition = msg.partition,
                    offset = msg.offset,
                    key = ?msg.key,
                    error = %e,
                    "审核事件无法解析，跳过"
                );
                record_event_consumed("malformed");
                self.commit(msg);
                return;
            }
        };

        let order_id = event.order.id.clone();
        if msg.key.as_deref().is_some_and(|key| key != order_id) {
            debug!(key = ?msg.key, %order_id, "消息 key 与订单 id 不一致");
        }
        let mut attempts: u32 = 0;

        // 重试期间整个循环阻塞，同一分区的消息保持顺序
        let result = retry_with_policy(
            &self.retry_policy,
            "update_reviewed_order",
            |_: &OrderError| true,
            || {
                attempts += 1;
                let handler = self.handler.clone();
                let event = event.clone();
                async move { handler.handle_reviewed_order(event).await }
            },
        )
        .await;

        match result {
            Ok(order) => {
                record_event_consumed(if attempts > 1 { "retried" } else { "applied" });
                info!(
                    order_id = %order.id,
                    status = %order.status,
                    attempts,
                    "审核事件已应用"
                );
            }
            Err(e) => {
                record_event_consumed("exhausted");
                error!(
                    %order_id,
                    attempts,
                    error = %e,
                    "审核事件重试耗尽，放弃处理"
                );
            }
        }

        self.commit(msg);
    }

    fn commit(&self, msg: &ConsumerMessage) {
        if let Err(e) = self.source.commit(msg) {
            warn!(
                partition = msg.partition,
                offset = msg.offset,
                error = %e,
                "提交位点失败"
            );
        }
    }
}

/// 等待信号变为 true；发送端已丢弃时永不完成
async fn signalled(rx: &mut watch::Receiver<bool>) {
    let result = rx.wait_for(|v| *v).await.map(|_| ());
    if result.is_err() {
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OrderInfo, OrderStatus, ProductQuantity};
    use crate::repository::OrderRepository;
    use bakery_shared::error::BakeryError;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::AtomicUsize;

    /// 内存消息源，队列为空时按超时时间休眠后返回 None
    #[derive(Default)]
    struct FakeSource {
        queue: parking_lot::Mutex<VecDeque<ConsumerMessage>>,
        committed: parking_lot::Mutex<Vec<i64>>,
        subscribes: AtomicUsize,
        closes: AtomicUsize,
    }

    impl FakeSource {
        fn push(&self, payload: Vec<u8>) {
            let mut queue = self.queue.lock();
            let offset = (self.committed.lock().len() + queue.len()) as i64;
            queue.push_back(ConsumerMessage {
                topic: "orders-reviewed".to_string(),
                partition: 0,
                offset,
                key: None,
                payload,
            });
        }

        fn committed(&self) -> Vec<i64> {
            self.committed.lock().clone()
        }
    }

    #[async_trait]
    impl MessageSource for FakeSource {
        fn subscribe(&self, _topics: &[&str]) -> Result<(), BakeryError> {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn poll(&self, timeout: Duration) -> Result<Option<ConsumerMessage>, BakeryError> {
            let next = self.queue.lock().pop_front();
            if next.is_some() {
                return Ok(next);
            }
            tokio::time::sleep(timeout).await;
            Ok(None)
        }

        fn commit(&self, msg: &ConsumerMessage) -> Result<(), BakeryError> {
            self.committed.lock().push(msg.offset);
            Ok(())
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// 按订单 id 预设失败次数的处理方
    #[derive(Default)]
    struct FlakyHandler {
        repository: OrderRepository,
        failures: HashMap<String, u32>,
        attempts: parking_lot::Mutex<HashMap<String, u32>>,
    }

    impl FlakyHandler {
        fn failing(failures: &[(&str, u32)]) -> Self {
            Self {
                failures: failures
                    .iter()
                    .map(|(id, n)| (id.to_string(), *n))
                    .collect(),
                ..Self::default()
            }
        }

        fn attempts(&self, id: &str) -> u32 {
            self.attempts.lock().get(id).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl ReviewedOrderHandler for FlakyHandler {
        async fn handle_reviewed_order(&self, event: OrderEvent) -> Result<Order, OrderError> {
            let attempt = {
                let mut attempts = self.attempts.lock();
                let n = attempts.entry(event.order.id.clone()).or_insert(0);
                *n += 1;
                *n
            };
            if attempt <= self.failures.get(&event.order.id).copied().unwrap_or(0) {
                return Err(OrderError::Shared(BakeryError::Internal(
                    "模拟处理失败".to_string(),
                )));
            }
            Ok(self.repository.save(event.order)?)
        }
    }

    fn review_payload(id: &str, status: OrderStatus) -> Vec<u8> {
        let order = Order {
            info: OrderInfo {
                customer_id: "lbroudoux".to_string(),
                product_quantities: vec![ProductQuantity {
                    product_name: "Millefeuille".to_string(),
                    quantity: 1,
                }],
                total_price: 4.1,
            },
            id: id.to_string(),
            status,
        };
        serde_json::to_vec(&OrderEvent::new(order, "Validation")).unwrap()
    }

    fn listener(source: Arc<FakeSource>, handler: Arc<FlakyHandler>) -> OrderEventListener {
        listener_with_backoff(source, handler, Duration::from_millis(1))
    }

    fn listener_with_backoff(
        source: Arc<FakeSource>,
        handler: Arc<FlakyHandler>,
        base_delay: Duration,
    ) -> OrderEventListener {
        OrderEventListener::new(
            source,
            handler,
            "orders-reviewed",
            Duration::from_millis(5),
            RetryPolicy {
                max_attempts: 3,
                base_delay,
            },
        )
    }

    async fn wait_for_commits(source: &FakeSource, expected: usize) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while source.committed.lock().len() < expected {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("位点提交超时");
    }

    #[tokio::test]
    async fn test_stop_before_listen_is_noop() {
        let source = Arc::new(FakeSource::default());
        let listener = listener(source.clone(), Arc::new(FlakyHandler::default()));

        listener.stop().await;

        assert!(!listener.is_running());
        assert_eq!(source.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_listen_twice_fails_and_restart_after_stop() {
        let source = Arc::new(FakeSource::default());
        let listener = listener(source.clone(), Arc::new(FlakyHandler::default()));
        let (_cancel_tx, cancel_rx) = watch::channel(false);

        let done = listener.listen(cancel_rx.clone()).await.unwrap();
        assert!(listener.is_running());

        let err = listener.listen(cancel_rx.clone()).await.unwrap_err();
        assert!(matches!(err, OrderError::AlreadyRunning));

        listener.stop().await;
        assert!(done.is_done());
        assert!(!listener.is_running());
        assert_eq!(source.closes.load(Ordering::SeqCst), 1);

        let done = listener.listen(cancel_rx).await.unwrap();
        assert!(listener.is_running());
        assert_eq!(source.subscribes.load(Ordering::SeqCst), 2);

        listener.stop().await;
        done.wait().await;
        assert!(!listener.is_running());
    }

    #[tokio::test]
    async fn test_later_event_for_same_order_wins() {
        let source = Arc::new(FakeSource::default());
        let handler = Arc::new(FlakyHandler::default());
        source.push(review_payload("o-1", OrderStatus::Validated));
        source.push(review_payload("o-1", OrderStatus::Canceled));

        let listener = listener(source.clone(), handler.clone());
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        listener.listen(cancel_rx).await.unwrap();

        wait_for_commits(&source, 2).await;
        listener.stop().await;

        assert_eq!(source.committed(), vec![0, 1]);
        assert_eq!(
            handler.repository.find_by_id("o-1").unwrap().status,
            OrderStatus::Canceled
        );
    }

    #[tokio::test]
    async fn test_exhausted_retries_commit_and_continue() {
        let source = Arc::new(FakeSource::default());
        let handler = Arc::new(FlakyHandler::failing(&[("poison", u32::MAX)]));
        source.push(review_payload("poison", OrderStatus::Validated));
        source.push(review_payload("o-2", OrderStatus::Validated));

        let listener = listener(source.clone(), handler.clone());
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        listener.listen(cancel_rx).await.unwrap();

        wait_for_commits(&source, 2).await;
        listener.stop().await;

        assert_eq!(handler.attempts("poison"), 3);
        assert_eq!(source.committed(), vec![0, 1]);
        assert!(handler.repository.find_by_id("poison").is_none());
        assert!(handler.repository.find_by_id("o-2").is_some());
    }

    #[tokio::test]
    async fn test_transient_failure_applied_once_committed_once() {
        let source = Arc::new(FakeSource::default());
        let handler = Arc::new(FlakyHandler::failing(&[("o-3", 1)]));
        source.push(review_payload("o-3", OrderStatus::Validated));

        let listener = listener(source.clone(), handler.clone());
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        listener.listen(cancel_rx).await.unwrap();

        wait_for_commits(&source, 1).await;
        listener.stop().await;

        assert_eq!(handler.attempts("o-3"), 2);
        assert_eq!(source.committed(), vec![0]);
        assert_eq!(
            handler.repository.find_by_id("o-3").unwrap().status,
            OrderStatus::Validated
        );
    }

    #[tokio::test]
    async fn test_malformed_payload_is_committed_and_skipped() {
        let source = Arc::new(FakeSource::default());
        let handler = Arc::new(FlakyHandler::default());
        source.push(b"{not json".to_vec());
        source.push(review_payload("o-4", OrderStatus::Failed));

        let listener = listener(source.clone(), handler.clone());
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        listener.listen(cancel_rx).await.unwrap();

        wait_for_commits(&source, 2).await;
        listener.stop().await;

        assert_eq!(source.committed(), vec![0, 1]);
        assert_eq!(handler.attempts.lock().len(), 1);
        assert_eq!(handler.repository.len(), 1);
    }

    #[tokio::test]
    async fn test_external_cancel_ends_loop() {
        let source = Arc::new(FakeSource::default());
        let listener = listener(source.clone(), Arc::new(FlakyHandler::default()));
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let done = listener.listen(cancel_rx).await.unwrap();
        cancel_tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), done.wait())
            .await
            .expect("取消后消费任务应退出");
        assert!(!listener.is_running());

        // 取消后可以重新启动，stop 仍负责释放订阅
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        listener.listen(cancel_rx).await.unwrap();
        listener.stop().await;
        assert_eq!(source.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_listen_starts_exactly_one_loop() {
        let source = Arc::new(FakeSource::default());
        let listener = Arc::new(listener(source.clone(), Arc::new(FlakyHandler::default())));
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let barrier = Arc::new(tokio::sync::Barrier::new(8));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let listener = listener.clone();
                let cancel_rx = cancel_rx.clone();
                let barrier = barrier.clone();
                tokio::spawn(async move {
                    barrier.wait().await;
                    listener.listen(cancel_rx).await
                })
            })
            .collect();

        let mut started = 0;
        let mut rejected = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => started += 1,
                Err(OrderError::AlreadyRunning) => rejected += 1,
                Err(e) => panic!("意外错误: {e}"),
            }
        }

        assert_eq!(started, 1);
        assert_eq!(rejected, 7);
        assert_eq!(source.subscribes.load(Ordering::SeqCst), 1);

        listener.stop().await;
        assert!(!listener.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_from_other_task_waits_for_retries_in_flight() {
        let source = Arc::new(FakeSource::default());
        let handler = Arc::new(FlakyHandler::failing(&[("slow", u32::MAX)]));
        source.push(review_payload("slow", OrderStatus::Validated));

        let listener = Arc::new(listener_with_backoff(
            source.clone(),
            handler.clone(),
            Duration::from_millis(50),
        ));
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let done = listener.listen(cancel_rx).await.unwrap();

        tokio::time::timeout(Duration::from_secs(2), async {
            while handler.attempts("slow") == 0 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .expect("处理方应已开始处理");

        let stopper = listener.clone();
        tokio::spawn(async move { stopper.stop().await })
            .await
            .unwrap();

        // 停止请求只在两条消息之间生效，正在重试的消息会跑完并提交
        assert_eq!(handler.attempts("slow"), 3);
        assert_eq!(source.committed(), vec![0]);
        assert!(done.is_done());
        assert!(!listener.is_running());
        assert_eq!(source.closes.load(Ordering::SeqCst), 1);
    }
}
