//! Prometheus 指标模块
//!
//! 基于 metrics crate 和 metrics-exporter-prometheus 实现指标收集与导出。
//! 指标通过独立的 HTTP 端口暴露，供 Prometheus 抓取。

use anyhow::Result;
use axum::{Router, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::sync::OnceLock;
use tokio::net::TcpListener;
use tracing::{error, info};

/// 全局 Prometheus handle，用于渲染指标
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// 订单指标名称
pub mod names {
    pub const ORDERS_PLACED: &str = "orders_placed_total";
    pub const ORDERS_REJECTED: &str = "orders_rejected_total";
    pub const ORDER_PUBLISH_FAILURES: &str = "order_publish_failures_total";
    pub const ORDER_EVENTS_CONSUMED: &str = "order_events_consumed_total";
    pub const ORDER_EVENT_DELIVERIES: &str = "order_event_deliveries_total";
}

/// Metrics 资源守卫
#[derive(Debug)]
pub struct MetricsHandle {
    server_handle: tokio::task::JoinHandle<()>,
}

impl MetricsHandle {
    /// 停止指标 HTTP 服务器
    pub fn shutdown(self) {
        self.server_handle.abort();
    }
}

/// 初始化 Prometheus 指标导出
///
/// 启动一个独立的 HTTP 服务器在指定端口暴露 `/metrics` 端点。
pub async fn init(service_name: &str, port: u16) -> Result<MetricsHandle> {
    let handle = PrometheusBuilder::new().install_recorder()?;

    // 保存到全局，供其他地方获取指标快照
    let _ = PROMETHEUS_HANDLE.set(handle.clone());

    register_common_metrics(service_name);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let server_handle = start_metrics_server(addr, handle).await?;

    Ok(MetricsHandle { server_handle })
}

/// 注册订单管道相关指标的描述
fn register_common_metrics(service_name: &str) {
    metrics::describe_counter!(names::ORDERS_PLACED, "Total number of accepted orders");
    metrics::describe_counter!(
        names::ORDERS_REJECTED,
        "Total number of orders rejected because a product is unavailable"
    );
    metrics::describe_counter!(
        names::ORDER_PUBLISH_FAILURES,
        "Total number of order events that could not be submitted"
    );
    metrics::describe_counter!(
        names::ORDER_EVENTS_CONSUMED,
        "Total number of inbound order events by outcome"
    );
    metrics::describe_counter!(
        names::ORDER_EVENT_DELIVERIES,
        "Total number of outbound delivery reports by outcome"
    );

    metrics::counter!("service_starts_total", "service" => service_name.to_string()).increment(1);
}

/// 启动指标 HTTP 服务器
async fn start_metrics_server(
    addr: SocketAddr,
    handle: PrometheusHandle,
) -> Result<tokio::task::JoinHandle<()>> {
    let app = Router::new()
        .route("/metrics", get(move || std::future::ready(handle.render())))
        .route("/health", get(|| async { "OK" }));

    let listener = TcpListener::bind(addr).await?;
    info!("Metrics server listening on {}", addr);

    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(server_handle)
}

/// 获取全局 Prometheus handle（用于自定义渲染）
pub fn get_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录下单结果
#[inline]
pub fn record_order_placed(accepted: bool) {
    if accepted {
        metrics::counter!(names::ORDERS_PLACED).increment(1);
    } else {
        metrics::counter!(names::ORDERS_REJECTED).increment(1);
    }
}

/// 记录事件提交失败
#[inline]
pub fn record_publish_failure(topic: &str) {
    metrics::counter!(names::ORDER_PUBLISH_FAILURES, "topic" => topic.to_string()).increment(1);
}

/// 记录入站事件的处理结果（applied / retried / exhausted / malformed）
#[inline]
pub fn record_event_consumed(outcome: &'static str) {
    metrics::counter!(names::ORDER_EVENTS_CONSUMED, "outcome" => outcome).increment(1);
}

/// 记录出站事件的投递结果
#[inline]
pub fn record_delivery(delivered: bool) {
    let outcome = if delivered { "delivered" } else { "failed" };
    metrics::counter!(names::ORDER_EVENT_DELIVERIES, "outcome" => outcome).increment(1);
}
