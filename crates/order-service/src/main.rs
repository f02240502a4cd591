use std::sync::Arc;

use anyhow::Context;
use bakery_shared::config::AppConfig;
use bakery_shared::kafka::{KafkaConsumer, KafkaProducer};
use bakery_shared::observability;
use bakery_shared::retry::RetryPolicy;
use order_service::inventory::PastryApiClient;
use order_service::repository::OrderRepository;
use order_service::routes;
use order_service::state::AppState;
use order_service::{KafkaOrderEventPublisher, OrderEventListener, OrderService};
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load("order-service").context("加载配置失败")?;

    let _guard = observability::init(&config.service_name, &config.observability).await?;

    info!(
        environment = %config.environment,
        brokers = %config.kafka.brokers,
        inventory = %config.inventory.base_url,
        "Starting order-service on {}",
        config.server_addr()
    );

    // 无法创建 Kafka 客户端时直接退出
    let producer = KafkaProducer::new(&config.kafka, &config.publisher)
        .context("创建 Kafka 生产者失败")?;
    let consumer = KafkaConsumer::new(&config.kafka).context("创建 Kafka 消费者失败")?;
    let pastry_api = PastryApiClient::new(&config.inventory.base_url, config.inventory.timeout())
        .context("创建库存服务客户端失败")?;

    let publisher = Arc::new(KafkaOrderEventPublisher::new(
        Arc::new(producer),
        &config.topics.order_created,
        &config.publisher,
    ));
    let order_service = Arc::new(OrderService::new(
        Arc::new(pastry_api),
        publisher.clone(),
        OrderRepository::new(),
    ));
    let listener = OrderEventListener::new(
        Arc::new(consumer),
        order_service.clone(),
        &config.topics.order_reviewed,
        config.listener.poll_timeout(),
        RetryPolicy::from(&config.listener),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let listener_done = listener.listen(shutdown_rx).await?;

    let app = routes::build_router(AppState::new(order_service));
    let tcp = TcpListener::bind(config.server_addr()).await?;
    info!("HTTP server listening on {}", config.server_addr());

    let served = axum::serve(tcp, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_tx.send_replace(true);
        })
        .await;
    if let Err(e) = &served {
        error!(error = %e, "HTTP server error");
    }

    listener.stop().await;
    listener_done.wait().await;
    publisher.shutdown().await;

    info!("Service shutdown complete");
    served.map_err(Into::into)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "无法监听 Ctrl+C 信号");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "无法监听 SIGTERM 信号");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown...");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown...");
        }
    }
}
