//! 配置管理模块
//!
//! 支持多格式配置文件加载，环境变量覆盖，以及类型安全的配置访问。

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::kafka::topics;

/// Kafka 配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    pub brokers: String,
    pub consumer_group: String,
    pub auto_offset_reset: String,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            brokers: "localhost:9092".to_string(),
            consumer_group: "order-service".to_string(),
            // 只关心启动之后的审核结果
            auto_offset_reset: "latest".to_string(),
        }
    }
}

/// Topic 配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TopicsConfig {
    /// 订单创建事件的出站 topic
    pub order_created: String,
    /// 订单审核结果的入站 topic
    pub order_reviewed: String,
}

impl Default for TopicsConfig {
    fn default() -> Self {
        Self {
            order_created: topics::ORDERS_CREATED.to_string(),
            order_reviewed: topics::ORDERS_REVIEWED.to_string(),
        }
    }
}

/// 库存（糕点目录）服务配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InventoryConfig {
    pub base_url: String,
    pub timeout_ms: u64,
}

impl Default for InventoryConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:9090/rest/API Pastries/0.0.1".to_string(),
            timeout_ms: 3000,
        }
    }
}

impl InventoryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// 审核事件监听器配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// 单次拉取消息的超时时间
    pub poll_timeout_ms: u64,
    /// 单条消息的最大处理次数（含首次）
    pub max_attempts: u32,
    /// 线性退避的基础间隔，第 n 次失败后等待 n 倍
    pub retry_backoff_ms: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 100,
            max_attempts: 3,
            retry_backoff_ms: 200,
        }
    }
}

impl ListenerConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }
}

/// 事件发布器配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// 每次发布后等待消息交给传输层的最长时间
    pub flush_timeout_ms: u64,
    /// 单条消息的投递超时（对应 librdkafka 的 message.timeout.ms）
    pub delivery_timeout_ms: u64,
    /// 待观察投递结果的队列容量
    pub delivery_queue_capacity: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            flush_timeout_ms: 50,
            delivery_timeout_ms: 5000,
            delivery_queue_capacity: 1024,
        }
    }
}

impl PublisherConfig {
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

/// 服务配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9000,
        }
    }
}

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub log_level: String,
    /// 日志输出格式：json（结构化）或 pretty（人类可读）
    pub log_format: String,
    pub metrics_enabled: bool,
    pub metrics_port: u16,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            metrics_enabled: false,
            metrics_port: 9464,
        }
    }
}

/// 应用配置
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub service_name: String,
    pub environment: String,
    pub server: ServerConfig,
    pub kafka: KafkaConfig,
    pub topics: TopicsConfig,
    pub inventory: InventoryConfig,
    pub listener: ListenerConfig,
    pub publisher: PublisherConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// 从配置文件和环境变量加载配置
    ///
    /// 加载顺序（后加载的会覆盖先加载的同名配置项）：
    /// 1. config/default.toml（默认配置）
    /// 2. config/{environment}.toml（环境特定配置）
    /// 3. config/{service_name}.toml（服务特定配置）
    /// 4. 环境变量（BAKERY_ 前缀，如 BAKERY_KAFKA__BROKERS -> kafka.brokers）
    /// 5. 兼容旧部署的环境变量（PASTRY_API_URL, KAFKA_BOOTSTRAP_URL）
    pub fn load(service_name: &str) -> Result<Self, ConfigError> {
        let env = std::env::var("BAKERY_ENV").unwrap_or_else(|_| "development".to_string());

        let config_dir = std::env::var("CONFIG_DIR").unwrap_or_else(|_| "config".to_string());

        let builder = Config::builder()
            .set_default("service_name", service_name)?
            .set_default("environment", env.clone())?
            .add_source(File::from(Path::new(&config_dir).join("default.toml")).required(false))
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", env))).required(false),
            )
            .add_source(
                File::from(Path::new(&config_dir).join(format!("{}.toml", service_name)))
                    .required(false),
            )
            // 双下划线分隔层级，单词内部的下划线保持原样
            .add_source(
                Environment::with_prefix("BAKERY")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        let mut config: Self = builder.build()?.try_deserialize()?;

        config.apply_legacy_overrides(
            std::env::var("PASTRY_API_URL").ok(),
            std::env::var("KAFKA_BOOTSTRAP_URL").ok(),
        );

        Ok(config)
    }

    /// 应用旧版环境变量覆盖
    ///
    /// 旧版部署脚本只设置 PASTRY_API_URL 和 KAFKA_BOOTSTRAP_URL 两个变量。
    fn apply_legacy_overrides(&mut self, pastry_api_url: Option<String>, kafka_url: Option<String>) {
        if let Some(url) = pastry_api_url.filter(|v| !v.is_empty()) {
            self.inventory.base_url = url;
        }
        if let Some(brokers) = kafka_url.filter(|v| !v.is_empty()) {
            self.kafka.brokers = brokers;
        }
    }

    /// 获取服务地址
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// 是否为生产环境
    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}
