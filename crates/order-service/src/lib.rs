//! 订单服务
//!
//! 接收 HTTP 下单请求，核对糕点库存后创建订单并发布创建事件，
//! 同时消费审核结果事件回写订单状态。
//!
//! ## 模块结构
//!
//! - `model`: 订单与事件模型
//! - `inventory`: 糕点库存 HTTP 客户端
//! - `repository`: 内存订单仓储
//! - `publisher`: 订单事件发布器
//! - `listener`: 审核事件监听器
//! - `service`: 下单与审核回写的业务逻辑
//! - `handlers` / `routes` / `state`: HTTP 接口
//! - `error`: 错误类型定义

pub mod error;
pub mod handlers;
pub mod inventory;
pub mod listener;
pub mod model;
pub mod publisher;
pub mod repository;
pub mod routes;
pub mod service;
pub mod state;

pub use error::OrderError;
pub use listener::{ListenerDone, OrderEventListener, ReviewedOrderHandler};
pub use publisher::{KafkaOrderEventPublisher, OrderEventPublisher};
pub use service::OrderService;
