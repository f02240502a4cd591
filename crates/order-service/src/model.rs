//! 订单领域模型
//!
//! 字段名与线上 JSON 契约保持一致（camelCase），
//! 出站的创建事件与入站的审核事件共用同一个 [`OrderEvent`] 结构。

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 订单创建事件的变更原因
pub const CHANGE_REASON_CREATION: &str = "Creation";

/// 单个商品及其数量
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductQuantity {
    pub product_name: String,
    pub quantity: u32,
}

/// 下单请求携带的订单信息，被接受后不再修改
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderInfo {
    pub customer_id: String,
    pub product_quantities: Vec<ProductQuantity>,
    pub total_price: f64,
}

impl OrderInfo {
    /// 请求入口的基本校验：每个商品的数量必须为正数，返回第一条不合法的原因
    pub fn validate(&self) -> Result<(), String> {
        if let Some(pq) = self.product_quantities.iter().find(|pq| pq.quantity == 0) {
            return Err(format!("商品 {} 的数量必须为正数", pq.product_name));
        }
        Ok(())
    }
}

/// 订单状态
///
/// 核心流程不限制状态迁移，审核事件带来什么状态就写入什么状态。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Created,
    Validated,
    Canceled,
    Failed,
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "CREATED",
            Self::Validated => "VALIDATED",
            Self::Canceled => "CANCELED",
            Self::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// 订单
///
/// 订单信息字段在 JSON 中与 id、status 平铺在同一层。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    #[serde(flatten)]
    pub info: OrderInfo,
    pub id: String,
    pub status: OrderStatus,
}

impl Order {
    /// 用新分配的 id 创建一笔 CREATED 状态的订单
    pub fn create(info: OrderInfo) -> Self {
        Self {
            info,
            id: Uuid::new_v4().to_string(),
            status: OrderStatus::Created,
        }
    }
}

/// 订单生命周期事件
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderEvent {
    /// 毫秒级 Unix 时间戳
    pub timestamp: i64,
    pub order: Order,
    pub change_reason: String,
}

impl OrderEvent {
    pub fn new(order: Order, change_reason: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().timestamp_millis(),
            order,
            change_reason: change_reason.into(),
        }
    }

    pub fn creation(order: Order) -> Self {
        Self::new(order, CHANGE_REASON_CREATION)
    }
}
