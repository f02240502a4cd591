//! 订单内存仓储
//!
//! 使用 DashMap 实现的并发安全订单存储，HTTP 下单路径与审核事件消费路径共享同一实例。
//! 同一 key 的并发写入按 DashMap 分片锁的获取顺序生效（后写覆盖先写），
//! 与事件时间戳无关。

use std::sync::Arc;

use bakery_shared::error::BakeryError;
use dashmap::DashMap;

use crate::model::Order;

/// 订单仓储
///
/// Clone 只复制内部 Arc，所有副本指向同一份数据。
#[derive(Debug, Clone, Default)]
pub struct OrderRepository {
    orders: Arc<DashMap<String, Order>>,
}

impl OrderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以订单 id 为 key 插入或覆盖，返回写入的订单
    ///
    /// 空 id 的订单无法被查询到，直接拒绝写入。
    pub fn save(&self, order: Order) -> Result<Order, BakeryError> {
        if order.id.is_empty() {
            return Err(BakeryError::Validation("订单 id 不能为空".to_string()));
        }
        self.orders.insert(order.id.clone(), order.clone());
        Ok(order)
    }

    /// 获取订单快照，返回克隆，不持有锁
    pub fn find_by_id(&self, id: &str) -> Option<Order> {
        self.orders.get(id).map(|entry| entry.value().clone())
    }

    /// 列出所有订单的快照
    pub fn list(&self) -> Vec<Order> {
        self.orders
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.orders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.orders.is_empty()
    }
}
