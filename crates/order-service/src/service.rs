//! 订单业务逻辑
//!
//! 下单时逐个核对商品库存，全部可售才创建订单并发布创建事件；
//! 审核事件到达后无条件覆盖仓储中的订单。

use std::sync::Arc;

use async_trait::async_trait;
use bakery_shared::observability::metrics::record_order_placed;
use tracing::{debug, info, warn};

use crate::error::OrderError;
use crate::inventory::PastryApi;
use crate::listener::ReviewedOrderHandler;
use crate::model::{Order, OrderEvent, OrderInfo};
use crate::publisher::OrderEventPublisher;
use crate::repository::OrderRepository;

/// 库存核对结果
#[derive(Debug, Clone, PartialEq, Eq)]
enum Availability {
    Available,
    Unavailable { product_name: String },
}

/// 订单服务
pub struct OrderService {
    pastry_api: Arc<dyn PastryApi>,
    publisher: Arc<dyn OrderEventPublisher>,
    repository: OrderRepository,
}

impl OrderService {
    pub fn new(
        pastry_api: Arc<dyn PastryApi>,
        publisher: Arc<dyn OrderEventPublisher>,
        repository: OrderRepository,
    ) -> Self {
        Self {
            pastry_api,
            publisher,
            repository,
        }
    }

    /// 下单
    ///
    /// 任一商品不可用时返回 [`OrderError::UnavailableProduct`]，不写入任何数据。
    /// 事件发布失败不回滚，订单仍然写入仓储。
    pub async fn place_order(&self, info: OrderInfo) -> Result<Order, OrderError> {
        if let Availability::Unavailable { product_name } = self.check_availability(&info).await {
            record_order_placed(false);
            info!(customer_id = %info.customer_id, %product_name, "商品不可用，拒绝下单");
            return Err(OrderError::UnavailableProduct { product_name });
        }

        let order = Order::create(info);
        let event = OrderEvent::creation(order.clone());

        if let Err(e) = self.publisher.publish_order_event(event).await {
            warn!(order_id = %order.id, error = %e, "订单创建事件发布失败，订单仍会保存");
        }

        let order = self.repository.save(order)?;
        record_order_placed(true);
        info!(order_id = %order.id, customer_id = %order.info.customer_id, "订单已创建");

        Ok(order)
    }

    pub fn get_order(&self, id: &str) -> Option<Order> {
        self.repository.find_by_id(id)
    }

    pub fn list_orders(&self) -> Vec<Order> {
        self.repository.list()
    }

    /// 用审核事件中的订单覆盖仓储，不校验状态迁移
    pub async fn update_reviewed_order(&self, event: OrderEvent) -> Result<Order, OrderError> {
        let order = self.repository.save(event.order)?;
        info!(
            order_id = %order.id,
            status = %order.status,
            change_reason = %event.change_reason,
            "订单审核结果已更新"
        );
        Ok(order)
    }

    /// 从左到右逐个查询，遇到第一个查询失败或非 available 的商品即停止
    async fn check_availability(&self, info: &OrderInfo) -> Availability {
        for pq in &info.product_quantities {
            match self.pastry_api.get_pastry(&pq.product_name).await {
                Ok(pastry) if pastry.is_available() => {
                    debug!(product_name = %pq.product_name, "商品可售");
                }
                Ok(pastry) => {
                    debug!(product_name = %pq.product_name, status = %pastry.status, "商品不可售");
                    return Availability::Unavailable {
                        product_name: pq.product_name.clone(),
                    };
                }
                Err(e) => {
                    warn!(product_name = %pq.product_name, error = %e, "查询库存失败");
                    return Availability::Unavailable {
                        product_name: pq.product_name.clone(),
                    };
                }
            }
        }
        Availability::Available
    }
}

#[async_trait]
impl ReviewedOrderHandler for OrderService {
    async fn handle_reviewed_order(&self, event: OrderEvent) -> Result<Order, OrderError> {
        self.update_reviewed_order(event).await
    }
}
