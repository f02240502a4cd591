//! 订单 API 处理器

use axum::Json;
use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde_json::{Value, json};
use tracing::info;

use crate::error::OrderError;
use crate::model::{Order, OrderInfo};
use crate::state::AppState;

/// 存活探针
///
/// GET /
pub async fn hello() -> Json<Value> {
    Json(json!({ "Hello": "World!" }))
}

/// GET /health
pub async fn health_check() -> &'static str {
    "OK"
}

/// 下单
///
/// POST /api/orders
pub async fn create_order(
    State(state): State<AppState>,
    payload: Result<Json<OrderInfo>, JsonRejection>,
) -> Result<(StatusCode, Json<Order>), OrderError> {
    let Json(info) = payload.map_err(|e| OrderError::InvalidOrder(e.body_text()))?;
    info.validate().map_err(OrderError::InvalidOrder)?;

    info!(
        customer_id = %info.customer_id,
        products = info.product_quantities.len(),
        "收到下单请求"
    );

    let order = state.order_service.place_order(info).await?;
    Ok((StatusCode::CREATED, Json(order)))
}

/// 查询订单
///
/// GET /api/orders/{order_id}
pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<String>,
) -> Result<Json<Order>, OrderError> {
    state
        .order_service
        .get_order(&order_id)
        .map(Json)
        .ok_or(OrderError::OrderNotFound(order_id))
}

/// GET /api/orders
pub async fn list_orders(State(state): State<AppState>) -> Json<Vec<Order>> {
    Json(state.order_service.list_orders())
}
