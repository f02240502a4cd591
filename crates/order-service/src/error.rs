//! 订单服务专用错误类型
//!
//! 在共享库 BakeryError 基础上定义本服务特有的错误变体。
//! 商品不可用是唯一预期的下单错误，它直接携带商品名，
//! HTTP 层按变体匹配即可渲染 422 响应，无需再检查错误的具体类型。

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bakery_shared::error::BakeryError;
use serde::Serialize;
use serde_json::json;

/// 订单处理错误
#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    /// 库存查询失败或返回非 available 状态
    #[error("商品不可用: {product_name}")]
    UnavailableProduct { product_name: String },

    /// 监听器已有消费循环在运行
    #[error("订单事件监听器已在运行")]
    AlreadyRunning,

    #[error("订单不存在: {0}")]
    OrderNotFound(String),

    #[error("无效的订单: {0}")]
    InvalidOrder(String),

    /// 发布器已关闭后仍有事件提交
    #[error("事件发布器已关闭")]
    PublisherClosed,

    /// 透传共享库错误，避免在每个 match 分支手动转换
    #[error(transparent)]
    Shared(#[from] BakeryError),
}

impl OrderError {
    /// 返回对应的 HTTP 状态码
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::UnavailableProduct { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::InvalidOrder(_) | Self::Shared(BakeryError::Validation(_)) => {
                StatusCode::BAD_REQUEST
            }
            Self::OrderNotFound(_) => StatusCode::NOT_FOUND,
            Self::AlreadyRunning => StatusCode::CONFLICT,
            Self::PublisherClosed => StatusCode::SERVICE_UNAVAILABLE,
            Self::Shared(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::UnavailableProduct { .. } => "UNAVAILABLE_PRODUCT",
            Self::AlreadyRunning => "ALREADY_RUNNING",
            Self::OrderNotFound(_) => "ORDER_NOT_FOUND",
            Self::InvalidOrder(_) => "INVALID_ORDER",
            Self::PublisherClosed => "PUBLISHER_CLOSED",
            Self::Shared(e) => e.code(),
        }
    }
}

/// 422 响应体
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UnavailableProduct {
    pub product_name: String,
    pub details: String,
}

impl UnavailableProduct {
    pub fn new(product_name: impl Into<String>) -> Self {
        let product_name = product_name.into();
        let details = format!("Pastry {product_name} is not available");
        Self {
            product_name,
            details,
        }
    }
}

impl IntoResponse for OrderError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        match self {
            Self::UnavailableProduct { product_name } => {
                (status, Json(UnavailableProduct::new(product_name))).into_response()
            }
            other => {
                if status.is_server_error() {
                    tracing::error!(error = %other, code = other.code(), "请求处理失败");
                }

                let body = json!({
                    "code": other.code(),
                    "message": other.to_string(),
                });
                (status, Json(body)).into_response()
            }
        }
    }
}
