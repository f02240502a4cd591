//! 路由配置模块

use axum::{Router, routing::get};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::{handlers, state::AppState};

/// 订单相关路由
pub fn order_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/orders",
            get(handlers::list_orders).post(handlers::create_order),
        )
        .route("/orders/{order_id}", get(handlers::get_order))
}

/// 构建完整的应用路由
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handlers::hello))
        .route("/health", get(handlers::health_check))
        .nest("/api", order_routes())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}
