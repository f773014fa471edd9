//! 编排引擎的 HTTP 接口
//!
//! 两类调用方：
//!
//! - 协议适配器：`/adapter/...`，上报设备连接、领取任务、回报结果
//! - 管理控制台：`/api/...`，分组、工作流和任务的管理操作
//!
//! 处理函数只做参数转换，业务逻辑全部在 [`fleet_dispatcher::FleetController`] 中。

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use axum::{http::StatusCode, Router};
use fleet_config::ApiConfig;
use fleet_dispatcher::FleetController;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;

use middleware::{cors_layer, request_logging, trace_layer};
use routes::{create_routes, AppState};

/// 创建完整的API应用
pub fn create_app(controller: Arc<FleetController>, api_config: &ApiConfig) -> Router {
    let state = AppState { controller };

    let router = create_routes(state).layer(
        ServiceBuilder::new()
            .layer(trace_layer())
            .layer(axum::middleware::from_fn(request_logging))
            .layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                Duration::from_secs(api_config.request_timeout_seconds),
            )),
    );

    if api_config.cors_enabled {
        router.layer(cors_layer(&api_config.cors_origins))
    } else {
        router
    }
}
