// v 基础库入口：配置、日志、数据库与健康检查
// v foundation crate: configuration, logging, database and health checks

pub mod comm;
#[cfg(feature = "config")]
pub use crate::comm::config::*;
pub use crate::comm::tracing::{init_tracing, LogFormat};

#[cfg(feature = "postgres")]
pub mod db;
#[cfg(feature = "postgres")]
pub use crate::db::connection::*;
#[cfg(feature = "postgres")]
pub use crate::db::error::*;

use async_trait::async_trait;

/// 健康状态结构体：用于表示组件当前健康状况
/// Health status struct: represents the current health of a component
#[derive(Debug, Clone, serde::Serialize)]
pub struct HealthStatus {
    /// 组件名称（如 postgres_pool、redis_broker）
    /// Component name (e.g., postgres_pool, redis_broker)
    pub component: String,
    pub healthy: bool,
    /// 附加消息（错误信息或提示）
    /// Additional message (error details or hint)
    pub message: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl HealthStatus {
    pub fn up(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            healthy: true,
            message: Some("OK".to_string()),
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn down(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            healthy: false,
            message: Some(message.into()),
            timestamp: chrono::Utc::now(),
        }
    }
}

/// 健康检查通用接口：由各服务或资源实现具体检查逻辑
/// Generic health check interface: implemented by services/resources with concrete logic
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check_health(&self) -> HealthStatus;
}
