use std::sync::Arc;

use actix_web::http::StatusCode;
use actix_web::{web, HttpResponse, Responder};
use serde_json::json;

use crate::node::ChatNode;

pub const LIVE_PATH: &str = "/v1/health/live";
pub const READY_PATH: &str = "/v1/health/ready";
pub const DETAILED_PATH: &str = "/v1/health/detailed";

// 路由注册入口（GET）
// Route registration entry (GET)
pub fn register(cfg: &mut web::ServiceConfig) {
    cfg.service(web::resource(LIVE_PATH).route(web::get().to(health_live_handle)))
        .service(web::resource(READY_PATH).route(web::get().to(health_ready_handle)))
        .service(web::resource(DETAILED_PATH).route(web::get().to(health_detailed_handle)));
}

// 存活检查：进程可响应即视为存活
// Liveness: the process answers
pub async fn health_live_handle(node: web::Data<Arc<ChatNode>>) -> impl Responder {
    HttpResponse::Ok().json(json!({
        "status": "alive",
        "node_id": node.node_id(),
        "timestamp": chrono::Utc::now().timestamp_millis(),
    }))
}

// 就绪检查：消息代理与数据库均健康
// Readiness: broker and database are healthy
pub async fn health_ready_handle(node: web::Data<Arc<ChatNode>>) -> impl Responder {
    let checks = node.health().await;
    let ready = checks.iter().all(|c| c.healthy);
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    HttpResponse::build(code).json(json!({
        "ready": ready,
        "node_id": node.node_id(),
        "checks": checks,
        "timestamp": chrono::Utc::now().timestamp_millis(),
    }))
}

// 详细检查：附带路由、死信与归档统计
// Detailed: adds routing, dead-letter and archive statistics
pub async fn health_detailed_handle(node: web::Data<Arc<ChatNode>>) -> impl Responder {
    let checks = node.health().await;
    let healthy = checks.iter().all(|c| c.healthy);
    let archive = node.archiver().map(|a| {
        json!({
            "running": a.is_running(),
            "cron": a.settings().cron,
            "last_report": a.last_report(),
        })
    });
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    HttpResponse::build(code).json(json!({
        "status": if healthy { "healthy" } else { "degraded" },
        "node_id": node.node_id(),
        "checks": checks,
        "online_local_users": node.sessions().len(),
        "router": node.router().stats(),
        "dead_letter": node.dead_letter().map(|d| d.stats()),
        "archive": archive,
        "timestamp": chrono::Utc::now().timestamp_millis(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerHandles, MemoryBroker};
    use crate::cluster::Keyspace;
    use actix_web::{test, App};
    use async_trait::async_trait;
    use std::time::Duration;
    use v::{HealthCheck, HealthStatus};

    struct DownDb;

    #[async_trait]
    impl HealthCheck for DownDb {
        async fn check_health(&self) -> HealthStatus {
            HealthStatus::down("postgres_pool", "connection refused")
        }
    }

    fn node() -> ChatNode {
        ChatNode::new(
            "node-a",
            BrokerHandles::from_shared(Arc::new(MemoryBroker::new())),
            Keyspace::default(),
            Duration::from_secs(90),
        )
    }

    #[actix_web::test]
    async fn test_live_and_ready() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(Arc::new(node())))
                .configure(register),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri(LIVE_PATH).to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);

        let body: serde_json::Value =
            test::call_and_read_body_json(&app, test::TestRequest::get().uri(READY_PATH).to_request()).await;
        assert_eq!(body["ready"], true);
        assert_eq!(body["node_id"], "node-a");
    }

    #[actix_web::test]
    async fn test_ready_fails_when_database_down() {
        let app = test::init_service(
            App::new()
                .app_data(web::Data::new(Arc::new(node().with_health_check(Arc::new(DownDb)))))
                .configure(register),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri(READY_PATH).to_request()).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let resp =
            test::call_service(&app, test::TestRequest::get().uri(DETAILED_PATH).to_request()).await;
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
