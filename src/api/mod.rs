pub mod health; // 健康检查接口 / Health endpoints

use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use tokio::sync::watch;
use tracing::info;

use crate::node::ChatNode;

/// 启动 HTTP 服务，收到关闭信号后优雅停止
/// Serve HTTP until the shutdown signal, then stop gracefully
pub async fn serve(
    node: Arc<ChatNode>,
    host: String,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let addr = format!("{}:{}", host, port);
    let data = web::Data::new(node);
    let server = HttpServer::new(move || App::new().app_data(data.clone()).configure(health::register))
        .workers(2)
        .disable_signals()
        .bind(addr.as_str())?
        .run();

    let handle = server.handle();
    tokio::spawn(async move {
        while shutdown.changed().await.is_ok() {
            if *shutdown.borrow() {
                break;
            }
        }
        handle.stop(true).await;
    });

    info!("🌐 HTTP Server starting on http://{}", addr);
    info!("   GET  {} - Liveness check", health::LIVE_PATH);
    info!("   GET  {} - Readiness check", health::READY_PATH);
    info!("   GET  {} - Detailed health check with metrics", health::DETAILED_PATH);
    server.await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerHandles, MemoryBroker};
    use crate::cluster::Keyspace;
    use std::time::Duration;

    #[tokio::test]
    async fn test_serve_runs_on_spawned_task_and_stops_on_shutdown() {
        let node = Arc::new(ChatNode::new(
            "node-a",
            BrokerHandles::from_shared(Arc::new(MemoryBroker::new())),
            Keyspace::default(),
            Duration::from_secs(90),
        ));
        let (tx, rx) = watch::channel(false);
        let host = String::from("127.0.0.1");
        let server = tokio::spawn(serve(node, host, 0, rx));

        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
