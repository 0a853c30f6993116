use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use v::{HealthCheck, HealthStatus};

use crate::broker::BrokerHandles;
use crate::cluster::{Keyspace, MessageRouter, PresenceEntry, PresenceRegistry};
use crate::config::NodeSettings;
use crate::error::AppResult;
use crate::session::{SessionSender, SessionTable};
use crate::storage::MessageStore;
use crate::stream::{AlertSink, DeadLetterConsumer, DeadLetterSettings, LogAlertSink};
use crate::tasks::{ArchiveLock, ArchiveSettings, MessageArchiver};

/// 聊天节点：组装在线状态、路由、死信消费与归档
/// Chat node: wires presence, routing, dead-letter handling and archival
///
/// 所有依赖通过构造参数显式传入 / Every dependency is passed in explicitly
pub struct ChatNode {
    node_id: String,
    keys: Keyspace,
    broker: BrokerHandles,
    presence: Arc<PresenceRegistry>,
    sessions: SessionTable,
    router: Arc<MessageRouter>,
    dead_letter: Option<Arc<DeadLetterConsumer>>,
    archiver: Option<Arc<MessageArchiver>>,
    refresh_interval: Duration,
    health_checks: Vec<Arc<dyn HealthCheck>>,
}

impl ChatNode {
    pub fn new(node_id: impl Into<String>, broker: BrokerHandles, keys: Keyspace, presence_ttl: Duration) -> Self {
        let node_id = node_id.into();
        let presence = Arc::new(PresenceRegistry::new(
            broker.kv.clone(),
            keys.clone(),
            node_id.clone(),
            presence_ttl,
        ));
        let sessions = SessionTable::new();
        let router = Arc::new(MessageRouter::new(
            presence.clone(),
            broker.pubsub.clone(),
            Arc::new(sessions.clone()),
            keys.clone(),
        ));
        let health_checks = vec![broker.health.clone()];
        Self {
            node_id,
            keys,
            broker,
            presence,
            sessions,
            router,
            dead_letter: None,
            archiver: None,
            refresh_interval: presence_ttl / 3,
            health_checks,
        }
    }

    /// 按配置组装节点 / Assemble a node from settings
    pub fn from_settings(
        settings: &NodeSettings,
        broker: BrokerHandles,
        store: Option<Arc<dyn MessageStore>>,
    ) -> Self {
        let keys = Keyspace::new(settings.broker.key_prefix.clone());
        let mut node = ChatNode::new(settings.node.id.clone(), broker, keys, settings.presence.ttl)
            .with_refresh_interval(settings.presence.refresh_interval);

        if settings.dead_letter.enabled {
            let dl = &settings.dead_letter;
            let dl_settings = DeadLetterSettings::new(&node.keys, &dl.consumer_prefix, &node.node_id)
                .with_batch(dl.batch_size, dl.block);
            node = node.with_dead_letter(dl_settings, Arc::new(LogAlertSink));
        }

        if let Some(store) = store {
            let a = &settings.archive;
            let lock = a.lock_ttl.map(|ttl| {
                ArchiveLock::new(node.broker.kv.clone(), node.keys.archive_lock(), node.node_id.clone(), ttl)
            });
            let archiver = MessageArchiver::new(store, ArchiveSettings::from(a), lock);
            node = node.with_archiver(Arc::new(archiver));
        }
        node
    }

    pub fn with_dead_letter(mut self, settings: DeadLetterSettings, alerts: Arc<dyn AlertSink>) -> Self {
        self.dead_letter = Some(Arc::new(DeadLetterConsumer::new(
            self.broker.stream.clone(),
            alerts,
            settings,
        )));
        self
    }

    pub fn with_archiver(mut self, archiver: Arc<MessageArchiver>) -> Self {
        self.archiver = Some(archiver);
        self
    }

    pub fn with_refresh_interval(mut self, every: Duration) -> Self {
        self.refresh_interval = every;
        self
    }

    /// 附加健康检查（例如数据库连接池）/ Extra health check, e.g. the database pool
    pub fn with_health_check(mut self, check: Arc<dyn HealthCheck>) -> Self {
        self.health_checks.push(check);
        self
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn keys(&self) -> &Keyspace {
        &self.keys
    }

    pub fn broker(&self) -> &BrokerHandles {
        &self.broker
    }

    pub fn presence(&self) -> &Arc<PresenceRegistry> {
        &self.presence
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn dead_letter(&self) -> Option<&Arc<DeadLetterConsumer>> {
        self.dead_letter.as_ref()
    }

    pub fn archiver(&self) -> Option<&Arc<MessageArchiver>> {
        self.archiver.as_ref()
    }

    /// 用户连接：绑定会话并注册位置 / User connected: attach session, register presence
    pub async fn on_connect(&self, uid: i64, sender: SessionSender) -> AppResult<PresenceEntry> {
        self.sessions.attach(uid, sender);
        let entry = self.presence.register_local(uid).await?;
        info!("🔗 uid={} connected to {}", uid, self.node_id);
        Ok(entry)
    }

    /// 用户断开：解绑会话并释放位置 / User disconnected: detach session, release presence
    pub async fn on_disconnect(&self, uid: i64) -> AppResult<bool> {
        self.sessions.detach(uid);
        let released = self.presence.release(uid).await?;
        info!("🔌 uid={} disconnected from {} (released={})", uid, self.node_id, released);
        Ok(released)
    }

    /// 逐项执行健康检查 / Run every health check
    pub async fn health(&self) -> Vec<HealthStatus> {
        let mut out = Vec::with_capacity(self.health_checks.len());
        for check in &self.health_checks {
            out.push(check.check_health().await);
        }
        out
    }

    /// 启动后台任务 / Start background tasks
    ///
    /// 返回时路由订阅已生效 / The route subscription is active on return
    pub async fn start(self: &Arc<Self>) -> AppResult<NodeHandle> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        let subscriber = self.router.start_subscriber(shutdown_rx.clone()).await?;
        tasks.push(("route-subscriber", subscriber));

        if let Some(consumer) = &self.dead_letter {
            tasks.push((
                "dead-letter",
                tokio::spawn(consumer.clone().run(shutdown_rx.clone())),
            ));
        }

        if let Some(archiver) = &self.archiver {
            tasks.push(("archive-schedule", archiver.spawn_schedule(shutdown_rx.clone())?));
        }

        tasks.push((
            "presence-refresh",
            crate::tasks::spawn_refresh_task(
                self.presence.clone(),
                Arc::new(self.sessions.clone()),
                self.refresh_interval,
                shutdown_rx,
            ),
        ));

        info!(
            "🚀 node {} started with {} background tasks",
            self.node_id,
            tasks.len()
        );
        Ok(NodeHandle { shutdown_tx, tasks })
    }
}

/// 后台任务句柄 / Handle over the node's background tasks
pub struct NodeHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl NodeHandle {
    /// 订阅关闭信号 / Subscribe to the shutdown signal
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub fn task_names(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|(name, _)| *name).collect()
    }

    /// 发送关闭信号并等待所有任务退出 / Signal shutdown and join every task
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        for (name, task) in self.tasks {
            if let Err(e) = task.await {
                warn!("task {} ended abnormally: {}", name, e);
            }
        }
        info!("👋 node stopped");
    }
}
