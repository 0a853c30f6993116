use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::broker::{BrokerResult, PubSub};
use crate::cluster::keys::Keyspace;
use crate::cluster::presence::PresenceRegistry;
use crate::session::{LocalDelivery, WsBaseResp};

/// 跨节点路由信封 / Cross-node route envelope
///
/// 线上格式 / Wire format: `{"targetUid": <i64>, "messageJson": "<WsBaseResp json>"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteEnvelope {
    #[serde(default)]
    pub target_uid: Option<i64>,
    #[serde(default)]
    pub message_json: Option<String>,
}

impl RouteEnvelope {
    pub fn new(target_uid: i64, resp: &WsBaseResp) -> serde_json::Result<Self> {
        Ok(Self {
            target_uid: Some(target_uid),
            message_json: Some(serde_json::to_string(resp)?),
        })
    }
}

#[derive(Debug, Error)]
pub enum RouteError {
    #[error("信封格式错误 / malformed envelope: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("信封缺少 targetUid / envelope has no targetUid")]
    MissingTarget,
    #[error("信封缺少 messageJson / envelope has no messageJson")]
    MissingPayload,
    #[error("消息体格式错误 / malformed inner payload: {0}")]
    BadPayload(#[source] serde_json::Error),
    #[error("本地投递失败 / local delivery failed: {0}")]
    Delivery(#[source] anyhow::Error),
}

/// 路由结果 / Outcome of a routing attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// 本节点直接投递 / Delivered on this node
    Local,
    /// 已发布到目标节点频道 / Published on the target node's channel
    Forwarded { node_id: String, receivers: usize },
    /// 用户不在线 / No presence entry
    Offline,
    /// 出错，已记录日志 / Failed; already logged
    Failed,
}

#[derive(Debug, Default)]
struct Counters {
    local: AtomicU64,
    forwarded: AtomicU64,
    offline: AtomicU64,
    failed: AtomicU64,
    received: AtomicU64,
    dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RouterStats {
    pub local: u64,
    pub forwarded: u64,
    pub offline: u64,
    pub failed: u64,
    pub received: u64,
    pub dropped: u64,
}

/// 跨节点消息路由器 / Cross-node message router
///
/// 尽力而为：目标节点订阅者离线期间发布的消息直接丢失
/// Best effort: messages published while the target subscriber is down are lost
pub struct MessageRouter {
    presence: Arc<PresenceRegistry>,
    pubsub: Arc<dyn PubSub>,
    delivery: Arc<dyn LocalDelivery>,
    keys: Keyspace,
    counters: Counters,
}

impl MessageRouter {
    pub fn new(
        presence: Arc<PresenceRegistry>,
        pubsub: Arc<dyn PubSub>,
        delivery: Arc<dyn LocalDelivery>,
        keys: Keyspace,
    ) -> Self {
        Self {
            presence,
            pubsub,
            delivery,
            keys,
            counters: Counters::default(),
        }
    }

    pub fn node_id(&self) -> &str {
        self.presence.node_id()
    }

    pub fn stats(&self) -> RouterStats {
        let c = &self.counters;
        RouterStats {
            local: c.local.load(Ordering::Relaxed),
            forwarded: c.forwarded.load(Ordering::Relaxed),
            offline: c.offline.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            received: c.received.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
        }
    }

    fn bump(&self, outcome: RouteOutcome) -> RouteOutcome {
        let counter = match &outcome {
            RouteOutcome::Local => &self.counters.local,
            RouteOutcome::Forwarded { .. } => &self.counters.forwarded,
            RouteOutcome::Offline => &self.counters.offline,
            RouteOutcome::Failed => &self.counters.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        outcome
    }

    /// 将消息送达目标用户所在节点；错误只记录不上抛
    /// Deliver to the node holding the user; errors are logged, never raised
    pub async fn route(&self, target_uid: i64, resp: &WsBaseResp) -> RouteOutcome {
        let node_id = match self.presence.resolve_node(target_uid).await {
            Ok(Some(node_id)) => node_id,
            Ok(None) => {
                tracing::debug!("uid={} offline, nothing to route", target_uid);
                return self.bump(RouteOutcome::Offline);
            }
            Err(e) => {
                tracing::error!("presence lookup for uid={} failed: {}", target_uid, e);
                return self.bump(RouteOutcome::Failed);
            }
        };

        if self.presence.is_local(&node_id) {
            return match self.delivery.send_to_local_uid(resp, target_uid).await {
                Ok(()) => self.bump(RouteOutcome::Local),
                Err(e) => {
                    tracing::warn!("local delivery to uid={} failed: {}", target_uid, e);
                    self.bump(RouteOutcome::Failed)
                }
            };
        }

        let body = match RouteEnvelope::new(target_uid, resp).and_then(|env| serde_json::to_string(&env)) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!("encode route envelope for uid={} failed: {}", target_uid, e);
                return self.bump(RouteOutcome::Failed);
            }
        };
        let channel = self.keys.route_channel(&node_id);
        match self.pubsub.publish(&channel, &body).await {
            Ok(receivers) => {
                if receivers == 0 {
                    tracing::warn!(
                        "no subscriber on {} for uid={}, message dropped",
                        channel,
                        target_uid
                    );
                } else {
                    tracing::debug!("forwarded uid={} to node {}", target_uid, node_id);
                }
                self.bump(RouteOutcome::Forwarded { node_id, receivers })
            }
            Err(e) => {
                tracing::error!("publish to {} failed: {}", channel, e);
                self.bump(RouteOutcome::Failed)
            }
        }
    }

    /// 异步投递，不阻塞调用方 / Fire-and-forget routing on the runtime
    pub fn dispatch(self: &Arc<Self>, target_uid: i64, resp: WsBaseResp) -> JoinHandle<RouteOutcome> {
        let router = Arc::clone(self);
        tokio::spawn(async move { router.route(target_uid, &resp).await })
    }

    /// 处理从本节点频道收到的信封 / Handle an envelope received on this node's channel
    pub async fn handle_envelope(&self, body: &str) -> Result<(), RouteError> {
        self.counters.received.fetch_add(1, Ordering::Relaxed);
        let envelope: RouteEnvelope = serde_json::from_str(body).map_err(RouteError::Malformed)?;
        let target_uid = envelope.target_uid.ok_or(RouteError::MissingTarget)?;
        let message_json = envelope
            .message_json
            .filter(|s| !s.trim().is_empty())
            .ok_or(RouteError::MissingPayload)?;
        let resp: WsBaseResp =
            serde_json::from_str(&message_json).map_err(RouteError::BadPayload)?;
        self.delivery
            .send_to_local_uid(&resp, target_uid)
            .await
            .map_err(RouteError::Delivery)
    }

    /// 订阅本节点频道；返回时订阅已生效
    /// Subscribe to this node's channel; the subscription is active on return
    pub async fn start_subscriber(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> BrokerResult<JoinHandle<()>> {
        let channel = self.keys.route_channel(self.node_id());
        let subscription = self.pubsub.subscribe(&channel).await?;
        tracing::info!("route subscriber listening on {}", channel);

        let router = Arc::clone(self);
        Ok(tokio::spawn(async move {
            let mut subscription = Some(subscription);
            let mut backoff = Duration::from_millis(500);
            loop {
                if subscription.is_none() {
                    // 订阅断开后重新订阅 / Resubscribe after the stream ended
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.changed() => break,
                    }
                    match router.pubsub.subscribe(&channel).await {
                        Ok(sub) => {
                            tracing::info!("route subscriber re-attached on {}", channel);
                            subscription = Some(sub);
                            backoff = Duration::from_millis(500);
                        }
                        Err(e) => {
                            tracing::error!("resubscribe to {} failed: {}", channel, e);
                            backoff = (backoff * 2).min(Duration::from_secs(30));
                        }
                    }
                    continue;
                }
                let Some(sub) = subscription.as_mut() else {
                    continue;
                };
                let ended = tokio::select! {
                    msg = sub.next() => match msg {
                        Some(msg) => {
                            router.on_channel_message(&msg.payload).await;
                            false
                        }
                        None => true,
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        false
                    }
                };
                if ended {
                    tracing::warn!("route subscription on {} ended", channel);
                    subscription = None;
                }
            }
            tracing::info!("route subscriber on {} stopped", channel);
        }))
    }

    async fn on_channel_message(&self, payload: &str) {
        if let Err(e) = self.handle_envelope(payload).await {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::error!("dropping routed message: {}", e);
        }
    }
}
