use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::cluster::PresenceRegistry;
use crate::session::LocalDelivery;

/// 定期续期本节点在线用户的位置记录
/// Periodically refresh presence for every user connected to this node
pub fn spawn_refresh_task(
    presence: Arc<PresenceRegistry>,
    delivery: Arc<dyn LocalDelivery>,
    every: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(
            "⏰ Presence refresh every {:?} (ttl {:?})",
            every,
            presence.ttl()
        );
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // 首次 tick 立即返回，连接时已注册过 / First tick is immediate; connect already registered
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    refresh_once(&presence, delivery.as_ref()).await;
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() { break; }
                }
            }
        }
    })
}

/// 续期一轮，返回成功数量 / One refresh round; returns how many succeeded
pub async fn refresh_once(presence: &PresenceRegistry, delivery: &dyn LocalDelivery) -> usize {
    let mut refreshed = 0;
    for uid in delivery.local_uids() {
        match presence.register_local(uid).await {
            Ok(_) => refreshed += 1,
            Err(e) => tracing::warn!("presence refresh for uid={} failed: {}", uid, e),
        }
    }
    tracing::debug!("presence refreshed for {} users", refreshed);
    refreshed
}
