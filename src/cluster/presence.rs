use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::broker::{BrokerResult, KvStore};
use crate::cluster::keys::Keyspace;

/// 在线位置记录 / Presence entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresenceEntry {
    pub user_id: i64,
    pub node_id: String,
    pub expires_at: DateTime<Utc>,
}

/// 用户位置注册表：uid -> 持有其连接的节点
/// Presence registry: uid -> node holding the user's socket
///
/// 同一用户最多一条有效记录，后写者胜出
/// At most one live entry per user; last writer wins
pub struct PresenceRegistry {
    kv: Arc<dyn KvStore>,
    keys: Keyspace,
    node_id: String,
    ttl: Duration,
}

impl PresenceRegistry {
    pub fn new(kv: Arc<dyn KvStore>, keys: Keyspace, node_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            kv,
            keys,
            node_id: node_id.into(),
            ttl,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// 写入或刷新位置 / Upsert a user's location with the registry TTL
    pub async fn register(&self, user_id: i64, node_id: &str) -> BrokerResult<PresenceEntry> {
        self.kv
            .set_with_ttl(&self.keys.location(user_id), node_id, self.ttl)
            .await?;
        let expires_at = Utc::now()
            + chrono::Duration::from_std(self.ttl).unwrap_or_else(|_| chrono::Duration::zero());
        tracing::debug!("presence registered uid={} node={}", user_id, node_id);
        Ok(PresenceEntry {
            user_id,
            node_id: node_id.to_string(),
            expires_at,
        })
    }

    /// 注册到本节点 / Register on this node
    pub async fn register_local(&self, user_id: i64) -> BrokerResult<PresenceEntry> {
        let node_id = self.node_id.clone();
        self.register(user_id, &node_id).await
    }

    /// 删除位置（幂等）/ Remove a location, idempotent
    pub async fn remove(&self, user_id: i64) -> BrokerResult<()> {
        let existed = self.kv.delete(&self.keys.location(user_id)).await?;
        tracing::debug!("presence removed uid={} existed={}", user_id, existed);
        Ok(())
    }

    /// 仅当记录仍指向本节点时删除
    /// Remove only while the entry still points at this node
    ///
    /// 迟到的断开事件不会抹掉用户在其它节点上的新注册
    /// A late disconnect cannot erase a newer registration on another node
    pub async fn release(&self, user_id: i64) -> BrokerResult<bool> {
        let released = self
            .kv
            .delete_if_eq(&self.keys.location(user_id), &self.node_id)
            .await?;
        if !released {
            tracing::debug!(
                "presence for uid={} no longer owned by {}, left untouched",
                user_id,
                self.node_id
            );
        }
        Ok(released)
    }

    /// 查询用户所在节点 / Resolve the node currently holding the user
    pub async fn resolve_node(&self, user_id: i64) -> BrokerResult<Option<String>> {
        self.kv.get(&self.keys.location(user_id)).await
    }

    pub fn is_local(&self, node_id: &str) -> bool {
        self.node_id == node_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;

    fn registry(broker: &Arc<MemoryBroker>, node: &str) -> PresenceRegistry {
        PresenceRegistry::new(broker.clone(), Keyspace::default(), node, Duration::from_secs(90))
    }

    #[tokio::test]
    async fn test_resolve_reflects_last_call() {
        let broker = Arc::new(MemoryBroker::new());
        let reg = registry(&broker, "node-a");

        assert_eq!(reg.resolve_node(1).await.unwrap(), None);
        reg.register(1, "node-a").await.unwrap();
        assert_eq!(reg.resolve_node(1).await.unwrap().as_deref(), Some("node-a"));
        reg.register(1, "node-b").await.unwrap();
        assert_eq!(reg.resolve_node(1).await.unwrap().as_deref(), Some("node-b"));
        reg.remove(1).await.unwrap();
        assert_eq!(reg.resolve_node(1).await.unwrap(), None);
        // 重复删除无副作用 / Removing twice is harmless
        reg.remove(1).await.unwrap();
        reg.register_local(1).await.unwrap();
        assert_eq!(reg.resolve_node(1).await.unwrap().as_deref(), Some("node-a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_without_refresh() {
        let broker = Arc::new(MemoryBroker::new());
        let reg = registry(&broker, "node-a");
        let entry = reg.register_local(9).await.unwrap();
        assert_eq!(entry.node_id, "node-a");
        assert!(entry.expires_at > Utc::now());

        tokio::time::advance(Duration::from_secs(89)).await;
        assert!(reg.resolve_node(9).await.unwrap().is_some());
        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(reg.resolve_node(9).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_release_keeps_other_nodes_entry() {
        let broker = Arc::new(MemoryBroker::new());
        let a = registry(&broker, "node-a");
        let b = registry(&broker, "node-b");

        a.register_local(5).await.unwrap();
        b.register_local(5).await.unwrap();
        assert!(!a.release(5).await.unwrap());
        assert_eq!(a.resolve_node(5).await.unwrap().as_deref(), Some("node-b"));
        assert!(b.release(5).await.unwrap());
        assert_eq!(a.resolve_node(5).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_is_local() {
        let broker = Arc::new(MemoryBroker::new());
        let reg = registry(&broker, "node-a");
        assert!(reg.is_local("node-a"));
        assert!(!reg.is_local("node-b"));
    }
}
