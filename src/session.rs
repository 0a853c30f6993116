use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// 推送给客户端的基础响应 / Base frame pushed to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WsBaseResp {
    #[serde(rename = "type")]
    pub kind: i32,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl WsBaseResp {
    pub fn new(kind: i32, data: serde_json::Value) -> Self {
        Self { kind, data }
    }
}

/// 本地投递接口：由 WebSocket 会话层实现
/// Local delivery seam, implemented by the WebSocket session layer
#[async_trait]
pub trait LocalDelivery: Send + Sync {
    /// 推送到本节点上该用户的连接 / Push to the user's socket on this node
    async fn send_to_local_uid(&self, resp: &WsBaseResp, uid: i64) -> Result<()>;

    /// 本节点当前在线的用户 / Users currently connected to this node
    fn local_uids(&self) -> Vec<i64>;
}

pub type SessionSender = mpsc::UnboundedSender<WsBaseResp>;

struct Session {
    sender: SessionSender,
    connected_at: chrono::DateTime<chrono::Utc>,
}

/// 进程内会话表：uid -> 发送通道 / In-process session table: uid -> outbound channel
#[derive(Clone, Default)]
pub struct SessionTable {
    sessions: Arc<DashMap<i64, Session>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// 绑定会话，同一用户的旧连接被替换 / Attach a session, replacing an older one
    pub fn attach(&self, uid: i64, sender: SessionSender) {
        let replaced = self
            .sessions
            .insert(
                uid,
                Session {
                    sender,
                    connected_at: chrono::Utc::now(),
                },
            )
            .is_some();
        debug!("session attached uid={} replaced={}", uid, replaced);
    }

    pub fn detach(&self, uid: i64) -> bool {
        self.sessions.remove(&uid).is_some()
    }

    pub fn contains(&self, uid: i64) -> bool {
        self.sessions.contains_key(&uid)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn connected_at(&self, uid: i64) -> Option<chrono::DateTime<chrono::Utc>> {
        self.sessions.get(&uid).map(|s| s.connected_at)
    }
}

#[async_trait]
impl LocalDelivery for SessionTable {
    async fn send_to_local_uid(&self, resp: &WsBaseResp, uid: i64) -> Result<()> {
        let closed = match self.sessions.get(&uid) {
            Some(session) => session.sender.send(resp.clone()).is_err(),
            None => return Err(anyhow!("uid {} has no session on this node", uid)),
        };
        if closed {
            // 接收端已关闭，清理失效会话 / Receiver gone, drop the stale session
            self.sessions.remove(&uid);
            warn!("session for uid={} closed before delivery", uid);
            return Err(anyhow!("session for uid {} is closed", uid));
        }
        debug!("delivered type={} to uid={}", resp.kind, uid);
        Ok(())
    }

    fn local_uids(&self) -> Vec<i64> {
        self.sessions.iter().map(|e| *e.key()).collect()
    }
}
