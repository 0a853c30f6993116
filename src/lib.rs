// v-im-cluster：聊天节点的跨节点投递、在线状态、死信处理与消息归档
// v-im-cluster: cross-node delivery, presence, dead-letter handling and
// message archival for chat nodes

pub mod api; // HTTP 健康检查 / HTTP health endpoints
pub mod broker; // 消息代理能力 / Broker capabilities
pub mod cluster; // 在线状态与路由 / Presence and routing
pub mod config; // 节点配置 / Node settings
pub mod error; // 错误类型 / Error types
pub mod node; // 节点组装与生命周期 / Node wiring and lifecycle
pub mod session; // 本地会话 / Local sessions
pub mod storage; // 消息存储 / Message storage
pub mod stream; // 死信流 / Dead-letter stream
pub mod tasks; // 后台任务 / Background tasks

pub use crate::broker::{BrokerHandles, MemoryBroker, RedisBroker};
pub use crate::cluster::{Keyspace, MessageRouter, PresenceRegistry, RouteEnvelope, RouteOutcome};
pub use crate::config::NodeSettings;
pub use crate::error::{AppError, AppResult};
pub use crate::node::{ChatNode, NodeHandle};
pub use crate::session::{LocalDelivery, SessionTable, WsBaseResp};
pub use crate::stream::{AlertSink, DeadLetterConsumer, StreamRecord};
pub use crate::tasks::{ArchiveReport, MessageArchiver};
