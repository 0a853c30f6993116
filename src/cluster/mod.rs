pub mod keys; // key 命名 / Key naming
pub mod presence; // 用户位置注册表 / Presence registry
pub mod router; // 跨节点路由 / Cross-node routing

pub use keys::Keyspace;
pub use presence::{PresenceEntry, PresenceRegistry};
pub use router::{MessageRouter, RouteEnvelope, RouteError, RouteOutcome, RouterStats};
