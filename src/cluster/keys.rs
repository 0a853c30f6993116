/// 代理 key 命名 / Broker key naming
///
/// 所有 key 共享可选前缀 `broker.key_prefix`
/// Every key shares the optional `broker.key_prefix`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keyspace {
    prefix: String,
}

impl Keyspace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// 用户位置 / User location: `location:<uid>`
    pub fn location(&self, uid: i64) -> String {
        format!("{}location:{}", self.prefix, uid)
    }

    /// 节点路由频道 / Per-node route channel: `route:to:<node>`
    pub fn route_channel(&self, node_id: &str) -> String {
        format!("{}route:to:{}", self.prefix, node_id)
    }

    pub fn dead_letter_stream(&self) -> String {
        format!("{}message:dlq", self.prefix)
    }

    pub fn dead_letter_group(&self) -> String {
        format!("{}dlq_group", self.prefix)
    }

    pub fn archive_lock(&self) -> String {
        format!("{}archive:lock", self.prefix)
    }
}
