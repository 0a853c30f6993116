//! 消息代理能力抽象 / Broker capability traits
//!
//! 三种能力各自独立：带 TTL 的 KV、即发即弃的 Pub/Sub、带确认的消费组流。
//! Three independent capabilities: TTL key-value, fire-and-forget pub/sub and
//! an acknowledged consumer-group stream.

pub mod memory;
pub mod redis;

use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::Stream;
use thiserror::Error;
use v::HealthCheck;

pub use self::memory::MemoryBroker;
pub use self::redis::RedisBroker;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Redis 错误 / redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
    #[error("消费组已存在 / consumer group already exists: {group}")]
    GroupExists { group: String },
    #[error("消费组不存在 / no such consumer group: {group} on {stream}")]
    NoGroup { stream: String, group: String },
    #[error("非法响应 / malformed reply: {0}")]
    Protocol(String),
}

pub type BrokerResult<T> = Result<T, BrokerError>;

/// Pub/Sub 频道消息 / Message received on a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub channel: String,
    pub payload: String,
}

/// 订阅流：`subscribe` 返回时即已生效 / Subscription stream, active once returned
pub type Subscription = Pin<Box<dyn Stream<Item = ChannelMessage> + Send>>;

/// 消费组读取位置 / Consumer-group read position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCursor {
    /// 尚未投递给任何消费者的新记录 (`>`) / Never-delivered records
    New,
    /// 已投递给本消费者但未确认的记录 (`0`) / Delivered to this consumer, not yet acked
    Pending,
}

impl ReadCursor {
    pub fn as_id(&self) -> &'static str {
        match self {
            ReadCursor::New => ">",
            ReadCursor::Pending => "0",
        }
    }
}

/// 流记录 / Stream entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    pub fields: BTreeMap<String, String>,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> BrokerResult<()>;
    async fn get(&self, key: &str) -> BrokerResult<Option<String>>;
    /// 删除 key，返回是否存在 / Delete a key, returning whether it existed
    async fn delete(&self, key: &str) -> BrokerResult<bool>;
    /// 仅当 key 不存在时写入 / Write only when the key is absent
    async fn set_nx_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> BrokerResult<bool>;
    /// 仅当值等于 `expected` 时删除 / Delete only when the value equals `expected`
    async fn delete_if_eq(&self, key: &str, expected: &str) -> BrokerResult<bool>;
}

#[async_trait]
pub trait PubSub: Send + Sync {
    /// 发布消息，返回收到消息的订阅者数量 / Publish, returning the receiver count
    async fn publish(&self, channel: &str, payload: &str) -> BrokerResult<usize>;
    async fn subscribe(&self, channel: &str) -> BrokerResult<Subscription>;
}

#[async_trait]
pub trait AckStream: Send + Sync {
    async fn append(&self, stream: &str, fields: &[(String, String)]) -> BrokerResult<String>;
    /// 创建消费组（流不存在时一并创建，从头开始）
    /// Create a group, creating the stream if needed, starting from the beginning
    async fn create_group(&self, stream: &str, group: &str) -> BrokerResult<()>;
    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Option<Duration>,
    ) -> BrokerResult<Vec<StreamEntry>>;
    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> BrokerResult<usize>;
    async fn pending_count(&self, stream: &str, group: &str) -> BrokerResult<usize>;
}

/// 同一代理实例的各能力句柄 / Capability handles onto one broker instance
#[derive(Clone)]
pub struct BrokerHandles {
    pub kv: Arc<dyn KvStore>,
    pub pubsub: Arc<dyn PubSub>,
    pub stream: Arc<dyn AckStream>,
    pub health: Arc<dyn HealthCheck>,
}

impl BrokerHandles {
    pub fn from_shared<B>(broker: Arc<B>) -> Self
    where
        B: KvStore + PubSub + AckStream + HealthCheck + 'static,
    {
        Self {
            kv: broker.clone(),
            pubsub: broker.clone(),
            stream: broker.clone(),
            health: broker,
        }
    }
}
