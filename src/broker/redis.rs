//! Redis 后端 / Redis backend
//!
//! 普通命令走 `ConnectionManager`（自动重连）；阻塞的流读取使用独立连接，
//! 避免阻塞其它命令；每个订阅使用独立的 Pub/Sub 连接。
//! Regular commands use a `ConnectionManager`; blocking stream reads use a
//! dedicated connection; every subscription gets its own pub/sub connection.

use std::collections::BTreeMap;
use std::time::Duration;

use ::redis::aio::{ConnectionManager, MultiplexedConnection};
use ::redis::streams::{StreamPendingReply, StreamReadReply};
use ::redis::{Client, RedisError, Script};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::Mutex;
use v::{HealthCheck, HealthStatus};

use super::{
    AckStream, BrokerError, BrokerResult, ChannelMessage, KvStore, PubSub, ReadCursor,
    StreamEntry, Subscription,
};

const COMPARE_AND_DELETE: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

pub struct RedisBroker {
    client: Client,
    conn: ConnectionManager,
    blocking: Mutex<Option<MultiplexedConnection>>,
}

fn ttl_millis(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

fn map_group_error(e: RedisError, stream: &str, group: &str) -> BrokerError {
    match e.code() {
        Some("BUSYGROUP") => BrokerError::GroupExists {
            group: group.to_string(),
        },
        Some("NOGROUP") => BrokerError::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        },
        _ => BrokerError::Redis(e),
    }
}

impl RedisBroker {
    pub async fn connect(url: &str) -> BrokerResult<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        tracing::info!("redis broker connected: {}", redact(url));
        Ok(Self {
            client,
            conn,
            blocking: Mutex::new(None),
        })
    }

    async fn blocking_conn(&self) -> BrokerResult<MultiplexedConnection> {
        let mut guard = self.blocking.lock().await;
        if let Some(conn) = guard.as_ref() {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        *guard = Some(conn.clone());
        Ok(conn)
    }

    async fn reset_blocking_conn(&self) {
        *self.blocking.lock().await = None;
    }
}

/// 日志中隐藏密码 / Hide credentials in logs
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            format!("{}://***@{}", &url[..scheme], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}

fn into_entries(reply: Option<StreamReadReply>) -> Vec<StreamEntry> {
    let Some(reply) = reply else {
        return Vec::new();
    };
    reply
        .keys
        .into_iter()
        .flat_map(|key| key.ids)
        .map(|sid| {
            let fields: BTreeMap<String, String> = sid
                .map
                .iter()
                .filter_map(|(k, v)| {
                    ::redis::from_redis_value::<String>(v)
                        .ok()
                        .map(|v| (k.clone(), v))
                })
                .collect();
            StreamEntry { id: sid.id, fields }
        })
        .collect()
}

#[async_trait]
impl KvStore for RedisBroker {
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> BrokerResult<()> {
        let mut conn = self.conn.clone();
        let _: () = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> BrokerResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = ::redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> BrokerResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = ::redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn set_nx_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> BrokerResult<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = ::redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> BrokerResult<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = Script::new(COMPARE_AND_DELETE)
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await?;
        Ok(removed > 0)
    }
}

#[async_trait]
impl PubSub for RedisBroker {
    async fn publish(&self, channel: &str, payload: &str) -> BrokerResult<usize> {
        let mut conn = self.conn.clone();
        let receivers: i64 = ::redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(receivers.max(0) as usize)
    }

    async fn subscribe(&self, channel: &str) -> BrokerResult<Subscription> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;
        let stream = pubsub.into_on_message().map(|msg| ChannelMessage {
            channel: msg.get_channel_name().to_string(),
            payload: String::from_utf8_lossy(msg.get_payload_bytes()).into_owned(),
        });
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl AckStream for RedisBroker {
    async fn append(&self, stream: &str, fields: &[(String, String)]) -> BrokerResult<String> {
        let mut conn = self.conn.clone();
        let mut cmd = ::redis::cmd("XADD");
        cmd.arg(stream).arg("*");
        for (k, v) in fields {
            cmd.arg(k).arg(v);
        }
        let id: String = cmd.query_async(&mut conn).await?;
        Ok(id)
    }

    async fn create_group(&self, stream: &str, group: &str) -> BrokerResult<()> {
        let mut conn = self.conn.clone();
        let created: Result<(), RedisError> = ::redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        created.map_err(|e| map_group_error(e, stream, group))
    }

    async fn read_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Option<Duration>,
    ) -> BrokerResult<Vec<StreamEntry>> {
        let mut cmd = ::redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count.max(1));
        let blocking = block.is_some() && cursor == ReadCursor::New;
        if let (true, Some(block)) = (blocking, block) {
            cmd.arg("BLOCK").arg(ttl_millis(block));
        }
        cmd.arg("STREAMS").arg(stream).arg(cursor.as_id());

        let reply: Result<Option<StreamReadReply>, RedisError> = if blocking {
            let mut conn = self.blocking_conn().await?;
            let reply = cmd.query_async(&mut conn).await;
            if matches!(&reply, Err(e) if e.is_io_error() || e.is_connection_dropped()) {
                self.reset_blocking_conn().await;
            }
            reply
        } else {
            let mut conn = self.conn.clone();
            cmd.query_async(&mut conn).await
        };
        reply
            .map(into_entries)
            .map_err(|e| map_group_error(e, stream, group))
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> BrokerResult<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.clone();
        let acked: i64 = ::redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(ids)
            .query_async(&mut conn)
            .await?;
        Ok(acked.max(0) as usize)
    }

    async fn pending_count(&self, stream: &str, group: &str) -> BrokerResult<usize> {
        let mut conn = self.conn.clone();
        let reply: Result<StreamPendingReply, RedisError> = ::redis::cmd("XPENDING")
            .arg(stream)
            .arg(group)
            .query_async(&mut conn)
            .await;
        reply
            .map(|r| r.count())
            .map_err(|e| map_group_error(e, stream, group))
    }
}

#[async_trait]
impl HealthCheck for RedisBroker {
    async fn check_health(&self) -> HealthStatus {
        let mut conn = self.conn.clone();
        let pong: Result<String, RedisError> = ::redis::cmd("PING").query_async(&mut conn).await;
        match pong {
            Ok(_) => HealthStatus::up("redis_broker"),
            Err(e) => HealthStatus::down("redis_broker", format!("redis error: {}", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redact_hides_password() {
        assert_eq!(redact("redis://:secret@10.0.0.1:6379/0"), "redis://***@10.0.0.1:6379/0");
        assert_eq!(redact("redis://127.0.0.1:6379"), "redis://127.0.0.1:6379");
    }

    #[test]
    fn test_ttl_never_rounds_to_zero() {
        assert_eq!(ttl_millis(Duration::from_micros(10)), 1);
        assert_eq!(ttl_millis(Duration::from_secs(90)), 90_000);
    }

    #[test]
    fn test_into_entries_handles_timeout() {
        assert!(into_entries(None).is_empty());
    }
}
