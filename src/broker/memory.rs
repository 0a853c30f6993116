//! 单进程内存代理 / Single-process in-memory broker
//!
//! 与 Redis 后端遵守相同约定：TTL 基于 tokio 时钟，Pub/Sub 至多一次，
//! 消费组带待确认列表。用于测试以及 `broker.kind = "memory"` 的单节点运行。
//! Honours the same contracts as the Redis backend: TTLs on tokio's clock,
//! at-most-once pub/sub, consumer groups with pending lists.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use v::{HealthCheck, HealthStatus};

use super::{
    AckStream, BrokerError, BrokerResult, ChannelMessage, KvStore, PubSub, ReadCursor,
    StreamEntry, Subscription,
};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone)]
struct KvValue {
    value: String,
    expires_at: Option<Instant>,
}

impl KvValue {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

#[derive(Debug, Clone)]
struct MemEntry {
    seq: u64,
    id: String,
    fields: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct ConsumerGroup {
    last_delivered: u64,
    /// seq -> 持有者 / seq -> owning consumer
    pending: BTreeMap<u64, String>,
}

#[derive(Debug, Default)]
struct MemStream {
    /// 按 seq 递增 / Ascending by seq
    entries: VecDeque<MemEntry>,
    groups: HashMap<String, ConsumerGroup>,
}

impl MemStream {
    /// 丢弃所有消费组都已投递并确认的记录；没有消费组时全部保留
    /// Drop entries every group has delivered and acknowledged; keep all while no group exists
    fn trim_acknowledged(&mut self) {
        let Some(watermark) = self
            .groups
            .values()
            .map(|g| match g.pending.keys().next() {
                Some(first) => g.last_delivered.min(first - 1),
                None => g.last_delivered,
            })
            .min()
        else {
            return;
        };
        while self.entries.front().is_some_and(|e| e.seq <= watermark) {
            self.entries.pop_front();
        }
    }
}

#[derive(Default)]
pub struct MemoryBroker {
    kv: DashMap<String, KvValue>,
    channels: DashMap<String, broadcast::Sender<String>>,
    streams: Mutex<HashMap<String, MemStream>>,
    appended: Notify,
    seq: AtomicU64,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> (u64, String) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let ms = chrono::Utc::now().timestamp_millis();
        (seq, format!("{}-{}", ms, seq))
    }

    /// 当前频道订阅者数量 / Active subscriber count on a channel
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.channels
            .get(channel)
            .map(|s| s.receiver_count())
            .unwrap_or(0)
    }

    /// 流中记录数 / Number of entries in a stream
    pub fn stream_len(&self, stream: &str) -> usize {
        self.streams
            .lock()
            .get(stream)
            .map(|s| s.entries.len())
            .unwrap_or(0)
    }

    fn collect(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
    ) -> BrokerResult<Vec<StreamEntry>> {
        let mut streams = self.streams.lock();
        let no_group = || BrokerError::NoGroup {
            stream: stream.to_string(),
            group: group.to_string(),
        };
        let s = streams.get_mut(stream).ok_or_else(no_group)?;
        let MemStream { entries, groups } = s;
        let g = groups.get_mut(group).ok_or_else(no_group)?;

        let picked: Vec<&MemEntry> = match cursor {
            ReadCursor::New => {
                let start = entries.partition_point(|e| e.seq <= g.last_delivered);
                entries.range(start..).take(count).collect()
            }
            ReadCursor::Pending => entries
                .iter()
                .filter(|e| g.pending.get(&e.seq).map(String::as_str) == Some(consumer))
                .take(count)
                .collect(),
        };

        let mut out = Vec::with_capacity(picked.len());
        for e in picked {
            if cursor == ReadCursor::New {
                g.last_delivered = e.seq;
                g.pending.insert(e.seq, consumer.to_string());
            }
            out.push(StreamEntry {
                id: e.id.clone(),
                fields: e.fields.clone(),
            });
        }
        Ok(out)
    }
}

fn seq_of(id: &str) -> Option<u64> {
    id.rsplit('-').next().and_then(|s| s.parse().ok())
}

#[async_trait]
impl KvStore for MemoryBroker {
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> BrokerResult<()> {
        self.kv.insert(
            key.to_string(),
            KvValue {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> BrokerResult<Option<String>> {
        let now = Instant::now();
        let removed = self.kv.remove_if(key, |_, v| !v.is_live(now));
        if removed.is_some() {
            return Ok(None);
        }
        Ok(self.kv.get(key).map(|v| v.value.clone()))
    }

    async fn delete(&self, key: &str) -> BrokerResult<bool> {
        let now = Instant::now();
        Ok(self
            .kv
            .remove(key)
            .map(|(_, v)| v.is_live(now))
            .unwrap_or(false))
    }

    async fn set_nx_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> BrokerResult<bool> {
        let now = Instant::now();
        let fresh = KvValue {
            value: value.to_string(),
            expires_at: Some(now + ttl),
        };
        match self.kv.entry(key.to_string()) {
            Entry::Occupied(mut o) => {
                if o.get().is_live(now) {
                    Ok(false)
                } else {
                    o.insert(fresh);
                    Ok(true)
                }
            }
            Entry::Vacant(vac) => {
                vac.insert(fresh);
                Ok(true)
            }
        }
    }

    async fn delete_if_eq(&self, key: &str, expected: &str) -> BrokerResult<bool> {
        let now = Instant::now();
        Ok(self
            .kv
            .remove_if(key, |_, v| v.is_live(now) && v.value == expected)
            .is_some())
    }
}

#[async_trait]
impl PubSub for MemoryBroker {
    async fn publish(&self, channel: &str, payload: &str) -> BrokerResult<usize> {
        match self.channels.get(channel) {
            // 无订阅者时 send 返回 Err，消息丢弃 / send errs with no receivers; message dropped
            Some(sender) => Ok(sender.send(payload.to_string()).unwrap_or(0)),
            None => Ok(0),
        }
    }

    async fn subscribe(&self, channel: &str) -> BrokerResult<Subscription> {
        let rx = self
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe();
        let name = channel.to_string();
        let stream = futures_util::stream::unfold((rx, name), |(mut rx, name)| async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => {
                        let msg = ChannelMessage {
                            channel: name.clone(),
                            payload,
                        };
                        return Some((msg, (rx, name)));
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("subscriber on {} lagged, {} messages dropped", name, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(stream))
    }
}

#[async_trait]
impl AckStream for MemoryBroker {
    async fn append(&self, stream: &str, fields: &[(String, String)]) -> BrokerResult<String> {
        // 持锁分配 seq，保证记录有序 / Assign seq under the lock so entries stay ordered
        let mut streams = self.streams.lock();
        let (seq, id) = self.next_id();
        streams
            .entry(stream.to_string())
            .or_default()
            .entries
            .push_back(MemEntry {
                seq,
                id: id.clone(),
                fields: fields.iter().cloned().collect(),
            });
        drop(streams);
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn create_group(&self, stream: &str, group: &str) -> BrokerResult<()> {
        let mut streams = self.streams.lock();
        let s = streams.entry(stream.to_string()).or_default();
        if s.groups.contains_key(group) {
            return Err(BrokerError::GroupExists {
                group: group.to_string(),
            });
        }
        s.groups.insert(group.to_string(), ConsumerGroup::default());
        Ok(())
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
        let deadline = block.map(|d| Instant::now() + d);
        loop {
            // 先登记等待再检查，避免漏掉通知 / Register before checking so no wakeup is missed
            let appended = self.appended.notified();
            let batch = self.collect(stream, group, consumer, cursor, count.max(1))?;
            if !batch.is_empty() || cursor == ReadCursor::Pending {
                return Ok(batch);
            }
            match deadline {
                Some(at) => {
                    if tokio::time::timeout_at(at, appended).await.is_err() {
                        return Ok(Vec::new());
                    }
                }
                None => return Ok(Vec::new()),
            }
        }
    }

    async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> BrokerResult<usize> {
        let mut streams = self.streams.lock();
        let Some(s) = streams.get_mut(stream) else {
            return Ok(0);
        };
        let Some(g) = s.groups.get_mut(group) else {
            return Ok(0);
        };
        let acked = ids
            .iter()
            .filter_map(|id| seq_of(id))
            .filter(|seq| g.pending.remove(seq).is_some())
            .count();
        s.trim_acknowledged();
        Ok(acked)
    }

    async fn pending_count(&self, stream: &str, group: &str) -> BrokerResult<usize> {
        let streams = self.streams.lock();
        streams
            .get(stream)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pending.len())
            .ok_or_else(|| BrokerError::NoGroup {
                stream: stream.to_string(),
                group: group.to_string(),
            })
    }
}

#[async_trait]
impl HealthCheck for MemoryBroker {
    async fn check_health(&self) -> HealthStatus {
        HealthStatus::up("memory_broker")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn fields(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_kv_ttl_expiry() {
        let b = MemoryBroker::new();
        b.set_with_ttl("k", "v", Duration::from_secs(10)).await.unwrap();
        assert_eq!(b.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(b.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_nx_respects_live_and_expired_values() {
        let b = MemoryBroker::new();
        assert!(b.set_nx_with_ttl("lock", "a", Duration::from_secs(5)).await.unwrap());
        assert!(!b.set_nx_with_ttl("lock", "b", Duration::from_secs(5)).await.unwrap());
        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(b.set_nx_with_ttl("lock", "b", Duration::from_secs(5)).await.unwrap());
        assert_eq!(b.get("lock").await.unwrap().as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_delete_if_eq() {
        let b = MemoryBroker::new();
        b.set_with_ttl("k", "node-a", Duration::from_secs(60)).await.unwrap();
        assert!(!b.delete_if_eq("k", "node-b").await.unwrap());
        assert!(b.delete_if_eq("k", "node-a").await.unwrap());
        assert_eq!(b.get("k").await.unwrap(), None);
        assert!(!b.delete("k").await.unwrap());
    }

    #[tokio::test]
    async fn test_publish_without_subscriber_is_dropped() {
        let b = MemoryBroker::new();
        assert_eq!(b.publish("ch", "x").await.unwrap(), 0);
        let mut sub = b.subscribe("ch").await.unwrap();
        assert_eq!(b.publish("ch", "y").await.unwrap(), 1);
        let msg = sub.next().await.unwrap();
        assert_eq!(msg.channel, "ch");
        assert_eq!(msg.payload, "y");
        drop(sub);
        assert_eq!(b.publish("ch", "z").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_group_reads_and_acks() {
        let b = MemoryBroker::new();
        b.append("s", &fields(&[("tempId", "t1")])).await.unwrap();
        b.create_group("s", "g").await.unwrap();
        assert!(matches!(
            b.create_group("s", "g").await,
            Err(BrokerError::GroupExists { .. })
        ));

        // 从 0 创建的组可以看到先前写入的记录 / Group created from 0 sees earlier records
        let first = b
            .read_group("s", "g", "c1", ReadCursor::New, 10, None)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].fields.get("tempId").map(String::as_str), Some("t1"));
        assert_eq!(b.pending_count("s", "g").await.unwrap(), 1);

        let pending = b
            .read_group("s", "g", "c1", ReadCursor::Pending, 10, None)
            .await
            .unwrap();
        assert_eq!(pending, first);
        let other = b
            .read_group("s", "g", "c2", ReadCursor::Pending, 10, None)
            .await
            .unwrap();
        assert!(other.is_empty());

        assert_eq!(b.ack("s", "g", &[first[0].id.clone()]).await.unwrap(), 1);
        assert_eq!(b.ack("s", "g", &[first[0].id.clone()]).await.unwrap(), 0);
        assert_eq!(b.pending_count("s", "g").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_blocking_read_wakes_on_append() {
        let b = std::sync::Arc::new(MemoryBroker::new());
        b.create_group("s", "g").await.unwrap();
        let reader = {
            let b = b.clone();
            tokio::spawn(async move {
                b.read_group("s", "g", "c", ReadCursor::New, 10, Some(Duration::from_secs(5)))
                    .await
            })
        };
        tokio::task::yield_now().await;
        b.append("s", &fields(&[("content", "hi")])).await.unwrap();
        let got = reader.await.unwrap().unwrap();
        assert_eq!(got.len(), 1);
    }

    #[tokio::test]
    async fn test_read_missing_group_fails() {
        let b = MemoryBroker::new();
        assert!(matches!(
            b.read_group("s", "g", "c", ReadCursor::New, 1, None).await,
            Err(BrokerError::NoGroup { .. })
        ));
    }

    #[tokio::test]
    async fn test_acknowledged_entries_are_trimmed() {
        let b = MemoryBroker::new();
        for n in ["0", "1", "2"] {
            b.append("s", &fields(&[("n", n)])).await.unwrap();
        }
        b.create_group("s", "g").await.unwrap();
        let got = b
            .read_group("s", "g", "c", ReadCursor::New, 10, None)
            .await
            .unwrap();
        assert_eq!(got.len(), 3);
        assert_eq!(b.stream_len("s"), 3);

        // 最后一条仍待确认 / The last entry is still pending
        b.ack("s", "g", &[got[0].id.clone(), got[1].id.clone()]).await.unwrap();
        assert_eq!(b.stream_len("s"), 1);
        b.ack("s", "g", &[got[2].id.clone()]).await.unwrap();
        assert_eq!(b.stream_len("s"), 0);

        // 新记录照常投递 / Later appends are still delivered
        b.append("s", &fields(&[("n", "3")])).await.unwrap();
        let next = b
            .read_group("s", "g", "c", ReadCursor::New, 10, None)
            .await
            .unwrap();
        assert_eq!(next.len(), 1);
    }

    #[tokio::test]
    async fn test_entries_kept_until_every_group_acks() {
        let b = MemoryBroker::new();
        b.append("s", &fields(&[("n", "0")])).await.unwrap();
        b.create_group("s", "g1").await.unwrap();
        b.create_group("s", "g2").await.unwrap();
        let got = b
            .read_group("s", "g1", "c", ReadCursor::New, 10, None)
            .await
            .unwrap();
        b.ack("s", "g1", &[got[0].id.clone()]).await.unwrap();
        assert_eq!(b.stream_len("s"), 1);

        let got = b
            .read_group("s", "g2", "c", ReadCursor::New, 10, None)
            .await
            .unwrap();
        b.ack("s", "g2", &[got[0].id.clone()]).await.unwrap();
        assert_eq!(b.stream_len("s"), 0);
    }
}
