use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;

use crate::broker::{AckStream, BrokerError, BrokerResult, ReadCursor, StreamEntry};
use crate::cluster::Keyspace;
use crate::stream::record::StreamRecord;

/// 告警出口（对接钉钉/飞书等）/ Alert sink for poison messages
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn alert(&self, record: &StreamRecord) -> Result<()>;
}

/// 默认告警：写错误日志 / Default sink: an error log line
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn alert(&self, record: &StreamRecord) -> Result<()> {
        tracing::error!(
            record_id = record.record_id.as_deref().unwrap_or("-"),
            temp_id = record.temp_id.as_deref().unwrap_or("-"),
            room_id = record.room_id.as_deref().unwrap_or("-"),
            from_uid = record.from_uid.as_deref().unwrap_or("-"),
            "[DLQ] 无法处理的死信消息 / unprocessable message: {}",
            record.content.as_deref().unwrap_or("")
        );
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DeadLetterSettings {
    pub stream: String,
    pub group: String,
    pub consumer: String,
    pub batch_size: usize,
    pub block: Duration,
}

impl DeadLetterSettings {
    pub fn new(keys: &Keyspace, consumer_prefix: &str, node_id: &str) -> Self {
        Self {
            stream: keys.dead_letter_stream(),
            group: keys.dead_letter_group(),
            consumer: format!("{}{}", consumer_prefix, node_id),
            batch_size: 10,
            block: Duration::from_secs(2),
        }
    }

    pub fn with_batch(mut self, batch_size: usize, block: Duration) -> Self {
        self.batch_size = batch_size.max(1);
        self.block = block;
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeadLetterStats {
    pub processed: u64,
    pub acknowledged: u64,
    pub alert_failures: u64,
    pub replayed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    acknowledged: AtomicU64,
    alert_failures: AtomicU64,
    replayed: AtomicU64,
}

/// 把记录放入死信流（上游投递链路使用）
/// Quarantine a record on the dead-letter stream, used by the ingestion path
pub async fn quarantine(
    stream: &dyn AckStream,
    keys: &Keyspace,
    record: &StreamRecord,
) -> BrokerResult<String> {
    let id = stream
        .append(&keys.dead_letter_stream(), &record.to_fields())
        .await?;
    tracing::warn!(
        "quarantined tempId={} as {}",
        record.temp_id.as_deref().unwrap_or("-"),
        id
    );
    Ok(id)
}

/// 死信流消费者：告警后无条件确认
/// Dead-letter consumer: alert, then acknowledge unconditionally
pub struct DeadLetterConsumer {
    stream: Arc<dyn AckStream>,
    alerts: Arc<dyn AlertSink>,
    settings: DeadLetterSettings,
    counters: Counters,
    /// 已告警但确认失败的记录 ID / Alerted records whose ack failed
    unacked: Mutex<Vec<String>>,
}

impl DeadLetterConsumer {
    pub fn new(
        stream: Arc<dyn AckStream>,
        alerts: Arc<dyn AlertSink>,
        settings: DeadLetterSettings,
    ) -> Self {
        Self {
            stream,
            alerts,
            settings,
            counters: Counters::default(),
            unacked: Mutex::new(Vec::new()),
        }
    }

    pub fn settings(&self) -> &DeadLetterSettings {
        &self.settings
    }

    pub fn stats(&self) -> DeadLetterStats {
        let c = &self.counters;
        DeadLetterStats {
            processed: c.processed.load(Ordering::Relaxed),
            acknowledged: c.acknowledged.load(Ordering::Relaxed),
            alert_failures: c.alert_failures.load(Ordering::Relaxed),
            replayed: c.replayed.load(Ordering::Relaxed),
        }
    }

    /// 创建消费组；已存在时忽略 / Create the group; an existing group is fine
    pub async fn ensure_group(&self) -> BrokerResult<()> {
        let s = &self.settings;
        match self.stream.create_group(&s.stream, &s.group).await {
            Ok(()) => {
                tracing::info!("[DLQ] created group {} on {}", s.group, s.stream);
                Ok(())
            }
            Err(BrokerError::GroupExists { .. }) => {
                tracing::info!("[DLQ] group {} already exists on {}", s.group, s.stream);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// 处理一条记录，返回告警是否成功 / Handle one record; returns whether the alert succeeded
    pub async fn on_message(&self, record: StreamRecord) -> bool {
        self.process(record).await.0
    }

    /// 返回 (告警成功, 已确认) / Returns (alerted, acknowledged)
    async fn process(&self, record: StreamRecord) -> (bool, bool) {
        self.counters.processed.fetch_add(1, Ordering::Relaxed);

        let alerted = match AssertUnwindSafe(self.alerts.alert(&record))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                tracing::error!(
                    "[DLQ] alert for {:?} failed: {}",
                    record.record_id.as_deref(),
                    e
                );
                false
            }
            Err(_) => {
                tracing::error!("[DLQ] alert for {:?} panicked", record.record_id.as_deref());
                false
            }
        };
        if !alerted {
            self.counters.alert_failures.fetch_add(1, Ordering::Relaxed);
        }

        let Some(id) = record.record_id else {
            return (alerted, false);
        };
        let s = &self.settings;
        let acked = match self.stream.ack(&s.stream, &s.group, &[id.clone()]).await {
            Ok(n) => {
                self.counters
                    .acknowledged
                    .fetch_add(n as u64, Ordering::Relaxed);
                true
            }
            Err(e) => {
                // 记入重试列表，不再重复告警 / Queue for ack retry without alerting again
                tracing::error!("[DLQ] ack {} failed, will retry: {}", id, e);
                self.unacked.lock().push(id);
                false
            }
        };
        (alerted, acked)
    }

    /// 等待重试确认的记录数 / Number of records waiting for an ack retry
    pub fn unacked_len(&self) -> usize {
        self.unacked.lock().len()
    }

    /// 重试此前失败的确认 / Retry acknowledgements that failed earlier
    pub async fn retry_acks(&self) -> BrokerResult<usize> {
        let ids = std::mem::take(&mut *self.unacked.lock());
        if ids.is_empty() {
            return Ok(0);
        }
        let s = &self.settings;
        match self.stream.ack(&s.stream, &s.group, &ids).await {
            Ok(n) => {
                self.counters
                    .acknowledged
                    .fetch_add(n as u64, Ordering::Relaxed);
                tracing::info!("[DLQ] retried ack for {} records", ids.len());
                Ok(ids.len())
            }
            Err(e) => {
                self.unacked.lock().extend(ids);
                Err(e)
            }
        }
    }

    async fn read(&self, cursor: ReadCursor, block: Option<Duration>) -> BrokerResult<Vec<StreamEntry>> {
        let s = &self.settings;
        self.stream
            .read_group(&s.stream, &s.group, &s.consumer, cursor, s.batch_size, block)
            .await
    }

    /// 重放本消费者未确认的记录 / Replay this consumer's unacknowledged entries
    pub async fn drain_pending(&self) -> BrokerResult<usize> {
        let mut total = 0;
        loop {
            let batch = self.read(ReadCursor::Pending, None).await?;
            if batch.is_empty() {
                break;
            }
            let mut all_acked = true;
            for entry in batch {
                let (_, acked) = self.process(entry.into()).await;
                all_acked &= acked;
                total += 1;
            }
            if !all_acked {
                break;
            }
        }
        self.counters
            .replayed
            .fetch_add(total as u64, Ordering::Relaxed);
        Ok(total)
    }

    /// 读取并处理一批新记录 / Read and handle one batch of new records
    pub async fn poll_once(&self, block: Option<Duration>) -> BrokerResult<usize> {
        if let Err(e) = self.retry_acks().await {
            tracing::warn!("[DLQ] ack retry failed: {}", e);
        }
        let batch = self.read(ReadCursor::New, block).await?;
        let n = batch.len();
        for entry in batch {
            self.process(entry.into()).await;
        }
        Ok(n)
    }

    /// 消费循环，直到收到关闭信号 / Consume until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = Duration::from_secs(1);
        loop {
            match self.ensure_group().await {
                Ok(()) => break,
                Err(e) => {
                    tracing::error!("[DLQ] create group failed, retrying in {:?}: {}", backoff, e);
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.changed() => return,
                    }
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                }
            }
        }

        match self.drain_pending().await {
            Ok(0) => {}
            Ok(n) => tracing::info!("[DLQ] replayed {} pending records", n),
            Err(e) => tracing::warn!("[DLQ] pending replay failed: {}", e),
        }
        tracing::info!(
            "[DLQ] listening: stream={} group={} consumer={}",
            self.settings.stream,
            self.settings.group,
            self.settings.consumer
        );

        backoff = Duration::from_secs(1);
        loop {
            if self.unacked_len() > 0 {
                if let Err(e) = self.retry_acks().await {
                    tracing::warn!("[DLQ] ack retry failed: {}", e);
                }
            }

            // 只在读取阶段响应关闭，已读记录总会处理完
            // Shutdown only interrupts the read; fetched records are always handled
            let read = tokio::select! {
                read = self.read(ReadCursor::New, Some(self.settings.block)) => read,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            };
            match read {
                Ok(batch) => {
                    backoff = Duration::from_secs(1);
                    for entry in batch {
                        self.process(entry.into()).await;
                    }
                }
                Err(e) => {
                    tracing::error!("[DLQ] read failed: {}", e);
                    if matches!(e, BrokerError::NoGroup { .. }) {
                        if let Err(e) = self.ensure_group().await {
                            tracing::error!("[DLQ] recreate group failed: {}", e);
                        }
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                    backoff = (backoff * 2).min(Duration::from_secs(30));
                }
            }
        }
        tracing::info!("[DLQ] consumer {} stopped", self.settings.consumer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use tokio::sync::mpsc;

    /// 可注入故障的流 / Stream wrapper with injectable failures
    struct FlakyStream {
        inner: Arc<MemoryBroker>,
        failing_acks: AtomicUsize,
        failing_reads: AtomicBool,
    }

    impl FlakyStream {
        fn new(inner: Arc<MemoryBroker>) -> Self {
            Self {
                inner,
                failing_acks: AtomicUsize::new(0),
                failing_reads: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl AckStream for FlakyStream {
        async fn append(&self, stream: &str, fields: &[(String, String)]) -> BrokerResult<String> {
            self.inner.append(stream, fields).await
        }

        async fn create_group(&self, stream: &str, group: &str) -> BrokerResult<()> {
            self.inner.create_group(stream, group).await
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
            if matches!(cursor, ReadCursor::New) && self.failing_reads.load(Ordering::SeqCst) {
                return Err(BrokerError::Protocol("connection refused".to_string()));
            }
            self.inner
                .read_group(stream, group, consumer, cursor, count, block)
                .await
        }

        async fn ack(&self, stream: &str, group: &str, ids: &[String]) -> BrokerResult<usize> {
            let failing = self
                .failing_acks
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(BrokerError::Protocol("connection reset".to_string()));
            }
            self.inner.ack(stream, group, ids).await
        }

        async fn pending_count(&self, stream: &str, group: &str) -> BrokerResult<usize> {
            self.inner.pending_count(stream, group).await
        }
    }

    enum Behaviour {
        Succeed,
        Fail,
        Panic,
    }

    struct TestSink {
        behaviour: Behaviour,
        seen: Mutex<Vec<StreamRecord>>,
        notify: Option<mpsc::UnboundedSender<String>>,
    }

    impl TestSink {
        fn new(behaviour: Behaviour) -> Self {
            Self {
                behaviour,
                seen: Mutex::new(Vec::new()),
                notify: None,
            }
        }
    }

    #[async_trait]
    impl AlertSink for TestSink {
        async fn alert(&self, record: &StreamRecord) -> Result<()> {
            self.seen.lock().push(record.clone());
            if let Some(tx) = &self.notify {
                let _ = tx.send(record.temp_id.clone().unwrap_or_default());
            }
            match self.behaviour {
                Behaviour::Succeed => Ok(()),
                Behaviour::Fail => Err(anyhow::anyhow!("webhook down")),
                Behaviour::Panic => panic!("sink exploded"),
            }
        }
    }

    fn record(temp_id: &str) -> StreamRecord {
        StreamRecord {
            temp_id: Some(temp_id.to_string()),
            content: Some("payload".to_string()),
            ..Default::default()
        }
    }

    fn consumer(broker: &Arc<MemoryBroker>, sink: Arc<TestSink>, node: &str) -> DeadLetterConsumer {
        let settings = DeadLetterSettings::new(&Keyspace::default(), "dlq_consumer_", node);
        DeadLetterConsumer::new(broker.clone(), sink, settings)
    }

    #[tokio::test]
    async fn test_existing_group_is_not_an_error() {
        let broker = Arc::new(MemoryBroker::new());
        let c = consumer(&broker, Arc::new(TestSink::new(Behaviour::Succeed)), "a");
        c.ensure_group().await.unwrap();
        c.ensure_group().await.unwrap();
        assert_eq!(c.settings().consumer, "dlq_consumer_a");
    }

    #[tokio::test]
    async fn test_failed_alert_is_still_acked_once() {
        let broker = Arc::new(MemoryBroker::new());
        let sink = Arc::new(TestSink::new(Behaviour::Fail));
        let c = consumer(&broker, sink.clone(), "a");
        c.ensure_group().await.unwrap();
        quarantine(broker.as_ref(), &Keyspace::default(), &record("t1"))
            .await
            .unwrap();

        assert_eq!(c.poll_once(None).await.unwrap(), 1);
        let stats = c.stats();
        assert_eq!(stats.processed, 1);
        assert_eq!(stats.acknowledged, 1);
        assert_eq!(stats.alert_failures, 1);
        assert_eq!(broker.pending_count("message:dlq", "dlq_group").await.unwrap(), 0);
        assert_eq!(sink.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_panicking_alert_is_still_acked() {
        let broker = Arc::new(MemoryBroker::new());
        let c = consumer(&broker, Arc::new(TestSink::new(Behaviour::Panic)), "a");
        c.ensure_group().await.unwrap();
        quarantine(broker.as_ref(), &Keyspace::default(), &record("t2"))
            .await
            .unwrap();

        assert_eq!(c.poll_once(None).await.unwrap(), 1);
        assert_eq!(c.stats().acknowledged, 1);
        assert_eq!(broker.pending_count("message:dlq", "dlq_group").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_records_before_group_creation_are_alerted() {
        let broker = Arc::new(MemoryBroker::new());
        quarantine(broker.as_ref(), &Keyspace::default(), &record("early"))
            .await
            .unwrap();
        let sink = Arc::new(TestSink::new(Behaviour::Succeed));
        let c = consumer(&broker, sink.clone(), "a");
        c.ensure_group().await.unwrap();
        assert_eq!(c.poll_once(None).await.unwrap(), 1);
        assert_eq!(sink.seen.lock()[0].temp_id.as_deref(), Some("early"));
    }

    #[tokio::test]
    async fn test_pending_entries_replayed_after_restart() {
        let broker = Arc::new(MemoryBroker::new());
        quarantine(broker.as_ref(), &Keyspace::default(), &record("t3"))
            .await
            .unwrap();
        let first = consumer(&broker, Arc::new(TestSink::new(Behaviour::Succeed)), "a");
        first.ensure_group().await.unwrap();
        // 读取但未确认，模拟崩溃 / Read without ack to simulate a crash
        let delivered = first.read(ReadCursor::New, None).await.unwrap();
        assert_eq!(delivered.len(), 1);
        drop(first);

        let sink = Arc::new(TestSink::new(Behaviour::Succeed));
        let restarted = consumer(&broker, sink.clone(), "a");
        assert_eq!(restarted.drain_pending().await.unwrap(), 1);
        assert_eq!(restarted.stats().replayed, 1);
        assert_eq!(sink.seen.lock()[0].temp_id.as_deref(), Some("t3"));
        assert_eq!(broker.pending_count("message:dlq", "dlq_group").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_run_consumes_until_shutdown() {
        let broker = Arc::new(MemoryBroker::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink = Arc::new(TestSink {
            behaviour: Behaviour::Succeed,
            seen: Mutex::new(Vec::new()),
            notify: Some(tx),
        });
        let settings = DeadLetterSettings::new(&Keyspace::default(), "dlq_consumer_", "a")
            .with_batch(5, Duration::from_millis(50));
        let c = Arc::new(DeadLetterConsumer::new(broker.clone(), sink, settings));

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(c.clone().run(stop_rx));

        quarantine(broker.as_ref(), &Keyspace::default(), &record("live"))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.as_deref(), Some("live"));

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
        assert_eq!(c.stats().acknowledged, 1);
    }

    #[tokio::test]
    async fn test_failed_ack_is_retried_without_second_alert() {
        let broker = Arc::new(MemoryBroker::new());
        let stream = Arc::new(FlakyStream::new(broker.clone()));
        stream.failing_acks.store(1, Ordering::SeqCst);
        let sink = Arc::new(TestSink::new(Behaviour::Succeed));
        let settings = DeadLetterSettings::new(&Keyspace::default(), "dlq_consumer_", "a")
            .with_batch(5, Duration::from_millis(20));
        let c = Arc::new(DeadLetterConsumer::new(stream, sink.clone(), settings));
        quarantine(broker.as_ref(), &Keyspace::default(), &record("t4"))
            .await
            .unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(c.clone().run(stop_rx));

        let mut acked = false;
        for _ in 0..200 {
            if broker.pending_count("message:dlq", "dlq_group").await.unwrap() == 0
                && c.stats().acknowledged == 1
            {
                acked = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        assert!(acked);
        assert_eq!(c.unacked_len(), 0);
        assert_eq!(sink.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_poll_once_retries_earlier_failed_ack() {
        let broker = Arc::new(MemoryBroker::new());
        let stream = Arc::new(FlakyStream::new(broker.clone()));
        stream.failing_acks.store(1, Ordering::SeqCst);
        let settings = DeadLetterSettings::new(&Keyspace::default(), "dlq_consumer_", "a");
        let c = DeadLetterConsumer::new(stream, Arc::new(TestSink::new(Behaviour::Succeed)), settings);
        c.ensure_group().await.unwrap();
        quarantine(broker.as_ref(), &Keyspace::default(), &record("t5"))
            .await
            .unwrap();

        assert_eq!(c.poll_once(None).await.unwrap(), 1);
        assert_eq!(c.unacked_len(), 1);
        assert_eq!(broker.pending_count("message:dlq", "dlq_group").await.unwrap(), 1);

        assert_eq!(c.poll_once(None).await.unwrap(), 0);
        assert_eq!(c.unacked_len(), 0);
        assert_eq!(c.stats().acknowledged, 1);
        assert_eq!(broker.pending_count("message:dlq", "dlq_group").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_during_read_backoff_stops_consumer() {
        let broker = Arc::new(MemoryBroker::new());
        let stream = Arc::new(FlakyStream::new(broker.clone()));
        stream.failing_reads.store(true, Ordering::SeqCst);
        let settings = DeadLetterSettings::new(&Keyspace::default(), "dlq_consumer_", "a");
        let c = Arc::new(DeadLetterConsumer::new(
            stream,
            Arc::new(TestSink::new(Behaviour::Succeed)),
            settings,
        ));

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(c.run(stop_rx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        stop_tx.send(true).unwrap();

        let joined = tokio::time::timeout(Duration::from_secs(5), handle).await;
        assert!(joined.is_ok());
    }
}
