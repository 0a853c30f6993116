use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local, Months, Utc};
use cron::Schedule;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::broker::{BrokerError, KvStore};
use crate::storage::{MessageArchive, MessageStore, StoreError};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("归档任务正在运行 / an archive run is already in progress")]
    AlreadyRunning,
    #[error("归档锁错误 / archive lock error: {0}")]
    Lock(#[source] BrokerError),
    #[error("无法计算归档阈值 / cannot compute threshold {months} months before {now}")]
    Threshold { now: DateTime<Utc>, months: u32 },
    #[error("批次失败，本次已归档 {archived} 条 / batch failed after {archived} archived rows: {source}")]
    Batch {
        archived: u64,
        #[source]
        source: StoreError,
    },
    #[error("非法 cron 表达式 / invalid cron expression '{expr}': {message}")]
    Schedule { expr: String, message: String },
}

#[derive(Debug, Clone)]
pub struct ArchiveSettings {
    pub cron: String,
    pub batch_size: i64,
    pub retention_months: u32,
    pub batch_pause: Duration,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            cron: "0 0 3 * * *".to_string(),
            batch_size: 1000,
            retention_months: 3,
            batch_pause: Duration::from_millis(100),
        }
    }
}

impl From<&crate::config::ArchiveConfig> for ArchiveSettings {
    fn from(c: &crate::config::ArchiveConfig) -> Self {
        Self {
            cron: c.cron.clone(),
            batch_size: c.batch_size,
            retention_months: c.retention_months,
            batch_pause: c.batch_pause,
        }
    }
}

/// 单次归档结果 / Result of one archive run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArchiveReport {
    pub batches: u32,
    pub archived: u64,
    pub batch_sizes: Vec<u64>,
    pub threshold: DateTime<Utc>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// 跨节点归档锁 / Cross-node archive lock held in the broker
pub struct ArchiveLock {
    kv: Arc<dyn KvStore>,
    key: String,
    owner: String,
    ttl: Duration,
}

impl ArchiveLock {
    pub fn new(kv: Arc<dyn KvStore>, key: String, owner: impl Into<String>, ttl: Duration) -> Self {
        Self {
            kv,
            key,
            owner: owner.into(),
            ttl,
        }
    }

    async fn acquire(&self) -> Result<bool, ArchiveError> {
        self.kv
            .set_nx_with_ttl(&self.key, &self.owner, self.ttl)
            .await
            .map_err(ArchiveError::Lock)
    }

    async fn release(&self) {
        if let Err(e) = self.kv.delete_if_eq(&self.key, &self.owner).await {
            tracing::warn!("[消息归档] 释放锁失败 / release {} failed: {}", self.key, e);
        }
    }
}

/// 进程内单飞守卫 / In-process single-flight guard
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunGuard(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// `now` 往前推 `months` 个月（月末自动收敛）
/// `now` minus `months` calendar months, clamped to month end
pub fn threshold(now: DateTime<Utc>, months: u32) -> Result<DateTime<Utc>, ArchiveError> {
    now.checked_sub_months(Months::new(months))
        .ok_or(ArchiveError::Threshold { now, months })
}

/// 解析 6/7 段 cron 表达式，兼容 `?` / Parse a 6 or 7 field cron expression, `?` allowed
pub fn parse_schedule(expr: &str) -> Result<Schedule, ArchiveError> {
    Schedule::from_str(&expr.replace('?', "*")).map_err(|e| ArchiveError::Schedule {
        expr: expr.to_string(),
        message: e.to_string(),
    })
}

/// 消息归档任务：将过期消息分批搬入归档表
/// Archival task: moves expired messages into the archive in batches
pub struct MessageArchiver {
    store: Arc<dyn MessageStore>,
    settings: ArchiveSettings,
    lock: Option<ArchiveLock>,
    running: AtomicBool,
    last_report: parking_lot::Mutex<Option<ArchiveReport>>,
}

impl MessageArchiver {
    pub fn new(store: Arc<dyn MessageStore>, settings: ArchiveSettings, lock: Option<ArchiveLock>) -> Self {
        Self {
            store,
            settings,
            lock,
            running: AtomicBool::new(false),
            last_report: parking_lot::Mutex::new(None),
        }
    }

    pub fn settings(&self) -> &ArchiveSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn last_report(&self) -> Option<ArchiveReport> {
        self.last_report.lock().clone()
    }

    /// 执行一次归档；已有运行中的任务时直接拒绝
    /// Run one archive pass; rejected while another run is active
    pub async fn run_once(&self) -> Result<ArchiveReport, ArchiveError> {
        let _guard = RunGuard::acquire(&self.running).ok_or(ArchiveError::AlreadyRunning)?;

        if let Some(lock) = &self.lock {
            if !lock.acquire().await? {
                tracing::info!("[消息归档] 其它节点正在归档 / another node holds {}", lock.key);
                return Err(ArchiveError::AlreadyRunning);
            }
        }

        let result = match threshold(Utc::now(), self.settings.retention_months) {
            Ok(before) => self.archive_before(before).await,
            Err(e) => Err(e),
        };

        if let Some(lock) = &self.lock {
            lock.release().await;
        }
        if let Ok(report) = &result {
            *self.last_report.lock() = Some(report.clone());
        }
        result
    }

    /// 分批归档 `before` 之前创建的消息 / Archive messages created before `before`
    pub async fn archive_before(&self, before: DateTime<Utc>) -> Result<ArchiveReport, ArchiveError> {
        let started_at = Utc::now();
        tracing::info!(
            "[消息归档] 任务启动，截止时间 / archive run started, threshold {}",
            before
        );

        let mut archived = 0_u64;
        let mut batch_sizes = Vec::new();
        loop {
            let rows = self
                .store
                .find_archivable(before, self.settings.batch_size)
                .await
                .map_err(|source| ArchiveError::Batch { archived, source })?;
            if rows.is_empty() {
                tracing::info!("[消息归档] 扫描完毕 / no more expired messages");
                break;
            }

            let rows: Vec<MessageArchive> = rows.into_iter().map(MessageArchive::from).collect();
            match self.store.archive_batch(&rows).await {
                Ok(n) => {
                    archived += n;
                    batch_sizes.push(n);
                    tracing::info!("[消息归档] 已迁移 / moved {} messages so far", archived);
                }
                Err(source) => {
                    tracing::error!(
                        transient = source.is_transient(),
                        "[消息归档] 批次回滚，任务终止 / batch rolled back, run aborted: {}",
                        source
                    );
                    return Err(ArchiveError::Batch { archived, source });
                }
            }

            if !self.settings.batch_pause.is_zero() {
                tokio::time::sleep(self.settings.batch_pause).await;
            }
        }

        let report = ArchiveReport {
            batches: batch_sizes.len() as u32,
            archived,
            batch_sizes,
            threshold: before,
            started_at,
            finished_at: Utc::now(),
        };
        tracing::info!("[消息归档] 任务结束，共归档 / run finished, {} archived", archived);
        Ok(report)
    }

    /// 按 cron 计划（本地时区）定时归档 / Run on the cron schedule in local time
    pub fn spawn_schedule(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>, ArchiveError> {
        let schedule = parse_schedule(&self.settings.cron)?;
        let archiver = Arc::clone(self);
        Ok(tokio::spawn(async move {
            loop {
                let now = Local::now();
                let Some(next) = schedule.after(&now).next() else {
                    tracing::warn!("[消息归档] cron 无后续触发 / schedule exhausted");
                    break;
                };
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                tracing::info!("[消息归档] 下次执行 / next run at {}", next);

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                        continue;
                    }
                }

                // 关闭时中断的批次由事务回滚 / A batch interrupted by shutdown rolls back
                let outcome = tokio::select! {
                    outcome = archiver.run_once() => Some(outcome),
                    _ = shutdown.changed() => None,
                };
                match outcome {
                    Some(Ok(report)) => tracing::info!(
                        "[消息归档] 完成 / run done: {} rows in {} batches",
                        report.archived,
                        report.batches
                    ),
                    Some(Err(ArchiveError::AlreadyRunning)) => {
                        tracing::info!("[消息归档] 跳过，已有任务运行 / skipped, already running")
                    }
                    Some(Err(e)) => tracing::error!("[消息归档] 失败 / run failed: {}", e),
                    None => {
                        if let Some(lock) = &archiver.lock {
                            lock.release().await;
                        }
                        tracing::warn!("[消息归档] 关闭时中断 / interrupted by shutdown");
                        break;
                    }
                }
            }
        }))
    }
}
