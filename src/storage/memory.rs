use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{Message, MessageArchive, MessageStore, StoreError, StoreResult};

#[derive(Default, Clone)]
struct Tables {
    hot: BTreeMap<i64, Message>,
    archive: BTreeMap<i64, MessageArchive>,
}

/// 内存消息存储，批次在副本上执行后整体提交，支持注入失败
/// In-memory message store; each batch runs on a staged copy and commits as a
/// whole, with injectable insert and delete failures
#[derive(Default)]
pub struct MemoryMessageStore {
    tables: Mutex<Tables>,
    /// 第 N 次归档批次写入失败（0 表示不注入）/ Fail the Nth batch's insert, 0 disables
    fail_on_batch: AtomicUsize,
    /// 第 N 次归档批次在写入后删除失败 / Fail the Nth batch's delete, after its insert
    fail_delete_on_batch: AtomicUsize,
    batches: AtomicUsize,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_messages(messages: impl IntoIterator<Item = Message>) -> Self {
        let store = Self::new();
        store.insert_hot(messages);
        store
    }

    pub fn insert_hot(&self, messages: impl IntoIterator<Item = Message>) {
        let mut t = self.tables.lock();
        for m in messages {
            t.hot.insert(m.id, m);
        }
    }

    /// 下一次归档批次写入失败 / Make the next archive batch fail on insert
    pub fn fail_next_insert(&self) {
        self.fail_insert_on(self.batches.load(Ordering::SeqCst) + 1);
    }

    /// 第 `n` 次（从 1 开始计）归档批次写入失败 / Fail the `n`th archive batch, 1-based
    pub fn fail_insert_on(&self, n: usize) {
        self.fail_on_batch.store(n, Ordering::SeqCst);
    }

    /// 下一次归档批次在写入之后删除失败 / Make the next batch fail on delete, after inserting
    pub fn fail_next_delete(&self) {
        self.fail_delete_on_batch
            .store(self.batches.load(Ordering::SeqCst) + 1, Ordering::SeqCst);
    }

    pub fn hot_ids(&self) -> Vec<i64> {
        self.tables.lock().hot.keys().copied().collect()
    }

    pub fn archive_ids(&self) -> Vec<i64> {
        self.tables.lock().archive.keys().copied().collect()
    }

    pub fn archived(&self, id: i64) -> Option<MessageArchive> {
        self.tables.lock().archive.get(&id).cloned()
    }

    pub fn batches(&self) -> usize {
        self.batches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn find_archivable(&self, before: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Message>> {
        let t = self.tables.lock();
        Ok(t.hot
            .values()
            .filter(|m| m.create_time < before)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn archive_batch(&self, rows: &[MessageArchive]) -> StoreResult<u64> {
        let batch_no = self.batches.fetch_add(1, Ordering::SeqCst) + 1;
        let mut t = self.tables.lock();
        // 在副本上执行，成功后整体提交；任何错误都丢弃副本
        // Work on a staged copy and commit it whole; any error drops the copy
        let mut staged = t.clone();

        for r in rows {
            if staged.archive.insert(r.id, r.clone()).is_some() {
                return Err(StoreError::Unavailable(format!(
                    "duplicate key {} in archive",
                    r.id
                )));
            }
            if self.fail_on_batch.load(Ordering::SeqCst) == batch_no {
                return Err(StoreError::Unavailable(format!(
                    "injected insert failure on batch {}",
                    batch_no
                )));
            }
        }

        if self.fail_delete_on_batch.load(Ordering::SeqCst) == batch_no {
            return Err(StoreError::Unavailable(format!(
                "injected delete failure on batch {}",
                batch_no
            )));
        }
        let deleted = rows
            .iter()
            .filter(|r| staged.hot.remove(&r.id).is_some())
            .count() as u64;
        let expected = rows.len() as u64;
        if deleted != expected {
            return Err(StoreError::CountMismatch { expected, deleted });
        }

        *t = staged;
        Ok(deleted)
    }
}
