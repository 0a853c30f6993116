//! 消息存储：热表与归档冷表 / Message storage: hot table and cold archive

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use memory::MemoryMessageStore;
pub use postgres::PgMessageStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Db(#[from] v::DbError),
    #[error("删除数量不符 / deleted {deleted} rows, expected {expected}")]
    CountMismatch { expected: u64, deleted: u64 },
    #[error("非法表名 / invalid table name: {0}")]
    InvalidTable(String),
    #[error("存储不可用 / store unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Db(v::DbError::from(e))
    }
}

impl StoreError {
    /// 是否值得稍后重试 / Whether a later retry may succeed
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Db(e) => e.is_transient(),
            StoreError::Unavailable(_) => true,
            _ => false,
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// 热表消息 / Live (hot) message row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Message {
    pub id: i64,
    /// 客户端可见的唯一 id / Client-visible unique id
    pub server_msg_id: Option<i64>,
    pub temp_id: Option<String>,
    pub room_id: i64,
    pub from_uid: i64,
    pub content: Option<String>,
    pub reply_msg_id: Option<i64>,
    /// 0 正常 1 删除 / 0 normal, 1 deleted
    pub status: i32,
    pub gap_count: Option<i32>,
    /// 1 文本 2 撤回 3 图片 4 语音 5 视频 6 文件
    /// 1 text, 2 recall, 3 image, 4 voice, 5 video, 6 file
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub msg_type: i32,
    pub extra: Option<serde_json::Value>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl Message {
    /// 文本消息 / Plain text message
    pub fn text(id: i64, room_id: i64, from_uid: i64, content: &str, create_time: DateTime<Utc>) -> Self {
        Self {
            id,
            server_msg_id: Some(id),
            temp_id: None,
            room_id,
            from_uid,
            content: Some(content.to_string()),
            reply_msg_id: None,
            status: 0,
            gap_count: None,
            msg_type: 1,
            extra: None,
            create_time,
            update_time: create_time,
        }
    }
}

/// 归档消息，保留原 id / Archived message keeping the original id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct MessageArchive {
    pub id: i64,
    pub server_msg_id: Option<i64>,
    pub temp_id: Option<String>,
    pub room_id: i64,
    pub from_uid: i64,
    pub content: Option<String>,
    pub reply_msg_id: Option<i64>,
    pub status: i32,
    pub gap_count: Option<i32>,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub msg_type: i32,
    pub extra: Option<serde_json::Value>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl From<Message> for MessageArchive {
    fn from(m: Message) -> Self {
        Self {
            id: m.id,
            server_msg_id: m.server_msg_id,
            temp_id: m.temp_id,
            room_id: m.room_id,
            from_uid: m.from_uid,
            content: m.content,
            reply_msg_id: m.reply_msg_id,
            status: m.status,
            gap_count: m.gap_count,
            msg_type: m.msg_type,
            extra: m.extra,
            create_time: m.create_time,
            update_time: m.update_time,
        }
    }
}

/// 归档所需的存储操作 / Storage operations used by archival
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// 最多 `limit` 条早于 `before` 的热表消息，按 id 升序
    /// Up to `limit` hot rows created before `before`, ordered by id
    async fn find_archivable(&self, before: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Message>>;

    /// 在同一事务中写入归档表并从热表删除；失败时两表均不变
    /// Insert into the archive and delete from the hot table in one
    /// transaction; on failure neither table changes
    async fn archive_batch(&self, rows: &[MessageArchive]) -> StoreResult<u64>;
}
