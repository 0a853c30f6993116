use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};

use super::{Message, MessageArchive, MessageStore, StoreError, StoreResult};

const COLUMNS: &str = "id, server_msg_id, temp_id, room_id, from_uid, content, reply_msg_id, \
                       status, gap_count, type, extra, create_time, update_time";
const COLUMN_COUNT: usize = 13;
// PostgreSQL 单条语句最多 65535 个绑定参数 / At most 65535 bind parameters per statement
const MAX_ROWS_PER_INSERT: usize = 65_535 / COLUMN_COUNT;

/// 表名校验：`name` 或 `schema.name` / Accepts `name` or `schema.name`
fn validate_table(name: &str) -> StoreResult<()> {
    let ok = !name.is_empty()
        && name.split('.').count() <= 2
        && name.split('.').all(|part| {
            let mut chars = part.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        });
    if ok {
        Ok(())
    } else {
        Err(StoreError::InvalidTable(name.to_string()))
    }
}

/// 基于 sqlx 的 PostgreSQL 消息存储 / sqlx-backed PostgreSQL message store
#[derive(Clone)]
pub struct PgMessageStore {
    pool: PgPool,
    hot_table: String,
    archive_table: String,
}

impl PgMessageStore {
    pub fn new(pool: PgPool, hot_table: &str, archive_table: &str) -> StoreResult<Self> {
        validate_table(hot_table)?;
        validate_table(archive_table)?;
        Ok(Self {
            pool,
            hot_table: hot_table.to_string(),
            archive_table: archive_table.to_string(),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 归档表不存在时按热表结构创建 / Create the archive table shaped like the hot table
    pub async fn ensure_archive_table(&self) -> StoreResult<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (LIKE {} INCLUDING ALL)",
            self.archive_table, self.hot_table
        );
        sqlx::raw_sql(&ddl).execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn find_archivable(&self, before: DateTime<Utc>, limit: i64) -> StoreResult<Vec<Message>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE create_time < $1 ORDER BY id LIMIT $2",
            COLUMNS, self.hot_table
        );
        let rows = sqlx::query_as::<_, Message>(&sql)
            .bind(before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn archive_batch(&self, rows: &[MessageArchive]) -> StoreResult<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let mut tx = v::begin_tx(&self.pool).await?;

        for chunk in rows.chunks(MAX_ROWS_PER_INSERT) {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new(format!("INSERT INTO {} ({}) ", self.archive_table, COLUMNS));
            qb.push_values(chunk, |mut b, r| {
                b.push_bind(r.id)
                    .push_bind(r.server_msg_id)
                    .push_bind(r.temp_id.clone())
                    .push_bind(r.room_id)
                    .push_bind(r.from_uid)
                    .push_bind(r.content.clone())
                    .push_bind(r.reply_msg_id)
                    .push_bind(r.status)
                    .push_bind(r.gap_count)
                    .push_bind(r.msg_type)
                    .push_bind(r.extra.clone())
                    .push_bind(r.create_time)
                    .push_bind(r.update_time);
            });
            qb.build().execute(&mut *tx).await?;
        }

        let ids: Vec<i64> = rows.iter().map(|r| r.id).collect();
        let delete = format!("DELETE FROM {} WHERE id = ANY($1)", self.hot_table);
        let deleted = sqlx::query(&delete)
            .bind(ids)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        let expected = rows.len() as u64;
        if deleted != expected {
            tx.rollback().await?;
            return Err(StoreError::CountMismatch { expected, deleted });
        }
        tx.commit().await?;
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_names_are_validated() {
        assert!(validate_table("dev_sphere_message").is_ok());
        assert!(validate_table("chat.dev_sphere_message_archive").is_ok());
        assert!(validate_table("").is_err());
        assert!(validate_table("1abc").is_err());
        assert!(validate_table("msg; DROP TABLE x").is_err());
        assert!(validate_table("a.b.c").is_err());
    }

    #[test]
    fn test_chunk_fits_bind_limit() {
        assert!(MAX_ROWS_PER_INSERT * COLUMN_COUNT <= 65_535);
        assert!(MAX_ROWS_PER_INSERT >= 1000);
    }

    // 以下测试需要一个可丢弃的 PostgreSQL：DATABASE_URL=... cargo test -- --ignored
    // The tests below need a disposable PostgreSQL: DATABASE_URL=... cargo test -- --ignored

    const HOT_DDL: &str = "(
        id BIGINT PRIMARY KEY,
        server_msg_id BIGINT UNIQUE,
        temp_id VARCHAR(64),
        room_id BIGINT NOT NULL,
        from_uid BIGINT NOT NULL,
        content TEXT,
        reply_msg_id BIGINT,
        status INTEGER NOT NULL DEFAULT 0,
        gap_count INTEGER,
        type INTEGER NOT NULL DEFAULT 1,
        extra JSONB,
        create_time TIMESTAMPTZ NOT NULL DEFAULT now(),
        update_time TIMESTAMPTZ NOT NULL DEFAULT now()
    )";

    async fn fresh_store(name: &str) -> PgMessageStore {
        let url = std::env::var("DATABASE_URL").unwrap();
        let pool = PgPool::connect(&url).await.unwrap();
        let hot = format!("{}_hot", name);
        let archive = format!("{}_archive", name);
        let ddl = format!(
            "DROP TABLE IF EXISTS {archive}; DROP TABLE IF EXISTS {hot}; CREATE TABLE {hot} {HOT_DDL};"
        );
        sqlx::raw_sql(&ddl).execute(&pool).await.unwrap();
        let store = PgMessageStore::new(pool, &hot, &archive).unwrap();
        store.ensure_archive_table().await.unwrap();
        store
    }

    async fn insert_into(store: &PgMessageStore, table: &str, m: &Message) {
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)",
            table, COLUMNS
        );
        sqlx::query(&sql)
            .bind(m.id)
            .bind(m.server_msg_id)
            .bind(m.temp_id.clone())
            .bind(m.room_id)
            .bind(m.from_uid)
            .bind(m.content.clone())
            .bind(m.reply_msg_id)
            .bind(m.status)
            .bind(m.gap_count)
            .bind(m.msg_type)
            .bind(m.extra.clone())
            .bind(m.create_time)
            .bind(m.update_time)
            .execute(store.pool())
            .await
            .unwrap();
    }

    async fn ids(store: &PgMessageStore, table: &str) -> Vec<i64> {
        sqlx::query_scalar::<_, i64>(&format!("SELECT id FROM {} ORDER BY id", table))
            .fetch_all(store.pool())
            .await
            .unwrap()
    }

    fn old_message(id: i64) -> Message {
        Message::text(id, 1, 10, "old", Utc::now() - chrono::Duration::days(200))
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL"]
    async fn test_pg_batch_moves_rows_in_one_transaction() {
        let store = fresh_store("t_move").await;
        for id in 1..=3 {
            insert_into(&store, &store.hot_table, &old_message(id)).await;
        }
        let rows: Vec<MessageArchive> = store
            .find_archivable(Utc::now(), 10)
            .await
            .unwrap()
            .into_iter()
            .map(MessageArchive::from)
            .collect();
        assert_eq!(store.archive_batch(&rows).await.unwrap(), 3);
        assert!(ids(&store, &store.hot_table).await.is_empty());
        assert_eq!(ids(&store, &store.archive_table).await, vec![1, 2, 3]);
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL"]
    async fn test_pg_insert_failure_leaves_both_tables_unchanged() {
        let store = fresh_store("t_insert_fail").await;
        for id in 1..=3 {
            insert_into(&store, &store.hot_table, &old_message(id)).await;
        }
        // 归档表已有相同主键，写入半程失败 / Same key already archived, the insert fails
        let mut clash = old_message(2);
        clash.server_msg_id = Some(200);
        insert_into(&store, &store.archive_table, &clash).await;

        let rows: Vec<MessageArchive> = (1..=3).map(|id| MessageArchive::from(old_message(id))).collect();
        assert!(store.archive_batch(&rows).await.is_err());
        assert_eq!(ids(&store, &store.hot_table).await, vec![1, 2, 3]);
        assert_eq!(ids(&store, &store.archive_table).await, vec![2]);
    }

    #[tokio::test]
    #[ignore = "needs DATABASE_URL"]
    async fn test_pg_delete_count_mismatch_rolls_back_insert() {
        let store = fresh_store("t_mismatch").await;
        for id in 1..=2 {
            insert_into(&store, &store.hot_table, &old_message(id)).await;
        }
        // id 3 不在热表：写入成功但删除数量不符 / id 3 is not live: insert succeeds, delete count differs
        let rows: Vec<MessageArchive> = (1..=3).map(|id| MessageArchive::from(old_message(id))).collect();
        assert!(matches!(
            store.archive_batch(&rows).await,
            Err(StoreError::CountMismatch { expected: 3, deleted: 2 })
        ));
        assert_eq!(ids(&store, &store.hot_table).await, vec![1, 2]);
        assert!(ids(&store, &store.archive_table).await.is_empty());
    }
}
