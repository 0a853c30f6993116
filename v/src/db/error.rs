use thiserror::Error;

pub type Result<T> = std::result::Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("配置错误 / config error: {0}")]
    Config(String),
    #[error("SQLx 错误 / SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),
}

impl DbError {
    /// 是否为瞬时错误（连接池耗尽、IO 中断）/ Whether the error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DbError::Sqlx(sqlx::Error::PoolTimedOut)
                | DbError::Sqlx(sqlx::Error::PoolClosed)
                | DbError::Sqlx(sqlx::Error::Io(_))
        )
    }
}
