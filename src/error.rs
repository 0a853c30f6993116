use thiserror::Error;

use crate::broker::BrokerError;
use crate::storage::StoreError;
use crate::tasks::archiver::ArchiveError;

/// 统一的应用错误类型 / Top-level application error
#[derive(Error, Debug)]
pub enum AppError {
    #[error("配置错误 / config error: {0}")]
    Config(String),

    #[error("消息代理错误 / broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("数据库错误 / database error: {0}")]
    Database(#[from] v::DbError),

    #[error("存储错误 / store error: {0}")]
    Store(#[from] StoreError),

    #[error("归档错误 / archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("IO 错误 / io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("内部错误 / internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<v::ConfigError> for AppError {
    fn from(e: v::ConfigError) -> Self {
        AppError::Config(e.to_string())
    }
}

impl AppError {
    /// 创建配置错误 / Build a config error
    pub fn config<T: Into<String>>(message: T) -> Self {
        Self::Config(message.into())
    }

    /// 进程退出码 / Process exit code
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Config(_) => 78,
            AppError::Broker(_) | AppError::Database(_) | AppError::Store(_) => 69,
            AppError::Archive(_) => 75,
            AppError::Io(_) => 74,
            AppError::Internal(_) => 70,
        }
    }
}

/// 应用结果类型 / Application result type
pub type AppResult<T> = Result<T, AppError>;
