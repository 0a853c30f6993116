pub mod archiver; // 消息归档 / Message archival
pub mod presence; // 在线状态续期 / Presence refresh

pub use archiver::{ArchiveError, ArchiveLock, ArchiveReport, ArchiveSettings, MessageArchiver};
pub use presence::spawn_refresh_task;
