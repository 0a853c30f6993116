use std::time::Duration;

use v::{ConfigManager, ConfigSource};

use crate::error::{AppError, AppResult};

/// 环境变量前缀，例如 `VIM_NODE__ID` / Environment prefix, e.g. `VIM_NODE__ID`
pub const ENV_PREFIX: &str = "VIM";

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub id: String,
    pub http_host: String,
    pub http_port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerKind {
    Redis,
    Memory,
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub kind: BrokerKind,
    pub url: String,
    /// 所有 key 的公共前缀 / Prefix prepended to every broker key
    pub key_prefix: String,
}

#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub ttl: Duration,
    pub refresh_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct DeadLetterConfig {
    pub enabled: bool,
    pub consumer_prefix: String,
    pub batch_size: usize,
    pub block: Duration,
}

#[derive(Debug, Clone)]
pub struct ArchiveConfig {
    pub enabled: bool,
    pub cron: String,
    pub batch_size: i64,
    pub retention_months: u32,
    pub batch_pause: Duration,
    /// 跨节点锁；为 None 时仅进程内互斥 / Cross-node lock; None keeps the guard in-process only
    pub lock_ttl: Option<Duration>,
    pub hot_table: String,
    pub archive_table: String,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

/// 节点完整配置 / Complete node settings
#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub node: NodeConfig,
    pub broker: BrokerConfig,
    pub presence: PresenceConfig,
    pub dead_letter: DeadLetterConfig,
    pub archive: ArchiveConfig,
    pub logging: LoggingConfig,
    pub database: Option<v::DbSettings>,
}

/// 按标准顺序构建配置源 / Build the standard source chain
///
/// `config/default.toml` -> `config/<VIM_ENV>.toml` -> `--config` -> `VIM_*`
pub fn standard_sources(explicit: Option<&str>) -> Vec<ConfigSource> {
    let env = std::env::var(format!("{}_ENV", ENV_PREFIX))
        .unwrap_or_else(|_| "development".to_string());
    let mut sources = vec![
        ConfigSource::toml("config/default.toml", false),
        ConfigSource::toml(format!("config/{}.toml", env), false),
    ];
    if let Some(path) = explicit {
        sources.push(ConfigSource::toml(path, true));
    }
    sources.push(ConfigSource::env(ENV_PREFIX));
    sources
}

/// 加载配置 / Load configuration from the standard sources
pub fn load(explicit: Option<&str>) -> AppResult<(ConfigManager, NodeSettings)> {
    let cm = ConfigManager::with_sources(standard_sources(explicit))?;
    let settings = NodeSettings::from_manager(&cm)?;
    Ok((cm, settings))
}

fn secs(cm: &ConfigManager, key: &str, default: u64) -> Duration {
    Duration::from_secs(cm.get_or(key, default))
}

fn millis(cm: &ConfigManager, key: &str, default: u64) -> Duration {
    Duration::from_millis(cm.get_or(key, default))
}

impl NodeSettings {
    pub fn from_manager(cm: &ConfigManager) -> AppResult<Self> {
        // 节点标识没有默认值 / Node identity has no default
        cm.validate_required_keys(&["node.id"])?;
        let id = cm.get_string("node.id")?.trim().to_string();
        if id.is_empty() {
            return Err(AppError::config("node.id must not be blank"));
        }

        let kind = match cm
            .get_or("broker.kind", "redis".to_string())
            .to_lowercase()
            .as_str()
        {
            "redis" => BrokerKind::Redis,
            "memory" => BrokerKind::Memory,
            other => {
                return Err(AppError::config(format!(
                    "broker.kind must be `redis` or `memory`, got `{}`",
                    other
                )))
            }
        };

        let presence = PresenceConfig {
            ttl: secs(cm, "presence.ttl_secs", 90),
            refresh_interval: secs(cm, "presence.refresh_interval_secs", 30),
        };
        if presence.ttl.is_zero() || presence.refresh_interval >= presence.ttl {
            return Err(AppError::config(
                "presence.refresh_interval_secs must be shorter than presence.ttl_secs",
            ));
        }

        let batch_size: i64 = cm.get_or("archive.batch_size", 1000_i64);
        if batch_size <= 0 {
            return Err(AppError::config("archive.batch_size must be positive"));
        }
        let lock_ttl_secs: u64 = cm.get_or("archive.lock_ttl_secs", 21_600_u64);

        let archive = ArchiveConfig {
            enabled: cm.get_or("archive.enabled", true),
            cron: cm.get_or("archive.cron", "0 0 3 * * *".to_string()),
            batch_size,
            retention_months: cm.get_or("archive.retention_months", 3_u32),
            batch_pause: millis(cm, "archive.batch_pause_ms", 100),
            lock_ttl: (cm.get_or("archive.distributed_lock", true) && lock_ttl_secs > 0)
                .then(|| Duration::from_secs(lock_ttl_secs)),
            hot_table: cm.get_or("archive.hot_table", "dev_sphere_message".to_string()),
            archive_table: cm.get_or(
                "archive.archive_table",
                "dev_sphere_message_archive".to_string(),
            ),
        };

        let database = if cm.exists("database.default") {
            Some(v::DbSettings::from_config(cm, "default")?)
        } else {
            None
        };

        Ok(Self {
            node: NodeConfig {
                id,
                http_host: cm.get_or("node.http_host", "0.0.0.0".to_string()),
                http_port: cm.get_or("node.http_port", 8088_u16),
            },
            broker: BrokerConfig {
                kind,
                url: cm.get_or("broker.url", "redis://127.0.0.1:6379".to_string()),
                key_prefix: cm.get_or("broker.key_prefix", String::new()),
            },
            presence,
            dead_letter: DeadLetterConfig {
                enabled: cm.get_or("dead_letter.enabled", true),
                consumer_prefix: cm.get_or("dead_letter.consumer_prefix", "dlq_consumer_".to_string()),
                batch_size: cm.get_or("dead_letter.batch_size", 10_usize),
                block: millis(cm, "dead_letter.block_ms", 2000),
            },
            archive,
            logging: LoggingConfig {
                level: cm.get_or("logging.level", "info".to_string()),
                json: cm.get_or("logging.json", false),
            },
            database,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use v::FileFormat;

    fn manager(toml: &str) -> ConfigManager {
        ConfigManager::with_sources(vec![ConfigSource::String {
            content: toml.to_string(),
            format: FileFormat::Toml,
        }])
        .unwrap()
    }

    #[test]
    fn missing_node_id_is_fatal() {
        let cm = manager("[broker]\nkind = \"memory\"");
        assert!(matches!(NodeSettings::from_manager(&cm), Err(AppError::Config(_))));
    }

    #[test]
    fn blank_node_id_is_fatal() {
        let cm = manager("[node]\nid = \"   \"");
        assert!(matches!(NodeSettings::from_manager(&cm), Err(AppError::Config(_))));
    }

    #[test]
    fn defaults_are_applied() {
        let s = NodeSettings::from_manager(&manager("[node]\nid = \"node-a\"")).unwrap();
        assert_eq!(s.node.id, "node-a");
        assert_eq!(s.broker.kind, BrokerKind::Redis);
        assert_eq!(s.broker.key_prefix, "");
        assert_eq!(s.presence.ttl, Duration::from_secs(90));
        assert_eq!(s.archive.cron, "0 0 3 * * *");
        assert_eq!(s.archive.batch_size, 1000);
        assert_eq!(s.archive.retention_months, 3);
        assert_eq!(s.archive.batch_pause, Duration::from_millis(100));
        assert_eq!(s.dead_letter.consumer_prefix, "dlq_consumer_");
        assert!(s.database.is_none());
    }

    #[test]
    fn memory_override_wins() {
        let base = ConfigSource::String {
            content: "[node]\nid = \"node-a\"\n[broker]\nkind = \"redis\"".to_string(),
            format: FileFormat::Toml,
        };
        let mut map = HashMap::new();
        map.insert("broker.kind".to_string(), serde_json::json!("memory"));
        let cm = ConfigManager::with_sources(vec![base, ConfigSource::Memory(map)]).unwrap();
        let s = NodeSettings::from_manager(&cm).unwrap();
        assert_eq!(s.broker.kind, BrokerKind::Memory);
    }

    #[test]
    fn refresh_must_be_shorter_than_ttl() {
        let cm = manager(
            "[node]\nid = \"a\"\n[presence]\nttl_secs = 30\nrefresh_interval_secs = 30",
        );
        assert!(NodeSettings::from_manager(&cm).is_err());
    }
}
