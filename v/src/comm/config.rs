use config::{Config, ConfigBuilder, Environment, File};
pub use config::FileFormat;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::path::Path;

/// 配置错误类型 / Configuration error type
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("配置文件不存在 / config file not found: {path}")]
    FileNotFound { path: String },
    #[error("配置项 '{key}' 不存在 / missing config key '{key}'")]
    KeyNotFound { key: String },
    #[error("配置项 '{key}' 无效 / invalid config key '{key}': {message}")]
    Invalid { key: String, message: String },
    #[error("配置初始化失败 / config initialization failed: {message}")]
    InitializationError { message: String },
}

/// 配置数据源信息 / Loaded source description
#[derive(Debug, Clone)]
pub struct ConfigSourceInfo {
    pub source_type: &'static str,
    pub description: String,
    pub priority: u8,
    pub loaded: bool,
}

/// 配置源类型（后添加者优先生效）
/// Configuration source kinds (later sources override earlier ones)
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// 文件配置源 / File source
    File {
        path: String,
        format: Option<FileFormat>,
        required: bool,
    },
    /// 环境变量配置源，例如 `VIM_NODE__ID` -> `node.id`
    /// Environment source, e.g. `VIM_NODE__ID` -> `node.id`
    Env {
        prefix: String,
        separator: &'static str,
    },
    /// 内存配置源（点分 key）/ In-memory source (dotted keys)
    Memory(HashMap<String, serde_json::Value>),
    /// 字符串配置源 / Inline string source
    String { content: String, format: FileFormat },
}

impl ConfigSource {
    /// 标准 TOML 文件源 / Plain TOML file source
    pub fn toml(path: impl Into<String>, required: bool) -> Self {
        ConfigSource::File {
            path: path.into(),
            format: Some(FileFormat::Toml),
            required,
        }
    }

    /// 使用 `<PREFIX>_` 前缀与 `__` 层级分隔符的环境变量源
    /// Environment source with `<PREFIX>_` prefix and `__` nesting separator
    pub fn env(prefix: impl Into<String>) -> Self {
        ConfigSource::Env {
            prefix: prefix.into(),
            separator: "__",
        }
    }

    fn info(&self, priority: u8) -> ConfigSourceInfo {
        let (source_type, description) = match self {
            ConfigSource::File { path, required, .. } => {
                ("File", format!("{} (required: {})", path, required))
            }
            ConfigSource::Env { prefix, separator } => (
                "Environment",
                format!("prefix={}_ separator={}", prefix, separator),
            ),
            ConfigSource::Memory(map) => ("Memory", format!("{} keys", map.len())),
            ConfigSource::String { .. } => ("String", "inline".to_string()),
        };
        ConfigSourceInfo {
            source_type,
            description,
            priority,
            loaded: false,
        }
    }

    fn add_to_builder(
        self,
        builder: ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<ConfigBuilder<config::builder::DefaultState>, ConfigError> {
        match self {
            ConfigSource::File {
                path,
                format,
                required,
            } => {
                let file = match format {
                    Some(format) => File::with_name(&path).format(format),
                    None => File::with_name(&path),
                };
                Ok(builder.add_source(file.required(required)))
            }
            ConfigSource::Env { prefix, separator } => Ok(builder.add_source(
                Environment::with_prefix(&prefix)
                    .prefix_separator("_")
                    .separator(separator)
                    .try_parsing(true)
                    .ignore_empty(true),
            )),
            ConfigSource::Memory(map) => {
                let mut builder = builder;
                for (key, value) in map {
                    builder = builder
                        .set_override(key.as_str(), json_to_config(value))
                        .map_err(|e| ConfigError::InitializationError {
                            message: e.to_string(),
                        })?;
                }
                Ok(builder)
            }
            ConfigSource::String { content, format } => {
                Ok(builder.add_source(File::from_str(&content, format)))
            }
        }
    }
}

fn json_to_config(value: serde_json::Value) -> config::Value {
    match value {
        serde_json::Value::Null => config::Value::from(config::ValueKind::Nil),
        serde_json::Value::Bool(b) => config::Value::from(b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => config::Value::from(i),
            None => config::Value::from(n.as_f64().unwrap_or_default()),
        },
        serde_json::Value::String(s) => config::Value::from(s),
        serde_json::Value::Array(items) => config::Value::from(
            items.into_iter().map(json_to_config).collect::<Vec<_>>(),
        ),
        serde_json::Value::Object(map) => config::Value::from(
            map.into_iter()
                .map(|(k, v)| (k, json_to_config(v)))
                .collect::<HashMap<_, _>>(),
        ),
    }
}

/// 配置管理器：按顺序叠加各配置源，并提供类型化读取
/// Configuration manager: layers sources in order and offers typed reads
pub struct ConfigManager {
    config: Config,
    sources_info: Vec<ConfigSourceInfo>,
}

impl ConfigManager {
    /// 使用指定的配置源创建配置管理器 / Build from the given sources
    ///
    /// 可选文件不存在时跳过；必需文件不存在时报错
    /// Missing optional files are skipped; missing required files fail
    pub fn with_sources(sources: Vec<ConfigSource>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder();
        let mut sources_info = Vec::with_capacity(sources.len());

        for (idx, source) in sources.into_iter().enumerate() {
            let mut info = source.info(idx as u8 + 1);
            if let ConfigSource::File { path, required, .. } = &source {
                if !Path::new(path).exists() {
                    if *required {
                        return Err(ConfigError::FileNotFound { path: path.clone() });
                    }
                    sources_info.push(info);
                    continue;
                }
            }
            builder = source.add_to_builder(builder)?;
            info.loaded = true;
            sources_info.push(info);
        }

        let config = builder
            .build()
            .map_err(|e| ConfigError::InitializationError {
                message: e.to_string(),
            })?;
        Ok(Self {
            config,
            sources_info,
        })
    }

    /// 读取指定 key 的配置值 / Read a typed value
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T, ConfigError> {
        self.config.get(key).map_err(|e| match e {
            config::ConfigError::NotFound(_) => ConfigError::KeyNotFound {
                key: key.to_string(),
            },
            other => ConfigError::Invalid {
                key: key.to_string(),
                message: other.to_string(),
            },
        })
    }

    /// 读取配置值，不存在时返回默认值（类型错误同样回退）
    /// Read a value, falling back to `default` when absent or mistyped
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    /// 读取可选配置：不存在返回 None，类型错误返回 Err
    /// Read an optional value: None when absent, Err when mistyped
    pub fn get_opt<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, ConfigError> {
        match self.get(key) {
            Ok(v) => Ok(Some(v)),
            Err(ConfigError::KeyNotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn get_string(&self, key: &str) -> Result<String, ConfigError> {
        self.get(key)
    }

    pub fn exists(&self, key: &str) -> bool {
        self.config.get::<config::Value>(key).is_ok()
    }

    pub fn sources_info(&self) -> &[ConfigSourceInfo] {
        &self.sources_info
    }

    /// 打印配置源详细信息 / Log loaded sources
    pub fn print_sources_info(&self) {
        for info in &self.sources_info {
            tracing::info!(
                "config source #{} {} [{}] {}",
                info.priority,
                info.source_type,
                if info.loaded { "loaded" } else { "skipped" },
                info.description
            );
        }
    }

    /// 验证必需的配置项 / Verify required keys are present
    pub fn validate_required_keys(&self, required_keys: &[&str]) -> Result<(), ConfigError> {
        for key in required_keys {
            if !self.exists(key) {
                return Err(ConfigError::KeyNotFound {
                    key: key.to_string(),
                });
            }
        }
        Ok(())
    }
}
