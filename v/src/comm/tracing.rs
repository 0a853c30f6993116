use chrono::{Datelike, Timelike};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{fmt, EnvFilter, Registry};

/// 日志输出格式 / Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// 紧凑文本（本地时间戳）/ Compact text with local timestamp
    Compact,
    /// Bunyan JSON，便于日志采集 / Bunyan JSON for log shippers
    Json,
}

struct LogTimer;

impl fmt::time::FormatTime for LogTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Local::now();
        write!(
            w,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:02}.{:03}",
            now.year(),
            now.month(),
            now.day(),
            now.hour(),
            now.minute(),
            now.second(),
            now.timestamp_subsec_millis()
        )
    }
}

/// 初始化全局日志订阅者 / Install the global tracing subscriber
///
/// `RUST_LOG` 优先于传入的 `level`；重复初始化时静默忽略
/// `RUST_LOG` takes precedence over `level`; repeated calls are no-ops
pub fn init_tracing(service: &str, level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    LogTracer::init().ok();

    // 直接设置全局订阅者，避免 try_init 重复安装 LogTracer
    // Set the global default directly; try_init would install LogTracer again
    let installed = match format {
        LogFormat::Compact => {
            let subscriber = fmt::SubscriberBuilder::default()
                .with_env_filter(filter)
                .with_timer(LogTimer)
                .compact()
                .with_target(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)
        }
        LogFormat::Json => {
            let subscriber = Registry::default()
                .with(filter)
                .with(JsonStorageLayer)
                .with(BunyanFormattingLayer::new(service.to_string(), std::io::stdout));
            tracing::subscriber::set_global_default(subscriber)
        }
    };
    if installed.is_err() {
        tracing::debug!("global subscriber already installed");
    }
}
