use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use v::{init_tracing, HealthCheck, LogFormat};

use v_im_cluster::broker::{BrokerHandles, MemoryBroker, RedisBroker};
use v_im_cluster::config::{self, BrokerKind, NodeSettings};
use v_im_cluster::storage::{MessageStore, PgMessageStore};
use v_im_cluster::tasks::{ArchiveLock, ArchiveSettings, MessageArchiver};
use v_im_cluster::{AppError, AppResult, ChatNode, Keyspace};

const SERVICE: &str = "v-im-cluster";

#[derive(Parser, Debug)]
#[command(author, version, about = "v IM cluster node: routing, presence, dead letters, archival", long_about = None)]
struct Args {
    /// 额外的配置文件（覆盖 config/default.toml）
    /// Extra config file layered over config/default.toml
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 启动节点（默认）/ Run the node (default)
    Server,
    /// 立即执行一次归档 / Run one archive pass now
    Archive,
    /// 打印版本 / Print version
    Version,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let result = match args.command.unwrap_or(Command::Server) {
        Command::Version => {
            println!("{} {}", SERVICE, env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Command::Server => run_server(args.config.as_deref()).await,
        Command::Archive => run_archive(args.config.as_deref()).await,
    };
    if let Err(e) = result {
        error!("❌ {}", e);
        eprintln!("{}: {}", SERVICE, e);
        std::process::exit(e.exit_code());
    }
}

fn bootstrap(explicit: Option<&str>) -> AppResult<NodeSettings> {
    let (cm, settings) = config::load(explicit)?;
    let format = if settings.logging.json {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };
    init_tracing(SERVICE, &settings.logging.level, format);
    cm.print_sources_info();
    Ok(settings)
}

async fn connect_broker(settings: &NodeSettings) -> AppResult<BrokerHandles> {
    Ok(match settings.broker.kind {
        BrokerKind::Redis => BrokerHandles::from_shared(Arc::new(
            RedisBroker::connect(&settings.broker.url).await?,
        )),
        BrokerKind::Memory => {
            warn!("⚠️  memory broker: presence and routing stay inside this process");
            BrokerHandles::from_shared(Arc::new(MemoryBroker::new()))
        }
    })
}

async fn connect_store(settings: &NodeSettings) -> AppResult<Option<(PgMessageStore, sqlx::PgPool)>> {
    let Some(db) = &settings.database else {
        return Ok(None);
    };
    let pool = v::connect_pool(db).await?;
    let store = PgMessageStore::new(pool.clone(), &settings.archive.hot_table, &settings.archive.archive_table)
        .map_err(|e| AppError::config(e.to_string()))?;
    store.ensure_archive_table().await?;
    Ok(Some((store, pool)))
}

async fn run_server(explicit: Option<&str>) -> AppResult<()> {
    let settings = bootstrap(explicit)?;
    info!("🎯 Starting {} node {}", SERVICE, settings.node.id);

    let broker = connect_broker(&settings).await?;

    let mut health: Vec<Arc<dyn HealthCheck>> = Vec::new();
    let store: Option<Arc<dyn MessageStore>> = if settings.archive.enabled {
        match connect_store(&settings).await? {
            Some((store, pool)) => {
                health.push(Arc::new(pool));
                Some(Arc::new(store))
            }
            None => {
                warn!("⚠️  archive enabled but no [database.default] configured, archival disabled");
                None
            }
        }
    } else {
        None
    };

    let node = health
        .into_iter()
        .fold(ChatNode::from_settings(&settings, broker, store), |node, check| {
            node.with_health_check(check)
        });
    let node = Arc::new(node);
    let handle = node.start().await?;

    let http = tokio::spawn(v_im_cluster::api::serve(
        node.clone(),
        settings.node.http_host.clone(),
        settings.node.http_port,
        handle.shutdown_signal(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("🛑 shutdown requested");
    handle.shutdown().await;
    match http.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("HTTP server stopped with error: {}", e),
        Err(e) => warn!("HTTP server task failed: {}", e),
    }
    Ok(())
}

async fn run_archive(explicit: Option<&str>) -> AppResult<()> {
    let settings = bootstrap(explicit)?;
    let (store, _pool) = connect_store(&settings)
        .await?
        .ok_or_else(|| AppError::config("[database.default] is required for `archive`"))?;

    let lock = match (settings.broker.kind, settings.archive.lock_ttl) {
        (BrokerKind::Redis, Some(ttl)) => {
            let broker = connect_broker(&settings).await?;
            let keys = Keyspace::new(settings.broker.key_prefix.clone());
            Some(ArchiveLock::new(broker.kv, keys.archive_lock(), settings.node.id.clone(), ttl))
        }
        _ => None,
    };

    let archiver = MessageArchiver::new(
        Arc::new(store),
        ArchiveSettings::from(&settings.archive),
        lock,
    );
    let report = archiver.run_once().await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&report).map_err(|e| AppError::Internal(e.into()))?
    );
    Ok(())
}
