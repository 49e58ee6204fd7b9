use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use structural_datastore::{
    BackendKind, DataManager, StorageHandler,
    config::{StoreConfig, read_config_file},
};
use tracing::{error, info, level_filters::LevelFilter, trace};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Target {
    /// Relational tables from `*/init_rdb`
    Rdb,
    /// Time-series store from `dynamic_data/init_tsdb`
    Tsdb,
    All,
}

/// Seed the relational and time-series stores from the data drive
#[derive(Debug, Clone, Parser)]
struct Args {
    /// Config file (JSON); the environment is used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data drive root, overrides the config file and DATADRIVE
    #[arg(short, long)]
    datadrive: Option<PathBuf>,

    target: Target,
}

fn init() {
    let filter = filter::Targets::new().with_targets(vec![
        ("structural_datastore", LevelFilter::DEBUG),
        ("datastore_init", LevelFilter::TRACE),
        ("sqlx", LevelFilter::WARN),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    init();
    let args = Args::parse();
    trace!("started with args: {args:?}");

    let mut config = match &args.config {
        Some(path) => read_config_file(path)?,
        None => StoreConfig::from_env(),
    };
    if let Some(datadrive) = args.datadrive {
        config.datadrive = datadrive;
    }

    let mut kinds = vec![BackendKind::File];
    if matches!(args.target, Target::Rdb | Target::All) {
        kinds.push(BackendKind::Relational);
    }
    if matches!(args.target, Target::Tsdb | Target::All) {
        kinds.push(BackendKind::TimeSeries);
    }

    let handler = Arc::new(StorageHandler::connect(&config, &kinds).await?);
    let manager = DataManager::new(handler.clone());

    let result = seed(&manager, args.target).await;
    if let Err(e) = handler.close().await {
        error!("failed to close backends: {e}");
    }
    result?;

    info!("seeded {:?} from {}", args.target, config.datadrive.display());
    Ok(())
}

async fn seed(manager: &DataManager, target: Target) -> anyhow::Result<()> {
    if matches!(target, Target::Rdb | Target::All) {
        manager.init_rdb().await?;
    }
    if matches!(target, Target::Tsdb | Target::All) {
        manager.init_tsdb(BackendKind::TimeSeries).await?;
    }
    Ok(())
}
