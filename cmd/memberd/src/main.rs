use clap::{Args, Parser, Subcommand, ValueEnum};
use pkg_constants::controller::{
    DEFAULT_DEBOUNCE_MS, DEFAULT_MIN_READY_MS, DEFAULT_PROBE_INTERVAL_MS,
    DEFAULT_RESYNC_INTERVAL_SECS,
};
use pkg_constants::paths::{DEFAULT_CONFIG, DEFAULT_DATA_DIR};
use pkg_controllers::endpoint::{EndpointController, EndpointControllerConfig};
use pkg_controllers::local::LocalCluster;
use pkg_controllers::publish::{StatusSink, StorePublisher};
use pkg_controllers::statefulset::{StatefulSetConfig, StatefulSetController};
use pkg_state::client::StateStore;
use pkg_state::label_index::LabelIndex;
use pkg_state::watch::PodEventLog;
use pkg_types::config::{ControllerConfigFile, load_config_file};
use pkg_types::labels::parse_label_pairs;
use pkg_types::manifest::Manifest;
use pkg_types::selector::Selector;
use std::collections::HashSet;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "memberd",
    about = "Label-selector endpoint reconciler and ordinal identity assigner"
)]
struct Cli {
    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the endpoint and ordinal controllers until interrupted
    Run(RunArgs),
    /// Evaluate a selector against a label set
    Match(MatchArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Path to YAML config file
    #[arg(long, short, default_value = DEFAULT_CONFIG)]
    config: String,

    /// Directory for SlateDB state storage
    #[arg(long)]
    data_dir: Option<String>,

    /// Workload manifest with services, statefulsets and pods
    #[arg(long, short)]
    manifest: Option<String>,

    /// Coalescing window for endpoint recomputes
    #[arg(long)]
    debounce_ms: Option<u64>,
}

#[derive(Args, Debug)]
struct MatchArgs {
    /// Selector expression, e.g. "app=web,tier in (frontend,edge)"
    #[arg(long, short)]
    selector: String,

    /// Labels as key=value
    labels: Vec<String>,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run(args) => {
            run(args).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Match(args) => cmd_match(args),
    }
}

fn cmd_match(args: MatchArgs) -> anyhow::Result<ExitCode> {
    let selector: Selector = args.selector.parse()?;
    let labels = parse_label_pairs(&args.labels)?;
    if selector.matches(&labels) {
        println!("match");
        Ok(ExitCode::SUCCESS)
    } else {
        println!("no match");
        Ok(ExitCode::FAILURE)
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    // Load config file (returns defaults if file not found)
    let file_cfg: ControllerConfigFile = load_config_file(&args.config)?;
    info!("Config file: {}", args.config);

    // Merge: CLI args > config file > defaults
    let data_dir = args
        .data_dir
        .or(file_cfg.data_dir)
        .unwrap_or_else(|| DEFAULT_DATA_DIR.to_string());
    let manifest_path = args.manifest.or(file_cfg.manifest);
    let debounce_ms = args
        .debounce_ms
        .or(file_cfg.debounce_ms)
        .unwrap_or(DEFAULT_DEBOUNCE_MS);
    let resync_secs = file_cfg
        .resync_interval_secs
        .unwrap_or(DEFAULT_RESYNC_INTERVAL_SECS);
    let probe_ms = file_cfg
        .probe_interval_ms
        .unwrap_or(DEFAULT_PROBE_INTERVAL_MS);
    let min_ready_ms = file_cfg.min_ready_ms.unwrap_or(DEFAULT_MIN_READY_MS);
    let retry = file_cfg.retry.unwrap_or_default();

    info!("Starting memberd");
    info!("  Data dir:  {}", data_dir);
    info!("  Manifest:  {}", manifest_path.as_deref().unwrap_or("(none)"));
    info!("  Debounce:  {}ms", debounce_ms);
    info!("  Resync:    {}s", resync_secs);
    info!("  Probe:     {}ms (min ready {}ms)", probe_ms, min_ready_ms);
    info!(
        "  Retry:     {}ms..{}ms x{}",
        retry.initial_delay_ms, retry.max_delay_ms, retry.backoff_factor
    );

    let manifest: Manifest = match &manifest_path {
        Some(path) => load_config_file(path)?,
        None => Manifest::default(),
    };
    manifest.validate()?;

    let store = StateStore::new(&data_dir).await?;
    let sink = Arc::new(StorePublisher::new(store.clone()));
    let events = PodEventLog::default();

    // Endpoint records of Services no longer in the manifest.
    let wanted: HashSet<String> = manifest.services.iter().map(|s| s.key()).collect();
    for stale in sink.list_endpoints().await? {
        if !wanted.contains(&stale.key()) {
            info!("Removing endpoints of unknown service {}", stale.key());
            sink.remove_endpoints(&stale.namespace, &stale.service_name)
                .await?;
        }
    }

    for pod in manifest.pods {
        events.apply(pod).await;
    }

    let endpoints = EndpointController::new(
        LabelIndex::new(),
        events.clone(),
        sink.clone(),
        EndpointControllerConfig {
            debounce: Duration::from_millis(debounce_ms),
            resync_interval: Duration::from_secs(resync_secs.max(1)),
            publish_retry: retry.clone(),
        },
    );
    let dispatcher = endpoints.clone().start();
    for svc in manifest.services {
        endpoints.apply_service(svc).await;
    }

    let cluster = Arc::new(LocalCluster::new(events.clone()));
    let sets = StatefulSetController::new(
        cluster.clone(),
        cluster,
        sink,
        StatefulSetConfig {
            probe_interval: Duration::from_millis(probe_ms),
            min_ready: Duration::from_millis(min_ready_ms),
            retry,
        },
    );
    for set in manifest.statefulsets {
        sets.add(set).await?;
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    sets.shutdown().await;
    endpoints.shutdown().await;
    dispatcher.abort();
    store.close().await?;
    Ok(())
}
