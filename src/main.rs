use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use flowrelay::{config, enrich, forward, ingress, pipeline, stats, stats_server, template};
use tracing::{error, info};

/// flowrelay — transparent NetFlow v9 / IPFIX relay with AS enrichment.
#[derive(Parser, Debug)]
#[command(name = "flowrelay", version, about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: String,

    /// Override general.listen_port.
    #[arg(long)]
    listen_port: Option<u16>,

    /// Override general.stats_port.
    #[arg(long)]
    stats_port: Option<u16>,
}

const BANNER: &str = r#"
   __ _                        _
  / _| | _____      ___ __ ___| | __ _ _   _
 | |_| |/ _ \ \ /\ / / '__/ _ \ |/ _` | | | |
 |  _| | (_) \ V  V /| | |  __/ | (_| | |_| |
 |_| |_|\___/ \_/\_/ |_|  \___|_|\__,_|\__, |
                                       |___/
"#;

/// How long shutdown may spend draining queues.
const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

/// Startup failures mapped to the documented exit codes.
enum Fatal {
    Config(anyhow::Error),
    Bind(anyhow::Error),
    Internal(anyhow::Error),
}

impl Fatal {
    fn exit_code(&self) -> ExitCode {
        match self {
            Fatal::Config(_) => ExitCode::from(1),
            Fatal::Bind(_) => ExitCode::from(2),
            Fatal::Internal(_) => ExitCode::from(3),
        }
    }

    fn message(&self) -> String {
        match self {
            Fatal::Config(err) => format!("configuration error: {err:#}"),
            Fatal::Bind(err) => format!("bind error: {err:#}"),
            Fatal::Internal(err) => format!("fatal error: {err:#}"),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(fatal) => {
            // Tracing may not be initialized yet for config errors.
            eprintln!("{}", fatal.message());
            error!("{}", fatal.message());
            fatal.exit_code()
        }
    }
}

async fn run() -> Result<(), Fatal> {
    let cli = Cli::parse();

    let mut app_config = config::AppConfig::from_file(&cli.config).map_err(Fatal::Config)?;
    if let Some(port) = cli.listen_port {
        app_config.general.listen_port = port;
    }
    if let Some(port) = cli.stats_port {
        app_config.general.stats_port = port;
    }
    app_config.validate().map_err(Fatal::Config)?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(app_config.log_directive())),
        )
        .init();

    println!("{BANNER}");
    info!(version = env!("CARGO_PKG_VERSION"), "starting flowrelay");

    if app_config.enrichment.geoip_enabled {
        info!("geoip_enabled set but no GeoIP collaborator is built in, ignoring");
    }
    if app_config.enrichment.reverse_dns {
        info!("reverse_dns set but no rDNS collaborator is built in, ignoring");
    }

    let collectors = app_config.collector_addrs().map_err(Fatal::Config)?;
    let enricher = Arc::new(
        enrich::Enricher::from_config(&app_config.enrichment).map_err(Fatal::Config)?,
    );

    let ingress_socket = ingress::bind(
        app_config.general.listen_port,
        app_config.general.buffer_size,
    )
    .await
    .map_err(Fatal::Bind)?;
    let forwarder = forward::Forwarder::bind(
        collectors,
        app_config.general.buffer_size,
        app_config.forwarding.max_packet_size,
    )
    .await
    .map_err(Fatal::Bind)?;
    let stats_listener = stats_server::bind(app_config.general.stats_port)
        .await
        .map_err(Fatal::Bind)?;

    let stats = Arc::new(stats::Stats::new());
    let cache = Arc::new(template::TemplateCache::default());

    let relay = pipeline::Pipeline::start(
        &app_config,
        stats.clone(),
        cache.clone(),
        enricher,
        ingress_socket,
        forwarder,
    );

    let stats_ctx = Arc::new(stats_server::StatsContext {
        stats,
        cache,
        config: app_config,
    });
    let stats_handle = tokio::spawn(stats_server::run(stats_listener, stats_ctx));

    wait_for_signal().await.map_err(Fatal::Internal)?;

    relay.shutdown(SHUTDOWN_DEADLINE).await;
    stats_handle.abort();
    info!("goodbye");
    Ok(())
}

/// Block until SIGINT or SIGTERM.
async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received"),
            _ = term.recv() => info!("SIGTERM received"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("interrupt received");
    }
    Ok(())
}
