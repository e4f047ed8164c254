use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use agora_agent::{ChatSettings, Orchestrator};
use agora_core::config::{Config, GatewayConfig, LoggingConfig};
use agora_core::context::StaticContext;
use agora_core::model::McpTransport;
use agora_core::store::{Store, ToolCatalog};
use agora_gateway::GatewayState;
use agora_jobs::{JobQueue, Worker, WorkerConfig};
use agora_providers::Gateway;
use agora_tools::{ConnectionManager, McpTransportFactory};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "agora",
    about = "Streaming chat orchestrator with sandboxed MCP tool execution",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP gateway, tool worker pool and idle sweeper
    Serve {
        /// Port to listen on (overrides gateway.port)
        #[arg(long)]
        port: Option<u16>,
    },

    /// Show configuration paths, queue depth and whether a gateway is running
    Status,

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Registered MCP servers
    Servers {
        #[command(subcommand)]
        action: ServerAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Show current configuration
    Show,
    /// Get a config value by dotted path (e.g. gateway.port)
    Get { key: String },
}

#[derive(Subcommand)]
enum ServerAction {
    /// List servers with their status and synced tools
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let mut config = Config::load(&config_path)?;
    init_logging(cli.verbose, config.logging.as_ref());

    match cli.command {
        Commands::Serve { port } => {
            if let Some(port) = port {
                config
                    .gateway
                    .get_or_insert_with(|| GatewayConfig { port, bind: None })
                    .port = port;
            }
            serve(config).await?;
        }
        Commands::Status => status(&config_path, &config).await?,
        Commands::Config { action } => match action {
            ConfigAction::Show => {
                let json = serde_json::to_string_pretty(&config)?;
                println!("{json}");
            }
            ConfigAction::Get { key } => match config.get_path(&key) {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => anyhow::bail!("no config value at '{key}'"),
            },
        },
        Commands::Servers {
            action: ServerAction::List,
        } => list_servers(&config).await?,
    }

    Ok(())
}

/// RUST_LOG wins; otherwise `logging.level`, then `--verbose`, plus any
/// per-crate `logging.filters`.
fn init_logging(verbose: bool, logging: Option<&LoggingConfig>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = logging
            .and_then(|l| l.level.clone())
            .unwrap_or_else(|| if verbose { "debug" } else { "info" }.to_string());
        let mut filter = EnvFilter::new(level);
        for directive in logging.map(|l| l.filters.as_slice()).unwrap_or_default() {
            match directive.parse() {
                Ok(d) => filter = filter.add_directive(d),
                Err(e) => eprintln!("Ignoring invalid log filter '{directive}': {e}"),
            }
        }
        filter
    });

    let json = logging.is_some_and(|l| l.format == "json");
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let (warnings, errors) = config.validate();
    for warning in &warnings {
        warn!("{warning}");
    }
    if !errors.is_empty() {
        anyhow::bail!("invalid configuration:\n  {}", errors.join("\n  "));
    }

    let config = Arc::new(config);
    let store = Arc::new(Store::open(config.storage_dir()).await?);
    let queue = Arc::new(JobQueue::open(&config.queue_dir()).await?);
    let gateway = Arc::new(Gateway::from_config(&config));
    let tools = Arc::new(ConnectionManager::from_config(
        &config,
        store.clone(),
        Arc::new(McpTransportFactory),
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        store.clone(),
        gateway,
        queue.clone(),
        Arc::new(StaticContext::new(config.profile_context().map(str::to_string))),
        ChatSettings::from_config(&config),
    ));
    let worker = Arc::new(Worker::new(
        store.clone(),
        store.clone(),
        tools.clone(),
        queue.clone(),
        WorkerConfig::from_config(&config),
    ));

    let state = GatewayState::new(config.clone(), orchestrator, queue.clone(), tools.clone());
    #[cfg(feature = "metrics")]
    let state = {
        let handle = agora_gateway::metrics::install_prometheus_recorder()?;
        agora_gateway::metrics::spawn_job_recorder(worker.subscribe());
        state.with_prometheus(handle)
    };

    let shutdown = CancellationToken::new();
    let worker_task = worker.spawn(shutdown.clone());
    let sweeper_task = tools
        .clone()
        .spawn_sweeper(Duration::from_millis(config.sweep_interval_ms()), shutdown.clone());

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => warn!(error = %e, "Failed to listen for CTRL+C, shutting down"),
        }
        signal.cancel();
    });

    info!(
        queue_depth = queue.depth(),
        storage = %config.storage_dir().display(),
        "Starting Agora"
    );
    let served = agora_gateway::start_gateway(Arc::new(state), shutdown.clone()).await;

    shutdown.cancel();
    if let Err(e) = worker_task.await {
        warn!(error = %e, "Worker pool task failed");
    }
    if let Err(e) = sweeper_task.await {
        warn!(error = %e, "Idle sweeper task failed");
    }
    tools.disconnect_all().await;
    info!(remaining_jobs = queue.depth(), "Agora stopped");
    served
}

async fn status(config_path: &Path, config: &Config) -> anyhow::Result<()> {
    let addr = format!("{}:{}", config.gateway_bind(), config.gateway_port());
    println!("Agora v{}", env!("CARGO_PKG_VERSION"));
    println!("Config: {}", config_path.display());
    println!("Storage: {}", config.storage_dir().display());
    println!("Queue: {}", config.queue_dir().display());
    println!("Gateway: http://{addr}");

    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(2))
        .build()?;
    match client.get(format!("http://{addr}/health")).send().await {
        Ok(resp) if resp.status().is_success() => {
            let health: serde_json::Value = resp.json().await?;
            println!("Status: running (v{})", health["version"].as_str().unwrap_or("?"));
            println!("Queued jobs: {}", health["queueDepth"]);
            println!("Active streams: {}", health["activeStreams"]);
            println!("Live connections: {}", health["connections"]);
        }
        Ok(resp) => println!("Status: unhealthy ({})", resp.status()),
        Err(_) => println!("Status: not running"),
    }
    Ok(())
}

async fn list_servers(config: &Config) -> anyhow::Result<()> {
    let store = Store::open(config.storage_dir()).await?;
    let servers = store.list_servers().await?;
    if servers.is_empty() {
        println!("No MCP servers registered.");
        return Ok(());
    }

    println!(
        "{:<20} {:<14} {:<6} {:>6}  {}",
        "ID", "STATUS", "TOOLS", "CALLS", "TRANSPORT"
    );
    for server in servers {
        let tools = store.server_tools(&server.id).await?;
        let transport = match &server.transport {
            McpTransport::Stdio { command, args, .. } => {
                format!("stdio: {command} {}", args.join(" ")).trim_end().to_string()
            }
            McpTransport::Http { url, .. } => format!("http: {url}"),
        };
        let status = serde_json::to_value(server.status)?;
        println!(
            "{:<20} {:<14} {:<6} {:>6}  {}",
            server.id,
            status.as_str().unwrap_or("unknown"),
            tools.len(),
            server.tool_call_count,
            transport
        );
        if let Some(reason) = &server.status_reason {
            println!("{:<20} reason: {reason}", "");
        }
    }
    Ok(())
}
