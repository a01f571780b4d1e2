use anyhow::{Context, Result};
use clap::Args;
use mqtt3::broker::{BrokerConfig, MqttBroker};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

#[derive(Args, Debug)]
pub struct BrokerCommand {
    /// Configuration file path (JSON format); flags override its values
    #[arg(long, short)]
    pub config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, short = 'a')]
    pub address: Option<IpAddr>,

    /// TCP port to listen on
    #[arg(long, short = 'p')]
    pub port: Option<u16>,

    /// Directory holding the message journal
    #[arg(long)]
    pub storage_dir: Option<PathBuf>,

    /// Journal size in bytes above which it is compacted
    #[arg(long)]
    pub storage_size_limit: Option<u64>,

    /// Maximum number of concurrent connections
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// Multiple of the client keep-alive after which silent clients are dropped
    #[arg(long)]
    pub keep_alive_grace: Option<f64>,

    /// Keep the journal from the previous run instead of starting empty
    #[arg(long)]
    pub keep_storage: bool,

    /// Allow anonymous access (no authentication required)
    #[arg(long, num_args = 0..=1, default_missing_value = "true")]
    pub allow_anonymous: Option<bool>,

    /// Password file path (`username:argon2-hash` per line)
    #[arg(long)]
    pub password_file: Option<PathBuf>,
}

pub async fn execute(cmd: BrokerCommand, verbose: bool, debug: bool) -> Result<()> {
    crate::init_basic_tracing(verbose, debug);

    info!("Starting MQTT 3.1.1 broker...");

    let config = build_config(&cmd).await?;
    config
        .validate()
        .context("Configuration validation failed")?;

    if config.enable_persistence && !cmd.keep_storage {
        clear_storage(&config.storage_path).await?;
    }

    let mut broker = MqttBroker::with_config(config.clone())
        .await
        .context("Failed to create MQTT broker")?;

    let mut signals = ShutdownSignals::install().context("Failed to install signal handlers")?;
    let handle = broker.shutdown_handle();
    let signal_task = tokio::spawn(async move {
        let name = signals.recv().await;
        info!("Received {}, shutting down gracefully...", name);
        handle.shutdown();
    });

    println!("MQTT 3.1.1 broker listening on {}", broker.local_addr());
    println!("  Storage: {}", config.storage_path.display());
    println!("  Max connections: {}", config.max_connections);

    let result = broker.run().await;
    signal_task.abort();
    result.context("Broker error")?;

    println!("MQTT broker stopped");
    Ok(())
}

async fn build_config(cmd: &BrokerCommand) -> Result<BrokerConfig> {
    let mut config = match &cmd.config {
        Some(path) => {
            debug!("Loading configuration from: {:?}", path);
            load_config_from_file(path)
                .await
                .with_context(|| format!("Failed to load config from {path:?}"))?
        }
        None => BrokerConfig::default(),
    };

    if let Some(address) = cmd.address {
        config = config.with_address(address);
    }
    if let Some(port) = cmd.port {
        config = config.with_port(port);
    }
    if let Some(ref dir) = cmd.storage_dir {
        config = config.with_storage_path(dir.clone());
    }
    if let Some(limit) = cmd.storage_size_limit {
        config = config.with_storage_size_limit(limit);
    }
    if let Some(max) = cmd.max_connections {
        config = config.with_max_connections(max);
    }
    if let Some(factor) = cmd.keep_alive_grace {
        config = config.with_keep_alive_grace_factor(factor);
    }
    if let Some(ref path) = cmd.password_file {
        if !path.exists() {
            anyhow::bail!("Password file not found: {}", path.display());
        }
        config.auth.password_file = Some(path.clone());
        if cmd.allow_anonymous.is_none() {
            info!("Password file provided, anonymous access disabled by default");
            config.auth.allow_anonymous = false;
        }
    }
    if let Some(allow) = cmd.allow_anonymous {
        config.auth.allow_anonymous = allow;
    }

    Ok(config)
}

async fn load_config_from_file(config_path: &Path) -> Result<BrokerConfig> {
    let contents = tokio::fs::read_to_string(config_path)
        .await
        .context("Failed to read config file")?;

    serde_json::from_str(&contents).context("Failed to parse config file as JSON")
}

async fn clear_storage(path: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {
            info!("Cleared storage directory {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to clear storage at {}", path.display())),
    }
}

#[cfg(unix)]
struct ShutdownSignals {
    terminate: tokio::signal::unix::Signal,
    interrupt: tokio::signal::unix::Signal,
    quit: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
            quit: signal(SignalKind::quit())?,
        })
    }

    async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.quit.recv() => "SIGQUIT",
        }
    }
}

#[cfg(not(unix))]
struct ShutdownSignals;

#[cfg(not(unix))]
impl ShutdownSignals {
    #[allow(clippy::unnecessary_wraps)]
    fn install() -> std::io::Result<Self> {
        Ok(Self)
    }

    async fn recv(&mut self) -> &'static str {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Unable to listen for shutdown signal: {e}");
            std::future::pending::<()>().await;
        }
        "Ctrl+C"
    }
}
