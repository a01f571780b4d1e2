use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{broker_cmd, passwd_cmd};

#[derive(Parser)]
#[command(name = "mqttv3")]
#[command(about = "MQTT 3.1.1 broker launcher")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Enable debug output
    #[arg(long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the MQTT broker
    Broker(broker_cmd::BrokerCommand),
    /// Manage the broker password file
    Passwd(passwd_cmd::PasswdCommand),
}

pub(crate) fn init_basic_tracing(verbose: bool, debug: bool) {
    let default_level = if debug {
        "debug"
    } else if verbose {
        "info"
    } else {
        "warn"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result: Result<()> = match cli.command {
        Commands::Broker(cmd) => broker_cmd::execute(cmd, cli.verbose, cli.debug).await,
        Commands::Passwd(cmd) => {
            init_basic_tracing(cli.verbose, cli.debug);
            passwd_cmd::execute(&cmd).await
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
