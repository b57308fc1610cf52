//! bridge-connect - pair with a wallet over an HTTP bridge from the terminal.

use anyhow::Result;
use clap::{Parser, Subcommand};

use bridge_connect::{commands, Config};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "bridge-connect")]
#[command(version = VERSION)]
#[command(about = "Encrypted wallet sessions over an HTTP bridge")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a new session and wait for the wallet to approve it
    Connect {
        /// URL of the app manifest shown by the wallet
        #[arg(long)]
        manifest_url: String,
        /// Seconds to wait for the wallet
        #[arg(long, default_value_t = 300)]
        wait: u64,
    },
    /// Show the stored wallet connection
    Status,
    /// Send an RPC request to the connected wallet
    Request {
        /// RPC method name
        #[arg(long)]
        method: String,
        /// Method parameter (JSON string), repeatable
        #[arg(long = "param")]
        params: Vec<String>,
        /// Seconds to wait for the response
        #[arg(long, default_value_t = 300)]
        wait: u64,
    },
    /// Notify the wallet and forget the stored connection
    Disconnect,
    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp_secs()
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;
    log::debug!("Loaded config: {:?}", config);

    match cli.command {
        Commands::Connect { manifest_url, wait } => {
            commands::connect::run(&config, &manifest_url, wait).await
        }
        Commands::Status => commands::session::status(&config).await,
        Commands::Request {
            method,
            params,
            wait,
        } => commands::session::request(&config, &method, params, wait).await,
        Commands::Disconnect => commands::session::disconnect(&config).await,
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}
