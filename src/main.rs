use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use trafficctl::config::{DriverConfig, LogFormat, LoggingConfig};
use trafficctl::transfer::{TransferFetcher, TransferRequest};

#[derive(Parser)]
#[command(
    name = "trafficctl",
    about = "Session-pooled orchestration driver for traffic-generator test controllers",
    version,
    long_about = None
)]
struct Cli {
    /// Config file (overrides TRAFFICCTL_CONFIG and the system path)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (control API + session pool)
    Serve {
        /// Bind address (defaults to `api.bind` from the config)
        #[arg(long)]
        bind: Option<String>,
    },

    /// Fetch a test configuration file the way `load-config` does
    Fetch {
        /// Location URI (http, https, ftp, sftp or scp)
        uri: String,

        /// Output file path (defaults to the file name in the URI)
        #[arg(long)]
        output: Option<PathBuf>,

        /// User for the transfer, overriding credentials in the URI
        #[arg(long, requires = "password")]
        user: Option<String>,

        /// Password for the transfer
        #[arg(long, env = "TRAFFICCTL_FETCH_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Print the effective configuration as TOML
    ShowConfig,
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => DriverConfig::load(path)?,
        None => DriverConfig::load_or_default(),
    };
    init_tracing(&config.logging);

    match cli.command {
        Commands::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.api.bind.clone());
            tracing::info!(%bind, "Starting trafficctl daemon");
            trafficctl::serve(&bind, config).await?;
        }
        Commands::Fetch {
            uri,
            output,
            user,
            password,
        } => {
            let mut request = TransferRequest::parse(&uri)?;
            if let (Some(user), Some(password)) = (user, password) {
                request = request.with_credentials(user, password);
            }
            let output = output.unwrap_or_else(|| PathBuf::from(request.destination()));

            let fetcher = TransferFetcher::new(&config.transfer)?;
            let payload = fetcher.fetch(&request).await?;
            std::fs::write(&output, &payload)
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!(
                "Fetched {} bytes from {} to {}",
                payload.len(),
                request.redacted(),
                output.display()
            );
        }
        Commands::ShowConfig => {
            let rendered = toml::to_string_pretty(&config)?;
            println!("{rendered}");
        }
    }

    Ok(())
}
