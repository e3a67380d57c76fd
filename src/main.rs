//! relaynet: join a relay network, or run a TCP relay hub.

use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};

use relaynet::config::{Config, CONFIG_FILE_NAME, DEFAULT_RELAY_ADDRESS};
use relaynet::service::packet_log::PacketLog;
use relaynet::service::tasks::Heartbeat;
use relaynet::transport::backend;
use relaynet::transport::relay_server::RelayServer;
use relaynet::utils::logging::init_logging;
use relaynet::{Client, ProtocolError, Result};

#[derive(Parser, Debug)]
#[command(name = "relaynet")]
#[command(about = "Ad-hoc virtual networks over a message relay")]
struct Args {
    /// Service source locations; the first one holding relaynet.toml supplies the configuration
    sources: Vec<PathBuf>,

    /// Configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Run the TCP relay hub instead of a client
    #[arg(short, long)]
    serve: bool,

    /// Broadcast a heartbeat every SECS seconds while alive
    #[arg(long, value_name = "SECS")]
    heartbeat: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("relaynet: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = init_logging(&config.logging) {
        eprintln!("relaynet: {e}");
        return ExitCode::FAILURE;
    }

    let outcome = if args.serve {
        serve(&config).await
    } else {
        run_client(&config, args.heartbeat).await
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "exiting");
            ExitCode::FAILURE
        }
    }
}

fn load_config(args: &Args) -> Result<Config> {
    let path = match &args.config {
        Some(path) => path.clone(),
        None => find_config(&args.sources).ok_or_else(|| {
            ProtocolError::ConfigError(format!(
                "no configuration given and no {CONFIG_FILE_NAME} found in the sources"
            ))
        })?,
    };

    let mut config = Config::from_file(&path)?;
    config.apply_env();
    config.validate_strict()?;
    Ok(config)
}

fn find_config(sources: &[PathBuf]) -> Option<PathBuf> {
    sources.iter().find_map(|source| {
        let candidate = if source.is_dir() {
            source.join(CONFIG_FILE_NAME)
        } else {
            source.clone()
        };
        let named = candidate.file_name() == Some(Path::new(CONFIG_FILE_NAME).as_os_str());
        (named && candidate.is_file()).then_some(candidate)
    })
}

async fn serve(config: &Config) -> Result<()> {
    let address = config.search_str("address").unwrap_or(DEFAULT_RELAY_ADDRESS);
    let server = RelayServer::bind(address).await?;
    info!(address = %server.local_addr()?, "serving relay hub");
    server.run_until_ctrl_c().await
}

async fn run_client(config: &Config, heartbeat: Option<u64>) -> Result<()> {
    let transport = backend::open(config)?;
    let mut builder = Client::builder(transport)
        .hostname(config.hostname())
        .discovery(config.discovery.clone())
        .service(PacketLog::factory);
    if let Some(secs) = heartbeat {
        builder = builder.service(Heartbeat::factory(Duration::from_secs(secs)));
    }
    let client = builder.build()?;

    tokio::select! {
        started = client.start() => {
            started?;
            info!(members = ?client.members(), "running, press Ctrl-C to leave");
            tokio::signal::ctrl_c().await?;
        }
        interrupted = tokio::signal::ctrl_c() => {
            interrupted?;
            info!("interrupted during startup");
        }
    }

    client.shutdown().await;
    Ok(())
}
