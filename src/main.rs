use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use log::{error, info};
use tcp_replay_proxy::configuration::{Config, ServeArgs};
use tcp_replay_proxy::data_capture::{describe_entry, ReplayLogReader};
use tcp_replay_proxy::error_handling::types::CaptureError;
use tcp_replay_proxy::proxy::{LogSink, ProxyServer};

#[derive(Parser)]
#[command(name = "tcp-replay-proxy")]
#[command(version)]
#[command(about = "Reverse TCP proxy that records client traffic into a replay log")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Proxy connections to the upstream server and capture them
    Serve(ServeArgs),
    /// Print the entries of a replay log
    Inspect {
        file: PathBuf,

        /// One JSON object per entry
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Inspect { file, json } => {
            if let Err(e) = inspect(&file, json).await {
                error!("Unable to read replay log {}: {}", file.display(), e);
                std::process::exit(1);
            }
        }
    }
}

async fn serve(args: ServeArgs) {
    let config = match Config::load(&args) {
        Ok(config) => config,
        Err(e) => {
            error!("Unable to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    info!("Configuration loaded successfully");

    let server = match ProxyServer::bind(config, Arc::new(LogSink)).await {
        Ok(server) => server,
        Err(e) => {
            error!("Unable to start the proxy: {}", e);
            std::process::exit(1);
        }
    };

    let result = server
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Unable to listen for interrupts: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    match result {
        Ok(report) => info!(
            "{} connection(s) accepted, {} failed, {} entries written",
            report.connections_accepted, report.connections_failed, report.entries_written
        ),
        Err(e) => {
            error!("Proxy stopped with an error: {}", e);
            std::process::exit(1);
        }
    }
}

async fn inspect(path: &Path, json: bool) -> Result<(), CaptureError> {
    let file = tokio::fs::File::open(path).await?;
    let mut reader = ReplayLogReader::new(file);
    let mut index = 0;
    while let Some(entry) = reader.next_entry().await? {
        if json {
            let line = serde_json::to_string(&entry)
                .map_err(|e| CaptureError::Encode(e.to_string()))?;
            println!("{}", line);
        } else {
            println!("{}", describe_entry(index, &entry));
        }
        index += 1;
    }
    Ok(())
}
