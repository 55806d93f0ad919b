use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;

use xlsx_json_service::config::{Config, ConfigError};
use xlsx_json_service::logging;

#[derive(Parser)]
#[command(name = "xlsx-json-service")]
#[command(about = "Converts uploaded Excel workbooks to JSON and serves the latest result", long_about = None)]
struct Cli {
    /// JSON config file; keys not present keep their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory holding uploaded workbooks
    #[arg(long)]
    upload_dir: Option<PathBuf>,

    /// Directory holding converted JSON files
    #[arg(long)]
    json_dir: Option<PathBuf>,

    /// Seconds between reconciliation scans
    #[arg(long)]
    scan_interval: Option<u64>,

    /// Only convert on the periodic scan, ignore filesystem events
    #[arg(long)]
    no_event_trigger: bool,

    /// Address to listen on, e.g. 127.0.0.1:5000
    #[arg(long)]
    bind: Option<String>,

    /// Log file appended to alongside stdout
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Cli {
    /// Defaults, then config file, then environment, then flags
    fn load_config(self) -> Result<Config, ConfigError> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        config.apply_env()?;

        if let Some(dir) = self.upload_dir {
            config.upload_dir = dir;
        }
        if let Some(dir) = self.json_dir {
            config.json_dir = dir;
        }
        if let Some(secs) = self.scan_interval {
            config.scan_interval_secs = secs;
        }
        if self.no_event_trigger {
            config.event_trigger = false;
        }
        if let Some(bind) = self.bind {
            config.bind_addr = bind;
        }
        if let Some(log_file) = self.log_file {
            config.log_file = Some(log_file);
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let config = match Cli::parse().load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let _log_guard = match logging::init(&config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialise logging: {}", e);
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(?config, "Starting xlsx-json-service");

    match xlsx_json_service::run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Service stopped with an error");
            ExitCode::FAILURE
        }
    }
}
