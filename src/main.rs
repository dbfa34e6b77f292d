//! CDC pipeline: streams PostgreSQL logical replication changes through
//! a transform stage and publishes them to Kafka.

mod config;
mod errors;
mod model;
mod pipeline;
mod replication;
mod sink;
mod supervisor;

use crate::config::Config;
use crate::supervisor::Supervisor;
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "cdc-pipe", about = "PostgreSQL logical replication to Kafka pipeline", version)]
struct Args {
    /// Path to the YAML configuration file.
    #[arg(long, default_value = "./config.yaml")]
    config: PathBuf,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Pretty)]
    log_format: LogFormat,
}

#[derive(Clone, Debug, clap::ValueEnum)]
enum LogFormat {
    Pretty,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_tracing(&args.log_format);

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::from(1);
        }
    };

    let supervisor = match Supervisor::new(config) {
        Ok(supervisor) => supervisor,
        Err(e) => {
            error!(error = %e, "failed to initialize pipeline");
            return ExitCode::from(1);
        }
    };

    match supervisor.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "pipeline exited with error");
            ExitCode::from(1)
        }
    }
}

fn init_tracing(format: &LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match format {
        LogFormat::Pretty => {
            fmt().with_env_filter(filter).with_target(false).with_thread_ids(false).init();
        }
        LogFormat::Json => {
            fmt().json().with_env_filter(filter).with_target(false).init();
        }
    }
}
