mod config_commands;
mod gateway_command;

use std::{path::PathBuf, process::ExitCode};

use {
    clap::{Parser, Subcommand},
    tracing::error,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
};

use crate::{config_commands::ConfigAction, gateway_command::ServerOverrides};

#[derive(Parser)]
#[command(name = "clawport", about = "Clawport chat gateway", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error). `RUST_LOG` wins if set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, global = true, default_value_t = false)]
    json_logs: bool,

    /// Address to bind to (overrides config value).
    #[arg(long, global = true)]
    bind: Option<String>,
    /// Port to listen on (overrides config value).
    #[arg(long, global = true)]
    port: Option<u16>,
    /// Custom config directory (overrides default ~/.config/clawport/).
    #[arg(long, global = true, env = "CLAWPORT_CONFIG_DIR")]
    config_dir: Option<PathBuf>,
    /// Custom data directory; holds the instance lock.
    #[arg(long, global = true, env = "CLAWPORT_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the gateway (default when no subcommand is provided).
    Gateway,
    /// Configuration management.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

fn init_telemetry(cli: &Cli) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if cli.json_logs {
        registry
            .with(fmt::layer().json().with_target(true).with_thread_ids(false))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(true),
            )
            .init();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    if let Some(dir) = &cli.config_dir {
        clawport_config::set_config_dir(dir.clone());
    }
    if let Some(dir) = &cli.data_dir {
        clawport_config::set_data_dir(dir.clone());
    }

    let result = match cli.command {
        None | Some(Commands::Gateway) => {
            gateway_command::run(ServerOverrides {
                bind: cli.bind,
                port: cli.port,
            })
            .await
        },
        Some(Commands::Config { action }) => config_commands::handle_config(action),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            let message = format!("{e:#}");
            error!(error = %message, "clawport failed");
            ExitCode::FAILURE
        },
    }
}
