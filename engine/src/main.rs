// Waypoint step executor
// Main entry point for the waypoint binary

use clap::Parser;
use waypoint_engine::cli::{Cli, Command};
use waypoint_engine::config::Config;
use waypoint_engine::handlers::{
    handle_cancel, handle_create, handle_pending, handle_run, handle_serve, handle_sign,
    handle_status, CreateArgs, OutputFormat,
};
use waypoint_engine::telemetry::init_telemetry_with_level;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Determine output format
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    // Signing needs no config, database, or logging
    if let Command::Sign {
        key,
        body,
        timestamp,
    } = &cli.command
    {
        return handle_sign(key, body, *timestamp, format);
    }

    // Load configuration (or use custom path if provided)
    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // --log wins over the config file; RUST_LOG wins over both
    let level = cli.log.as_deref().unwrap_or(&config.core.log_level);
    init_telemetry_with_level(level);

    let version = env!("CARGO_PKG_VERSION");
    let commit = env!("GIT_COMMIT_HASH");
    let timestamp = env!("BUILD_TIMESTAMP");
    tracing::info!("Waypoint v{} ({} - {})", version, commit, timestamp);

    match cli.command {
        Command::Serve => {
            tracing::info!("Starting server on {}", config.server.bind_addr);
            handle_serve(&config).await
        }

        Command::Create {
            operation_id,
            user,
            message,
            max_steps,
            no_start,
        } => {
            let args = CreateArgs {
                operation_id,
                user,
                message,
                max_steps,
                auto_start: !no_start,
            };
            handle_create(&config, args, format).await
        }

        Command::Status {
            operation_id,
            history,
            limit,
        } => handle_status(&config, &operation_id, history, limit, format).await,

        Command::Run {
            operation_id,
            max_steps,
        } => {
            tracing::info!("Running {} in-process", operation_id);
            handle_run(&config, &operation_id, max_steps, format).await
        }

        Command::Pending { user } => handle_pending(&config, user, format).await,

        Command::Cancel { operation_id } => handle_cancel(&config, &operation_id, format).await,

        Command::Sign { .. } => Ok(()),
    }
}
