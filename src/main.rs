//! authflow - OAuth 2.1 authorization for protected MCP servers
//!
#![doc = "Main entry point for the authflow command-line tool."]

use anyhow::Result;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use authflow::cli::{Cli, Commands};
use authflow::commands;
use authflow::config::{Config, DEFAULT_CONFIG_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Initialize tracing
    init_tracing(cli.verbose, cli.json_logs);

    // Load configuration
    let config_path = cli.config.as_deref().unwrap_or(DEFAULT_CONFIG_PATH);
    let config = Config::load(config_path, &cli)?;

    // Validate configuration
    config.validate()?;

    // Execute command
    match cli.command {
        Commands::Connect {
            server,
            no_browser,
            trace,
        } => {
            tracing::info!(server_id = %server, "Starting authorization");
            commands::connect::run_connect(config, &server, no_browser, trace).await?;
            Ok(())
        }
        Commands::Callback { url } => {
            tracing::info!("Delivering authorization callback");
            commands::callback::run_callback(config, &url).await?;
            Ok(())
        }
        Commands::Status { server } => {
            commands::status::run_status(config, &server)?;
            Ok(())
        }
        Commands::Token { server } => {
            tracing::debug!(server_id = %server, "Resolving access token");
            commands::token::run_token(config, &server).await?;
            Ok(())
        }
        Commands::Reset { server, scope } => {
            tracing::info!(server_id = %server, scope = %scope, "Resetting flow");
            commands::reset::run_reset(config, &server, scope)?;
            Ok(())
        }
        Commands::Servers => {
            commands::servers::run_servers(&config);
            Ok(())
        }
    }
}

/// Initialize tracing subscriber
///
/// Logs go to stderr so `authflow token` output stays pipeable.
fn init_tracing(verbose: bool, json: bool) {
    let default_level = if verbose { "authflow=debug" } else { "authflow=info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}
