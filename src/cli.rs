//! Command-line interface definition for authflow
//!
//! This module defines the CLI structure using clap's derive API: one
//! subcommand per flow operation, plus global overrides for the credential
//! store and redirect URI.

use clap::{Parser, Subcommand};

use crate::flow::machine::ResetScope;

/// authflow - OAuth 2.1 authorization for protected MCP servers
///
/// Discovers the authorization server, registers a client, runs the PKCE
/// authorization code flow, and keeps the resulting tokens in the OS
/// keyring.
#[derive(Parser, Debug, Clone)]
#[command(name = "authflow")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/authflow.yaml")]
    pub config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub json_logs: bool,

    /// Credential store backend (keyring, file, memory)
    #[arg(long, global = true)]
    pub store: Option<String>,

    /// Credentials file for the file backend
    #[arg(long, global = true)]
    pub store_path: Option<String>,

    /// Redirect URI registered for this client
    #[arg(long, global = true)]
    pub redirect_uri: Option<String>,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for authflow
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Authorize against a server, waiting for the browser callback
    Connect {
        /// Configured server id
        server: String,

        /// Print the authorization URL instead of opening a browser
        #[arg(long)]
        no_browser: bool,

        /// Print every HTTP exchange of the flow
        #[arg(long)]
        trace: bool,
    },

    /// Deliver a redirect URL captured outside authflow to the pending flow
    Callback {
        /// The full redirected URL, or its query string
        url: String,
    },

    /// Show stored tokens, registration, and pending authorization
    Status {
        /// Configured server id
        server: String,
    },

    /// Print a valid access token, refreshing it if needed
    Token {
        /// Configured server id
        server: String,
    },

    /// Forget the flow and stored credentials
    Reset {
        /// Configured server id
        server: String,

        /// What to forget besides the pending authorization
        #[arg(long, value_enum, default_value_t = ResetScope::All)]
        scope: ResetScope,
    },

    /// List configured servers
    Servers,
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            config: Some("config/authflow.yaml".to_string()),
            verbose: false,
            json_logs: false,
            store: None,
            store_path: None,
            redirect_uri: None,
            command: Commands::Servers,
        }
    }
}
