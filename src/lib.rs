//! authflow - OAuth 2.1 authorization for protected MCP servers
//!
//! This library implements the discovery and token-acquisition state
//! machine a client runs before it may call a protected MCP server: probe
//! the resource, discover its authorization server, register a client, run
//! the PKCE authorization code flow across a browser redirect, and exchange
//! the code for tokens.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `flow`: the flow snapshot, per-version step plans, exchange capture,
//!   and the orchestrating [`FlowMachine`]
//! - `auth`: discovery, registration, PKCE, redirect, callback, token
//!   exchange, and the multi-server [`AuthManager`]
//! - `transport`: the HTTP seam and its `reqwest` implementation
//! - `store`: credential persistence (keyring, file, memory)
//! - `config`: Configuration management and validation
//! - `error`: Error types and result aliases
//! - `cli` / `commands`: Command-line interface
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use authflow::auth::redirect::SystemBrowser;
//! use authflow::{AuthManager, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config/authflow.yaml", &Default::default())?;
//!     config.validate()?;
//!
//!     let manager = AuthManager::from_config(config, Arc::new(SystemBrowser))?;
//!     let state = manager.connect("notion").await?;
//!     println!("flow is at {}", state.step);
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod flow;
pub mod store;
pub mod transport;

// Re-export commonly used types
pub use auth::manager::AuthManager;
pub use config::Config;
pub use error::{AuthflowError, FlowError, Result};
pub use flow::machine::{FlowMachine, FlowSettings, ResetScope};
pub use flow::state::{FlowState, FlowStep};
pub use flow::version::ProtocolVersion;
