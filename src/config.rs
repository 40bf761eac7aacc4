//! Configuration management for authflow
//!
//! This module handles loading, parsing, validating, and managing
//! configuration from files, environment variables, and CLI overrides.
//! Precedence, lowest to highest: built-in defaults, the YAML file,
//! `AUTHFLOW_*` environment variables, command-line flags.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::auth::discovery::DiscoveryFallback;
use crate::auth::registration::RegistrationStrategy;
use crate::error::{AuthflowError, Result};
use crate::flow::version::ProtocolVersion;

/// Default location of the configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "config/authflow.yaml";

/// Main configuration structure for authflow
///
/// # Examples
///
/// ```
/// use authflow::config::Config;
///
/// let yaml = r#"
/// servers:
///   - id: notion
///     url: https://mcp.notion.com/mcp
/// "#;
/// let config: Config = serde_yaml::from_str(yaml).unwrap();
/// assert!(config.validate().is_ok());
/// assert_eq!(config.servers[0].protocol_version.as_str(), "2025-11-25");
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// How this client presents itself to authorization servers
    #[serde(default)]
    pub client: ClientConfig,
    /// Outbound HTTP settings
    #[serde(default)]
    pub http: HttpConfig,
    /// Flow behavior
    #[serde(default)]
    pub flow: FlowConfig,
    /// Credential storage backend
    #[serde(default)]
    pub store: StoreConfig,
    /// MCP servers that can be authorized
    #[serde(default)]
    pub servers: Vec<ServerConfig>,
}

/// Client identity settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// `client_name` sent during dynamic registration
    #[serde(default = "default_client_name")]
    pub name: String,

    /// Redirect URI registered with the authorization server. The loopback
    /// listener binds to its host and port.
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,

    /// Optional `client_uri` sent during dynamic registration
    #[serde(default)]
    pub client_uri: Option<String>,
}

fn default_client_name() -> String {
    "authflow".to_string()
}

fn default_redirect_uri() -> String {
    "http://127.0.0.1:8765/callback".to_string()
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            name: default_client_name(),
            redirect_uri: default_redirect_uri(),
            client_uri: None,
        }
    }
}

/// Outbound HTTP settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Per-request timeout in seconds
    #[serde(default = "default_http_timeout")]
    pub timeout_seconds: u64,

    /// `User-Agent` header for every request
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_http_timeout() -> u64 {
    10
}

fn default_user_agent() -> String {
    format!("authflow/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: default_http_timeout(),
            user_agent: default_user_agent(),
        }
    }
}

impl HttpConfig {
    /// The per-request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Flow behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// How long a parked flow waits for its redirect callback
    #[serde(default = "default_redirect_timeout")]
    pub redirect_timeout_seconds: u64,

    /// What to do when no authorization server metadata document is found
    #[serde(default)]
    pub discovery_fallback: DiscoveryFallback,
}

fn default_redirect_timeout() -> u64 {
    300
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            redirect_timeout_seconds: default_redirect_timeout(),
            discovery_fallback: DiscoveryFallback::default(),
        }
    }
}

impl FlowConfig {
    /// The redirect wait.
    pub fn redirect_timeout(&self) -> Duration {
        Duration::from_secs(self.redirect_timeout_seconds)
    }
}

/// Credential storage backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// OS keychain
    #[default]
    Keyring,
    /// A JSON file
    File,
    /// Process memory
    Memory,
}

impl FromStr for StoreBackend {
    type Err = AuthflowError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "keyring" => Ok(Self::Keyring),
            "file" => Ok(Self::File),
            "memory" => Ok(Self::Memory),
            other => Err(AuthflowError::Config(format!(
                "Invalid store backend: {}. Must be one of: keyring, file, memory",
                other
            ))),
        }
    }
}

/// Credential storage settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Which backend to use
    #[serde(default)]
    pub backend: StoreBackend,

    /// File location for the `file` backend; defaults to the platform data
    /// directory
    #[serde(default)]
    pub path: Option<PathBuf>,
}

/// One protected MCP server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Identifier used on the command line and as the credential key
    pub id: String,

    /// The MCP endpoint to authorize against
    pub url: String,

    /// MCP authorization revision the server implements
    #[serde(default)]
    pub protocol_version: ProtocolVersion,

    /// How the client obtains a client id
    #[serde(default)]
    pub registration: RegistrationStrategy,

    /// Scope to request; when unset, advertised scopes are used
    #[serde(default)]
    pub scope: Option<String>,

    /// Authorization server to use instead of the first advertised one
    #[serde(default)]
    pub authorization_server: Option<String>,
}

impl ServerConfig {
    /// The server URL, parsed.
    ///
    /// # Errors
    ///
    /// Returns [`AuthflowError::Config`] for an unparseable URL.
    pub fn resource_url(&self) -> Result<Url> {
        Url::parse(&self.url).map_err(|e| {
            AuthflowError::Config(format!("Invalid url for server '{}': {}", self.id, e)).into()
        })
    }

    /// The authorization server override, parsed.
    ///
    /// # Errors
    ///
    /// Returns [`AuthflowError::Config`] for an unparseable URL.
    pub fn authorization_server_url(&self) -> Result<Option<Url>> {
        self.authorization_server
            .as_deref()
            .map(|raw| {
                Url::parse(raw).map_err(|e| {
                    AuthflowError::Config(format!(
                        "Invalid authorization_server for server '{}': {}",
                        self.id, e
                    ))
                    .into()
                })
            })
            .transpose()
    }
}

impl Config {
    /// Load configuration from file with environment and CLI overrides
    ///
    /// # Arguments
    ///
    /// * `path` - Path to configuration file
    /// * `cli` - CLI arguments for overrides
    ///
    /// # Returns
    ///
    /// Returns the loaded and merged configuration
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn load(path: &str, cli: &crate::cli::Cli) -> Result<Self> {
        let mut config = if Path::new(path).exists() {
            Self::from_file(path)?
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path);
            Self::default()
        };

        config.apply_env_vars();
        config.apply_cli_overrides(cli)?;

        Ok(config)
    }

    /// Parses a YAML configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`AuthflowError::Config`] when the file is unreadable or
    /// malformed.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| AuthflowError::Config(format!("Failed to read config file: {}", e)))?;
        serde_yaml::from_str(&contents)
            .map_err(|e| AuthflowError::Config(format!("Failed to parse config: {}", e)).into())
    }

    fn apply_env_vars(&mut self) {
        // Client overrides
        if let Ok(name) = std::env::var("AUTHFLOW_CLIENT_NAME") {
            self.client.name = name;
        }

        if let Ok(redirect_uri) = std::env::var("AUTHFLOW_REDIRECT_URI") {
            self.client.redirect_uri = redirect_uri;
        }

        // HTTP overrides
        if let Ok(timeout) = std::env::var("AUTHFLOW_HTTP_TIMEOUT_SECONDS") {
            if let Ok(value) = timeout.parse() {
                self.http.timeout_seconds = value;
            } else {
                tracing::warn!("Invalid AUTHFLOW_HTTP_TIMEOUT_SECONDS: {}", timeout);
            }
        }

        if let Ok(user_agent) = std::env::var("AUTHFLOW_USER_AGENT") {
            self.http.user_agent = user_agent;
        }

        // Flow overrides
        if let Ok(timeout) = std::env::var("AUTHFLOW_REDIRECT_TIMEOUT_SECONDS") {
            if let Ok(value) = timeout.parse() {
                self.flow.redirect_timeout_seconds = value;
            } else {
                tracing::warn!("Invalid AUTHFLOW_REDIRECT_TIMEOUT_SECONDS: {}", timeout);
            }
        }

        if let Ok(fallback) = std::env::var("AUTHFLOW_DISCOVERY_FALLBACK") {
            self.flow.discovery_fallback = match fallback.to_lowercase().as_str() {
                "fail" => DiscoveryFallback::Fail,
                "default_endpoints" => DiscoveryFallback::DefaultEndpoints,
                _ => {
                    tracing::warn!("Invalid AUTHFLOW_DISCOVERY_FALLBACK: {}", fallback);
                    self.flow.discovery_fallback
                }
            };
        }

        // Store overrides
        if let Ok(backend) = std::env::var("AUTHFLOW_STORE_BACKEND") {
            match backend.parse() {
                Ok(value) => self.store.backend = value,
                Err(_) => tracing::warn!("Invalid AUTHFLOW_STORE_BACKEND: {}", backend),
            }
        }

        if let Ok(path) = std::env::var("AUTHFLOW_STORE_PATH") {
            self.store.path = Some(PathBuf::from(path));
        }
    }

    fn apply_cli_overrides(&mut self, cli: &crate::cli::Cli) -> Result<()> {
        if let Some(backend) = &cli.store {
            self.store.backend = backend.parse()?;
        }
        if let Some(path) = &cli.store_path {
            self.store.path = Some(PathBuf::from(path));
        }
        if let Some(redirect_uri) = &cli.redirect_uri {
            self.client.redirect_uri = redirect_uri.clone();
        }
        Ok(())
    }

    /// Looks up a configured server.
    ///
    /// # Errors
    ///
    /// Returns [`AuthflowError::ServerNotFound`] for an unknown id.
    pub fn server(&self, id: &str) -> Result<&ServerConfig> {
        self.servers
            .iter()
            .find(|s| s.id == id)
            .ok_or_else(|| AuthflowError::ServerNotFound(id.to_string()).into())
    }

    /// The redirect URI, parsed.
    ///
    /// # Errors
    ///
    /// Returns [`AuthflowError::Config`] for an unparseable URI.
    pub fn redirect_uri(&self) -> Result<Url> {
        Url::parse(&self.client.redirect_uri).map_err(|e| {
            AuthflowError::Config(format!("Invalid client.redirect_uri: {}", e)).into()
        })
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns error if any validation check fails
    pub fn validate(&self) -> Result<()> {
        if self.client.name.trim().is_empty() {
            return Err(AuthflowError::Config("client.name cannot be empty".to_string()).into());
        }

        let redirect = self.redirect_uri()?;
        if !matches!(redirect.scheme(), "http" | "https") {
            return Err(AuthflowError::Config(format!(
                "client.redirect_uri must use http or https, got {}",
                redirect.scheme()
            ))
            .into());
        }

        if self.http.timeout_seconds == 0 {
            return Err(AuthflowError::Config(
                "http.timeout_seconds must be greater than 0".to_string(),
            )
            .into());
        }

        if self.flow.redirect_timeout_seconds == 0 {
            return Err(AuthflowError::Config(
                "flow.redirect_timeout_seconds must be greater than 0".to_string(),
            )
            .into());
        }

        let mut seen = std::collections::HashSet::new();
        for server in &self.servers {
            if server.id.trim().is_empty() {
                return Err(
                    AuthflowError::Config("server id cannot be empty".to_string()).into(),
                );
            }
            if !seen.insert(server.id.as_str()) {
                return Err(
                    AuthflowError::Config(format!("duplicate server id: {}", server.id)).into(),
                );
            }
            let url = server.resource_url()?;
            if !matches!(url.scheme(), "http" | "https") {
                return Err(AuthflowError::Config(format!(
                    "server '{}' url must use http or https",
                    server.id
                ))
                .into());
            }
            server.authorization_server_url()?;
            match &server.registration {
                RegistrationStrategy::Preregistered { client_id, .. }
                | RegistrationStrategy::Cimd { client_id }
                    if client_id.trim().is_empty() =>
                {
                    return Err(AuthflowError::Config(format!(
                        "server '{}' registration requires a client_id",
                        server.id
                    ))
                    .into());
                }
                _ => {}
            }
        }

        Ok(())
    }
}
