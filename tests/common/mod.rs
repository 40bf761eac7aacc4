//! Shared helpers for the integration tests: a mock authorization stack on
//! a `wiremock` server and a flow machine wired to it.

#![allow(dead_code)]

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tempfile::TempDir;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use authflow::auth::callback::CallbackParams;
use authflow::auth::redirect::BrowserLauncher;
use authflow::auth::registration::RegistrationStrategy;
use authflow::flow::machine::{FlowMachine, FlowSettings};
use authflow::flow::state::FlowState;
use authflow::flow::version::ProtocolVersion;
use authflow::store::CredentialStore;
use authflow::transport::http::ReqwestTransport;

pub const REDIRECT_URI: &str = "http://127.0.0.1:8765/callback";
pub const SERVER_ID: &str = "mock";

/// Remembers every URL it was asked to open.
#[derive(Debug, Default)]
pub struct RecordingLauncher {
    opened: Mutex<Vec<Url>>,
}

impl RecordingLauncher {
    pub fn opened(&self) -> Vec<Url> {
        self.opened.lock().expect("launcher lock").clone()
    }
}

impl BrowserLauncher for RecordingLauncher {
    fn open(&self, url: &Url) -> anyhow::Result<()> {
        self.opened.lock().expect("launcher lock").push(url.clone());
        Ok(())
    }
}

/// The protected resource, `{uri}/mcp`.
pub fn resource_url(server: &MockServer) -> Url {
    Url::parse(&format!("{}/mcp", server.uri())).unwrap()
}

/// The authorization server issuer, `{uri}/auth`.
pub fn issuer(server: &MockServer) -> String {
    format!("{}/auth", server.uri())
}

pub fn resource_metadata_body(server: &MockServer) -> serde_json::Value {
    serde_json::json!({
        "resource": resource_url(server).as_str(),
        "authorization_servers": [issuer(server), "https://b.example"],
        "scopes_supported": ["mcp:read", "mcp:write"]
    })
}

pub fn auth_server_body(server: &MockServer) -> serde_json::Value {
    let issuer = issuer(server);
    serde_json::json!({
        "issuer": issuer,
        "authorization_endpoint": format!("{issuer}/authorize"),
        "token_endpoint": format!("{issuer}/token"),
        "registration_endpoint": format!("{issuer}/register"),
        "response_types_supported": ["code"],
        "code_challenge_methods_supported": ["S256"]
    })
}

pub fn token_body() -> serde_json::Value {
    serde_json::json!({
        "access_token": "mock-access-token",
        "token_type": "Bearer",
        "expires_in": 3600,
        "refresh_token": "mock-refresh-token",
        "scope": "mcp:read mcp:write"
    })
}

/// `GET /mcp` answers 401 pointing at the path-aware resource metadata.
pub async fn mount_unauthorized_resource(server: &MockServer) {
    let challenge = format!(
        r#"Bearer realm="mock", resource_metadata="{}/.well-known/oauth-protected-resource/mcp""#,
        server.uri()
    );
    Mock::given(method("GET"))
        .and(path("/mcp"))
        .respond_with(ResponseTemplate::new(401).insert_header("WWW-Authenticate", challenge.as_str()))
        .mount(server)
        .await;
}

pub async fn mount_resource_metadata(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/.well-known/oauth-protected-resource/mcp"))
        .respond_with(ResponseTemplate::new(200).set_body_json(resource_metadata_body(server)))
        .mount(server)
        .await;
}

/// Serves the authorization server metadata at the path-inserted location
/// for `{uri}/auth` and at the root location the legacy revision uses.
pub async fn mount_auth_server_metadata(server: &MockServer) {
    for location in [
        "/.well-known/oauth-authorization-server/auth",
        "/.well-known/oauth-authorization-server",
    ] {
        Mock::given(method("GET"))
            .and(path(location))
            .respond_with(ResponseTemplate::new(200).set_body_json(auth_server_body(server)))
            .mount(server)
            .await;
    }
}

pub async fn mount_registration(server: &MockServer, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/auth/register"))
        .respond_with(ResponseTemplate::new(201).set_body_json(serde_json::json!({
            "client_id": "dyn-client",
            "redirect_uris": [REDIRECT_URI]
        })))
        .expect(expected_calls)
        .mount(server)
        .await;
}

pub async fn mount_token(server: &MockServer, response: ResponseTemplate, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/auth/token"))
        .respond_with(response)
        .expect(expected_calls)
        .mount(server)
        .await;
}

/// Everything up to and including the registration endpoint.
pub async fn mount_discovery(server: &MockServer) {
    mount_unauthorized_resource(server).await;
    mount_resource_metadata(server).await;
    mount_auth_server_metadata(server).await;
}

pub fn settings() -> FlowSettings {
    FlowSettings::new(Url::parse(REDIRECT_URI).unwrap())
}

pub fn transport() -> Arc<ReqwestTransport> {
    Arc::new(ReqwestTransport::new(Duration::from_secs(5), "authflow-tests").unwrap())
}

pub fn machine(
    server: &MockServer,
    version: ProtocolVersion,
    strategy: RegistrationStrategy,
    store: Arc<dyn CredentialStore>,
    launcher: Arc<RecordingLauncher>,
) -> FlowMachine {
    machine_with_settings(server, version, strategy, store, launcher, settings())
}

pub fn machine_with_settings(
    server: &MockServer,
    version: ProtocolVersion,
    strategy: RegistrationStrategy,
    store: Arc<dyn CredentialStore>,
    launcher: Arc<RecordingLauncher>,
    settings: FlowSettings,
) -> FlowMachine {
    let state = FlowState::new(SERVER_ID, resource_url(server), version, strategy);
    FlowMachine::new(state, settings, transport(), store, launcher)
}

/// A callback carrying `code` and the state of the issued authorize URL.
pub fn callback_for(authorization_url: &Url, code: &str) -> CallbackParams {
    let state = query_param(authorization_url, "state").expect("authorize URL has a state");
    let url = Url::parse(&format!("{REDIRECT_URI}?code={code}&state={state}")).unwrap();
    CallbackParams::from_url(&url)
}

pub fn query_param(url: &Url, name: &str) -> Option<String> {
    url.query_pairs()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.into_owned())
}

pub fn temp_config_file(contents: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("failed to create tempdir");
    let config_path = temp_dir.path().join("authflow.yaml");
    fs::write(&config_path, contents).expect("failed to write config file");
    (temp_dir, config_path)
}
