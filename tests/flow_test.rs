//! End-to-end flow tests against a mock authorization stack
//!
//! Each test drives a [`FlowMachine`] through `proceed()` against a
//! `wiremock` server playing resource server and authorization server.

mod common;

use std::sync::Arc;
use std::time::Duration;

use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use authflow::auth::discovery::{DiscoveryFallback, MetadataSource};
use authflow::auth::callback::CallbackParams;
use authflow::auth::registration::RegistrationStrategy;
use authflow::error::{FlowError, TokenErrorCode};
use authflow::flow::machine::ResetScope;
use authflow::flow::state::FlowStep;
use authflow::flow::version::{ProtocolVersion, StepPlan};
use authflow::store::memory::MemoryStore;
use authflow::store::CredentialKind;

use common::*;

/// Calls `proceed()` until the flow parks, recording every step reached.
async fn steps_until_parked(machine: &authflow::FlowMachine) -> Vec<FlowStep> {
    let mut visited = Vec::new();
    for _ in 0..16 {
        let state = machine.proceed().await.unwrap();
        visited.push(state.step);
        if matches!(state.step, FlowStep::RedirectToAuthorize | FlowStep::Error) {
            break;
        }
    }
    visited
}

#[tokio::test]
async fn test_each_version_visits_its_step_sequence() {
    for version in ProtocolVersion::ALL {
        let server = MockServer::start().await;
        mount_discovery(&server).await;
        mount_registration(&server, 1).await;

        let launcher = Arc::new(RecordingLauncher::default());
        let machine = machine(
            &server,
            version,
            RegistrationStrategy::Dcr,
            Arc::new(MemoryStore::new()),
            launcher.clone(),
        );

        let visited = steps_until_parked(&machine).await;
        let plan = StepPlan::for_version(version, RegistrationStrategy::Dcr.kind());
        let parked_at = plan
            .steps()
            .iter()
            .position(|s| *s == FlowStep::RedirectToAuthorize)
            .unwrap();
        assert_eq!(
            visited,
            plan.steps()[1..=parked_at].to_vec(),
            "unexpected step sequence for {version}"
        );
        assert_eq!(launcher.opened().len(), 1);
    }
}

#[tokio::test]
async fn test_full_chain_parks_then_authorizes() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;
    mount_registration(&server, 1).await;
    mount_token(
        &server,
        ResponseTemplate::new(200).set_body_json(token_body()),
        1,
    )
    .await;

    let store = Arc::new(MemoryStore::new());
    let launcher = Arc::new(RecordingLauncher::default());
    let machine = machine(
        &server,
        ProtocolVersion::V2025_11_25,
        RegistrationStrategy::Dcr,
        store.clone(),
        launcher.clone(),
    );

    let parked = machine.run_until_parked().await.unwrap();
    assert_eq!(parked.step, FlowStep::RedirectToAuthorize);
    assert!(parked.pending_pkce.is_some());
    assert!(store.contains(SERVER_ID, CredentialKind::PkceVerifier));
    assert!(store.contains(SERVER_ID, CredentialKind::PendingFlowMarker));
    assert!(store.contains(SERVER_ID, CredentialKind::ClientRegistration));

    let authorize = parked.authorization_url.clone().unwrap();
    assert_eq!(launcher.opened(), vec![authorize.clone()]);
    assert_eq!(query_param(&authorize, "client_id").as_deref(), Some("dyn-client"));
    assert_eq!(query_param(&authorize, "code_challenge_method").as_deref(), Some("S256"));
    assert_eq!(query_param(&authorize, "scope").as_deref(), Some("mcp:read mcp:write"));
    assert_eq!(
        query_param(&authorize, "resource").as_deref(),
        Some(resource_url(&server).as_str())
    );

    // Parked: proceeding without a callback does nothing.
    let still = machine.proceed().await.unwrap();
    assert_eq!(still.step, FlowStep::RedirectToAuthorize);

    let received = machine
        .deliver_callback(callback_for(&authorize, "the-code"))
        .await
        .unwrap();
    assert_eq!(received.step, FlowStep::ReceivedCallback);

    let planned = machine.proceed().await.unwrap();
    assert_eq!(planned.step, FlowStep::ExchangeToken);
    assert_eq!(
        planned.token_request.as_ref().unwrap().param("code"),
        Some("the-code")
    );

    let authorized = machine.proceed().await.unwrap();
    assert_eq!(authorized.step, FlowStep::Authorized);
    let tokens = authorized.token_set.as_ref().unwrap();
    assert_eq!(tokens.access_token, "mock-access-token");
    assert_eq!(tokens.client_id, "dyn-client");
    assert!(authorized.pending_pkce.is_none());
    assert!(store.contains(SERVER_ID, CredentialKind::Tokens));
    assert!(!store.contains(SERVER_ID, CredentialKind::PkceVerifier));
    assert!(!store.contains(SERVER_ID, CredentialKind::PendingFlowMarker));

    server.verify().await;
}

#[tokio::test]
async fn test_first_authorization_server_is_selected() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;

    let machine = machine(
        &server,
        ProtocolVersion::V2025_06_18,
        RegistrationStrategy::Dcr,
        Arc::new(MemoryStore::new()),
        Arc::new(RecordingLauncher::default()),
    );
    let state = machine
        .drive_until(|s| s.step == FlowStep::ReceivedResourceMetadata)
        .await
        .unwrap();

    assert_eq!(state.step, FlowStep::ReceivedResourceMetadata);
    assert_eq!(
        state.authorization_server.as_ref().unwrap().as_str(),
        issuer(&server)
    );
    assert_ne!(
        state.authorization_server.as_ref().unwrap().as_str(),
        "https://b.example/"
    );
}

#[tokio::test]
async fn test_override_replaces_selected_authorization_server() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;

    let machine = machine(
        &server,
        ProtocolVersion::V2025_11_25,
        RegistrationStrategy::Dcr,
        Arc::new(MemoryStore::new()),
        Arc::new(RecordingLauncher::default()),
    );
    machine
        .drive_until(|s| s.step == FlowStep::ReceivedResourceMetadata)
        .await
        .unwrap();

    let other = url::Url::parse(&format!("{}/other", server.uri())).unwrap();
    let state = machine.override_authorization_server(other.clone()).unwrap();
    assert_eq!(state.step, FlowStep::ReceivedResourceMetadata);

    let planned = machine.proceed().await.unwrap();
    assert_eq!(planned.step, FlowStep::RequestAuthorizationServerMetadata);
    assert_eq!(planned.authorization_server.as_ref(), Some(&other));
    assert!(planned
        .discovery_candidates
        .iter()
        .any(|u| u.path() == "/.well-known/oauth-authorization-server/other"));
}

#[tokio::test]
async fn test_state_mismatch_rejected_before_token_call() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;
    mount_registration(&server, 1).await;
    mount_token(
        &server,
        ResponseTemplate::new(200).set_body_json(token_body()),
        0,
    )
    .await;

    let store = Arc::new(MemoryStore::new());
    let machine = machine(
        &server,
        ProtocolVersion::V2025_11_25,
        RegistrationStrategy::Dcr,
        store.clone(),
        Arc::new(RecordingLauncher::default()),
    );
    machine.run_until_parked().await.unwrap();

    let forged = authflow::auth::callback::CallbackParams::parse(&format!(
        "{REDIRECT_URI}?code=stolen&state=not-the-state"
    ))
    .unwrap();
    let state = machine.deliver_callback(forged).await.unwrap();

    assert_eq!(state.step, FlowStep::Error);
    let failure = state.last_error.as_ref().unwrap();
    assert!(matches!(failure.error, FlowError::CallbackStateMismatch { .. }));
    assert!(!failure.is_retryable());
    assert!(state.pending_pkce.is_none());
    assert!(!store.contains(SERVER_ID, CredentialKind::PkceVerifier));

    let after = machine.proceed().await.unwrap();
    assert_eq!(after.step, FlowStep::Error);
    server.verify().await;
}

#[tokio::test]
async fn test_invalid_grant_never_authorizes() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;
    mount_registration(&server, 1).await;
    mount_token(
        &server,
        ResponseTemplate::new(400).set_body_json(serde_json::json!({
            "error": "invalid_grant",
            "error_description": "code expired"
        })),
        1,
    )
    .await;

    let machine = machine(
        &server,
        ProtocolVersion::V2025_11_25,
        RegistrationStrategy::Dcr,
        Arc::new(MemoryStore::new()),
        Arc::new(RecordingLauncher::default()),
    );
    let parked = machine.run_until_parked().await.unwrap();
    machine
        .deliver_callback(callback_for(parked.authorization_url.as_ref().unwrap(), "code"))
        .await
        .unwrap();
    let state = machine.run_until_parked().await.unwrap();

    assert_eq!(state.step, FlowStep::Error);
    assert!(state.token_set.is_none());
    match &state.last_error.as_ref().unwrap().error {
        FlowError::TokenExchange {
            code, transient, ..
        } => {
            assert_eq!(*code, TokenErrorCode::InvalidGrant);
            assert!(!transient);
        }
        other => panic!("expected TokenExchange, got {other:?}"),
    }
    assert!(state.is_terminal());
    server.verify().await;
}

#[tokio::test]
async fn test_reset_returns_to_idle_and_clears_pending_entries() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;
    mount_registration(&server, 1).await;

    let store = Arc::new(MemoryStore::new());
    let machine = machine(
        &server,
        ProtocolVersion::V2025_11_25,
        RegistrationStrategy::Dcr,
        store.clone(),
        Arc::new(RecordingLauncher::default()),
    );
    let parked = machine.run_until_parked().await.unwrap();

    let fresh = machine.reset(ResetScope::Verifier).unwrap();
    assert_eq!(fresh.step, FlowStep::Idle);
    assert_ne!(fresh.flow_id, parked.flow_id);
    assert!(fresh.pending_pkce.is_none());
    assert!(fresh.exchanges.is_empty());
    assert!(!store.contains(SERVER_ID, CredentialKind::PkceVerifier));
    assert!(!store.contains(SERVER_ID, CredentialKind::PendingFlowMarker));
    assert!(store.contains(SERVER_ID, CredentialKind::ClientRegistration));
}

#[tokio::test]
async fn test_stored_registration_is_reused() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;
    // One registration for two attempts.
    mount_registration(&server, 1).await;

    let store = Arc::new(MemoryStore::new());
    let machine = machine(
        &server,
        ProtocolVersion::V2025_11_25,
        RegistrationStrategy::Dcr,
        store.clone(),
        Arc::new(RecordingLauncher::default()),
    );
    machine.run_until_parked().await.unwrap();
    machine.reset(ResetScope::Verifier).unwrap();
    let again = machine.run_until_parked().await.unwrap();

    assert_eq!(again.step, FlowStep::RedirectToAuthorize);
    assert_eq!(
        again.client_registration.as_ref().unwrap().client_id,
        "dyn-client"
    );
    server.verify().await;
}

#[tokio::test]
async fn test_preregistered_client_skips_registration_call() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;
    mount_registration(&server, 0).await;

    let machine = machine(
        &server,
        ProtocolVersion::V2025_11_25,
        RegistrationStrategy::Preregistered {
            client_id: "static-client".to_string(),
            client_secret: None,
        },
        Arc::new(MemoryStore::new()),
        Arc::new(RecordingLauncher::default()),
    );
    let parked = machine.run_until_parked().await.unwrap();
    assert_eq!(parked.step, FlowStep::RedirectToAuthorize);
    assert_eq!(
        query_param(parked.authorization_url.as_ref().unwrap(), "client_id").as_deref(),
        Some("static-client")
    );
    server.verify().await;
}

#[tokio::test]
async fn test_concurrent_proceed_issues_one_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/mcp"))
        .respond_with(
            ResponseTemplate::new(401).set_delay(std::time::Duration::from_millis(200)),
        )
        .expect(1)
        .mount(&server)
        .await;

    let machine = machine(
        &server,
        ProtocolVersion::V2025_11_25,
        RegistrationStrategy::Dcr,
        Arc::new(MemoryStore::new()),
        Arc::new(RecordingLauncher::default()),
    );

    let (first, second) = tokio::join!(machine.proceed(), machine.proceed());
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(first.step, FlowStep::SentUnauthenticatedRequest);
    assert_eq!(second.step, FlowStep::Idle);
    assert!(second.in_flight);
    assert!(!machine.snapshot().in_flight);
    assert_eq!(machine.snapshot().exchanges.len(), 1);
    server.verify().await;
}

#[tokio::test]
async fn test_exchanges_are_kept_in_call_order_including_failures() {
    let server = MockServer::start().await;
    mount_unauthorized_resource(&server).await;
    // No resource metadata anywhere: every candidate answers 404.

    let machine = machine(
        &server,
        ProtocolVersion::V2025_11_25,
        RegistrationStrategy::Dcr,
        Arc::new(MemoryStore::new()),
        Arc::new(RecordingLauncher::default()),
    );
    let state = machine.run_until_parked().await.unwrap();

    assert_eq!(state.step, FlowStep::Error);
    let failure = state.last_error.as_ref().unwrap();
    assert_eq!(failure.failed_at, FlowStep::ReceivedResourceMetadata);
    assert_eq!(failure.resume_from, FlowStep::RequestResourceMetadata);
    assert!(matches!(failure.error, FlowError::Discovery { .. }));

    let paths: Vec<String> = state
        .exchanges
        .iter()
        .map(|e| url::Url::parse(&e.request.url).unwrap().path().to_string())
        .collect();
    assert_eq!(
        paths,
        vec![
            "/mcp".to_string(),
            "/.well-known/oauth-protected-resource/mcp".to_string(),
            "/.well-known/oauth-protected-resource".to_string(),
        ]
    );
    assert_eq!(state.exchanges[1].status(), Some(404));
    assert_eq!(state.exchanges[1].step, FlowStep::ReceivedResourceMetadata);

    // Retryable: metadata appears, the retry picks up where it failed.
    mount_resource_metadata(&server).await;
    let retried = machine.proceed().await.unwrap();
    assert_eq!(retried.step, FlowStep::ReceivedResourceMetadata);
    assert_eq!(retried.exchanges.len(), 4);
}

#[tokio::test]
async fn test_serialized_state_and_exchange_display_hide_secrets() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;
    mount_registration(&server, 1).await;
    Mock::given(method("POST"))
        .and(path("/auth/token"))
        .and(body_string_contains("code_verifier="))
        .respond_with(ResponseTemplate::new(200).set_body_json(token_body()))
        .expect(1)
        .mount(&server)
        .await;

    let machine = machine(
        &server,
        ProtocolVersion::V2025_11_25,
        RegistrationStrategy::Dcr,
        Arc::new(MemoryStore::new()),
        Arc::new(RecordingLauncher::default()),
    );
    let parked = machine.run_until_parked().await.unwrap();
    let verifier = parked.pending_pkce.as_ref().unwrap().code_verifier.clone();
    machine
        .deliver_callback(callback_for(parked.authorization_url.as_ref().unwrap(), "secret-code"))
        .await
        .unwrap();
    let state = machine.run_until_parked().await.unwrap();
    assert_eq!(state.step, FlowStep::Authorized);

    // The raw token exchange keeps what was sent.
    let token_call = state.exchanges.last().unwrap();
    assert!(token_call.request.body.as_ref().unwrap().contains(&verifier));

    let json = serde_json::to_string(&*state).unwrap();
    for secret in [verifier.as_str(), "secret-code", "mock-access-token", "mock-refresh-token"] {
        assert!(!json.contains(secret), "serialized state leaks {secret}");
    }
    let shown = format!("{:?}", token_call.redacted());
    assert!(!shown.contains(&verifier));
    assert!(!format!("{token_call:?}").contains("mock-access-token"));
    server.verify().await;
}

#[tokio::test]
async fn test_missing_auth_server_metadata_fallback_policy() {
    for (fallback, expect_parked) in [
        (DiscoveryFallback::Fail, false),
        (DiscoveryFallback::DefaultEndpoints, true),
    ] {
        let server = MockServer::start().await;
        mount_unauthorized_resource(&server).await;
        mount_resource_metadata(&server).await;
        mount_registration(&server, u64::from(expect_parked)).await;

        let mut settings = settings();
        settings.discovery_fallback = fallback;
        let machine = machine_with_settings(
            &server,
            ProtocolVersion::V2025_11_25,
            RegistrationStrategy::Dcr,
            Arc::new(MemoryStore::new()),
            Arc::new(RecordingLauncher::default()),
            settings,
        );
        let state = machine.run_until_parked().await.unwrap();

        if expect_parked {
            assert_eq!(state.step, FlowStep::RedirectToAuthorize);
            assert_eq!(state.metadata_source, Some(MetadataSource::FallbackDefaults));
            assert!(state
                .authorization_url
                .as_ref()
                .unwrap()
                .path()
                .ends_with("/auth/authorize"));
        } else {
            assert_eq!(state.step, FlowStep::Error);
            assert_eq!(
                state.last_error.as_ref().unwrap().failed_at,
                FlowStep::ReceivedAuthorizationServerMetadata
            );
        }
        server.verify().await;
    }
}

#[tokio::test]
async fn test_denied_authorization_reissues_redirect_on_retry() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;
    mount_registration(&server, 1).await;

    let launcher = Arc::new(RecordingLauncher::default());
    let machine = machine(
        &server,
        ProtocolVersion::V2025_11_25,
        RegistrationStrategy::Dcr,
        Arc::new(MemoryStore::new()),
        launcher.clone(),
    );
    let parked = machine.run_until_parked().await.unwrap();
    let denied = authflow::auth::callback::CallbackParams::parse(&format!(
        "{REDIRECT_URI}?error=access_denied&state={}",
        parked.pending_pkce.as_ref().unwrap().state
    ))
    .unwrap();

    let failed = machine.deliver_callback(denied).await.unwrap();
    assert_eq!(failed.step, FlowStep::Error);
    assert!(matches!(
        failed.last_error.as_ref().unwrap().error,
        FlowError::AuthorizationDenied { .. }
    ));

    let reparked = machine.proceed().await.unwrap();
    assert_eq!(reparked.step, FlowStep::RedirectToAuthorize);
    assert_ne!(
        reparked.pending_pkce.as_ref().unwrap().state,
        parked.pending_pkce.as_ref().unwrap().state
    );
    assert_eq!(launcher.opened().len(), 2);
}

#[tokio::test]
async fn test_error_callback_with_forged_state_is_fatal() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;
    mount_registration(&server, 1).await;
    mount_token(
        &server,
        ResponseTemplate::new(200).set_body_json(token_body()),
        0,
    )
    .await;

    let launcher = Arc::new(RecordingLauncher::default());
    let machine = machine(
        &server,
        ProtocolVersion::V2025_11_25,
        RegistrationStrategy::Dcr,
        Arc::new(MemoryStore::new()),
        launcher.clone(),
    );
    machine.run_until_parked().await.unwrap();

    let forged = CallbackParams::parse(&format!("{REDIRECT_URI}?error=access_denied&state=FORGED")).unwrap();
    let failed = machine.deliver_callback(forged).await.unwrap();

    assert_eq!(failed.step, FlowStep::Error);
    let failure = failed.last_error.as_ref().unwrap();
    assert!(matches!(failure.error, FlowError::CallbackStateMismatch { .. }));
    assert!(!failure.is_retryable());

    // Fatal: no new redirect is issued.
    let after = machine.proceed().await.unwrap();
    assert_eq!(after.step, FlowStep::Error);
    assert_eq!(launcher.opened().len(), 1);
    server.verify().await;
}

#[tokio::test]
async fn test_reset_during_token_exchange_leaves_store_empty() {
    let server = MockServer::start().await;
    mount_discovery(&server).await;
    mount_registration(&server, 1).await;
    mount_token(
        &server,
        ResponseTemplate::new(200)
            .set_body_json(token_body())
            .set_delay(Duration::from_millis(500)),
        1,
    )
    .await;

    let store = Arc::new(MemoryStore::new());
    let machine = machine(
        &server,
        ProtocolVersion::V2025_11_25,
        RegistrationStrategy::Dcr,
        store.clone(),
        Arc::new(RecordingLauncher::default()),
    );
    let parked = machine.run_until_parked().await.unwrap();
    machine
        .deliver_callback(callback_for(parked.authorization_url.as_ref().unwrap(), "code"))
        .await
        .unwrap();
    let planned = machine.proceed().await.unwrap();
    assert_eq!(planned.step, FlowStep::ExchangeToken);

    let (exchanged, reset) = tokio::join!(machine.proceed(), async {
        tokio::time::sleep(Duration::from_millis(150)).await;
        machine.reset(ResetScope::All)
    });

    let reset = reset.unwrap();
    assert_eq!(reset.step, FlowStep::Idle);
    let exchanged = exchanged.unwrap();
    assert_eq!(exchanged.step, FlowStep::Idle);
    assert_eq!(exchanged.flow_id, reset.flow_id);

    let current = machine.snapshot();
    assert_eq!(current.step, FlowStep::Idle);
    assert!(current.token_set.is_none());
    assert!(!current.in_flight);
    for kind in CredentialKind::ALL {
        assert!(!store.contains(SERVER_ID, kind), "{kind:?} survived the reset");
    }
    server.verify().await;
}

#[tokio::test]
async fn test_openid_configuration_used_when_oauth_metadata_is_missing() {
    for (version, location) in [
        (ProtocolVersion::V2025_11_25, "/.well-known/openid-configuration/auth"),
        (ProtocolVersion::V2025_06_18, "/auth/.well-known/openid-configuration"),
    ] {
        let server = MockServer::start().await;
        mount_unauthorized_resource(&server).await;
        mount_resource_metadata(&server).await;
        Mock::given(method("GET"))
            .and(path(location))
            .respond_with(ResponseTemplate::new(200).set_body_json(auth_server_body(&server)))
            .expect(1)
            .mount(&server)
            .await;
        mount_registration(&server, 1).await;

        let machine = machine(
            &server,
            version,
            RegistrationStrategy::Dcr,
            Arc::new(MemoryStore::new()),
            Arc::new(RecordingLauncher::default()),
        );
        let parked = machine.run_until_parked().await.unwrap();
        assert_eq!(parked.step, FlowStep::RedirectToAuthorize, "{version:?}");

        let served_by = url::Url::parse(&format!("{}{location}", server.uri())).unwrap();
        assert_eq!(
            parked.metadata_source,
            Some(MetadataSource::OpenidConfiguration { url: served_by })
        );

        let lookups: Vec<_> = parked
            .exchanges
            .iter()
            .filter(|e| e.step == FlowStep::ReceivedAuthorizationServerMetadata)
            .collect();
        let first = lookups.first().unwrap();
        assert!(first
            .request
            .url
            .contains("/.well-known/oauth-authorization-server"));
        assert_eq!(first.response.as_ref().unwrap().status, 404);
        assert_eq!(lookups.last().unwrap().response.as_ref().unwrap().status, 200);
        server.verify().await;
    }
}

#[tokio::test]
async fn test_metadata_document_client_completes_without_registration() {
    let document = "https://client.example/oauth/metadata.json";
    let server = MockServer::start().await;
    mount_discovery(&server).await;
    mount_registration(&server, 0).await;
    mount_token(
        &server,
        ResponseTemplate::new(200).set_body_json(token_body()),
        1,
    )
    .await;

    let store = Arc::new(MemoryStore::new());
    let machine = machine(
        &server,
        ProtocolVersion::V2025_11_25,
        RegistrationStrategy::Cimd {
            client_id: document.to_string(),
        },
        store.clone(),
        Arc::new(RecordingLauncher::default()),
    );

    let parked = machine.run_until_parked().await.unwrap();
    assert_eq!(parked.step, FlowStep::RedirectToAuthorize);
    assert!(!parked.exchanges.iter().any(|e| e.step == FlowStep::RegisterClient));
    let authorize = parked.authorization_url.clone().unwrap();
    assert_eq!(query_param(&authorize, "client_id").as_deref(), Some(document));

    machine
        .deliver_callback(callback_for(&authorize, "cimd-code"))
        .await
        .unwrap();
    let authorized = machine.run_until_parked().await.unwrap();
    assert_eq!(authorized.step, FlowStep::Authorized);
    assert_eq!(authorized.token_set.as_ref().unwrap().client_id, document);
    let encoded: String = url::form_urlencoded::byte_serialize(document.as_bytes()).collect();
    let token_call = authorized
        .exchanges
        .iter()
        .find(|e| e.step == FlowStep::Authorized)
        .unwrap();
    assert!(token_call
        .request
        .body
        .as_deref()
        .unwrap()
        .contains(&format!("client_id={encoded}")));
    // Only dynamic registrations are persisted.
    assert!(!store.contains(SERVER_ID, CredentialKind::ClientRegistration));
    server.verify().await;
}
