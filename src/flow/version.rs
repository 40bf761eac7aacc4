//! Protocol version adapter
//!
//! Each supported MCP authorization revision discovers the authorization
//! server differently. [`StepPlan::for_version`] resolves a version and a
//! registration strategy into a fixed plan once per flow: the ordered step
//! list, the discovery candidates at each step, and whether the RFC 8707
//! `resource` parameter is sent. The plan never changes mid-flow.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::auth::discovery::{
    all_auth_server_candidates, dedup_candidates, oauth_metadata_url, openid_appended_url,
    origin_of, resource_metadata_url, root_oauth_metadata_url, root_resource_metadata_url,
    WwwAuthenticate,
};
use crate::auth::registration::StrategyKind;
use crate::error::AuthflowError;
use crate::flow::state::FlowStep;

/// Supported MCP authorization revisions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// Pre-RFC 9728 revision: the authorization server is the resource's
    /// origin (or a `WWW-Authenticate` hint).
    #[serde(rename = "2025-03-26")]
    V2025_03_26,
    /// RFC 9728 discovery with the RFC 8414 candidates.
    #[serde(rename = "2025-06-18")]
    V2025_06_18,
    /// RFC 9728 discovery honoring the `resource_metadata` hint, with all
    /// five OAuth/OIDC well-known orderings.
    #[default]
    #[serde(rename = "2025-11-25")]
    V2025_11_25,
}

impl ProtocolVersion {
    /// All supported versions, oldest first.
    pub const ALL: [ProtocolVersion; 3] = [Self::V2025_03_26, Self::V2025_06_18, Self::V2025_11_25];

    /// The version's date string.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::V2025_03_26 => "2025-03-26",
            Self::V2025_06_18 => "2025-06-18",
            Self::V2025_11_25 => "2025-11-25",
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProtocolVersion {
    type Err = AuthflowError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|v| v.as_str() == s.trim())
            .ok_or_else(|| {
                AuthflowError::Config(format!(
                    "unsupported protocol version '{s}' (expected one of 2025-03-26, 2025-06-18, 2025-11-25)"
                ))
            })
    }
}

const LEGACY_STEPS: &[FlowStep] = &[
    FlowStep::Idle,
    FlowStep::SentUnauthenticatedRequest,
    FlowStep::ReceivedUnauthorized,
    FlowStep::RequestAuthorizationServerMetadata,
    FlowStep::ReceivedAuthorizationServerMetadata,
    FlowStep::RegisterClient,
    FlowStep::RedirectToAuthorize,
    FlowStep::ReceivedCallback,
    FlowStep::ExchangeToken,
    FlowStep::Authorized,
];

const FULL_STEPS: &[FlowStep] = &[
    FlowStep::Idle,
    FlowStep::SentUnauthenticatedRequest,
    FlowStep::ReceivedUnauthorized,
    FlowStep::RequestResourceMetadata,
    FlowStep::ReceivedResourceMetadata,
    FlowStep::RequestAuthorizationServerMetadata,
    FlowStep::ReceivedAuthorizationServerMetadata,
    FlowStep::RegisterClient,
    FlowStep::RedirectToAuthorize,
    FlowStep::ReceivedCallback,
    FlowStep::ExchangeToken,
    FlowStep::Authorized,
];

/// The version-specific plan of a flow.
///
/// # Examples
///
/// ```
/// use authflow::auth::registration::StrategyKind;
/// use authflow::flow::state::FlowStep;
/// use authflow::flow::version::{ProtocolVersion, StepPlan};
///
/// let plan = StepPlan::for_version(ProtocolVersion::V2025_03_26, StrategyKind::Dcr);
/// assert!(!plan.uses_resource_metadata());
/// assert_eq!(
///     plan.next(FlowStep::ReceivedUnauthorized),
///     Some(FlowStep::RequestAuthorizationServerMetadata)
/// );
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepPlan {
    version: ProtocolVersion,
    strategy: StrategyKind,
    steps: &'static [FlowStep],
}

impl StepPlan {
    /// Resolves the plan for a version and registration strategy.
    pub fn for_version(version: ProtocolVersion, strategy: StrategyKind) -> Self {
        let steps = match version {
            ProtocolVersion::V2025_03_26 => LEGACY_STEPS,
            ProtocolVersion::V2025_06_18 | ProtocolVersion::V2025_11_25 => FULL_STEPS,
        };
        Self {
            version,
            strategy,
            steps,
        }
    }

    /// The protocol version.
    pub fn version(&self) -> ProtocolVersion {
        self.version
    }

    /// The registration strategy.
    pub fn strategy(&self) -> StrategyKind {
        self.strategy
    }

    /// Ordered steps from `idle` to `authorized`.
    pub fn steps(&self) -> &'static [FlowStep] {
        self.steps
    }

    /// The step after `current`, or `None` at the end of the plan or for
    /// steps the plan does not contain.
    pub fn next(&self, current: FlowStep) -> Option<FlowStep> {
        let idx = self.steps.iter().position(|s| *s == current)?;
        self.steps.get(idx + 1).copied()
    }

    /// `true` when `step` is part of this plan.
    pub fn contains(&self, step: FlowStep) -> bool {
        self.steps.contains(&step)
    }

    /// `true` for versions with the RFC 9728 steps.
    pub fn uses_resource_metadata(&self) -> bool {
        self.contains(FlowStep::RequestResourceMetadata)
    }

    /// `true` when authorize and token requests carry `resource`.
    pub fn sends_resource_parameter(&self) -> bool {
        !matches!(self.version, ProtocolVersion::V2025_03_26)
    }

    /// `true` when `register_client` makes a network call.
    pub fn performs_registration_call(&self) -> bool {
        self.strategy == StrategyKind::Dcr
    }

    /// Resource metadata URLs to try, in order.
    pub fn resource_metadata_candidates(
        &self,
        resource: &Url,
        challenge: Option<&WwwAuthenticate>,
    ) -> Vec<Url> {
        match self.version {
            ProtocolVersion::V2025_03_26 => Vec::new(),
            ProtocolVersion::V2025_06_18 => vec![resource_metadata_url(resource)],
            ProtocolVersion::V2025_11_25 => {
                let mut candidates = Vec::with_capacity(3);
                if let Some(hint) = challenge
                    .and_then(WwwAuthenticate::resource_metadata)
                    .and_then(|h| Url::parse(h).ok())
                {
                    candidates.push(hint);
                }
                candidates.push(resource_metadata_url(resource));
                candidates.push(root_resource_metadata_url(resource));
                dedup_candidates(candidates)
            }
        }
    }

    /// Issuer assumed by the legacy version, which has no resource
    /// metadata: the challenge's authorization server hint, else the
    /// resource origin.
    pub fn legacy_issuer(&self, resource: &Url, challenge: Option<&WwwAuthenticate>) -> Url {
        challenge
            .and_then(WwwAuthenticate::authorization_uri)
            .and_then(|hint| Url::parse(hint).ok())
            .unwrap_or_else(|| origin_of(resource))
    }

    /// Authorization server metadata URLs to try, in order.
    pub fn auth_server_candidates(&self, issuer: &Url) -> Vec<Url> {
        match self.version {
            ProtocolVersion::V2025_03_26 => vec![root_oauth_metadata_url(issuer)],
            ProtocolVersion::V2025_06_18 => {
                dedup_candidates(vec![oauth_metadata_url(issuer), openid_appended_url(issuer)])
            }
            ProtocolVersion::V2025_11_25 => all_auth_server_candidates(issuer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_full_chain_has_twelve_states() {
        for version in [ProtocolVersion::V2025_06_18, ProtocolVersion::V2025_11_25] {
            let plan = StepPlan::for_version(version, StrategyKind::Dcr);
            assert_eq!(plan.steps().len(), 12);
            assert_eq!(plan.steps().first(), Some(&FlowStep::Idle));
            assert_eq!(plan.steps().last(), Some(&FlowStep::Authorized));
        }
    }

    #[test]
    fn test_legacy_plan_omits_resource_metadata() {
        let plan = StepPlan::for_version(ProtocolVersion::V2025_03_26, StrategyKind::Dcr);
        assert_eq!(plan.steps().len(), 10);
        assert!(!plan.contains(FlowStep::ReceivedResourceMetadata));
        assert!(!plan.sends_resource_parameter());
    }

    #[test]
    fn test_next_at_end_is_none() {
        let plan = StepPlan::for_version(ProtocolVersion::V2025_11_25, StrategyKind::Dcr);
        assert_eq!(plan.next(FlowStep::Authorized), None);
        assert_eq!(plan.next(FlowStep::Error), None);
    }

    #[test]
    fn test_registration_call_depends_on_strategy() {
        let v = ProtocolVersion::V2025_11_25;
        assert!(StepPlan::for_version(v, StrategyKind::Dcr).performs_registration_call());
        assert!(!StepPlan::for_version(v, StrategyKind::Cimd).performs_registration_call());
        assert!(!StepPlan::for_version(v, StrategyKind::Preregistered).performs_registration_call());
    }

    #[test]
    fn test_latest_prefers_resource_metadata_hint() {
        let plan = StepPlan::for_version(ProtocolVersion::V2025_11_25, StrategyKind::Dcr);
        let challenge = WwwAuthenticate::parse(
            r#"Bearer resource_metadata="https://meta.example/prm""#,
        );
        let candidates =
            plan.resource_metadata_candidates(&url("https://mcp.example.com/mcp"), Some(&challenge));
        let candidates: Vec<&str> = candidates.iter().map(Url::as_str).collect();
        assert_eq!(
            candidates,
            vec![
                "https://meta.example/prm",
                "https://mcp.example.com/.well-known/oauth-protected-resource/mcp",
                "https://mcp.example.com/.well-known/oauth-protected-resource",
            ]
        );
    }

    #[test]
    fn test_2025_06_18_ignores_hint() {
        let plan = StepPlan::for_version(ProtocolVersion::V2025_06_18, StrategyKind::Dcr);
        let challenge = WwwAuthenticate::parse(
            r#"Bearer resource_metadata="https://meta.example/prm""#,
        );
        let candidates =
            plan.resource_metadata_candidates(&url("https://mcp.example.com/mcp"), Some(&challenge));
        assert_eq!(candidates.len(), 1);
        assert_eq!(
            candidates[0].as_str(),
            "https://mcp.example.com/.well-known/oauth-protected-resource/mcp"
        );
    }

    #[test]
    fn test_2025_06_18_auth_server_candidates() {
        let plan = StepPlan::for_version(ProtocolVersion::V2025_06_18, StrategyKind::Dcr);
        let candidates = plan.auth_server_candidates(&url("https://as.example/tenant"));
        let candidates: Vec<&str> = candidates.iter().map(Url::as_str).collect();
        assert_eq!(
            candidates,
            vec![
                "https://as.example/.well-known/oauth-authorization-server/tenant",
                "https://as.example/tenant/.well-known/openid-configuration",
            ]
        );
    }

    #[test]
    fn test_legacy_issuer_uses_hint_then_origin() {
        let plan = StepPlan::for_version(ProtocolVersion::V2025_03_26, StrategyKind::Dcr);
        let resource = url("https://mcp.example.com/v1/mcp");
        assert_eq!(
            plan.legacy_issuer(&resource, None).as_str(),
            "https://mcp.example.com/"
        );
        let challenge = WwwAuthenticate::parse(r#"Bearer authorization_uri="https://as.example""#);
        assert_eq!(
            plan.legacy_issuer(&resource, Some(&challenge)).as_str(),
            "https://as.example/"
        );
        assert_eq!(
            plan.auth_server_candidates(&origin_of(&resource))[0].as_str(),
            "https://mcp.example.com/.well-known/oauth-authorization-server"
        );
    }

    #[test]
    fn test_protocol_version_parse_and_serde() {
        assert_eq!(
            "2025-06-18".parse::<ProtocolVersion>().unwrap(),
            ProtocolVersion::V2025_06_18
        );
        assert!("2024-11-05".parse::<ProtocolVersion>().is_err());
        let json = serde_json::to_string(&ProtocolVersion::V2025_03_26).unwrap();
        assert_eq!(json, "\"2025-03-26\"");
        assert_eq!(ProtocolVersion::default(), ProtocolVersion::V2025_11_25);
    }
}
