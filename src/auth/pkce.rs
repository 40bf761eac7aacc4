//! PKCE S256 secrets for one authorization attempt
//!
//! Implements RFC 7636 with the `S256` method, the only method OAuth 2.1
//! allows for public clients.
//!
//! 1. 32 random bytes are base64url-encoded (no padding) into a 43-character
//!    `code_verifier`.
//! 2. The `code_challenge` is `BASE64URL(SHA256(ASCII(code_verifier)))`.
//! 3. A separate random `state` value protects the redirect against CSRF.
//!
//! The three values together form a [`PendingPkce`], which belongs to
//! exactly one flow attempt (its `flow_id`).
//!
//! # References
//!
//! - RFC 7636 <https://www.rfc-editor.org/rfc/rfc7636>

use std::fmt;

use base64::Engine as _;
use rand::RngCore as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// The only challenge method produced by this module.
pub const CHALLENGE_METHOD: &str = "S256";

/// Verifier and challenge for an in-flight authorization attempt.
///
/// `Debug` never prints the verifier.
///
/// # Examples
///
/// ```
/// use authflow::auth::pkce::PendingPkce;
/// use uuid::Uuid;
///
/// let pkce = PendingPkce::generate(Uuid::new_v4());
/// assert_eq!(pkce.code_verifier.len(), 43);
/// assert!(pkce.matches_challenge());
/// ```
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingPkce {
    /// The flow attempt this secret belongs to.
    pub flow_id: Uuid,
    /// 43-character base64url verifier, sent only to the token endpoint.
    pub code_verifier: String,
    /// S256 challenge, sent to the authorization endpoint.
    pub code_challenge: String,
    /// CSRF `state` expected back on the callback.
    pub state: String,
}

impl PendingPkce {
    /// Generates a fresh verifier, challenge, and state.
    pub fn generate(flow_id: Uuid) -> Self {
        let code_verifier = random_urlsafe(32);
        let code_challenge = challenge_for(&code_verifier);
        Self {
            flow_id,
            code_verifier,
            code_challenge,
            state: generate_state(),
        }
    }

    /// Rebuilds the secret from a persisted verifier.
    pub fn from_parts(flow_id: Uuid, code_verifier: String, state: String) -> Self {
        let code_challenge = challenge_for(&code_verifier);
        Self {
            flow_id,
            code_verifier,
            code_challenge,
            state,
        }
    }

    /// `true` when the challenge is the S256 digest of the verifier.
    pub fn matches_challenge(&self) -> bool {
        challenge_for(&self.code_verifier) == self.code_challenge
    }
}

impl fmt::Debug for PendingPkce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingPkce")
            .field("flow_id", &self.flow_id)
            .field("code_verifier", &"[REDACTED]")
            .field("code_challenge", &self.code_challenge)
            .field("state", &self.state)
            .finish()
    }
}

/// Computes the S256 challenge for a verifier.
///
/// # Examples
///
/// ```
/// use authflow::auth::pkce::challenge_for;
///
/// // RFC 7636 Appendix B
/// assert_eq!(
///     challenge_for("dBjftJeZ4CVP-mJ92K27uhbUJU1p1r-wW1gFWFOEjXk"),
///     "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
/// );
/// ```
pub fn challenge_for(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(digest.as_slice())
}

/// A random CSRF `state` value (16 bytes, base64url).
pub fn generate_state() -> String {
    random_urlsafe(16)
}

fn random_urlsafe(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

/// `true` for strings RFC 7636 accepts as a verifier: 43-128 characters
/// from the unreserved set.
pub fn is_valid_verifier(verifier: &str) -> bool {
    (43..=128).contains(&verifier.len())
        && verifier
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b'~'))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
