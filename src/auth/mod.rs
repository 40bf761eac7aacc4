//! OAuth 2.1 building blocks used by the flow
//!
//! Every function here that talks to the network takes a
//! [`Recorder`](crate::flow::capture::Recorder), so each exchange ends up
//! on the flow snapshot.
//!
//! # Module Layout
//!
//! - [`discovery`]    -- probe, RFC 9728 resource metadata, RFC 8414 / OIDC
//!   authorization server metadata
//! - [`registration`] -- dynamic, preregistered, and metadata-document clients
//! - [`pkce`]         -- `S256` verifier, challenge, and CSRF state
//! - [`redirect`]     -- authorize URL construction and browser launching
//! - [`callback`]     -- redirect parsing and the loopback listener
//! - [`token`]        -- code exchange and refresh
//! - [`manager`]      -- per-server flows and callback routing

pub mod callback;
pub mod discovery;
pub mod manager;
pub mod pkce;
pub mod redirect;
pub mod registration;
pub mod token;
