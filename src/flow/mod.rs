//! The authorization flow
//!
//! # Module Layout
//!
//! - [`state`]   -- immutable [`FlowState`](state::FlowState) snapshots and
//!   the transition function
//! - [`version`] -- per-revision step plans and discovery candidates
//! - [`capture`] -- request/response recording with secret redaction
//! - [`marker`]  -- what a parked flow persists to survive a restart
//! - [`machine`] -- the orchestrator: `proceed()`, `reset()`, callback
//!   delivery, refresh, resume

pub mod capture;
pub mod machine;
pub mod marker;
pub mod state;
pub mod version;
