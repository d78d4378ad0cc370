//! spfpolicy Core - SPF policy decisions for MTA policy delegation
//!
//! This crate provides the SPF evaluation engine and the policy pipeline
//! that reads transactions from the MTA, queries the engine, and answers
//! with an access action.

pub mod email_auth;
pub mod policy;

pub use email_auth::{EngineError, SpfEngine, SpfIdentity, SpfResult, SpfVerifier, Verdict};
pub use policy::{
    decide, DaemonSummary, PolicyAction, PolicyDaemon, PolicyDecision, ProtocolError,
    QueryOrchestrator, ReadOutcome, ResultTrace,
};
