//! spfpolicy Common - Shared types and utilities
//!
//! This crate provides the transaction types, configuration, and error
//! types shared by the policy core and the daemon binary.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::ClientRequest;
