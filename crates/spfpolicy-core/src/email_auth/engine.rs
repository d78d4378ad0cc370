//! SPF engine interface
//!
//! The policy pipeline talks to SPF evaluation only through [`SpfEngine`].
//! [`SpfVerifier`](super::SpfVerifier) is the DNS-backed implementation;
//! tests plug in fixed-answer engines.

use super::result::{SpfResult, Verdict};
use async_trait::async_trait;
use std::net::IpAddr;
use thiserror::Error;

/// SPF engine errors
///
/// An error means no verdict could be produced at all. A negative verdict
/// (fail, temperror, ...) is an `Ok` value.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid sender identity: {0}")]
    InvalidSender(String),
    #[error("Invalid SPF record: {0}")]
    InvalidRecord(String),
    #[error("Invalid macro string: {0}")]
    InvalidMacro(String),
}

/// The identity being checked
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpfIdentity {
    /// Connecting client address
    pub ip: IpAddr,
    /// HELO/EHLO domain, if the client sent one
    pub helo: Option<String>,
    /// Envelope sender (`local@domain`)
    pub sender: String,
}

impl SpfIdentity {
    pub fn new(ip: IpAddr, helo: Option<String>, sender: impl Into<String>) -> Self {
        Self {
            ip,
            helo,
            sender: sender.into(),
        }
    }

    /// Local part of the sender, `postmaster` when empty
    pub fn local_part(&self) -> &str {
        match self.sender.rsplit_once('@') {
            Some((local, _)) if !local.is_empty() => local.trim_start_matches('<'),
            _ => "postmaster",
        }
    }

    /// Domain part of the sender, lowercased
    pub fn sender_domain(&self) -> Option<String> {
        extract_domain(&self.sender)
    }
}

/// Extract domain from email address
pub fn extract_domain(email: &str) -> Option<String> {
    // Handle <user@domain> format
    let email = email.trim_start_matches('<').trim_end_matches('>');

    if let Some(at_pos) = email.rfind('@') {
        let domain = email[at_pos + 1..].trim_end_matches('.');
        if !domain.is_empty() {
            return Some(domain.to_lowercase());
        }
    }

    None
}

/// Capability interface of an SPF evaluation engine
#[async_trait]
pub trait SpfEngine: Send + Sync {
    /// Check the envelope sender's domain
    async fn query_mail_from(&self, identity: &SpfIdentity) -> Result<Verdict, EngineError>;

    /// Check whether the client is a designated mail exchanger of the
    /// recipient's domain
    async fn query_rcpt_to(
        &self,
        identity: &SpfIdentity,
        recipient: &str,
    ) -> Result<Verdict, EngineError>;

    /// Check the envelope sender's domain against a best-guess record
    async fn query_fallback(
        &self,
        identity: &SpfIdentity,
        record: &str,
    ) -> Result<Verdict, EngineError>;

    /// Merge a primary verdict with a secondary one
    fn combine(&self, primary: Verdict, secondary: Verdict) -> Verdict {
        combine_verdicts(primary, secondary)
    }
}

/// Default merge rule
///
/// A pass on either side wins. A definitive secondary (fail, softfail)
/// replaces an indefinite primary (none, neutral). Otherwise the primary
/// stands.
pub fn combine_verdicts(primary: Verdict, secondary: Verdict) -> Verdict {
    if primary.result == SpfResult::Pass {
        return primary;
    }
    if secondary.result == SpfResult::Pass {
        return secondary;
    }
    if matches!(primary.result, SpfResult::None | SpfResult::Neutral)
        && secondary.result.is_definitive()
    {
        return secondary;
    }
    primary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verdict(result: SpfResult) -> Verdict {
        Verdict::new(result)
    }

    #[test]
    fn test_extract_domain() {
        assert_eq!(
            extract_domain("user@example.com"),
            Some("example.com".to_string())
        );
        assert_eq!(
            extract_domain("<user@example.com>"),
            Some("example.com".to_string())
        );
        assert_eq!(
            extract_domain("User@Example.COM."),
            Some("example.com".to_string())
        );
        assert_eq!(extract_domain("nodomain"), None);
        assert_eq!(extract_domain("user@"), None);
    }

    #[test]
    fn test_local_part() {
        let ip: IpAddr = "192.0.2.1".parse().unwrap();
        assert_eq!(SpfIdentity::new(ip, None, "bob@example.com").local_part(), "bob");
        assert_eq!(SpfIdentity::new(ip, None, "@example.com").local_part(), "postmaster");
    }

    #[test]
    fn test_combine_pass_wins() {
        let combined = combine_verdicts(verdict(SpfResult::Fail), verdict(SpfResult::Pass));
        assert_eq!(combined.result, SpfResult::Pass);
        let combined = combine_verdicts(verdict(SpfResult::Pass), verdict(SpfResult::Fail));
        assert_eq!(combined.result, SpfResult::Pass);
    }

    #[test]
    fn test_combine_definitive_replaces_indefinite() {
        let combined = combine_verdicts(verdict(SpfResult::None), verdict(SpfResult::SoftFail));
        assert_eq!(combined.result, SpfResult::SoftFail);
        let combined =
            combine_verdicts(verdict(SpfResult::Neutral), verdict(SpfResult::TempError));
        assert_eq!(combined.result, SpfResult::Neutral);
        let combined = combine_verdicts(verdict(SpfResult::Fail), verdict(SpfResult::Neutral));
        assert_eq!(combined.result, SpfResult::Fail);
    }
}
