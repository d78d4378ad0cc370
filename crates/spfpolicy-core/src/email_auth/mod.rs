//! Email Authentication Module
//!
//! Provides SPF verification of the envelope sender, exposed to the policy
//! pipeline through the [`SpfEngine`] trait.

pub mod dns;
pub mod engine;
pub mod macros;
pub mod result;
pub mod spf;

pub use dns::{DnsError, DnsResolver};
pub use engine::{combine_verdicts, EngineError, SpfEngine, SpfIdentity};
pub use result::{SpfResult, Verdict};
pub use spf::{check_fallback_record, SpfVerifier};

/// Check that a name is a syntactically valid domain
///
/// A single trailing dot is allowed. Labels may contain letters, digits,
/// hyphens and underscores and may not start or end with a hyphen.
pub fn is_valid_domain(name: &str) -> bool {
    let name = name.strip_suffix('.').unwrap_or(name);
    if name.is_empty() || name.len() > 253 {
        return false;
    }

    name.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_domains() {
        assert!(is_valid_domain("example.com"));
        assert!(is_valid_domain("mail.example.com."));
        assert!(is_valid_domain("_spf.example-mail.net"));
        assert!(is_valid_domain("localhost"));
    }

    #[test]
    fn test_invalid_domains() {
        assert!(!is_valid_domain(""));
        assert!(!is_valid_domain("."));
        assert!(!is_valid_domain("bad..domain"));
        assert!(!is_valid_domain("-leading.example"));
        assert!(!is_valid_domain("space in.example"));
        assert!(!is_valid_domain(&"a".repeat(64)));
    }
}
