//! Policy decisions
//!
//! Maps an SPF verdict to the access action returned to the MTA.

use crate::email_auth::{SpfResult, Verdict};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Exit code recorded for decisions synthesized without a verdict
pub const SYNTHESIZED_CODE: u8 = 255;

/// Comment of the synthesized temporary failure
pub const TEMPORARY_FAILURE_COMMENT: &str = "please contact postmaster if the error remains";

/// Access action understood by the MTA
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyAction {
    /// Continue normal processing
    Dunno,
    /// Refuse the transaction
    Reject,
    /// Temporarily fail the transaction
    Defer,
}

/// One answer to one transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub action: PolicyAction,
    /// Reason given to the client (reject and defer only)
    pub comment: Option<String>,
    /// Trace header prepended as `X-<header>` (pass-through only)
    pub prepend_header: Option<String>,
    /// Numeric result code, used as the process exit status
    pub code: u8,
}

impl PolicyDecision {
    /// Defer used for malformed input and engine failures
    pub fn temporary_failure() -> Self {
        Self {
            action: PolicyAction::Defer,
            comment: Some(TEMPORARY_FAILURE_COMMENT.to_string()),
            prepend_header: None,
            code: SYNTHESIZED_CODE,
        }
    }

    /// Pass-through for a transaction that cannot be checked
    pub fn unauthenticated(reason: &str) -> Self {
        Self {
            action: PolicyAction::Dunno,
            comment: None,
            prepend_header: Some(format!("Received-SPF: {}", reason)),
            code: SYNTHESIZED_CODE,
        }
    }

    /// Value of the `action=` line
    pub fn action_text(&self) -> String {
        let comment = self.comment.as_deref().unwrap_or_default();
        match self.action {
            PolicyAction::Dunno => "DUNNO".to_string(),
            PolicyAction::Reject if comment.is_empty() => "REJECT".to_string(),
            PolicyAction::Reject => format!("REJECT {}", comment),
            PolicyAction::Defer => format!("450 temporary failure: {}", comment),
        }
    }

    /// Encode as protocol response, including the terminating blank line
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        if self.action == PolicyAction::Dunno {
            if let Some(header) = &self.prepend_header {
                out.push_str(&format!("action=PREPEND X-{}\n", header));
            }
        }
        out.push_str(&format!("action={}\n\n", self.action_text()));
        out
    }
}

impl fmt::Display for PolicyDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "action={}", self.action_text())?;
        if let Some(header) = &self.prepend_header {
            write!(f, " {}", header)?;
        }
        Ok(())
    }
}

/// Map a combined verdict to a decision
pub fn decide(verdict: &Verdict) -> PolicyDecision {
    let code = verdict.result.code();

    match verdict.result {
        SpfResult::Fail => PolicyDecision {
            action: PolicyAction::Reject,
            comment: Some(
                verdict
                    .smtp_comment
                    .clone()
                    .or_else(|| verdict.header_comment.clone())
                    .unwrap_or_default(),
            ),
            prepend_header: None,
            code,
        },
        SpfResult::TempError | SpfResult::PermError | SpfResult::Invalid => PolicyDecision {
            action: PolicyAction::Defer,
            comment: Some(verdict.smtp_comment.clone().unwrap_or_default()),
            prepend_header: None,
            code,
        },
        SpfResult::Pass | SpfResult::SoftFail | SpfResult::Neutral | SpfResult::None => {
            PolicyDecision {
                action: PolicyAction::Dunno,
                comment: None,
                prepend_header: verdict.received_spf.clone(),
                code,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_decide_is_total() {
        for result in SpfResult::ALL {
            let decision = decide(&Verdict::new(result));
            let expected = match result {
                SpfResult::Fail => PolicyAction::Reject,
                SpfResult::TempError | SpfResult::PermError | SpfResult::Invalid => {
                    PolicyAction::Defer
                }
                _ => PolicyAction::Dunno,
            };
            assert_eq!(decision.action, expected, "{}", result);
            assert_eq!(decision.code, result.code());
        }
    }

    #[test]
    fn test_pass_prepends_header() {
        let verdict = Verdict::new(SpfResult::Pass)
            .with_smtp_comment("ignored")
            .with_received_spf("Received-SPF: pass (example)");
        let decision = decide(&verdict);

        assert_eq!(decision.comment, None);
        assert_eq!(
            decision.to_wire(),
            "action=PREPEND X-Received-SPF: pass (example)\naction=DUNNO\n\n"
        );
    }

    #[test]
    fn test_pass_without_header() {
        assert_eq!(
            decide(&Verdict::new(SpfResult::Neutral)).to_wire(),
            "action=DUNNO\n\n"
        );
    }

    #[test]
    fn test_fail_comment_precedence() {
        let verdict = Verdict::new(SpfResult::Fail)
            .with_smtp_comment("blocked")
            .with_header_comment("header")
            .with_received_spf("Received-SPF: fail");
        assert_eq!(decide(&verdict).to_wire(), "action=REJECT blocked\n\n");

        let verdict = Verdict::new(SpfResult::Fail).with_header_comment("header");
        assert_eq!(decide(&verdict).to_wire(), "action=REJECT header\n\n");

        assert_eq!(
            decide(&Verdict::new(SpfResult::Fail)).to_wire(),
            "action=REJECT\n\n"
        );
    }

    #[test]
    fn test_errors_defer() {
        let verdict = Verdict::new(SpfResult::TempError)
            .with_smtp_comment("DNS timeout")
            .with_header_comment("not used");
        assert_eq!(
            decide(&verdict).to_wire(),
            "action=450 temporary failure: DNS timeout\n\n"
        );
        assert_eq!(
            decide(&Verdict::new(SpfResult::PermError)).action_text(),
            "450 temporary failure: "
        );
    }

    #[test]
    fn test_synthesized_decisions() {
        assert_eq!(
            PolicyDecision::temporary_failure().to_wire(),
            "action=450 temporary failure: please contact postmaster if the error remains\n\n"
        );
        let decision = PolicyDecision::unauthenticated("no valid email address found");
        assert_eq!(decision.code, SYNTHESIZED_CODE);
        assert_eq!(
            decision.to_wire(),
            "action=PREPEND X-Received-SPF: no valid email address found\naction=DUNNO\n\n"
        );
    }
}
