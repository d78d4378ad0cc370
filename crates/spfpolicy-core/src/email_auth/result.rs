//! SPF result vocabulary

use serde::{Deserialize, Serialize};
use std::fmt;

/// SPF verification result
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpfResult {
    /// The sending IP is authorized
    Pass,
    /// The sending IP is explicitly not authorized
    Fail,
    /// The sending IP is probably not authorized (soft fail)
    SoftFail,
    /// The domain owner has no opinion
    Neutral,
    /// No SPF record found
    None,
    /// Temporary error (DNS timeout, etc.)
    TempError,
    /// Permanent error (invalid SPF record)
    PermError,
    /// The evaluation did not produce a usable result
    Invalid,
}

impl SpfResult {
    /// All results, in numeric code order
    pub const ALL: [SpfResult; 8] = [
        SpfResult::Invalid,
        SpfResult::Neutral,
        SpfResult::Pass,
        SpfResult::Fail,
        SpfResult::SoftFail,
        SpfResult::None,
        SpfResult::TempError,
        SpfResult::PermError,
    ];

    /// Symbolic name, as used in traces and Received-SPF headers
    pub fn as_str(&self) -> &'static str {
        match self {
            SpfResult::Invalid => "(invalid)",
            SpfResult::Neutral => "neutral",
            SpfResult::Pass => "pass",
            SpfResult::Fail => "fail",
            SpfResult::SoftFail => "softfail",
            SpfResult::None => "none",
            SpfResult::TempError => "temperror",
            SpfResult::PermError => "permerror",
        }
    }

    /// Numeric code, used as the process exit status
    pub fn code(&self) -> u8 {
        match self {
            SpfResult::Invalid => 0,
            SpfResult::Neutral => 1,
            SpfResult::Pass => 2,
            SpfResult::Fail => 3,
            SpfResult::SoftFail => 4,
            SpfResult::None => 5,
            SpfResult::TempError => 6,
            SpfResult::PermError => 7,
        }
    }

    /// Whether the domain owner expressed a definite opinion about the host
    pub fn is_definitive(&self) -> bool {
        matches!(self, SpfResult::Pass | SpfResult::Fail | SpfResult::SoftFail)
    }
}

impl fmt::Display for SpfResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one SPF query
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub result: SpfResult,
    /// Text suitable for an SMTP reply
    pub smtp_comment: Option<String>,
    /// Text suitable for the comment part of a trace header
    pub header_comment: Option<String>,
    /// Complete `Received-SPF: ...` header line
    pub received_spf: Option<String>,
}

impl Verdict {
    /// A verdict carrying only a result
    pub fn new(result: SpfResult) -> Self {
        Self {
            result,
            smtp_comment: None,
            header_comment: None,
            received_spf: None,
        }
    }

    pub fn with_smtp_comment(mut self, comment: impl Into<String>) -> Self {
        self.smtp_comment = Some(comment.into());
        self
    }

    pub fn with_header_comment(mut self, comment: impl Into<String>) -> Self {
        self.header_comment = Some(comment.into());
        self
    }

    pub fn with_received_spf(mut self, header: impl Into<String>) -> Self {
        self.received_spf = Some(header.into());
        self
    }

    /// Whether a best-guess query should be tried after this verdict
    pub fn wants_fallback(&self) -> bool {
        self.result == SpfResult::None
    }
}
