//! Common types for spfpolicy

use serde::{Deserialize, Serialize};
use std::fmt;

/// Attributes of one MTA transaction, as sent over the policy protocol
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientRequest {
    /// Client address (`client_address=`)
    pub ip: Option<String>,

    /// Envelope sender (`sender=`)
    pub sender: Option<String>,

    /// HELO/EHLO name (`helo_name=`)
    pub helo: Option<String>,

    /// Envelope recipient(s) (`recipient=`)
    pub rcpt_to: Option<String>,
}

impl ClientRequest {
    /// Number of attributes collected so far
    pub fn attribute_count(&self) -> usize {
        [&self.ip, &self.sender, &self.helo, &self.rcpt_to]
            .iter()
            .filter(|attr| attr.is_some())
            .count()
    }

    /// Returns the name of the first required attribute that is missing
    pub fn missing_required(&self) -> Option<&'static str> {
        if self.ip.is_none() {
            Some("client_address")
        } else if self.sender.is_none() {
            Some("sender")
        } else {
            None
        }
    }

    /// Individual recipients, split on `,` or `;`
    pub fn recipients(&self) -> Vec<&str> {
        self.rcpt_to
            .as_deref()
            .unwrap_or_default()
            .split([',', ';'])
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .collect()
    }
}

impl fmt::Display for ClientRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ip={} from={} helo={} to={}",
            self.ip.as_deref().unwrap_or_default(),
            self.sender.as_deref().unwrap_or_default(),
            self.helo.as_deref().unwrap_or_default(),
            self.rcpt_to.as_deref().unwrap_or_default()
        )
    }
}
