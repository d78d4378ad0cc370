//! Policy Service Module
//!
//! Implements the MTA access-policy delegation protocol: requests are read
//! from the session stream, checked with SPF and answered with an access
//! action.

mod daemon;
mod decision;
mod orchestrator;
mod protocol;
mod trace;

pub use daemon::{DaemonSummary, PolicyDaemon};
pub use decision::{decide, PolicyAction, PolicyDecision, SYNTHESIZED_CODE};
pub use orchestrator::{ProtocolError, QueryOrchestrator};
pub use protocol::{read_request, write_decision, ReadOutcome};
pub use trace::ResultTrace;
