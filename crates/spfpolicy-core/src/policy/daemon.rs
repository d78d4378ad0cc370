//! Policy daemon session loop
//!
//! Serves one MTA session: reads requests, evaluates them and writes one
//! decision per request until the peer closes the stream or the
//! transaction cap is reached.

use super::decision::{decide, PolicyDecision};
use super::orchestrator::{ProtocolError, QueryOrchestrator};
use super::protocol::{read_request, write_decision, ReadOutcome};
use super::trace::ResultTrace;
use crate::email_auth::SpfEngine;
use spfpolicy_common::{ClientRequest, Result};
use tokio::io::{AsyncBufRead, AsyncWrite};
use tracing::{debug, info, warn};

/// Session state
#[derive(Debug)]
enum SessionState {
    AwaitingRequest,
    Evaluating(ClientRequest),
    Responding {
        request: ClientRequest,
        decision: PolicyDecision,
    },
    GracefulShutdown,
}

/// Outcome of a finished session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonSummary {
    /// Code of the last decision, 0 when nothing was answered
    pub exit_code: u8,
    /// Number of answered transactions
    pub transactions: usize,
}

/// Sequential policy server for one session
pub struct PolicyDaemon<E: SpfEngine> {
    orchestrator: QueryOrchestrator<E>,
    request_limit: usize,
    debug: u8,
}

impl<E: SpfEngine> PolicyDaemon<E> {
    /// Create a new daemon
    pub fn new(orchestrator: QueryOrchestrator<E>, request_limit: usize, debug: u8) -> Self {
        Self {
            orchestrator,
            request_limit,
            debug,
        }
    }

    /// Serve requests until end of stream or the transaction cap
    ///
    /// I/O errors on either stream end the session with an error.
    pub async fn run<R, W>(&self, reader: &mut R, writer: &mut W) -> Result<DaemonSummary>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut summary = DaemonSummary {
            exit_code: 0,
            transactions: 0,
        };
        let mut trace = ResultTrace::new();
        let mut state = if self.request_limit == 0 {
            SessionState::GracefulShutdown
        } else {
            SessionState::AwaitingRequest
        };

        loop {
            state = match state {
                SessionState::AwaitingRequest => match read_request(reader, self.debug).await? {
                    ReadOutcome::Request(request) => SessionState::Evaluating(request),
                    ReadOutcome::Malformed { request, missing } => {
                        warn!("Request without {} ({})", missing, request);
                        SessionState::Responding {
                            request,
                            decision: PolicyDecision::temporary_failure(),
                        }
                    }
                    ReadOutcome::EndOfSession => {
                        info!("IO closed while reading");
                        SessionState::GracefulShutdown
                    }
                },

                SessionState::Evaluating(request) => {
                    trace.reset();
                    let decision = match self.orchestrator.evaluate(&request, &mut trace).await {
                        Ok(verdict) => decide(&verdict),
                        Err(ProtocolError::Unauthenticatable) => {
                            debug!("Not checking ({})", request);
                            ProtocolError::Unauthenticatable.decision()
                        }
                        Err(err) => {
                            warn!("{} ({})", err, request);
                            err.decision()
                        }
                    };
                    if self.debug > 1 && !trace.is_empty() {
                        debug!("Results: {}", trace);
                    }
                    SessionState::Responding { request, decision }
                }

                SessionState::Responding { request, decision } => {
                    write_decision(writer, &decision).await?;
                    if self.debug > 0 {
                        info!("{} ({})", decision, request);
                    }
                    summary.transactions += 1;
                    summary.exit_code = decision.code;

                    if summary.transactions >= self.request_limit {
                        debug!("Transaction limit {} reached", self.request_limit);
                        SessionState::GracefulShutdown
                    } else {
                        SessionState::AwaitingRequest
                    }
                }

                SessionState::GracefulShutdown => {
                    info!(
                        "Terminating with result {}, transactions {}",
                        summary.exit_code, summary.transactions
                    );
                    return Ok(summary);
                }
            };
        }
    }
}
