//! Query orchestration
//!
//! Validates one request, then runs the primary, recipient and fallback
//! queries against an [`SpfEngine`] and merges their verdicts.

use super::decision::PolicyDecision;
use super::trace::ResultTrace;
use crate::email_auth::{
    is_valid_domain, EngineError, SpfEngine, SpfIdentity, SpfResult, Verdict,
};
use spfpolicy_common::ClientRequest;
use std::net::IpAddr;
use thiserror::Error;
use tracing::{debug, warn};

/// Reason no verdict could be produced for a request
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Invalid client address: {0}")]
    InvalidAddress(String),
    #[error("Invalid HELO name: {0}")]
    InvalidHelo(String),
    #[error("No valid email address found")]
    Unauthenticatable,
    #[error("Invalid sender: {0}")]
    InvalidSender(String),
    #[error("SPF query failed: {0}")]
    QueryFailed(EngineError),
}

impl ProtocolError {
    /// Decision sent in place of a mapped verdict
    pub fn decision(&self) -> PolicyDecision {
        match self {
            ProtocolError::Unauthenticatable => {
                PolicyDecision::unauthenticated("no valid email address found")
            }
            _ => PolicyDecision::temporary_failure(),
        }
    }
}

impl From<EngineError> for ProtocolError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::InvalidSender(sender) => ProtocolError::InvalidSender(sender),
            other => ProtocolError::QueryFailed(other),
        }
    }
}

/// Runs the queries of one transaction
pub struct QueryOrchestrator<E: SpfEngine> {
    engine: E,
    fallback: Option<String>,
    rcpt_to_mx: bool,
}

impl<E: SpfEngine> QueryOrchestrator<E> {
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            fallback: None,
            rcpt_to_mx: false,
        }
    }

    /// Best-guess record used when the sender's domain publishes none
    pub fn with_fallback(mut self, record: Option<String>) -> Self {
        self.fallback = record.filter(|r| !r.trim().is_empty());
        self
    }

    /// Also accept clients that are MX hosts of a recipient's domain
    pub fn with_rcpt_to_mx(mut self, enabled: bool) -> Self {
        self.rcpt_to_mx = enabled;
        self
    }

    /// Evaluate one request
    ///
    /// The name of every query's result is appended to `trace`, including
    /// queries that precede a failure.
    pub async fn evaluate(
        &self,
        request: &ClientRequest,
        trace: &mut ResultTrace,
    ) -> Result<Verdict, ProtocolError> {
        let raw_ip = request.ip.as_deref().unwrap_or_default();
        let ip: IpAddr = raw_ip
            .trim()
            .parse()
            .map_err(|_| ProtocolError::InvalidAddress(raw_ip.to_string()))?;

        let helo = match request.helo.as_deref().map(str::trim) {
            None | Some("") => None,
            Some(name) if is_valid_helo(name) => Some(name.to_string()),
            Some(name) => return Err(ProtocolError::InvalidHelo(name.to_string())),
        };

        let sender = request.sender.as_deref().unwrap_or_default().trim();
        if !sender.contains('@') {
            debug!("Sender {:?} has no domain, not checking", sender);
            return Err(ProtocolError::Unauthenticatable);
        }

        let identity = SpfIdentity::new(ip, helo, sender);

        let mut verdict = self.engine.query_mail_from(&identity).await?;
        trace.append(verdict.result);
        debug!("mail_from: {}", verdict.result);

        if self.rcpt_to_mx {
            for recipient in request.recipients() {
                if verdict.result == SpfResult::Pass {
                    break;
                }
                let secondary = match self.engine.query_rcpt_to(&identity, recipient).await {
                    Ok(secondary) => secondary,
                    Err(EngineError::InvalidSender(reason)) => {
                        warn!("Skipping recipient {}: {}", recipient, reason);
                        continue;
                    }
                    Err(err) => return Err(ProtocolError::QueryFailed(err)),
                };
                trace.append(secondary.result);
                debug!("rcpt_to {}: {}", recipient, secondary.result);
                verdict = self.engine.combine(verdict, secondary);
            }
        }

        if let Some(record) = &self.fallback {
            if verdict.wants_fallback() {
                let secondary = self.engine.query_fallback(&identity, record).await?;
                trace.append(secondary.result);
                debug!("fallback: {}", secondary.result);
                verdict = self.engine.combine(verdict, secondary);
            }
        }

        Ok(verdict)
    }
}

/// HELO names are domains or bracketed address literals
fn is_valid_helo(name: &str) -> bool {
    match name.strip_prefix('[').and_then(|n| n.strip_suffix(']')) {
        Some(literal) => {
            let literal = literal.strip_prefix("IPv6:").unwrap_or(literal);
            literal.parse::<IpAddr>().is_ok()
        }
        None => is_valid_domain(name),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Engine answering with fixed results and counting calls
    #[derive(Clone, Default)]
    pub(crate) struct FixedEngine {
        pub mail_from: Option<SpfResult>,
        pub rcpt_to: Option<SpfResult>,
        pub fallback: Option<SpfResult>,
        pub calls: Arc<AtomicUsize>,
    }

    impl FixedEngine {
        pub fn answering(result: SpfResult) -> Self {
            Self {
                mail_from: Some(result),
                ..Default::default()
            }
        }

        pub fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn answer(&self, result: Option<SpfResult>) -> Result<Verdict, EngineError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match result {
                Some(result) => Ok(Verdict::new(result)
                    .with_header_comment(format!("test: {}", result))
                    .with_received_spf(format!("Received-SPF: {} (test)", result))),
                None => Err(EngineError::InvalidRecord("no answer".to_string())),
            }
        }
    }

    #[async_trait]
    impl SpfEngine for FixedEngine {
        async fn query_mail_from(&self, _identity: &SpfIdentity) -> Result<Verdict, EngineError> {
            self.answer(self.mail_from)
        }

        async fn query_rcpt_to(
            &self,
            _identity: &SpfIdentity,
            recipient: &str,
        ) -> Result<Verdict, EngineError> {
            if !recipient.contains('@') {
                self.calls.fetch_add(1, Ordering::SeqCst);
                return Err(EngineError::InvalidSender(recipient.to_string()));
            }
            self.answer(self.rcpt_to)
        }

        async fn query_fallback(
            &self,
            _identity: &SpfIdentity,
            _record: &str,
        ) -> Result<Verdict, EngineError> {
            self.answer(self.fallback)
        }
    }

    fn request(ip: &str, sender: &str, helo: Option<&str>, rcpt: Option<&str>) -> ClientRequest {
        ClientRequest {
            ip: Some(ip.to_string()),
            sender: Some(sender.to_string()),
            helo: helo.map(str::to_string),
            rcpt_to: rcpt.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_primary_only() {
        let engine = FixedEngine::answering(SpfResult::Pass);
        let orchestrator = QueryOrchestrator::new(engine.clone());
        let mut trace = ResultTrace::new();

        let verdict = orchestrator
            .evaluate(
                &request("192.0.2.1", "a@example.com", Some("mail.example.com"), None),
                &mut trace,
            )
            .await
            .unwrap();

        assert_eq!(verdict.result, SpfResult::Pass);
        assert_eq!(trace.as_str(), "pass");
        assert_eq!(engine.call_count(), 1);
    }

    #[tokio::test]
    async fn test_sender_without_at_skips_engine() {
        let engine = FixedEngine::answering(SpfResult::Pass);
        let orchestrator = QueryOrchestrator::new(engine.clone());
        let mut trace = ResultTrace::new();

        for sender in ["", "postmaster", "<>"] {
            let err = orchestrator
                .evaluate(&request("192.0.2.1", sender, None, None), &mut trace)
                .await
                .unwrap_err();
            assert!(matches!(err, ProtocolError::Unauthenticatable));
            assert_eq!(err.decision().code, 255);
        }
        assert_eq!(engine.call_count(), 0);
        assert!(trace.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_address_defers() {
        let engine = FixedEngine::answering(SpfResult::Pass);
        let orchestrator = QueryOrchestrator::new(engine.clone());
        let mut trace = ResultTrace::new();

        for ip in ["", "999.1.1.1", "not-an-ip", "192.0.2.1/24"] {
            let err = orchestrator
                .evaluate(&request(ip, "a@example.com", None, None), &mut trace)
                .await
                .unwrap_err();
            assert!(matches!(err, ProtocolError::InvalidAddress(_)), "{}", ip);
            assert_eq!(err.decision(), PolicyDecision::temporary_failure());
        }
        assert_eq!(engine.call_count(), 0);
    }

    #[tokio::test]
    async fn test_helo_validation() {
        let engine = FixedEngine::answering(SpfResult::Neutral);
        let orchestrator = QueryOrchestrator::new(engine.clone());
        let mut trace = ResultTrace::new();

        let err = orchestrator
            .evaluate(
                &request("192.0.2.1", "a@example.com", Some("bad..helo"), None),
                &mut trace,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidHelo(_)));

        for helo in ["", "[192.0.2.1]", "[IPv6:2001:db8::1]"] {
            orchestrator
                .evaluate(&request("192.0.2.1", "a@example.com", Some(helo), None), &mut trace)
                .await
                .unwrap();
        }
        assert_eq!(engine.call_count(), 3);
    }

    #[tokio::test]
    async fn test_fallback_only_when_none() {
        let engine = FixedEngine {
            mail_from: Some(SpfResult::None),
            fallback: Some(SpfResult::Pass),
            ..Default::default()
        };
        let orchestrator = QueryOrchestrator::new(engine.clone())
            .with_fallback(Some("v=spf1 a/24 mx/24 ptr".to_string()));
        let mut trace = ResultTrace::new();

        let verdict = orchestrator
            .evaluate(&request("192.0.2.1", "a@example.com", None, None), &mut trace)
            .await
            .unwrap();
        assert_eq!(verdict.result, SpfResult::Pass);
        assert_eq!(trace.as_str(), "nonepass");

        let engine = FixedEngine {
            mail_from: Some(SpfResult::Neutral),
            fallback: Some(SpfResult::Pass),
            ..Default::default()
        };
        let orchestrator =
            QueryOrchestrator::new(engine.clone()).with_fallback(Some("v=spf1 +all".to_string()));
        trace.reset();
        let verdict = orchestrator
            .evaluate(&request("192.0.2.1", "a@example.com", None, None), &mut trace)
            .await
            .unwrap();
        assert_eq!(verdict.result, SpfResult::Neutral);
        assert_eq!(engine.call_count(), 1);
    }

    #[tokio::test]
    async fn test_recipient_mx_mode() {
        let engine = FixedEngine {
            mail_from: Some(SpfResult::Neutral),
            rcpt_to: Some(SpfResult::Pass),
            ..Default::default()
        };
        let orchestrator = QueryOrchestrator::new(engine.clone()).with_rcpt_to_mx(true);
        let mut trace = ResultTrace::new();

        let verdict = orchestrator
            .evaluate(
                &request(
                    "192.0.2.1",
                    "a@example.com",
                    None,
                    Some("bogus; b@example.org, c@example.net"),
                ),
                &mut trace,
            )
            .await
            .unwrap();

        // Invalid recipient skipped, loop stops after the first pass
        assert_eq!(verdict.result, SpfResult::Pass);
        assert_eq!(trace.as_str(), "neutralpass");
        assert_eq!(engine.call_count(), 3);
    }

    #[tokio::test]
    async fn test_recipient_mx_mode_disabled() {
        let engine = FixedEngine {
            mail_from: Some(SpfResult::Neutral),
            rcpt_to: Some(SpfResult::Pass),
            ..Default::default()
        };
        let orchestrator = QueryOrchestrator::new(engine.clone());
        let mut trace = ResultTrace::new();

        let verdict = orchestrator
            .evaluate(
                &request("192.0.2.1", "a@example.com", None, Some("b@example.org")),
                &mut trace,
            )
            .await
            .unwrap();
        assert_eq!(verdict.result, SpfResult::Neutral);
        assert_eq!(engine.call_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_keeps_trace() {
        let engine = FixedEngine {
            mail_from: Some(SpfResult::None),
            fallback: None,
            ..Default::default()
        };
        let orchestrator =
            QueryOrchestrator::new(engine).with_fallback(Some("v=spf1 mx".to_string()));
        let mut trace = ResultTrace::new();

        let err = orchestrator
            .evaluate(&request("192.0.2.1", "a@example.com", None, None), &mut trace)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::QueryFailed(_)));
        assert_eq!(trace.as_str(), "none");
    }

    #[tokio::test]
    async fn test_engine_invalid_sender() {
        let orchestrator = QueryOrchestrator::new(InvalidSenderEngine);
        let mut trace = ResultTrace::new();
        let err = orchestrator
            .evaluate(&request("192.0.2.1", "a@", None, None), &mut trace)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidSender(_)));
        assert_eq!(err.decision(), PolicyDecision::temporary_failure());
    }

    struct InvalidSenderEngine;

    #[async_trait]
    impl SpfEngine for InvalidSenderEngine {
        async fn query_mail_from(&self, identity: &SpfIdentity) -> Result<Verdict, EngineError> {
            Err(EngineError::InvalidSender(identity.sender.clone()))
        }

        async fn query_rcpt_to(
            &self,
            identity: &SpfIdentity,
            _recipient: &str,
        ) -> Result<Verdict, EngineError> {
            self.query_mail_from(identity).await
        }

        async fn query_fallback(
            &self,
            identity: &SpfIdentity,
            _record: &str,
        ) -> Result<Verdict, EngineError> {
            self.query_mail_from(identity).await
        }
    }
}
