//! SPF (Sender Policy Framework) verification
//!
//! Implements RFC 7208 - Sender Policy Framework (SPF) for Authorizing Use of Domains in Email

use super::dns::{DnsError, DnsResolver};
use super::engine::{extract_domain, EngineError, SpfEngine, SpfIdentity};
use super::is_valid_domain;
use super::macros::{MacroContext, MacroString};
use super::result::{SpfResult, Verdict};
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use spfpolicy_common::config::DEFAULT_EXPLANATION;
use std::fmt;
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

/// RFC 7208 limit on DNS-querying mechanisms
pub const DEFAULT_MAX_DNS_MECH: usize = 10;

/// Include appended to the local policy when trusted forwarders are enabled
pub const TRUSTED_FORWARDER_INCLUDE: &str = "include:spf.trusted-forwarder.org";

/// Nesting bound for include/redirect chains
const MAX_DEPTH: usize = 10;

/// MX hosts examined per `mx` mechanism
const MAX_MX_HOSTS: usize = 10;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Address prefix lengths of `a`/`mx` mechanisms (`a/24//64`)
#[derive(Debug, Clone, Copy, PartialEq)]
struct DualCidr {
    v4: u8,
    v6: u8,
}

impl Default for DualCidr {
    fn default() -> Self {
        Self { v4: 32, v6: 128 }
    }
}

/// SPF mechanism types
#[derive(Debug, Clone, PartialEq)]
enum SpfMechanism {
    All,
    Include(String),
    A(Option<String>, DualCidr),
    Mx(Option<String>, DualCidr),
    Ip4(ipnet::Ipv4Net),
    Ip6(ipnet::Ipv6Net),
    Ptr(Option<String>),
    Exists(String),
}

impl fmt::Display for SpfMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn target(f: &mut fmt::Formatter<'_>, name: &str, domain: &Option<String>) -> fmt::Result {
            match domain {
                Some(d) => write!(f, "{}:{}", name, d),
                None => f.write_str(name),
            }
        }

        match self {
            SpfMechanism::All => f.write_str("all"),
            SpfMechanism::Include(d) => write!(f, "include:{}", d),
            SpfMechanism::A(d, _) => target(f, "a", d),
            SpfMechanism::Mx(d, _) => target(f, "mx", d),
            SpfMechanism::Ip4(net) => write!(f, "ip4:{}", net),
            SpfMechanism::Ip6(net) => write!(f, "ip6:{}", net),
            SpfMechanism::Ptr(d) => target(f, "ptr", d),
            SpfMechanism::Exists(d) => write!(f, "exists:{}", d),
        }
    }
}

/// SPF qualifier (prefix)
#[derive(Debug, Clone, Copy, PartialEq)]
enum SpfQualifier {
    Pass,     // + (default)
    Fail,     // -
    SoftFail, // ~
    Neutral,  // ?
}

impl SpfQualifier {
    fn to_result(self) -> SpfResult {
        match self {
            SpfQualifier::Pass => SpfResult::Pass,
            SpfQualifier::Fail => SpfResult::Fail,
            SpfQualifier::SoftFail => SpfResult::SoftFail,
            SpfQualifier::Neutral => SpfResult::Neutral,
        }
    }

    fn prefix(self) -> &'static str {
        match self {
            SpfQualifier::Pass => "",
            SpfQualifier::Fail => "-",
            SpfQualifier::SoftFail => "~",
            SpfQualifier::Neutral => "?",
        }
    }
}

/// Parsed SPF directive (qualifier + mechanism)
#[derive(Debug, Clone, PartialEq)]
struct SpfDirective {
    qualifier: SpfQualifier,
    mechanism: SpfMechanism,
}

impl fmt::Display for SpfDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.qualifier.prefix(), self.mechanism)
    }
}

/// Parsed SPF record
#[derive(Debug, Clone, Default, PartialEq)]
struct SpfRecord {
    directives: Vec<SpfDirective>,
    redirect: Option<String>,
    exp: Option<String>,
}

/// Result of evaluating one domain
#[derive(Debug, Clone)]
struct Evaluation {
    result: SpfResult,
    reason: String,
    /// Explanation published by the domain (`exp=`), already expanded
    explanation: Option<String>,
}

impl Evaluation {
    fn new(result: SpfResult, reason: impl Into<String>) -> Self {
        Self {
            result,
            reason: reason.into(),
            explanation: None,
        }
    }
}

/// Why a mechanism could not be evaluated
#[derive(Debug)]
enum EvalError {
    Temp(String),
    Perm(String),
}

impl From<EvalError> for Evaluation {
    fn from(err: EvalError) -> Self {
        match err {
            EvalError::Temp(reason) => Evaluation::new(SpfResult::TempError, reason),
            EvalError::Perm(reason) => Evaluation::new(SpfResult::PermError, reason),
        }
    }
}

impl From<DnsError> for EvalError {
    fn from(err: DnsError) -> Self {
        EvalError::Temp(err.to_string())
    }
}

/// Per-query evaluation state
struct EvalContext<'a> {
    identity: &'a SpfIdentity,
    sender: String,
    local_part: &'a str,
    sender_domain: String,
    lookups: AtomicUsize,
}

/// SPF verifier
pub struct SpfVerifier<R: DnsResolver = TokioAsyncResolver> {
    resolver: R,
    max_dns_lookups: usize,
    rec_dom: String,
    sanitize: bool,
    local_policy: Vec<SpfDirective>,
    explanation: MacroString,
}

impl SpfVerifier<TokioAsyncResolver> {
    /// Create a new SPF verifier using the system resolver configuration
    pub fn new() -> Self {
        let resolver = match TokioAsyncResolver::tokio_from_system_conf() {
            Ok(resolver) => resolver,
            Err(e) => {
                warn!("Falling back to default resolver configuration: {}", e);
                TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
            }
        };
        Self::with_resolver(resolver)
    }
}

impl Default for SpfVerifier<TokioAsyncResolver> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: DnsResolver> SpfVerifier<R> {
    /// Create a new SPF verifier with custom resolver
    pub fn with_resolver(resolver: R) -> Self {
        Self {
            resolver,
            max_dns_lookups: DEFAULT_MAX_DNS_MECH,
            rec_dom: "localhost".to_string(),
            sanitize: false,
            local_policy: Vec::new(),
            // The built-in explanation is a valid macro string
            explanation: MacroString::parse(DEFAULT_EXPLANATION)
                .unwrap_or_else(|_| unreachable!("default explanation parses")),
        }
    }

    /// Set the name of the host doing the checking
    pub fn set_rec_dom(&mut self, rec_dom: impl Into<String>) {
        self.rec_dom = rec_dom.into();
    }

    /// Set the bound on DNS-querying mechanisms
    pub fn set_max_dns_mech(&mut self, max: usize) {
        self.max_dns_lookups = max;
    }

    /// Replace non-printable characters in generated strings
    pub fn set_sanitize(&mut self, sanitize: bool) {
        self.sanitize = sanitize;
    }

    /// Set mechanisms evaluated before a record's final `all`
    pub fn set_local_policy(&mut self, policy: &str, use_trusted: bool) -> Result<(), EngineError> {
        let mut terms = policy.trim().to_string();
        if use_trusted {
            terms = format!("{} {}", terms, TRUSTED_FORWARDER_INCLUDE);
        }

        let record = parse_terms(&terms).map_err(|e| EngineError::InvalidRecord(e.to_string()))?;
        if record.redirect.is_some() || record.exp.is_some() {
            return Err(EngineError::InvalidRecord(
                "modifiers are not allowed in a local policy".to_string(),
            ));
        }
        self.local_policy = record.directives;
        Ok(())
    }

    /// Set the explanation attached to failures
    pub fn set_explanation(&mut self, explanation: &str) -> Result<(), EngineError> {
        self.explanation = MacroString::parse(explanation)?;
        Ok(())
    }

    fn context<'a>(&self, identity: &'a SpfIdentity) -> Result<EvalContext<'a>, EngineError> {
        let sender_domain = identity
            .sender_domain()
            .filter(|d| is_valid_domain(d))
            .ok_or_else(|| EngineError::InvalidSender(identity.sender.clone()))?;
        let local_part = identity.local_part();

        Ok(EvalContext {
            identity,
            sender: format!("{}@{}", local_part, sender_domain),
            local_part,
            sender_domain,
            lookups: AtomicUsize::new(0),
        })
    }

    fn macro_context<'a>(&'a self, ctx: &'a EvalContext<'a>, domain: &'a str) -> MacroContext<'a> {
        MacroContext {
            sender: &ctx.sender,
            local_part: ctx.local_part,
            sender_domain: &ctx.sender_domain,
            domain,
            ip: ctx.identity.ip,
            helo: ctx.identity.helo.as_deref(),
            rec_dom: &self.rec_dom,
        }
    }

    /// Expand a domain-spec that may carry macros
    fn target_domain(&self, spec: &str, ctx: &EvalContext<'_>, domain: &str) -> String {
        if !spec.contains('%') {
            return spec.to_lowercase();
        }
        match MacroString::parse(spec) {
            Ok(macro_string) => macro_string.expand(&self.macro_context(ctx, domain)),
            Err(_) => spec.to_lowercase(),
        }
    }

    fn count_lookup(&self, ctx: &EvalContext<'_>) -> Result<(), EvalError> {
        let used = ctx.lookups.fetch_add(1, Ordering::Relaxed) + 1;
        if used > self.max_dns_lookups {
            return Err(EvalError::Perm(format!(
                "Maximum DNS-interactive terms limit ({}) exceeded",
                self.max_dns_lookups
            )));
        }
        Ok(())
    }

    /// Evaluate the record of `domain` (or `record` in its place)
    fn check_host<'a>(
        &'a self,
        ctx: &'a EvalContext<'a>,
        domain: String,
        record: Option<SpfRecord>,
        depth: usize,
    ) -> BoxFuture<'a, Evaluation> {
        Box::pin(async move {
            if depth > MAX_DEPTH {
                return Evaluation::new(SpfResult::PermError, "Include/redirect nesting too deep");
            }

            let record = match record {
                Some(record) => record,
                None => match self.get_spf_record(&domain).await {
                    Ok(Some(txt)) => {
                        debug!("Found SPF record for {}: {}", domain, txt);
                        match parse_spf_record(&txt) {
                            Ok(record) => record,
                            Err(e) => {
                                warn!("Failed to parse SPF record for {}: {}", domain, e);
                                return Evaluation::new(SpfResult::PermError, e.to_string());
                            }
                        }
                    }
                    Ok(None) => {
                        return Evaluation::new(
                            SpfResult::None,
                            format!("No SPF record found for {}", domain),
                        )
                    }
                    Err(e) => return e.into(),
                },
            };

            for directive in &record.directives {
                if depth == 0
                    && directive.mechanism == SpfMechanism::All
                    && directive.qualifier != SpfQualifier::Pass
                {
                    for local in &self.local_policy {
                        match self.evaluate_directive(local, ctx, &domain, depth).await {
                            Ok(Some(result)) => {
                                return Evaluation::new(
                                    result,
                                    format!("local policy mechanism {} matched", local),
                                )
                            }
                            Ok(None) => continue,
                            Err(e) => return e.into(),
                        }
                    }
                }

                match self.evaluate_directive(directive, ctx, &domain, depth).await {
                    Ok(Some(result)) => {
                        let mut evaluation =
                            Evaluation::new(result, format!("mechanism {} matched", directive));
                        if result == SpfResult::Fail {
                            evaluation.explanation =
                                self.published_explanation(&record, ctx, &domain).await;
                        }
                        return evaluation;
                    }
                    Ok(None) => continue,
                    Err(e) => return e.into(),
                }
            }

            if let Some(spec) = &record.redirect {
                if let Err(e) = self.count_lookup(ctx) {
                    return e.into();
                }
                let target = self.target_domain(spec, ctx, &domain);
                let evaluation = self.check_host(ctx, target.clone(), None, depth + 1).await;
                if evaluation.result == SpfResult::None {
                    return Evaluation::new(
                        SpfResult::PermError,
                        format!("redirect domain {} has no SPF record", target),
                    );
                }
                return evaluation;
            }

            // Default result if no mechanism matches
            Evaluation::new(SpfResult::Neutral, "default result")
        })
    }

    /// Get the SPF TXT record for a domain
    async fn get_spf_record(&self, domain: &str) -> Result<Option<String>, EvalError> {
        let records = match self.resolver.txt(domain).await {
            Ok(records) => records,
            Err(DnsError::NotFound(_)) => return Ok(None),
            Err(e) => {
                warn!("DNS lookup failed for {}: {}", domain, e);
                return Err(e.into());
            }
        };

        let mut spf: Vec<String> = records
            .into_iter()
            .filter(|txt| {
                let lower = txt.to_ascii_lowercase();
                lower == "v=spf1" || lower.starts_with("v=spf1 ")
            })
            .collect();

        match spf.len() {
            0 => Ok(None),
            1 => Ok(spf.pop()),
            n => Err(EvalError::Perm(format!(
                "{} SPF records published for {}",
                n, domain
            ))),
        }
    }

    /// Evaluate a single SPF directive
    fn evaluate_directive<'a>(
        &'a self,
        directive: &'a SpfDirective,
        ctx: &'a EvalContext<'a>,
        domain: &'a str,
        depth: usize,
    ) -> BoxFuture<'a, Result<Option<SpfResult>, EvalError>> {
        Box::pin(async move {
            let client_ip = ctx.identity.ip;

            let matches = match &directive.mechanism {
                SpfMechanism::All => true,

                SpfMechanism::Ip4(network) => match client_ip {
                    IpAddr::V4(ip) => network.contains(&ip),
                    IpAddr::V6(ip) => ip
                        .to_ipv4_mapped()
                        .is_some_and(|mapped| network.contains(&mapped)),
                },

                SpfMechanism::Ip6(network) => match client_ip {
                    IpAddr::V6(ip) => network.contains(&ip),
                    IpAddr::V4(_) => false,
                },

                SpfMechanism::A(target, cidr) => {
                    self.count_lookup(ctx)?;
                    let target = match target {
                        Some(spec) => self.target_domain(spec, ctx, domain),
                        None => domain.to_string(),
                    };
                    self.check_a_record(&target, client_ip, *cidr).await?
                }

                SpfMechanism::Mx(target, cidr) => {
                    self.count_lookup(ctx)?;
                    let target = match target {
                        Some(spec) => self.target_domain(spec, ctx, domain),
                        None => domain.to_string(),
                    };
                    self.check_mx_record(&target, client_ip, *cidr).await?
                }

                SpfMechanism::Include(spec) => {
                    self.count_lookup(ctx)?;
                    let target = self.target_domain(spec, ctx, domain);
                    let included = self.check_host(ctx, target.clone(), None, depth + 1).await;
                    match included.result {
                        SpfResult::Pass => true,
                        SpfResult::Fail | SpfResult::SoftFail | SpfResult::Neutral => false,
                        SpfResult::TempError => return Err(EvalError::Temp(included.reason)),
                        SpfResult::None | SpfResult::PermError | SpfResult::Invalid => {
                            return Err(EvalError::Perm(format!(
                                "include:{} failed: {}",
                                target, included.reason
                            )))
                        }
                    }
                }

                SpfMechanism::Ptr(_) => {
                    // Deprecated (RFC 7208 5.5), never matches
                    self.count_lookup(ctx)?;
                    debug!("PTR mechanism used but not evaluated (deprecated)");
                    false
                }

                SpfMechanism::Exists(spec) => {
                    self.count_lookup(ctx)?;
                    let target = self.target_domain(spec, ctx, domain);
                    self.check_exists(&target).await?
                }
            };

            if matches {
                Ok(Some(directive.qualifier.to_result()))
            } else {
                Ok(None)
            }
        })
    }

    /// Check if client IP falls in the networks of any A/AAAA record for domain
    async fn check_a_record(
        &self,
        domain: &str,
        client_ip: IpAddr,
        cidr: DualCidr,
    ) -> Result<bool, EvalError> {
        match client_ip {
            IpAddr::V4(ip) => match self.resolver.ipv4(domain).await {
                Ok(records) => Ok(records.into_iter().any(|record| {
                    ipnet::Ipv4Net::new(record, cidr.v4)
                        .map(|net| net.contains(&ip))
                        .unwrap_or(false)
                })),
                Err(DnsError::NotFound(_)) => Ok(false),
                Err(e) => Err(e.into()),
            },
            IpAddr::V6(ip) => match self.resolver.ipv6(domain).await {
                Ok(records) => Ok(records.into_iter().any(|record| {
                    ipnet::Ipv6Net::new(record, cidr.v6)
                        .map(|net| net.contains(&ip))
                        .unwrap_or(false)
                })),
                Err(DnsError::NotFound(_)) => Ok(false),
                Err(e) => Err(e.into()),
            },
        }
    }

    /// Check if client IP matches any MX host's A/AAAA record
    async fn check_mx_record(
        &self,
        domain: &str,
        client_ip: IpAddr,
        cidr: DualCidr,
    ) -> Result<bool, EvalError> {
        let hosts = match self.resolver.mx(domain).await {
            Ok(hosts) => hosts,
            Err(DnsError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        for mx_host in hosts.iter().take(MAX_MX_HOSTS) {
            if self.check_a_record(mx_host, client_ip, cidr).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Check if A record exists for domain (exists mechanism)
    async fn check_exists(&self, domain: &str) -> Result<bool, EvalError> {
        match self.resolver.ipv4(domain).await {
            Ok(records) => Ok(!records.is_empty()),
            Err(DnsError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Explanation published through the record's `exp=` modifier
    async fn published_explanation(
        &self,
        record: &SpfRecord,
        ctx: &EvalContext<'_>,
        domain: &str,
    ) -> Option<String> {
        let spec = record.exp.as_ref()?;
        let target = self.target_domain(spec, ctx, domain);

        let txt = match self.resolver.txt(&target).await {
            Ok(records) if records.len() == 1 => records.into_iter().next()?,
            Ok(_) => return None,
            Err(e) => {
                debug!("Ignoring explanation at {}: {}", target, e);
                return None;
            }
        };

        MacroString::parse(&txt)
            .ok()
            .map(|exp| exp.expand(&self.macro_context(ctx, domain)))
    }

    /// Turn an evaluation into a verdict with its comments and trace header
    fn build_verdict(&self, ctx: &EvalContext<'_>, evaluation: Evaluation, guess: bool) -> Verdict {
        let ip = ctx.identity.ip;
        let sender = &ctx.sender;
        let rec_dom = &self.rec_dom;

        let mut header_comment = match evaluation.result {
            SpfResult::Pass => format!(
                "{}: domain of {} designates {} as permitted sender",
                rec_dom, sender, ip
            ),
            SpfResult::Fail => format!(
                "{}: domain of {} does not designate {} as permitted sender",
                rec_dom, sender, ip
            ),
            SpfResult::SoftFail => format!(
                "{}: transitioning domain of {} does not designate {} as permitted sender",
                rec_dom, sender, ip
            ),
            SpfResult::Neutral => format!(
                "{}: {} is neither permitted nor denied by domain of {}",
                rec_dom, ip, sender
            ),
            SpfResult::None => format!(
                "{}: domain of {} does not provide an SPF record",
                rec_dom, sender
            ),
            SpfResult::TempError | SpfResult::PermError => format!(
                "{}: error in processing during lookup of {}: {}",
                rec_dom, sender, evaluation.reason
            ),
            SpfResult::Invalid => format!("{}: unable to evaluate {}", rec_dom, sender),
        };
        if guess {
            header_comment.push_str(" (best guess record)");
        }

        let smtp_comment = match evaluation.result {
            SpfResult::Fail | SpfResult::SoftFail => Some(evaluation.explanation.unwrap_or_else(
                || {
                    self.explanation
                        .expand(&self.macro_context(ctx, &ctx.sender_domain))
                },
            )),
            SpfResult::TempError | SpfResult::PermError | SpfResult::Invalid => {
                Some(evaluation.reason.clone())
            }
            _ => None,
        };

        let mut received_spf = format!(
            "Received-SPF: {} ({}) receiver={}; client-ip={}; envelope-from={};",
            evaluation.result, header_comment, rec_dom, ip, sender
        );
        if let Some(helo) = &ctx.identity.helo {
            received_spf.push_str(&format!(" helo={};", helo));
        }

        Verdict {
            result: evaluation.result,
            smtp_comment: smtp_comment.map(|c| self.clean(c)),
            header_comment: Some(self.clean(header_comment)),
            received_spf: Some(self.clean(received_spf)),
        }
    }

    fn clean(&self, text: String) -> String {
        if !self.sanitize {
            return text;
        }
        text.chars()
            .map(|c| if c == ' ' || c.is_ascii_graphic() { c } else { '?' })
            .collect()
    }
}

#[async_trait]
impl<R: DnsResolver> SpfEngine for SpfVerifier<R> {
    async fn query_mail_from(&self, identity: &SpfIdentity) -> Result<Verdict, EngineError> {
        let ctx = self.context(identity)?;
        debug!(
            "Checking SPF for domain {} from IP {}",
            ctx.sender_domain, identity.ip
        );

        let evaluation = self
            .check_host(&ctx, ctx.sender_domain.clone(), None, 0)
            .await;
        Ok(self.build_verdict(&ctx, evaluation, false))
    }

    async fn query_rcpt_to(
        &self,
        identity: &SpfIdentity,
        recipient: &str,
    ) -> Result<Verdict, EngineError> {
        let ctx = self.context(identity)?;
        let rcpt_domain = extract_domain(recipient)
            .filter(|d| is_valid_domain(d))
            .ok_or_else(|| EngineError::InvalidSender(format!("recipient {}", recipient)))?;

        debug!("Checking whether {} is an MX of {}", identity.ip, rcpt_domain);

        let result = match self
            .check_mx_record(&rcpt_domain, identity.ip, DualCidr::default())
            .await
        {
            Ok(true) => Evaluation::new(
                SpfResult::Pass,
                format!("{} is a designated mail exchanger of {}", identity.ip, rcpt_domain),
            ),
            Ok(false) => Evaluation::new(
                SpfResult::Neutral,
                format!("{} is not a mail exchanger of {}", identity.ip, rcpt_domain),
            ),
            Err(e) => e.into(),
        };

        let mut verdict = self.build_verdict(&ctx, result.clone(), false);
        if verdict.result == SpfResult::Pass {
            verdict.header_comment = Some(self.clean(format!(
                "{}: {}",
                self.rec_dom, result.reason
            )));
        }
        Ok(verdict)
    }

    async fn query_fallback(
        &self,
        identity: &SpfIdentity,
        record: &str,
    ) -> Result<Verdict, EngineError> {
        let ctx = self.context(identity)?;
        let record = parse_fallback(record).map_err(|e| EngineError::InvalidRecord(e.to_string()))?;

        debug!("Checking best-guess record for domain {}", ctx.sender_domain);

        let evaluation = self
            .check_host(&ctx, ctx.sender_domain.clone(), Some(record), 0)
            .await;
        Ok(self.build_verdict(&ctx, evaluation, true))
    }
}

/// Check that a best-guess record parses, with or without `v=spf1`
pub fn check_fallback_record(record: &str) -> Result<(), EngineError> {
    parse_fallback(record)
        .map(|_| ())
        .map_err(|e| EngineError::InvalidRecord(e.to_string()))
}

/// Parse SPF record into directives
fn parse_spf_record(record: &str) -> Result<SpfRecord> {
    // Remove "v=spf1" prefix
    let version = record.get(..6).unwrap_or_default();
    if !version.eq_ignore_ascii_case("v=spf1") {
        bail!("Invalid SPF record: missing v=spf1");
    }

    parse_terms(&record[6..])
}

/// Parse a best-guess record, with or without the version tag
fn parse_fallback(record: &str) -> Result<SpfRecord> {
    let record = record.trim();
    if record
        .get(..6)
        .is_some_and(|v| v.eq_ignore_ascii_case("v=spf1"))
    {
        parse_spf_record(record)
    } else {
        parse_terms(record)
    }
}

/// Parse the terms following the version tag
fn parse_terms(terms: &str) -> Result<SpfRecord> {
    let mut record = SpfRecord::default();

    for term in terms.split_whitespace() {
        if let Some((name, value)) = term.split_once('=').filter(|(name, _)| is_modifier_name(name)) {
            check_domain_spec(value)?;
            match name.to_ascii_lowercase().as_str() {
                "redirect" => {
                    if record.redirect.replace(value.to_string()).is_some() {
                        bail!("Duplicate redirect modifier");
                    }
                }
                "exp" => {
                    if record.exp.replace(value.to_string()).is_some() {
                        bail!("Duplicate exp modifier");
                    }
                }
                // Unknown modifiers are ignored
                _ => {}
            }
            continue;
        }

        // Parse qualifier
        let (qualifier, mechanism_str) = match term.chars().next() {
            Some('+') => (SpfQualifier::Pass, &term[1..]),
            Some('-') => (SpfQualifier::Fail, &term[1..]),
            Some('~') => (SpfQualifier::SoftFail, &term[1..]),
            Some('?') => (SpfQualifier::Neutral, &term[1..]),
            _ => (SpfQualifier::Pass, term),
        };

        // Parse mechanism
        let mechanism = parse_mechanism(mechanism_str)?;

        record.directives.push(SpfDirective {
            qualifier,
            mechanism,
        });
    }

    Ok(record)
}

/// `name = ALPHA *( ALPHA / DIGIT / "-" / "_" / "." )`
fn is_modifier_name(name: &str) -> bool {
    name.starts_with(|c: char| c.is_ascii_alphabetic())
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// Parse a single SPF mechanism
fn parse_mechanism(s: &str) -> Result<SpfMechanism> {
    let lower = s.to_ascii_lowercase();

    if lower == "all" {
        return Ok(SpfMechanism::All);
    }

    if let Some(rest) = strip_name(&lower, s, "a") {
        let (domain, cidr) = parse_target_with_cidr(rest)?;
        return Ok(SpfMechanism::A(domain, cidr));
    }

    if let Some(rest) = strip_name(&lower, s, "mx") {
        let (domain, cidr) = parse_target_with_cidr(rest)?;
        return Ok(SpfMechanism::Mx(domain, cidr));
    }

    if let Some(network) = lower.strip_prefix("ip4:") {
        let net = if network.contains('/') {
            network.parse()?
        } else {
            format!("{}/32", network).parse()?
        };
        return Ok(SpfMechanism::Ip4(net));
    }

    if let Some(network) = lower.strip_prefix("ip6:") {
        let net = if network.contains('/') {
            network.parse()?
        } else {
            format!("{}/128", network).parse()?
        };
        return Ok(SpfMechanism::Ip6(net));
    }

    if lower.starts_with("include:") {
        let domain = &s[8..];
        check_domain_spec(domain)?;
        return Ok(SpfMechanism::Include(domain.to_string()));
    }

    if lower == "ptr" {
        return Ok(SpfMechanism::Ptr(None));
    }

    if lower.starts_with("ptr:") {
        let domain = &s[4..];
        check_domain_spec(domain)?;
        return Ok(SpfMechanism::Ptr(Some(domain.to_string())));
    }

    if lower.starts_with("exists:") {
        let domain = &s[7..];
        check_domain_spec(domain)?;
        return Ok(SpfMechanism::Exists(domain.to_string()));
    }

    Err(anyhow!("Unknown SPF mechanism: {}", s))
}

/// Strip an `a`/`mx` mechanism name, keeping the original case of the rest
fn strip_name<'a>(lower: &str, original: &'a str, name: &str) -> Option<&'a str> {
    let rest = lower.strip_prefix(name)?;
    if rest.is_empty() || rest.starts_with(':') || rest.starts_with('/') {
        Some(&original[name.len()..])
    } else {
        None
    }
}

/// Parse `[:domain][/v4cidr][//v6cidr]`
fn parse_target_with_cidr(rest: &str) -> Result<(Option<String>, DualCidr)> {
    let (domain_part, cidr_part) = match rest.find('/') {
        Some(pos) => (&rest[..pos], &rest[pos..]),
        None => (rest, ""),
    };

    let domain = match domain_part.strip_prefix(':') {
        Some(d) => {
            check_domain_spec(d)?;
            Some(d.to_string())
        }
        None if domain_part.is_empty() => None,
        None => bail!("Invalid mechanism target: {}", rest),
    };

    let mut cidr = DualCidr::default();
    if !cidr_part.is_empty() {
        let (v4, v6) = match cidr_part.strip_prefix("//") {
            Some(v6) => (None, Some(v6)),
            None => match cidr_part[1..].split_once("//") {
                Some((v4, v6)) => (Some(v4), Some(v6)),
                None => (Some(&cidr_part[1..]), None),
            },
        };
        if let Some(v4) = v4 {
            cidr.v4 = v4.parse()?;
            if cidr.v4 > 32 {
                bail!("Invalid IPv4 prefix length: {}", v4);
            }
        }
        if let Some(v6) = v6 {
            cidr.v6 = v6.parse()?;
            if cidr.v6 > 128 {
                bail!("Invalid IPv6 prefix length: {}", v6);
            }
        }
    }

    Ok((domain, cidr))
}

/// A domain-spec is either a literal domain or a valid macro string
fn check_domain_spec(spec: &str) -> Result<()> {
    if spec.is_empty() {
        bail!("Empty domain specification");
    }
    if spec.contains('%') {
        MacroString::parse(spec).map_err(|e| anyhow!("{}", e))?;
    }
    Ok(())
}
