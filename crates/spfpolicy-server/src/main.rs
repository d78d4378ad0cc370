//! policyd-spf - SPF policy daemon entry point
//!
//! Serves one policy delegation session on stdin/stdout. Logs go to stderr.

use anyhow::{bail, Context, Result};
use clap::Parser;
use spfpolicy_common::config::{Config, LoggingConfig, SpfConfig};
use spfpolicy_common::Error;
use spfpolicy_core::email_auth::{check_fallback_record, DnsResolver};
use spfpolicy_core::{DaemonSummary, PolicyDaemon, QueryOrchestrator, SpfVerifier};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::io::BufReader;
use tracing::{debug, error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Exit status for failures before or outside a decision
const FATAL_EXIT_CODE: u8 = 255;

/// SPF policy daemon for MTA access-policy delegation
#[derive(Parser, Debug)]
#[command(name = "policyd-spf")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(long, env = "SPFPOLICY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Debug level
    #[arg(long, value_name = "LEVEL", num_args = 0..=1, default_missing_value = "1")]
    debug: Option<u8>,

    /// Local policy for whitelisting
    #[arg(long, value_name = "SPF MECHANISMS")]
    local: Option<String>,

    /// Should trusted-forwarder.org be checked?
    #[arg(long, value_name = "0|1", num_args = 0..=1, default_missing_value = "1")]
    trusted: Option<u8>,

    /// Default checks if no SPF record is found
    #[arg(long, value_name = "SPF MECHANISMS")]
    guess: Option<String>,

    /// Default explanation string to use
    #[arg(long, value_name = "STR")]
    default_explanation: Option<String>,

    /// Maximum number of DNS lookups to allow
    #[arg(long, value_name = "NUMBER")]
    max_lookup: Option<usize>,

    /// Clean up invalid characters in output?
    #[arg(long, value_name = "0|1")]
    sanitize: Option<u8>,

    /// The name of the system doing the SPF checking
    #[arg(long, value_name = "DOMAIN NAME")]
    name: Option<String>,

    /// Transactions served before exiting
    #[arg(long, value_name = "NUMBER")]
    request_limit: Option<usize>,

    /// Also accept clients that are MX hosts of a recipient's domain
    #[arg(long)]
    rcpt_to_mx: bool,

    /// Override SPF records for domains (not implemented)
    #[arg(long = "override", value_name = "...")]
    override_records: Option<String>,

    /// Fallback SPF records for domains (not implemented)
    #[arg(long = "fallback", value_name = "...")]
    fallback_records: Option<String>,
}

impl Cli {
    /// Apply command-line flags on top of the loaded configuration
    fn apply(&self, config: &mut Config) {
        if let Some(debug) = self.debug {
            config.logging.debug = debug;
        }
        if let Some(local) = &self.local {
            config.spf.local_policy = Some(local.clone());
        }
        if let Some(trusted) = self.trusted {
            config.spf.use_trusted = trusted != 0;
        }
        if let Some(guess) = &self.guess {
            config.spf.fallback = Some(guess.clone());
        }
        if let Some(explanation) = &self.default_explanation {
            config.spf.explanation = explanation.clone();
        }
        if let Some(max) = self.max_lookup {
            config.spf.max_lookup = Some(max);
        }
        if let Some(sanitize) = self.sanitize {
            config.spf.sanitize = sanitize != 0;
        }
        if let Some(name) = &self.name {
            config.spf.rec_dom = Some(name.clone());
        }
        if let Some(limit) = self.request_limit {
            config.policy.request_limit = limit;
        }
        if self.rcpt_to_mx {
            config.policy.rcpt_to_mx = true;
        }
    }

    /// First flag that is accepted but not supported
    fn unimplemented_flag(&self) -> Option<&'static str> {
        if self.override_records.is_some() {
            Some("--override")
        } else if self.fallback_records.is_some() {
            Some("--fallback")
        } else {
            None
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { FATAL_EXIT_CODE } else { 0 };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::from(FATAL_EXIT_CODE);
        }
    };

    init_logging(&config.logging);

    match run(&cli, config).await {
        Ok(summary) => ExitCode::from(summary.exit_code),
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(FATAL_EXIT_CODE)
        }
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;
    cli.apply(&mut config);
    Ok(config)
}

async fn run(cli: &Cli, config: Config) -> Result<DaemonSummary> {
    if let Some(flag) = cli.unimplemented_flag() {
        bail!("Option {} is not implemented", flag);
    }

    let rec_dom = match &config.spf.rec_dom {
        Some(name) => name.clone(),
        None => hostname::get()
            .context("Failed to determine host name")?
            .to_string_lossy()
            .into_owned(),
    };
    if config.logging.debug > 1 {
        debug!("Hostname: {}", rec_dom);
    }

    let mut verifier = SpfVerifier::new();
    configure_engine(&mut verifier, &config.spf, &rec_dom)?;

    let orchestrator = QueryOrchestrator::new(verifier)
        .with_fallback(config.spf.fallback.clone())
        .with_rcpt_to_mx(config.policy.rcpt_to_mx);
    let daemon = PolicyDaemon::new(
        orchestrator,
        config.policy.request_limit,
        config.logging.debug,
    );

    info!(
        "Serving policy requests as {} (limit {})",
        rec_dom, config.policy.request_limit
    );

    let mut reader = BufReader::new(tokio::io::stdin());
    let mut writer = tokio::io::stdout();
    match daemon.run(&mut reader, &mut writer).await {
        Ok(summary) => Ok(summary),
        Err(e) => bail!("Policy session failed [{}]: {}", e.code(), e),
    }
}

/// Apply the SPF settings, rejecting invalid policy strings before serving
fn configure_engine<R: DnsResolver>(
    verifier: &mut SpfVerifier<R>,
    spf: &SpfConfig,
    rec_dom: &str,
) -> spfpolicy_common::Result<()> {
    verifier.set_rec_dom(rec_dom);
    verifier.set_sanitize(spf.sanitize);
    if let Some(max) = spf.max_lookup.filter(|max| *max > 0) {
        verifier.set_max_dns_mech(max);
    }
    if let Some(local) = &spf.local_policy {
        verifier
            .set_local_policy(local, spf.use_trusted)
            .map_err(|e| Error::Engine(format!("Error setting local policy: {}", e)))?;
    }
    verifier
        .set_explanation(&spf.explanation)
        .map_err(|e| Error::Engine(format!("Error setting default explanation: {}", e)))?;
    if let Some(record) = &spf.fallback {
        check_fallback_record(record)
            .map_err(|e| Error::Engine(format!("Error setting best-guess record: {}", e)))?;
    }
    Ok(())
}

fn init_logging(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.filter_directive()));

    // stdout carries the policy protocol
    if logging.format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_level(true)
                    .with_writer(std::io::stderr),
            )
            .with(filter)
            .init();
    }
}
