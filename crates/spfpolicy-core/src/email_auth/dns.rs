//! DNS access for SPF evaluation

use async_trait::async_trait;
use std::net::{Ipv4Addr, Ipv6Addr};
use thiserror::Error;
use trust_dns_resolver::error::ResolveErrorKind;
use trust_dns_resolver::TokioAsyncResolver;

/// DNS lookup errors
#[derive(Debug, Error)]
pub enum DnsError {
    /// The name exists with no records of the type, or does not exist
    #[error("No records found for {0}")]
    NotFound(String),
    /// The lookup itself failed (timeout, SERVFAIL, ...)
    #[error("DNS lookup failed: {0}")]
    Failure(String),
}

/// Record lookups used by the SPF evaluator
#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn txt(&self, name: &str) -> Result<Vec<String>, DnsError>;
    async fn ipv4(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError>;
    async fn ipv6(&self, name: &str) -> Result<Vec<Ipv6Addr>, DnsError>;
    /// Exchange host names, in preference order
    async fn mx(&self, name: &str) -> Result<Vec<String>, DnsError>;
}

fn map_error(name: &str, err: trust_dns_resolver::error::ResolveError) -> DnsError {
    match err.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => DnsError::NotFound(name.to_string()),
        _ => DnsError::Failure(err.to_string()),
    }
}

#[async_trait]
impl DnsResolver for TokioAsyncResolver {
    async fn txt(&self, name: &str) -> Result<Vec<String>, DnsError> {
        let lookup = self.txt_lookup(name).await.map_err(|e| map_error(name, e))?;

        Ok(lookup
            .iter()
            .map(|record| {
                record
                    .txt_data()
                    .iter()
                    .map(|d| String::from_utf8_lossy(d))
                    .collect::<String>()
            })
            .collect())
    }

    async fn ipv4(&self, name: &str) -> Result<Vec<Ipv4Addr>, DnsError> {
        let lookup = self.ipv4_lookup(name).await.map_err(|e| map_error(name, e))?;
        Ok(lookup.iter().map(|record| (*record).into()).collect())
    }

    async fn ipv6(&self, name: &str) -> Result<Vec<Ipv6Addr>, DnsError> {
        let lookup = self.ipv6_lookup(name).await.map_err(|e| map_error(name, e))?;
        Ok(lookup.iter().map(|record| (*record).into()).collect())
    }

    async fn mx(&self, name: &str) -> Result<Vec<String>, DnsError> {
        let lookup = self.mx_lookup(name).await.map_err(|e| map_error(name, e))?;

        let mut exchanges: Vec<_> = lookup
            .iter()
            .map(|mx| (mx.preference(), mx.exchange().to_string()))
            .collect();
        exchanges.sort_by_key(|(preference, _)| *preference);

        Ok(exchanges.into_iter().map(|(_, host)| host).collect())
    }
}
