//! DNS utilities
//!
//! MX lookups for outbound delivery and sender validation.

use crate::error::{GatewayError, Result};
use tracing::{debug, info, warn};
use trust_dns_resolver::config::*;
use trust_dns_resolver::error::ResolveErrorKind;
use trust_dns_resolver::TokioAsyncResolver;

fn resolver() -> TokioAsyncResolver {
    TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default())
}

/// MX hosts of a domain, lowest preference first. Empty when the domain has none.
pub async fn mx_hosts(domain: &str) -> Result<Vec<String>> {
    debug!("Looking up MX records for {}", domain);

    let lookup = match resolver().mx_lookup(domain).await {
        Ok(lookup) => lookup,
        Err(e) => {
            if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) {
                return Ok(Vec::new());
            }
            return Err(GatewayError::DnsLookup(format!(
                "MX lookup failed for {}: {}",
                domain, e
            )));
        }
    };

    let mut records: Vec<(u16, String)> = lookup
        .iter()
        .map(|mx| {
            (
                mx.preference(),
                mx.exchange().to_string().trim_end_matches('.').to_string(),
            )
        })
        .filter(|(_, host)| !host.is_empty())
        .collect();

    records.sort_by_key(|(preference, _)| *preference);

    Ok(records.into_iter().map(|(_, host)| host).collect())
}

/// Resolve a domain to mail server addresses (`host:25`) in priority order
///
/// Falls back to the domain itself when it publishes no MX record.
pub async fn lookup_mx(domain: &str) -> Result<Vec<String>> {
    info!("Resolving mail servers for {}", domain);

    let hosts = match mx_hosts(domain).await {
        Ok(hosts) => hosts,
        Err(e) => {
            warn!("{}", e);
            Vec::new()
        }
    };

    if hosts.is_empty() {
        warn!("No MX records found for {}, using the domain directly", domain);
        return Ok(vec![format!("{}:25", domain)]);
    }

    Ok(hosts.into_iter().map(|host| format!("{}:25", host)).collect())
}
