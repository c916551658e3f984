//! Mail exchange resolution with an optional response cache.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use regex::Regex;
use tracing::debug;
use trust_dns_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use trust_dns_resolver::error::{ResolveError, ResolveErrorKind};
use trust_dns_resolver::system_conf::read_system_conf;
use trust_dns_resolver::TokioAsyncResolver;

use crate::core::error::{AppError, Result};

/// A domain written as a bracketed IPv4 literal bypasses resolution.
static DOMAIN_LITERAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\[(?P<ip_address>(\d{1,3}\.){3}\d{1,3})\]$")
        .expect("Domain literal pattern failed to compile. This is a bug.")
});

/// Resolves a recipient domain to its best mail exchange host.
///
/// Responses live for one process run in the optional cache; lookups
/// carry a query-level timeout independent of the SMTP timeouts.
pub struct ExchangeResolver {
    inner: TokioAsyncResolver,
    cache: Option<RwLock<HashMap<String, String>>>,
}

impl ExchangeResolver {
    /// Build a resolver, optionally overriding the system nameservers.
    pub fn new(
        nameservers: Option<&[String]>,
        timeout: Duration,
        use_cache: bool,
    ) -> Result<Self> {
        let inner = match nameservers {
            Some(servers) if !servers.is_empty() => {
                let ips = servers
                    .iter()
                    .map(|s| s.trim().parse::<IpAddr>())
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(|err| {
                        AppError::Initialization(format!("Invalid nameserver address: {}", err))
                    })?;
                let group = NameServerConfigGroup::from_ips_clear(&ips, 53, true);
                let mut opts = ResolverOpts::default();
                opts.timeout = timeout;
                TokioAsyncResolver::tokio(ResolverConfig::from_parts(None, vec![], group), opts)
            }
            _ => {
                let (config, mut opts) = read_system_conf().unwrap_or_else(|_| {
                    (ResolverConfig::default(), ResolverOpts::default())
                });
                opts.timeout = timeout;
                TokioAsyncResolver::tokio(config, opts)
            }
        };

        let cache = use_cache.then(|| RwLock::new(HashMap::new()));

        Ok(Self { inner, cache })
    }

    /// Return the mail exchange host for a domain.
    ///
    /// The lowest preference value wins; equal preferences fall back to
    /// resolver-provided order. Timeouts and missing records are
    /// reported as distinct failures.
    pub async fn resolve(&self, domain: &str) -> Result<String> {
        if let Some(captures) = DOMAIN_LITERAL.captures(domain) {
            return Ok(captures["ip_address"].to_string());
        }

        if let Some(cache) = &self.cache {
            if let Some(host) = cache.read().get(domain) {
                debug!("Resolved from cache. [domain={}, host={}]", domain, host);
                return Ok(host.clone());
            }
        }

        let answers = self
            .inner
            .mx_lookup(domain)
            .await
            .map_err(|err| classify(domain, err))?;

        let host = select_exchange(
            answers
                .iter()
                .map(|mx| (mx.preference(), mx.exchange().to_utf8())),
        )
        .ok_or_else(|| {
            AppError::NoMxRecords(format!("No mx record found for domain. [domain={}]", domain))
        })?;

        if let Some(cache) = &self.cache {
            cache.write().insert(domain.to_string(), host.clone());
        }

        Ok(host)
    }
}

fn classify(domain: &str, err: ResolveError) -> AppError {
    match err.kind() {
        ResolveErrorKind::NoRecordsFound { .. } => AppError::NoMxRecords(format!(
            "No mx record found for domain. [domain={}]",
            domain
        )),
        ResolveErrorKind::Timeout => AppError::DnsTimeout(domain.to_string()),
        _ => AppError::Dns(err),
    }
}

/// Pick the preferred exchange: lowest preference value, ties broken by
/// the order the resolver returned.
pub(crate) fn select_exchange(
    records: impl IntoIterator<Item = (u16, String)>,
) -> Option<String> {
    records
        .into_iter()
        .min_by_key(|(preference, _)| *preference)
        .map(|(_, host)| {
            let trimmed = host.trim_end_matches('.');
            if trimmed.is_empty() {
                host.clone()
            } else {
                trimmed.to_string()
            }
        })
}
