//! Defines the core runtime `Config` struct, its defaults, and related utilities.

use std::time::Duration;

/// Runtime configuration settings used by the mailspool core logic.
#[derive(Debug, Clone)]
pub struct Config {
    /// Fixed relay host. When set, every recipient is delivered through it.
    pub relay: Option<String>,
    /// Remote SMTP port.
    pub port: u16,
    /// EHLO/HELO name override. Detected from the local host when `None`.
    pub helo: Option<String>,

    /// Nameserver override for MX lookups (system configuration otherwise).
    pub nameservers: Option<Vec<String>>,
    /// Disable the MX response cache.
    pub no_cache: bool,
    /// Query-level timeout for MX resolution.
    pub dns_timeout: Duration,

    /// Connect/IO timeout for SMTP sessions.
    pub smtp_timeout: Duration,
    /// Attempt an opportunistic STARTTLS upgrade on each session.
    pub starttls: bool,
    /// Keep one relay session open across messages instead of
    /// reconnecting per message.
    pub keep_alive: bool,

    /// Delay in seconds inserted between successive messages.
    pub delay: Option<f64>,
    /// Print rendered messages to stdout instead of sending.
    pub print_only: bool,
    /// Validate config files and exit without building messages.
    pub check_only: bool,
    /// Comma-separated tag filter; a mail is selected if it shares a tag.
    pub tags: Option<String>,
}

impl Config {
    fn build_default() -> Self {
        Config {
            relay: None,
            port: 25,
            helo: None,
            nameservers: None,
            no_cache: false,
            dns_timeout: Duration::from_secs(10),
            smtp_timeout: Duration::from_secs(5),
            starttls: false,
            keep_alive: false,
            delay: None,
            print_only: false,
            check_only: false,
            tags: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::build_default()
    }
}

/// Utility function to check a mail's tags against the configured filter.
///
/// A mail is selected when no filter is active, or when it carries at
/// least one tag named in the comma-separated filter string.
pub fn tags_match(filter: Option<&str>, tags: &[String]) -> bool {
    let filter = match filter {
        None => return true,
        Some(f) if f.is_empty() => return true,
        Some(f) => f,
    };

    filter
        .split(',')
        .map(str::trim)
        .any(|tag| tags.iter().any(|t| t == tag))
}
