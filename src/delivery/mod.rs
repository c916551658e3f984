//! Delivery: recipient partitioning, exchange selection and session
//! handling.
//!
//! With a fixed relay every recipient goes through it in a single
//! session; otherwise recipients are partitioned by mailbox domain and
//! each group is delivered to its own resolved mail exchange. Transport
//! failures are isolated per domain group and reported, never raised
//! past the group boundary. A kept-alive relay session is torn down via
//! [`Mailer::shutdown`] at each file boundary.

pub mod resolver;
pub mod session;

use std::collections::BTreeMap;
use std::time::Duration;

use lettre::message::Mailbox;
use tracing::{debug, error, info, warn};

use crate::core::config::Config;
use crate::core::error::{AppError, Result};
use crate::message::Message;
pub use resolver::ExchangeResolver;
pub use session::{Refusal, SmtpSession};

const MAIL_OUT_PREFIX: &str = "---------- MESSAGE FOLLOWS ----------";
const MAIL_OUT_SUFFIX: &str = "------------ END MESSAGE ------------";

/// The result for one domain group (or the relay session).
#[derive(Debug)]
pub struct DeliveryOutcome {
    /// Domain the group was formed on, or the relay host.
    pub domain: String,
    /// The host the session targeted, when one was selected.
    pub host: Option<String>,
    pub status: DeliveryStatus,
}

#[derive(Debug)]
pub enum DeliveryStatus {
    /// The transaction completed; soft refusals listed per recipient.
    Sent { refused: Vec<Refusal> },
    /// The group failed with a classified transport error.
    Failed(AppError),
}

impl DeliveryOutcome {
    pub fn is_sent(&self) -> bool {
        matches!(self.status, DeliveryStatus::Sent { .. })
    }
}

/// Delivers rendered messages over SMTP sessions.
pub struct Mailer {
    relay: Option<String>,
    port: u16,
    helo: String,
    timeout: Duration,
    starttls: bool,
    keep_alive: bool,
    resolver: ExchangeResolver,
    session: Option<SmtpSession>,
}

impl Mailer {
    /// Build a mailer from the runtime configuration.
    pub fn new(config: &Config) -> Result<Mailer> {
        let resolver = ExchangeResolver::new(
            config.nameservers.as_deref(),
            config.dns_timeout,
            !config.no_cache,
        )?;
        let helo = config.helo.clone().unwrap_or_else(local_identity);

        Ok(Mailer {
            relay: config.relay.clone(),
            port: config.port,
            helo,
            timeout: config.smtp_timeout,
            starttls: config.starttls,
            keep_alive: config.keep_alive,
            resolver,
            session: None,
        })
    }

    /// Send a message, or print it when `print_only` is set.
    ///
    /// Message-scoped failures (rendering, attachments, signing)
    /// propagate to the caller; transport failures are classified,
    /// logged, and returned inside the per-group outcomes.
    pub async fn send(&mut self, msg: &Message, print_only: bool) -> Result<Vec<DeliveryOutcome>> {
        let rendered = msg.render()?;

        if print_only {
            println!("{}", framed(&rendered));
            return Ok(Vec::new());
        }

        let sender = msg.envelope_sender().email.to_string();
        let recipients = msg.envelope_recipients();

        let mut outcomes = Vec::new();

        if let Some(relay) = self.relay.clone() {
            let group: Vec<String> = recipients.iter().map(|m| m.email.to_string()).collect();
            let outcome = self
                .deliver_group(msg, &relay, relay.clone(), &sender, &group, &rendered)
                .await?;
            outcomes.push(outcome);
        } else {
            for (domain, group) in group_by_domain(&recipients) {
                let host = match self.resolver.resolve(&domain).await {
                    Ok(host) => host,
                    Err(err) => {
                        error!(
                            "Failed to send message: {} [name={}]",
                            err,
                            msg.display_name()
                        );
                        outcomes.push(DeliveryOutcome {
                            domain,
                            host: None,
                            status: DeliveryStatus::Failed(err),
                        });
                        continue;
                    }
                };

                let outcome = self
                    .deliver_group(msg, &domain, host, &sender, &group, &rendered)
                    .await?;
                outcomes.push(outcome);
            }
        }

        Ok(outcomes)
    }

    /// Tear down a kept-alive session at end of scope.
    pub async fn shutdown(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.quit().await;
        }
    }

    async fn deliver_group(
        &mut self,
        msg: &Message,
        domain: &str,
        host: String,
        sender: &str,
        recipients: &[String],
        rendered: &str,
    ) -> Result<DeliveryOutcome> {
        match self.transmit(&host, sender, recipients, rendered).await {
            Ok(refused) => {
                for refusal in &refused {
                    warn!(
                        "Remote refused recipient: {} [code={}, host={}, port={}]",
                        refusal.recipient, refusal.code, host, self.port
                    );
                }
                info!(
                    "Message sent. [name={}, host={}, port={}]",
                    msg.display_name(),
                    host,
                    self.port
                );
                Ok(DeliveryOutcome {
                    domain: domain.to_string(),
                    host: Some(host),
                    status: DeliveryStatus::Sent { refused },
                })
            }
            Err(err) if err.is_transport() => {
                error!(
                    "Failed to send message: {} [name={}, host={}, port={}]",
                    err,
                    msg.display_name(),
                    host,
                    self.port
                );
                Ok(DeliveryOutcome {
                    domain: domain.to_string(),
                    host: Some(host),
                    status: DeliveryStatus::Failed(err),
                })
            }
            // anything outside the transport taxonomy is a defect
            Err(err) => Err(err),
        }
    }

    async fn transmit(
        &mut self,
        host: &str,
        sender: &str,
        recipients: &[String],
        body: &str,
    ) -> Result<Vec<Refusal>> {
        let mut session = match self.session.take() {
            Some(session) => session,
            None => {
                let mut session =
                    SmtpSession::connect(host, self.port, self.timeout, &self.helo).await?;
                if self.starttls {
                    if session.supports("STARTTLS") {
                        session.starttls().await?;
                    } else {
                        warn!(
                            "No support for STARTTLS command by remote server. [host={}, port={}]",
                            host, self.port
                        );
                    }
                }
                session
            }
        };

        let result = session.send_mail(sender, recipients, body).await;

        if result.is_ok() && self.keep_alive && self.relay.is_some() {
            self.session = Some(session);
        } else {
            session.quit().await;
        }

        result
    }
}

/// Partition envelope recipients by their mailbox domain, in sorted
/// domain order.
fn group_by_domain(recipients: &[Mailbox]) -> BTreeMap<String, Vec<String>> {
    let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for mailbox in recipients {
        groups
            .entry(mailbox.email.domain().to_string())
            .or_default()
            .push(mailbox.email.to_string());
    }
    groups
}

/// Frame a rendered message for print-only output. Stripping the
/// markers recovers exactly the rendered string.
fn framed(rendered: &str) -> String {
    format!("{}\n{}\n{}", MAIL_OUT_PREFIX, rendered, MAIL_OUT_SUFFIX)
}

/// The EHLO name: the local hostname when dot-qualified, otherwise a
/// bracketed literal of a local address.
fn local_identity() -> String {
    let name = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_default();
    if name.contains('.') {
        return name;
    }

    debug!("No dot-qualified hostname, falling back to an address literal.");
    local_address()
        .map(|ip| format!("[{}]", ip))
        .unwrap_or_else(|| "[127.0.0.1]".to_string())
}

/// Best-effort local address discovery; no packets are sent.
fn local_address() -> Option<std::net::IpAddr> {
    let socket = std::net::UdpSocket::bind(("0.0.0.0", 0)).ok()?;
    socket.connect(("198.51.100.1", 25)).ok()?;
    socket.local_addr().ok().map(|addr| addr.ip())
}
