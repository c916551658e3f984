//! Defines the custom error types for the mailspool application.

use std::io;
use thiserror::Error;

/// The primary error type for the mail composition and delivery process.
#[derive(Error, Debug)]
pub enum AppError {
    /// Error occurring during configuration loading or schema validation.
    #[error("Configuration Error: {0}")]
    Config(String),

    /// Error parsing a YAML config document.
    #[error("YAML Error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Error rendering a template field.
    #[error("Template Error: {0}")]
    Template(#[from] handlebars::RenderError),

    /// A mail node violated a validation rule.
    #[error("Validation Error: {0}")]
    Validation(String),

    /// Error initializing necessary components (e.g., resolvers).
    #[error("Initialization Error: {0}")]
    Initialization(String),

    /// Error while assembling a single message (attachments, signing).
    #[error("Message Error: {0}")]
    Message(String),

    /// Error parsing a mailbox address.
    #[error("Address Parsing Error: {0}")]
    AddressParse(#[from] lettre::address::AddressError),

    /// Error related to file input/output operations.
    #[error("IO Error: {0}")]
    Io(#[from] io::Error),

    /// Error during DNS resolution.
    #[error("DNS Resolution Error: {0}")]
    Dns(#[from] trust_dns_resolver::error::ResolveError),

    /// No mail exchange record exists for the domain.
    #[error("No MX Record Found: {0}")]
    NoMxRecords(String),

    /// The mail exchange query timed out.
    #[error("DNS Timeout for domain: {0}")]
    DnsTimeout(String),

    /// The remote host refused the connection.
    #[error("Connection Refused: {host}:{port}")]
    ConnectionRefused {
        /// Target host.
        host: String,
        /// Target port.
        port: u16,
    },

    /// Connecting to or awaiting the remote host timed out.
    #[error("Connection Timeout: {host}:{port}")]
    ConnectionTimeout {
        /// Target host.
        host: String,
        /// Target port.
        port: u16,
    },

    /// The remote server rejected the envelope sender.
    #[error("Sender Rejected: Code={code}, Message='{reason}'")]
    SenderRejected {
        /// The SMTP status code.
        code: u16,
        /// The reason returned by the server.
        reason: String,
    },

    /// The remote server rejected every envelope recipient.
    #[error("All Recipients Rejected")]
    RecipientsRefused,

    /// The remote server closed the connection mid-transaction.
    #[error("Connection Closed by Remote Host")]
    Disconnected,

    /// A generic negative protocol response outside the specific cases.
    #[error("Protocol Error: Code={code}, Message='{text}'")]
    Protocol {
        /// The SMTP status code.
        code: u16,
        /// The message returned by the server.
        text: String,
    },

    /// Error specifically during the STARTTLS handshake.
    #[error("STARTTLS Error: {0}")]
    StartTls(String),

    /// An underlying error that doesn't fit other categories, using anyhow.
    #[error("Generic Error: {0}")]
    Generic(#[from] anyhow::Error),
}

impl AppError {
    /// Whether this error belongs to the per-domain-group transport taxonomy.
    ///
    /// Transport errors are caught and logged at the group boundary;
    /// everything else propagates to its own scope (file or message).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            AppError::Dns(_)
                | AppError::NoMxRecords(_)
                | AppError::DnsTimeout(_)
                | AppError::ConnectionRefused { .. }
                | AppError::ConnectionTimeout { .. }
                | AppError::SenderRejected { .. }
                | AppError::RecipientsRefused
                | AppError::Disconnected
                | AppError::Protocol { .. }
                | AppError::StartTls(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_are_classified() {
        assert!(AppError::RecipientsRefused.is_transport());
        assert!(AppError::DnsTimeout("example.org".into()).is_transport());
        assert!(AppError::Protocol {
            code: 554,
            text: "5.7.1 Spam message rejected".into()
        }
        .is_transport());
        assert!(!AppError::Validation("sender missing".into()).is_transport());
        assert!(!AppError::Message("attachment not found".into()).is_transport());
    }
}
