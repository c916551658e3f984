//! The typed shape of one expanded mail node.

use serde::Deserialize;
use serde_yaml::Mapping;

/// A field that accepts either a comma-joined string or an explicit list.
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
pub enum StringOrList {
    One(String),
    Many(Vec<String>),
}

impl StringOrList {
    /// Flatten into the individual items. A single string is split on
    /// commas the same way the list form separates its entries.
    pub fn items(&self) -> Vec<String> {
        match self {
            StringOrList::One(s) => s.split(',').map(|i| i.trim().to_string()).collect(),
            StringOrList::Many(list) => list.clone(),
        }
    }

    /// The raw values without comma splitting (attachment paths may
    /// legitimately contain commas).
    pub fn raw_items(&self) -> Vec<String> {
        match self {
            StringOrList::One(s) => vec![s.clone()],
            StringOrList::Many(list) => list.clone(),
        }
    }
}

/// DKIM signing parameters.
#[derive(Deserialize, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct DkimParams {
    /// Selector published under `<selector>._domainkey.<domain>`.
    pub selector: String,
    /// Signing domain (`d=` tag).
    pub domain: String,
    /// RSA private key, PEM, inline.
    pub privkey: Option<String>,
    /// RSA private key path, relative to the config file.
    pub privkey_file: Option<String>,
}

/// S/MIME signing and encryption material, inline or by path.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct SmimeParams {
    pub from_key: Option<String>,
    pub from_key_file: Option<String>,
    pub from_crt: Option<String>,
    pub from_crt_file: Option<String>,
    pub to_crts: Option<String>,
    pub to_crts_file: Option<String>,
}

impl SmimeParams {
    /// Signing requested (key and certificate configured).
    pub fn signs(&self) -> bool {
        (self.from_key.is_some() || self.from_key_file.is_some())
            && (self.from_crt.is_some() || self.from_crt_file.is_some())
    }

    /// Encryption requested (recipient certificates configured).
    pub fn encrypts(&self) -> bool {
        self.to_crts.is_some() || self.to_crts_file.is_some()
    }
}

/// Fully expanded representation of one message to send.
///
/// Field names form the allow-list: unknown keys are rejected during
/// deserialization. Most fields are optional at the type level; the
/// cross-field invariants live in [`crate::document::validate`].
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct MailDescriptor {
    /// Short name used in log correlation.
    pub name: Option<String>,
    /// Free-form description, dropped before message assembly.
    pub description: Option<String>,

    /// Envelope sender (required).
    pub sender: Option<String>,
    /// Display `From` when distinct from the envelope sender.
    #[serde(rename = "from")]
    pub from_addr: Option<String>,

    /// Legacy combined envelope recipient list.
    pub recipients: Option<StringOrList>,
    /// Display `To` recipients.
    pub to: Option<StringOrList>,
    /// Display `Cc` recipients.
    pub cc: Option<StringOrList>,
    /// Blind-copy recipients: part of the envelope, never of the headers.
    pub bcc: Option<StringOrList>,

    pub subject: Option<String>,
    /// Custom headers. A `null` value suppresses the computed header of
    /// the same (case-insensitive) name.
    pub headers: Option<Mapping>,

    pub text_body: Option<String>,
    pub html_body: Option<String>,
    /// Calendar payload, sent as a `text/calendar` part.
    pub ical: Option<String>,
    /// Path to an externally-templated raw message. Mutually exclusive
    /// with the body and attachment fields.
    pub eml: Option<String>,

    /// Attachment paths, relative to the config file.
    pub attachments: Option<StringOrList>,

    pub dkim: Option<DkimParams>,
    pub smime: Option<SmimeParams>,

    /// Free-form tags matched against the run's tag filter.
    pub tags: Option<Vec<String>>,
}

impl MailDescriptor {
    /// Log-friendly identifier for this descriptor.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<unnamed>")
    }
}
