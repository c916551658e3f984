//! Message assembly: addresses, body variants, attachments, signing.
//!
//! A [`Message`] is built once from a validated descriptor, optionally
//! staged with attachments, and finalized by [`Message::render`] into
//! the wire-encoded string. Rendering is idempotent over its declared
//! inputs but generates a fresh Message-ID, Date and MIME boundaries on
//! each call unless the caller pins them.

pub mod dkim;
pub mod mime;
pub mod smime;

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use lettre::message::Mailbox;
use serde_yaml::Value as Yaml;
use uuid::Uuid;

use crate::core::error::{AppError, Result};
use crate::document::descriptor::{MailDescriptor, StringOrList};
use crate::document::template::TemplateExpander;
use dkim::ResolvedDkim;
use mime::MimeEntity;
use smime::ResolvedSmime;

/// The message body, dispatched by variant at render time.
#[derive(Debug, Clone)]
pub enum Body {
    /// No body fields configured; renders as an empty text part.
    Empty,
    Text(String),
    Html(String),
    /// Both representations, least capable first.
    Alternative { text: String, html: String },
    /// A rendered raw-message template used as the base message.
    Raw(String),
}

/// One renderable message.
pub struct Message {
    /// Short name used in log correlation.
    pub name: Option<String>,

    sender: Mailbox,
    from_addr: Mailbox,
    recipients: Vec<Mailbox>,
    to_addrs: Vec<Mailbox>,
    cc_addrs: Vec<Mailbox>,
    bcc_addrs: Vec<Mailbox>,

    subject: Option<String>,
    headers: Vec<(String, Option<String>)>,

    body: Body,
    ical: Option<String>,
    attachments: Vec<PathBuf>,

    dkim: Option<ResolvedDkim>,
    smime: Option<ResolvedSmime>,

    /// Pin the Message-ID instead of generating one per render.
    pub message_id: Option<String>,
    /// Pin the Date header instead of stamping render time.
    pub date: Option<DateTime<Utc>>,
}

impl Message {
    /// Consume a validated descriptor into a message.
    ///
    /// `base_dir` anchors every relative path the descriptor names (raw
    /// message template, key material). The expander runs the nested
    /// template pass over a raw-message (`eml`) file.
    pub fn from_descriptor(
        mail: MailDescriptor,
        base_dir: &Path,
        expander: &TemplateExpander,
    ) -> Result<Message> {
        let sender = parse_one(
            mail.sender
                .as_deref()
                .ok_or_else(|| AppError::Validation("Missing required field 'sender'".into()))?,
        )?;
        let from_addr = match mail.from_addr.as_deref() {
            Some(addr) => parse_one(addr)?,
            None => sender.clone(),
        };

        let recipients = parse_addresses(mail.recipients.as_ref())?;
        let to_addrs = match mail.to.as_ref() {
            Some(field) => parse_addresses(Some(field))?,
            None => recipients.clone(),
        };
        let cc_addrs = parse_addresses(mail.cc.as_ref())?;
        let bcc_addrs = parse_addresses(mail.bcc.as_ref())?;

        let body = match (&mail.eml, &mail.text_body, &mail.html_body) {
            (Some(path), _, _) => {
                let path = base_dir.join(path);
                let raw = std::fs::read_to_string(&path).map_err(|err| {
                    AppError::Message(format!("Failed to read {}: {}", path.display(), err))
                })?;
                Body::Raw(expander.render_str(&raw, None)?)
            }
            (None, Some(text), Some(html)) => Body::Alternative {
                text: text.clone(),
                html: html.clone(),
            },
            (None, Some(text), None) => Body::Text(text.clone()),
            (None, None, Some(html)) => Body::Html(html.clone()),
            (None, None, None) => Body::Empty,
        };

        let headers = match &mail.headers {
            Some(map) => header_overrides(map)?,
            None => Vec::new(),
        };

        let dkim = match mail.dkim {
            Some(params) => Some(ResolvedDkim {
                privkey: resolve_material(
                    params.privkey.as_deref(),
                    params.privkey_file.as_deref(),
                    base_dir,
                )?
                .ok_or_else(|| AppError::Message("DKIM key material missing".into()))?,
                selector: params.selector,
                domain: params.domain,
            }),
            None => None,
        };

        let smime = match mail.smime {
            Some(params) => Some(ResolvedSmime {
                from_key: resolve_material(
                    params.from_key.as_deref(),
                    params.from_key_file.as_deref(),
                    base_dir,
                )?,
                from_crt: resolve_material(
                    params.from_crt.as_deref(),
                    params.from_crt_file.as_deref(),
                    base_dir,
                )?,
                to_crts: resolve_material(
                    params.to_crts.as_deref(),
                    params.to_crts_file.as_deref(),
                    base_dir,
                )?,
            }),
            None => None,
        };

        Ok(Message {
            name: mail.name,
            sender,
            from_addr,
            recipients,
            to_addrs,
            cc_addrs,
            bcc_addrs,
            subject: mail.subject,
            headers,
            body,
            ical: mail.ical,
            attachments: Vec::new(),
            dkim,
            smime,
            message_id: None,
            date: None,
        })
    }

    /// Stage an attachment. The path is checked at render time.
    pub fn attach(&mut self, path: impl Into<PathBuf>) {
        self.attachments.push(path.into());
    }

    /// Log-friendly identifier for this message.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("<unnamed>")
    }

    /// The envelope sender address.
    pub fn envelope_sender(&self) -> &Mailbox {
        &self.sender
    }

    /// The full envelope recipient set: the combined recipient list
    /// (falling back to `to`) plus cc plus bcc.
    pub fn envelope_recipients(&self) -> Vec<Mailbox> {
        let primary = if self.recipients.is_empty() {
            &self.to_addrs
        } else {
            &self.recipients
        };
        primary
            .iter()
            .chain(self.cc_addrs.iter())
            .chain(self.bcc_addrs.iter())
            .cloned()
            .collect()
    }

    /// Flatten the entire message into its wire-encoded string.
    pub fn render(&self) -> Result<String> {
        let (base_headers, mut entity) = match &self.body {
            Body::Raw(text) => raw_base(text)?,
            Body::Empty => (Vec::new(), mime::text_part("", "plain")),
            Body::Text(text) => (Vec::new(), mime::text_part(text, "plain")),
            Body::Html(html) => (Vec::new(), mime::text_part(html, "html")),
            Body::Alternative { text, html } => (
                Vec::new(),
                mime::multipart(
                    "alternative",
                    "",
                    None,
                    vec![mime::text_part(text, "plain"), mime::text_part(html, "html")],
                ),
            ),
        };

        if self.ical.is_some() || !self.attachments.is_empty() {
            let mut parts = vec![entity];
            if let Some(ical) = &self.ical {
                parts.push(mime::calendar_part(ical));
            }
            for path in &self.attachments {
                parts.push(mime::attachment_part(path)?);
            }
            entity = mime::multipart(
                "mixed",
                "",
                Some("This is a multi-part message in MIME format."),
                parts,
            );
        }

        if let Some(smime) = &self.smime {
            if smime.signs() {
                entity = smime::sign(
                    &entity,
                    smime.from_key.as_deref().unwrap_or_default(),
                    smime.from_crt.as_deref().unwrap_or_default(),
                )?;
            }
            if smime.encrypts() {
                entity = smime::encrypt(&entity, smime.to_crts.as_deref().unwrap_or_default())?;
            }
        }

        let headers = self.merged_headers(base_headers);

        let mut out = String::with_capacity(entity.body.len() + 1024);
        for (name, value) in &headers {
            mime::write_header(&mut out, name, value);
        }
        for (name, value) in &entity.headers {
            mime::write_header(&mut out, name, value);
        }
        out.push_str("\r\n");
        out.push_str(&entity.body);

        if let Some(dkim) = &self.dkim {
            let signature = dkim::sign_header(out.as_bytes(), dkim)?;
            out.insert_str(0, &signature);
        }

        Ok(out)
    }

    /// Canonical headers computed at render time, merged with user
    /// overrides. User headers win on a case-insensitive key match,
    /// keep their original casing, and a null/empty value suppresses
    /// the computed header entirely.
    fn merged_headers(&self, base: Vec<(String, String)>) -> Vec<(String, String)> {
        let user_has =
            |name: &str| -> bool { self.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name)) };

        let mut merged: Vec<(String, String)> = Vec::new();
        for (name, value) in base {
            if !user_has(&name) {
                merged.push((name, value));
            }
        }

        let mut computed: Vec<(String, String)> = Vec::new();
        computed.push(("From".to_string(), self.from_addr.to_string()));
        computed.push(("To".to_string(), join_mailboxes(&self.to_addrs)));
        if !self.cc_addrs.is_empty() {
            computed.push(("Cc".to_string(), join_mailboxes(&self.cc_addrs)));
        }
        if let Some(subject) = &self.subject {
            computed.push(("Subject".to_string(), mime::encode_header_value(subject)));
        }
        computed.push((
            "Date".to_string(),
            self.date.unwrap_or_else(Utc::now).to_rfc2822(),
        ));
        computed.push(("Message-ID".to_string(), self.next_message_id()));
        computed.push(("MIME-Version".to_string(), "1.0".to_string()));

        for (name, value) in computed {
            let already_present = merged.iter().any(|(k, _)| k.eq_ignore_ascii_case(&name));
            if !already_present && !user_has(&name) {
                merged.push((name, value));
            }
        }

        for (name, value) in &self.headers {
            match value {
                Some(v) if !v.is_empty() => merged.push((name.clone(), v.clone())),
                _ => {} // explicit null/empty suppresses the header
            }
        }

        merged
    }

    fn next_message_id(&self) -> String {
        match &self.message_id {
            Some(pinned) => pinned.clone(),
            None => format!(
                "<{}@{}>",
                Uuid::new_v4().simple(),
                self.sender.email.domain()
            ),
        }
    }
}

/// Split a rendered raw-message template into its display headers and
/// body entity. `Content-*` headers stay with the entity so signing and
/// assembly treat the parsed body like any other base body.
fn raw_base(text: &str) -> Result<(Vec<(String, String)>, MimeEntity)> {
    let (parsed, body_offset) = mailparse::parse_headers(text.as_bytes())
        .map_err(|err| AppError::Message(format!("Failed to parse raw message: {}", err)))?;

    let mut top = Vec::new();
    let mut entity_headers = Vec::new();
    for header in &parsed {
        let name = header.get_key();
        let value = header.get_value();
        if name.to_ascii_lowercase().starts_with("content-") {
            entity_headers.push((name, value));
        } else {
            top.push((name, value));
        }
    }

    let body = mime::normalize_crlf(&text[body_offset..]);

    Ok((
        top,
        MimeEntity {
            headers: entity_headers,
            body,
        },
    ))
}

fn parse_one(address: &str) -> Result<Mailbox> {
    Ok(address.trim().parse::<Mailbox>()?)
}

/// Parse an address field: a comma-joined string or an explicit list,
/// one mailbox per item.
fn parse_addresses(field: Option<&StringOrList>) -> Result<Vec<Mailbox>> {
    let Some(field) = field else {
        return Ok(Vec::new());
    };

    field
        .items()
        .iter()
        .filter(|item| !item.is_empty())
        .map(|item| parse_one(item))
        .collect()
}

fn join_mailboxes(mailboxes: &[Mailbox]) -> String {
    mailboxes
        .iter()
        .map(|m| m.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Convert the descriptor's header mapping into ordered overrides,
/// preserving the given key casing. A null value marks suppression.
fn header_overrides(map: &serde_yaml::Mapping) -> Result<Vec<(String, Option<String>)>> {
    let mut headers = Vec::with_capacity(map.len());
    for (key, value) in map {
        let name = key
            .as_str()
            .ok_or_else(|| AppError::Message("Header names must be strings".into()))?
            .to_string();
        let value = match value {
            Yaml::Null => None,
            Yaml::String(s) => Some(s.clone()),
            Yaml::Bool(b) => Some(b.to_string()),
            Yaml::Number(n) => Some(n.to_string()),
            _ => {
                return Err(AppError::Message(format!(
                    "Header '{}' must be a scalar value",
                    name
                )))
            }
        };
        headers.push((name, value));
    }
    Ok(headers)
}

/// Read inline-or-file key material, file paths relative to the config
/// file's directory.
fn resolve_material(
    inline: Option<&str>,
    file: Option<&str>,
    base_dir: &Path,
) -> Result<Option<String>> {
    match (inline, file) {
        (Some(text), _) => Ok(Some(text.to_string())),
        (None, Some(rel)) => {
            let path = base_dir.join(rel);
            std::fs::read_to_string(&path).map(Some).map_err(|err| {
                AppError::Message(format!("Failed to read {}: {}", path.display(), err))
            })
        }
        (None, None) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::descriptor::StringOrList;
    use std::io::Write;

    fn expander() -> TemplateExpander {
        TemplateExpander::new(None)
    }

    fn descriptor() -> MailDescriptor {
        MailDescriptor {
            name: Some("test".into()),
            sender: Some("sender@example.org".into()),
            recipients: Some(StringOrList::One("recipient@example.org".into())),
            subject: Some("Test email".into()),
            ..Default::default()
        }
    }

    fn build(mail: MailDescriptor) -> Message {
        Message::from_descriptor(mail, Path::new("."), &expander()).unwrap()
    }

    fn pinned(mail: MailDescriptor) -> Message {
        let mut msg = build(mail);
        msg.message_id = Some("<fixed@example.org>".into());
        msg.date = Some(DateTime::parse_from_rfc3339("2024-05-01T12:00:00Z").unwrap().into());
        msg
    }

    fn header_value<'a>(rendered: &'a str, name: &str) -> Option<&'a str> {
        let headers = rendered.split("\r\n\r\n").next().unwrap();
        headers.split("\r\n").find_map(|line| {
            let (key, value) = line.split_once(": ")?;
            key.eq_ignore_ascii_case(name).then_some(value)
        })
    }

    #[test]
    fn comma_string_and_list_parse_to_the_same_mailboxes() {
        let joined = parse_addresses(Some(&StringOrList::One("a@x.com, b@y.com".into()))).unwrap();
        let listed = parse_addresses(Some(&StringOrList::Many(vec![
            "a@x.com".into(),
            "b@y.com".into(),
        ])))
        .unwrap();

        assert_eq!(joined.len(), 2);
        let render = |boxes: &[Mailbox]| -> Vec<String> {
            boxes.iter().map(|m| m.to_string()).collect()
        };
        assert_eq!(render(&joined), render(&listed));
        assert_eq!(joined[1].email.to_string(), "b@y.com");
    }

    #[test]
    fn display_names_survive_parsing() {
        let parsed =
            parse_addresses(Some(&StringOrList::Many(vec!["Alice <alice@x.com>".into()])))
                .unwrap();
        assert_eq!(parsed[0].name.as_deref(), Some("Alice"));
        assert_eq!(parsed[0].email.domain(), "x.com");
    }

    #[test]
    fn text_only_renders_a_single_plain_part() {
        let mut mail = descriptor();
        mail.text_body = Some("Just a simple text message.".into());
        let rendered = pinned(mail).render().unwrap();

        assert_eq!(
            header_value(&rendered, "Content-Type").unwrap(),
            "text/plain; charset=\"utf-8\""
        );
        assert!(!rendered.contains("multipart/"));
        assert!(rendered.contains("Just a simple text message."));
    }

    #[test]
    fn text_and_html_render_alternative_plain_first() {
        let mut mail = descriptor();
        mail.text_body = Some("plain version".into());
        mail.html_body = Some("<p>html version</p>".into());
        let rendered = pinned(mail).render().unwrap();

        assert!(header_value(&rendered, "Content-Type")
            .unwrap()
            .starts_with("multipart/alternative"));
        assert_eq!(rendered.matches("Content-Type: text/plain").count(), 1);
        assert_eq!(rendered.matches("Content-Type: text/html").count(), 1);
        let plain_at = rendered.find("text/plain").unwrap();
        let html_at = rendered.find("text/html").unwrap();
        assert!(plain_at < html_at);
    }

    #[test]
    fn no_body_renders_an_empty_text_part() {
        let rendered = pinned(descriptor()).render().unwrap();
        assert_eq!(
            header_value(&rendered, "Content-Type").unwrap(),
            "text/plain; charset=\"utf-8\""
        );
    }

    #[test]
    fn from_defaults_to_sender_and_to_defaults_to_recipients() {
        let rendered = pinned(descriptor()).render().unwrap();
        assert_eq!(header_value(&rendered, "From").unwrap(), "sender@example.org");
        assert_eq!(header_value(&rendered, "To").unwrap(), "recipient@example.org");
    }

    #[test]
    fn distinct_from_and_to_override_the_envelope_fields() {
        let mut mail = descriptor();
        mail.from_addr = Some("display@example.org".into());
        mail.to = Some(StringOrList::One("shown@example.org".into()));
        let msg = pinned(mail);
        let rendered = msg.render().unwrap();

        assert_eq!(header_value(&rendered, "From").unwrap(), "display@example.org");
        assert_eq!(header_value(&rendered, "To").unwrap(), "shown@example.org");
        // envelope still targets the combined recipient list
        let envelope: Vec<String> = msg
            .envelope_recipients()
            .iter()
            .map(|m| m.email.to_string())
            .collect();
        assert_eq!(envelope, vec!["recipient@example.org".to_string()]);
    }

    #[test]
    fn bcc_reaches_the_envelope_but_never_the_headers() {
        let mut mail = descriptor();
        mail.bcc = Some(StringOrList::One("hidden@example.org".into()));
        let msg = pinned(mail);
        let rendered = msg.render().unwrap();

        assert!(!rendered.contains("hidden@example.org"));
        let envelope: Vec<String> = msg
            .envelope_recipients()
            .iter()
            .map(|m| m.email.to_string())
            .collect();
        assert!(envelope.contains(&"hidden@example.org".to_string()));
    }

    #[test]
    fn user_headers_override_computed_ones_case_insensitively() {
        let mut mail = descriptor();
        mail.headers = Some(serde_yaml::from_str("{ subject: Overridden, X-Campaign: roll-out }").unwrap());
        let rendered = pinned(mail).render().unwrap();

        assert_eq!(header_value(&rendered, "Subject").unwrap(), "Overridden");
        assert_eq!(header_value(&rendered, "X-Campaign").unwrap(), "roll-out");
        // the override keeps its own casing and appears exactly once
        assert_eq!(rendered.matches("subject: Overridden").count(), 1);
        assert!(!rendered.contains("Subject: Test email"));
    }

    #[test]
    fn null_header_suppresses_the_computed_value() {
        let mut mail = descriptor();
        mail.headers = Some(serde_yaml::from_str("Message-ID: null").unwrap());
        let rendered = pinned(mail).render().unwrap();
        assert!(header_value(&rendered, "Message-ID").is_none());
    }

    #[test]
    fn calendar_payload_wraps_the_body_in_mixed() {
        let mut mail = descriptor();
        mail.text_body = Some("see invite".into());
        mail.ical = Some("BEGIN:VCALENDAR\nEND:VCALENDAR".into());
        let rendered = pinned(mail).render().unwrap();

        assert!(header_value(&rendered, "Content-Type")
            .unwrap()
            .starts_with("multipart/mixed"));
        assert!(rendered.contains("text/calendar; method=REQUEST"));
        assert!(rendered.contains("BEGIN:VCALENDAR"));
    }

    #[test]
    fn attachments_wrap_the_body_in_mixed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("notes.txt");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"attached text").unwrap();

        let mut mail = descriptor();
        mail.text_body = Some("body text".into());
        let mut msg = pinned(mail);
        msg.attach(&path);
        let rendered = msg.render().unwrap();

        assert!(header_value(&rendered, "Content-Type")
            .unwrap()
            .starts_with("multipart/mixed"));
        assert!(rendered.contains("attachment; filename=\"notes.txt\""));
    }

    #[test]
    fn missing_attachment_fails_with_the_path() {
        let mut msg = pinned(descriptor());
        msg.attach("/no/such/file.pdf");
        let err = msg.render().unwrap_err();
        assert!(matches!(err, AppError::Message(_)));
        assert!(err.to_string().contains("/no/such/file.pdf"));
    }

    #[test]
    fn raw_message_base_keeps_its_headers_and_body() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mail.eml");
        std::fs::write(
            &path,
            "X-Origin: templated\nContent-Type: text/plain\n\nraw body line\n",
        )
        .unwrap();

        let mut mail = descriptor();
        mail.eml = Some("mail.eml".into());
        let msg = Message::from_descriptor(mail, dir.path(), &expander()).unwrap();
        let mut msg = msg;
        msg.message_id = Some("<fixed@example.org>".into());
        let rendered = msg.render().unwrap();

        assert_eq!(header_value(&rendered, "X-Origin").unwrap(), "templated");
        assert_eq!(header_value(&rendered, "Content-Type").unwrap(), "text/plain");
        assert!(rendered.contains("raw body line"));
        // canonical headers are still added around the base
        assert_eq!(header_value(&rendered, "From").unwrap(), "sender@example.org");
    }

    #[test]
    fn render_is_stable_when_identifiers_are_pinned() {
        let mut mail = descriptor();
        mail.text_body = Some("stable".into());
        let msg = pinned(mail);
        assert_eq!(msg.render().unwrap(), msg.render().unwrap());
    }

    #[test]
    fn signed_message_keeps_display_headers_outside_the_envelope() {
        use openssl::asn1::Asn1Time;
        use openssl::hash::MessageDigest;
        use openssl::pkey::PKey;
        use openssl::rsa::Rsa;
        use openssl::x509::{X509, X509Name};

        let rsa = Rsa::generate(2048).unwrap();
        let key = PKey::from_rsa(rsa).unwrap();
        let mut name = X509Name::builder().unwrap();
        name.append_entry_by_text("CN", "sender@example.org").unwrap();
        let name = name.build();
        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder.set_not_before(&Asn1Time::days_from_now(0).unwrap()).unwrap();
        builder.set_not_after(&Asn1Time::days_from_now(1).unwrap()).unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        let cert = builder.build();

        let mut mail = descriptor();
        mail.text_body = Some("signed body".into());
        mail.smime = Some(crate::document::descriptor::SmimeParams {
            from_key: Some(
                String::from_utf8(key.private_key_to_pem_pkcs8().unwrap()).unwrap(),
            ),
            from_crt: Some(String::from_utf8(cert.to_pem().unwrap()).unwrap()),
            ..Default::default()
        });
        let rendered = pinned(mail).render().unwrap();

        assert_eq!(header_value(&rendered, "From").unwrap(), "sender@example.org");
        assert!(header_value(&rendered, "Content-Type")
            .unwrap()
            .starts_with("multipart/signed"));
        assert!(rendered.contains("signed body"));
        assert!(rendered.contains("smime.p7s"));
    }

    #[test]
    fn dkim_header_is_prepended_last() {
        let privkey = {
            use openssl::rsa::Rsa;
            String::from_utf8(Rsa::generate(2048).unwrap().private_key_to_pem().unwrap()).unwrap()
        };

        let mut mail = descriptor();
        mail.text_body = Some("integrity".into());
        mail.dkim = Some(crate::document::descriptor::DkimParams {
            selector: "default".into(),
            domain: "example.org".into(),
            privkey: Some(privkey),
            privkey_file: None,
        });
        let rendered = pinned(mail).render().unwrap();

        assert!(rendered.starts_with("DKIM-Signature:"));
        assert!(rendered.contains("d=example.org"));
    }
}
