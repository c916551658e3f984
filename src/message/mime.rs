//! MIME entity construction: parts, multiparts, encodings.
//!
//! Entities carry their own `Content-*` headers separately from the
//! message's display headers so signing can operate on the
//! header-stripped body.

use std::path::Path;

use base64::Engine;
use uuid::Uuid;

use crate::core::error::{AppError, Result};

const DEFAULT_ATTACHMENT_MIME_TYPE: &str = "application/octet-stream";
const CHARSET: &str = "utf-8";

/// One MIME entity: `Content-*` headers plus an encoded, CRLF-terminated
/// body. Multiparts nest their children into the body text.
#[derive(Debug, Clone)]
pub struct MimeEntity {
    pub headers: Vec<(String, String)>,
    pub body: String,
}

impl MimeEntity {
    /// Flatten into entity headers + blank line + body.
    pub fn flatten(&self) -> String {
        let mut out = String::with_capacity(self.body.len() + 256);
        for (name, value) in &self.headers {
            write_header(&mut out, name, value);
        }
        out.push_str("\r\n");
        out.push_str(&self.body);
        out
    }
}

/// A `text/<subtype>` part carrying the given content.
pub fn text_part(content: &str, subtype: &str) -> MimeEntity {
    MimeEntity {
        headers: vec![
            (
                "Content-Type".to_string(),
                format!("text/{}; charset=\"{}\"", subtype, CHARSET),
            ),
            ("Content-Transfer-Encoding".to_string(), "8bit".to_string()),
        ],
        body: ensure_crlf_terminated(&normalize_crlf(content)),
    }
}

/// The calendar part appended ahead of any attachments.
pub fn calendar_part(ical: &str) -> MimeEntity {
    MimeEntity {
        headers: vec![
            (
                "Content-Type".to_string(),
                format!("text/calendar; method=REQUEST; charset=\"{}\"", CHARSET),
            ),
            ("Content-Transfer-Encoding".to_string(), "8bit".to_string()),
        ],
        body: ensure_crlf_terminated(&normalize_crlf(ical)),
    }
}

/// Build an attachment part from a file on disk.
///
/// The content type is guessed from the path; an unrecognized guess
/// falls back to a generic binary type so re-encoding cannot corrupt
/// the payload.
pub fn attachment_part(path: &Path) -> Result<MimeEntity> {
    if !path.is_file() {
        return Err(AppError::Message(format!(
            "File not found: {}",
            path.display()
        )));
    }

    let mime_type = mime_guess::from_path(path)
        .first()
        .map(|m| m.essence_str().to_string())
        .unwrap_or_else(|| DEFAULT_ATTACHMENT_MIME_TYPE.to_string());

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let data = std::fs::read(path)?;

    Ok(MimeEntity {
        headers: vec![
            (
                "Content-Type".to_string(),
                format!("{}; name=\"{}\"", mime_type, file_name),
            ),
            (
                "Content-Disposition".to_string(),
                format!("attachment; filename=\"{}\"", file_name),
            ),
            (
                "Content-Transfer-Encoding".to_string(),
                "base64".to_string(),
            ),
        ],
        body: wrap_base64(&data),
    })
}

/// Assemble a `multipart/<subtype>` entity around the given parts.
///
/// `extra_params` lands in the Content-Type after the boundary
/// (`micalg`/`protocol` for multipart/signed).
pub fn multipart(
    subtype: &str,
    extra_params: &str,
    preamble: Option<&str>,
    parts: Vec<MimeEntity>,
) -> MimeEntity {
    let boundary = fresh_boundary();

    let mut body = String::new();
    if let Some(preamble) = preamble {
        body.push_str(preamble);
        body.push_str("\r\n");
    }
    for part in &parts {
        body.push_str(&format!("--{}\r\n", boundary));
        body.push_str(&ensure_crlf_terminated(&part.flatten()));
    }
    body.push_str(&format!("--{}--\r\n", boundary));

    MimeEntity {
        headers: vec![(
            "Content-Type".to_string(),
            format!(
                "multipart/{}; boundary=\"{}\"{}",
                subtype, boundary, extra_params
            ),
        )],
        body,
    }
}

pub(crate) fn fresh_boundary() -> String {
    format!("----=_Part_{}", Uuid::new_v4().simple())
}

pub(crate) fn write_header(out: &mut String, name: &str, value: &str) {
    out.push_str(name);
    out.push_str(": ");
    out.push_str(value);
    out.push_str("\r\n");
}

/// RFC 2047 encode a header value if it contains non-ASCII characters.
pub(crate) fn encode_header_value(value: &str) -> String {
    if value.is_ascii() {
        return value.to_string();
    }
    let encoded = base64::engine::general_purpose::STANDARD.encode(value.as_bytes());
    format!("=?UTF-8?B?{}?=", encoded)
}

/// Base64 encode wrapped at 76 columns.
pub(crate) fn wrap_base64(data: &[u8]) -> String {
    let encoded = base64::engine::general_purpose::STANDARD.encode(data);
    let mut out = String::with_capacity(encoded.len() + encoded.len() / 76 * 2 + 2);
    for chunk in encoded.as_bytes().chunks(76) {
        out.push_str(std::str::from_utf8(chunk).unwrap_or(""));
        out.push_str("\r\n");
    }
    out
}

pub(crate) fn normalize_crlf(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    for line in text.split('\n') {
        let line = line.trim_end_matches('\r');
        out.push_str(line);
        out.push_str("\r\n");
    }
    // drop the break added after the final split element
    out.truncate(out.len() - 2);
    out
}

pub(crate) fn ensure_crlf_terminated(text: &str) -> String {
    if text.ends_with("\r\n") {
        text.to_string()
    } else {
        format!("{}\r\n", text)
    }
}
