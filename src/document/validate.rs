//! Cross-field validation rules for expanded mail descriptors.

use crate::core::error::{AppError, Result};
use crate::document::descriptor::MailDescriptor;

/// Field pairs that must not appear together on one mail node.
const MUTUAL_EXCLUSION: &[(&str, &str)] = &[
    ("eml", "text_body"),
    ("eml", "html_body"),
    ("eml", "attachments"),
    ("eml", "ical"),
];

/// Check one descriptor against the configured rules.
///
/// Each violation names the failed rule so the log line identifies what
/// to fix. Callers add the mail name and source path as context.
pub fn check(mail: &MailDescriptor) -> Result<()> {
    if mail.sender.is_none() {
        return Err(AppError::Validation(
            "Missing required field 'sender'".to_string(),
        ));
    }

    if mail.recipients.is_none() && mail.to.is_none() {
        return Err(AppError::Validation(
            "Envelope recipient(s) or 'to' not given".to_string(),
        ));
    }

    for (left, right) in MUTUAL_EXCLUSION {
        if field_present(mail, left) && field_present(mail, right) {
            return Err(AppError::Validation(format!(
                "Fields are mutually exclusive: {}, {}",
                left, right
            )));
        }
    }

    if let Some(dkim) = &mail.dkim {
        match (&dkim.privkey, &dkim.privkey_file) {
            (None, None) => {
                return Err(AppError::Validation(
                    "dkim requires 'privkey' or 'privkey_file'".to_string(),
                ))
            }
            (Some(_), Some(_)) => {
                return Err(AppError::Validation(
                    "dkim: 'privkey' and 'privkey_file' are mutually exclusive".to_string(),
                ))
            }
            _ => {}
        }
    }

    if let Some(smime) = &mail.smime {
        for (inline, file, name) in [
            (&smime.from_key, &smime.from_key_file, "from_key"),
            (&smime.from_crt, &smime.from_crt_file, "from_crt"),
            (&smime.to_crts, &smime.to_crts_file, "to_crts"),
        ] {
            if inline.is_some() && file.is_some() {
                return Err(AppError::Validation(format!(
                    "smime: '{0}' and '{0}_file' are mutually exclusive",
                    name
                )));
            }
        }

        let has_key = smime.from_key.is_some() || smime.from_key_file.is_some();
        let has_crt = smime.from_crt.is_some() || smime.from_crt_file.is_some();
        if has_key != has_crt {
            return Err(AppError::Validation(
                "smime signing requires both a key and a certificate".to_string(),
            ));
        }
    }

    Ok(())
}

fn field_present(mail: &MailDescriptor, field: &str) -> bool {
    match field {
        "eml" => mail.eml.is_some(),
        "text_body" => mail.text_body.is_some(),
        "html_body" => mail.html_body.is_some(),
        "attachments" => mail.attachments.is_some(),
        "ical" => mail.ical.is_some(),
        _ => false,
    }
}
