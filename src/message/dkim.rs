//! Message-integrity header: DKIM signature over the finalized
//! header-plus-body bytes.

use mail_auth::common::crypto::{RsaKey, Sha256};
use mail_auth::common::headers::HeaderWriter;
use mail_auth::dkim::DkimSigner;

use crate::core::error::{AppError, Result};

/// Headers covered by the signature when present in the message.
const SIGNED_HEADERS: [&str; 6] = ["From", "To", "Cc", "Subject", "Date", "Message-ID"];

/// Resolved DKIM parameters: PEM key text, file indirection already
/// applied.
#[derive(Debug, Clone)]
pub struct ResolvedDkim {
    pub selector: String,
    pub domain: String,
    pub privkey: String,
}

/// Compute the `DKIM-Signature` header line for a finalized message.
///
/// The returned line is complete (name, value, trailing CRLF) and is
/// prepended to the message as its final top-level header.
pub fn sign_header(message: &[u8], params: &ResolvedDkim) -> Result<String> {
    let key = RsaKey::<Sha256>::from_rsa_pem(&params.privkey)
        .map_err(|err| AppError::Message(format!("Failed to load DKIM key: {}", err)))?;

    let signature = DkimSigner::from_key(key)
        .domain(&params.domain)
        .selector(&params.selector)
        .headers(SIGNED_HEADERS)
        .sign(message)
        .map_err(|err| AppError::Message(format!("DKIM signing failed: {}", err)))?;

    Ok(signature.to_header())
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2048-bit RSA key generated for these tests only.
    fn test_key() -> String {
        use openssl::rsa::Rsa;
        let rsa = Rsa::generate(2048).unwrap();
        String::from_utf8(rsa.private_key_to_pem().unwrap()).unwrap()
    }

    #[test]
    fn produces_a_complete_header_line() {
        let params = ResolvedDkim {
            selector: "default".to_string(),
            domain: "example.org".to_string(),
            privkey: test_key(),
        };
        let message = b"From: sender@example.org\r\n\
                        To: recipient@example.org\r\n\
                        Subject: Test email\r\n\
                        \r\n\
                        Just a simple text message.\r\n";

        let header = sign_header(message, &params).unwrap();
        assert!(header.starts_with("DKIM-Signature:"));
        assert!(header.contains("d=example.org"));
        assert!(header.contains("s=default"));
        assert!(header.ends_with("\r\n"));
    }

    #[test]
    fn bad_key_is_a_message_error() {
        let params = ResolvedDkim {
            selector: "default".to_string(),
            domain: "example.org".to_string(),
            privkey: "not a key".to_string(),
        };
        let err = sign_header(b"From: a@b\r\n\r\nbody", &params).unwrap_err();
        assert!(matches!(err, AppError::Message(_)));
    }
}
