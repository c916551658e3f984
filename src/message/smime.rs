//! S/MIME envelopes: PKCS#7 detached signatures and enveloped-data
//! encryption around a header-stripped MIME entity.

use openssl::pkcs7::{Pkcs7, Pkcs7Flags};
use openssl::pkey::PKey;
use openssl::stack::Stack;
use openssl::symm::Cipher;
use openssl::x509::X509;

use crate::core::error::{AppError, Result};
use crate::message::mime::{self, MimeEntity};

/// Resolved S/MIME material: PEM text, file indirection already applied.
#[derive(Debug, Clone, Default)]
pub struct ResolvedSmime {
    pub from_key: Option<String>,
    pub from_crt: Option<String>,
    pub to_crts: Option<String>,
}

impl ResolvedSmime {
    pub fn signs(&self) -> bool {
        self.from_key.is_some() && self.from_crt.is_some()
    }

    pub fn encrypts(&self) -> bool {
        self.to_crts.is_some()
    }
}

/// Wrap the entity in a `multipart/signed` envelope with a detached
/// PKCS#7 signature.
///
/// The certificate argument may carry a chain; the last certificate is
/// the signer, the rest ride along in the signature.
pub fn sign(entity: &MimeEntity, key_pem: &str, cert_pem: &str) -> Result<MimeEntity> {
    let content = canonical_bytes(entity);

    let key = PKey::private_key_from_pem(key_pem.as_bytes()).map_err(crypto_err)?;
    let certs = X509::stack_from_pem(cert_pem.as_bytes()).map_err(crypto_err)?;
    let signer = certs
        .last()
        .ok_or_else(|| AppError::Message("Signing certificate chain is empty".to_string()))?;

    let mut chain = Stack::new().map_err(crypto_err)?;
    for cert in &certs[..certs.len() - 1] {
        chain.push(cert.clone()).map_err(crypto_err)?;
    }

    let pkcs7 = Pkcs7::sign(
        signer,
        &key,
        &chain,
        &content,
        Pkcs7Flags::DETACHED | Pkcs7Flags::BINARY,
    )
    .map_err(crypto_err)?;
    let der = pkcs7.to_der().map_err(crypto_err)?;

    let signature = MimeEntity {
        headers: vec![
            (
                "Content-Type".to_string(),
                "application/pkcs7-signature; name=\"smime.p7s\"".to_string(),
            ),
            (
                "Content-Disposition".to_string(),
                "attachment; filename=\"smime.p7s\"".to_string(),
            ),
            (
                "Content-Transfer-Encoding".to_string(),
                "base64".to_string(),
            ),
        ],
        body: mime::wrap_base64(&der),
    };

    Ok(mime::multipart(
        "signed",
        "; micalg=\"sha-256\"; protocol=\"application/pkcs7-signature\"",
        Some("This is an S/MIME signed message"),
        vec![entity.clone(), signature],
    ))
}

/// Replace the entity with a PKCS#7 enveloped-data entity encrypted to
/// the given recipient certificates.
pub fn encrypt(entity: &MimeEntity, certs_pem: &str) -> Result<MimeEntity> {
    let content = canonical_bytes(entity);

    let certs = X509::stack_from_pem(certs_pem.as_bytes()).map_err(crypto_err)?;
    if certs.is_empty() {
        return Err(AppError::Message(
            "No recipient certificates for encryption".to_string(),
        ));
    }

    let mut stack = Stack::new().map_err(crypto_err)?;
    for cert in certs {
        stack.push(cert).map_err(crypto_err)?;
    }

    let pkcs7 = Pkcs7::encrypt(
        &stack,
        &content,
        Cipher::aes_256_cbc(),
        Pkcs7Flags::BINARY,
    )
    .map_err(crypto_err)?;
    let der = pkcs7.to_der().map_err(crypto_err)?;

    Ok(MimeEntity {
        headers: vec![
            (
                "Content-Type".to_string(),
                "application/pkcs7-mime; smime-type=enveloped-data; name=\"smime.p7m\"".to_string(),
            ),
            (
                "Content-Disposition".to_string(),
                "attachment; filename=\"smime.p7m\"".to_string(),
            ),
            (
                "Content-Transfer-Encoding".to_string(),
                "base64".to_string(),
            ),
        ],
        body: mime::wrap_base64(&der),
    })
}

/// Signature input: the flattened entity with CRLF line endings.
fn canonical_bytes(entity: &MimeEntity) -> Vec<u8> {
    mime::normalize_crlf(&entity.flatten()).into_bytes()
}

fn crypto_err(err: openssl::error::ErrorStack) -> AppError {
    AppError::Message(format!("S/MIME operation failed: {}", err))
}
