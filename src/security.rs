//! Signing, verification, encryption and decryption of AS4 messages.
//!
//! Outbound order is sign then encrypt; inbound order is decrypt then verify.
//! Signature references cover the `eb:Messaging` header, the verbatim body
//! content and every attachment as transported (after compression).

use crate::attachment::Attachment;
use crate::config::{CryptoConfig, KeystoreConfig};
use crate::crypto::{
    DigestAlgorithm, EncryptAlgorithm, Keystore, SignAlgorithm, WrappedKey, KEY_AGREEMENT_URI, KEY_WRAP_URI,
};
use crate::document::{SoapDocument, XmlElement, BODY_ID};
use crate::error::As4Error;
use crate::model::{CID_PREFIX, EBMS_NS, MESSAGING_ID};
use crate::parser::parse_element;
use crate::wssec::{
    EncryptedAttachment, EncryptedBody, EncryptedKey, SecurityHeader, Signature, SignatureReference,
    BODY_ENCRYPTED_DATA_ID,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::debug;

/// MIME type of encrypted attachment parts.
pub const ENCRYPTED_PART_MIME_TYPE: &str = "application/octet-stream";

/// Per-send security settings.
///
/// All fields absent means the message is sent unsecured.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityParameters {
    pub sign_algorithm: Option<SignAlgorithm>,
    pub sign_digest_algorithm: Option<DigestAlgorithm>,
    pub encrypt_algorithm: Option<EncryptAlgorithm>,
    pub keystore: Option<KeystoreConfig>,
    /// Keystore alias of the party the content key is wrapped for
    pub recipient_alias: Option<String>,
}

impl SecurityParameters {
    pub fn from_config(config: &CryptoConfig) -> Self {
        Self {
            sign_algorithm: config.sign_algorithm,
            sign_digest_algorithm: config.sign_digest_algorithm,
            encrypt_algorithm: config.encrypt_algorithm,
            keystore: config.keystore.clone(),
            recipient_alias: None,
        }
    }

    pub fn is_unsecured(&self) -> bool {
        self.sign_algorithm.is_none()
            && self.sign_digest_algorithm.is_none()
            && self.encrypt_algorithm.is_none()
    }

    /// Signing algorithms, when signing is requested.
    ///
    /// Only one of the two fields being set is a precondition failure.
    pub fn signing(&self) -> Result<Option<(SignAlgorithm, DigestAlgorithm)>, As4Error> {
        match (self.sign_algorithm, self.sign_digest_algorithm) {
            (Some(sign), Some(digest)) => Ok(Some((sign, digest))),
            (None, None) => Ok(None),
            (Some(_), None) => Err(As4Error::precondition(
                "signature algorithm set without signature digest algorithm",
            )),
            (None, Some(_)) => Err(As4Error::precondition(
                "signature digest algorithm set without signature algorithm",
            )),
        }
    }

    /// Validate and open the keystore if any security is requested.
    ///
    /// Configuration problems surface as precondition failures before any
    /// cryptographic operation runs.
    pub fn open_keystore(&self) -> Result<Option<Keystore>, As4Error> {
        if self.is_unsecured() {
            return Ok(None);
        }
        let config = self
            .keystore
            .as_ref()
            .ok_or_else(|| As4Error::precondition("security requested but no keystore configured"))?;
        config.validate()?;
        Keystore::open(config).map(Some)
    }
}

/// Outcome of a successful signature verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedSignature {
    /// Keystore alias named in the signature's `KeyInfo`
    pub signer_alias: String,
    pub references: Vec<SignatureReference>,
}

fn security_header(document: &SoapDocument) -> Result<Option<SecurityHeader>, As4Error> {
    document.header("Security").map(SecurityHeader::from_element).transpose()
}

fn store_security_header(document: &mut SoapDocument, header: &SecurityHeader) {
    if header.is_empty() {
        document.remove_header("Security");
    } else {
        let element = header.to_element(document.version);
        document.set_header(element);
    }
}

/// The header block a same-document reference points at.
///
/// The `Id` must be unique across all header content and name a top-level
/// block. `#_messaging` must resolve to the only `eb:Messaging` header, the
/// one inbound processing reads.
fn header_by_id<'a>(document: &'a SoapDocument, id: &str) -> Result<&'a XmlElement, As4Error> {
    let matches: Vec<&XmlElement> = document
        .headers
        .iter()
        .flat_map(|h| h.find_all_by_id(id))
        .collect();
    let element = match matches.as_slice() {
        [] => return Err(As4Error::security(format!("reference #{} not found in header", id))),
        [element] => *element,
        _ => {
            return Err(As4Error::security(format!(
                "reference #{} matches {} elements",
                id,
                matches.len()
            )))
        }
    };
    if !document.headers.iter().any(|h| std::ptr::eq(h, element)) {
        return Err(As4Error::security(format!(
            "reference #{} does not name a top-level header block",
            id
        )));
    }
    if id == MESSAGING_ID {
        let is_messaging = element.local_name == "Messaging" && element.namespace.as_deref() == Some(EBMS_NS);
        if !is_messaging || document.headers_named("Messaging").count() != 1 {
            return Err(As4Error::security(format!(
                "reference #{} does not name the eb:Messaging header",
                id
            )));
        }
    }
    Ok(element)
}

fn find_attachment<'a>(attachments: &'a [Attachment], uri: &str) -> Option<&'a Attachment> {
    let content_id = uri.strip_prefix(CID_PREFIX)?;
    attachments.iter().find(|a| a.content_id() == content_id)
}

/// Bytes a reference URI points at.
fn referenced_bytes(document: &SoapDocument, attachments: &[Attachment], uri: &str) -> Result<Vec<u8>, As4Error> {
    if let Some(id) = uri.strip_prefix('#') {
        if id == BODY_ID {
            return Ok(document.body.as_bytes().to_vec());
        }
        return header_by_id(document, id).map(XmlElement::canonical_bytes);
    }
    if uri.starts_with(CID_PREFIX) {
        return find_attachment(attachments, uri)
            .ok_or_else(|| As4Error::security(format!("referenced attachment {} is missing", uri)))?
            .read_bytes();
    }
    Err(As4Error::security(format!("unsupported reference URI '{}'", uri)))
}

/// Sign the messaging header, the body and every attachment.
pub fn sign(
    document: &mut SoapDocument,
    attachments: &[Attachment],
    algorithm: SignAlgorithm,
    digest_algorithm: DigestAlgorithm,
    keystore: &Keystore,
) -> Result<(), As4Error> {
    if let Err(e) = header_by_id(document, MESSAGING_ID) {
        return Err(As4Error::precondition(format!("no messaging header to sign: {}", e)));
    }

    let mut uris = vec![format!("#{}", MESSAGING_ID), format!("#{}", BODY_ID)];
    uris.extend(attachments.iter().map(Attachment::href));

    let references = uris
        .into_iter()
        .map(|uri| {
            let data = referenced_bytes(document, attachments, &uri)?;
            Ok(SignatureReference {
                uri,
                digest_algorithm_uri: digest_algorithm.uri().to_string(),
                digest_value: BASE64.encode(digest_algorithm.digest(&data)),
            })
        })
        .collect::<Result<Vec<_>, As4Error>>()?;

    let mut signature = Signature {
        signature_method_uri: algorithm.uri().to_string(),
        references,
        signature_value: String::new(),
        key_name: keystore.alias().to_string(),
    };
    let signed_info = signature.signed_info_element().canonical_bytes();
    signature.signature_value = BASE64.encode(keystore.sign(algorithm, &signed_info)?);

    let mut header = security_header(document)?.unwrap_or_default();
    header.must_understand = true;
    header.signature = Some(signature);
    header.received_signed_info = None;
    store_security_header(document, &header);

    debug!(
        alias = %keystore.alias(),
        references = attachments.len() + 2,
        "Message signed"
    );
    Ok(())
}

/// Verify the signature of a received (already decrypted) message.
///
/// Returns `Ok(None)` when the message carries no signature.
pub fn verify(
    document: &SoapDocument,
    attachments: &[Attachment],
    keystore: &Keystore,
) -> Result<Option<VerifiedSignature>, As4Error> {
    let header = match security_header(document)? {
        Some(header) => header,
        None => return Ok(None),
    };
    let (signature, signed_info) = match (header.signature, header.received_signed_info) {
        (Some(signature), Some(signed_info)) => (signature, signed_info),
        _ => return Ok(None),
    };

    let algorithm = SignAlgorithm::from_uri(&signature.signature_method_uri).ok_or_else(|| {
        As4Error::security(format!(
            "unsupported signature algorithm '{}'",
            signature.signature_method_uri
        ))
    })?;
    let signature_bytes = BASE64
        .decode(signature.signature_value.as_bytes())
        .map_err(|e| As4Error::security(format!("signature value is not base64: {}", e)))?;
    keystore.verify(
        algorithm,
        &signature.key_name,
        &signed_info.canonical_bytes(),
        &signature_bytes,
    )?;

    for reference in &signature.references {
        let digest_algorithm = DigestAlgorithm::from_uri(&reference.digest_algorithm_uri).ok_or_else(|| {
            As4Error::security(format!(
                "unsupported digest algorithm '{}'",
                reference.digest_algorithm_uri
            ))
        })?;
        let data = referenced_bytes(document, attachments, &reference.uri)?;
        if BASE64.encode(digest_algorithm.digest(&data)) != reference.digest_value {
            return Err(As4Error::security(format!("digest mismatch for reference {}", reference.uri)));
        }
    }

    let covered = |uri: &str| signature.references.iter().any(|r| r.uri == uri);
    let mut required = vec![format!("#{}", MESSAGING_ID), format!("#{}", BODY_ID)];
    required.extend(attachments.iter().map(Attachment::href));
    if let Some(missing) = required.iter().find(|uri| !covered(uri)) {
        return Err(As4Error::security(format!("{} is not covered by the signature", missing)));
    }

    debug!(signer = %signature.key_name, references = signature.references.len(), "Signature verified");
    Ok(Some(VerifiedSignature {
        signer_alias: signature.key_name,
        references: signature.references,
    }))
}

/// Encrypt the body (when it has content or there are no attachments) and
/// every attachment for `recipient_alias`.
///
/// Returns the encrypted attachments; their MIME type becomes
/// `application/octet-stream` and the plaintext type is kept in the
/// security header.
pub fn encrypt(
    document: &mut SoapDocument,
    attachments: &[Attachment],
    algorithm: EncryptAlgorithm,
    keystore: &Keystore,
    recipient_alias: &str,
) -> Result<Vec<Attachment>, As4Error> {
    if keystore.agreement_key(recipient_alias).is_none() {
        return Err(As4Error::security(format!("no agreement key for '{}'", recipient_alias)));
    }
    let mut header = security_header(document)?.unwrap_or_default();
    if header.encrypted_key.is_some() {
        return Err(As4Error::precondition("message is already encrypted"));
    }

    let content_key = algorithm.generate_key();
    let mut data_references = Vec::with_capacity(attachments.len() + 1);

    if document.has_body_payload() || attachments.is_empty() {
        let ciphertext = algorithm.encrypt(&content_key, document.body.as_bytes())?;
        document.body = EncryptedBody {
            algorithm_uri: algorithm.uri().to_string(),
            cipher_value: BASE64.encode(ciphertext),
        }
        .to_element()
        .to_xml();
        data_references.push(format!("#{}", BODY_ENCRYPTED_DATA_ID));
    }

    let mut encrypted = Vec::with_capacity(attachments.len());
    for (idx, attachment) in attachments.iter().enumerate() {
        let ciphertext = algorithm.encrypt(&content_key, &attachment.read_bytes()?)?;
        header.encrypted_attachments.push(EncryptedAttachment {
            id: format!("ed-{}", idx + 1),
            algorithm_uri: algorithm.uri().to_string(),
            mime_type: attachment.mime_type().to_string(),
            cipher_reference: attachment.href(),
        });
        data_references.push(attachment.href());
        encrypted.push(attachment.with_content(ENCRYPTED_PART_MIME_TYPE, ciphertext));
    }

    let wrapped = keystore.wrap_content_key(recipient_alias, &content_key)?;
    header.must_understand = true;
    header.encrypted_key = Some(EncryptedKey {
        key_wrap_uri: KEY_WRAP_URI.to_string(),
        agreement_method_uri: KEY_AGREEMENT_URI.to_string(),
        originator_key: BASE64.encode(wrapped.originator_key),
        key_name: recipient_alias.to_string(),
        cipher_value: BASE64.encode(wrapped.wrapped),
        data_references,
    });
    header.received_signed_info = None;
    store_security_header(document, &header);

    debug!(
        recipient = %recipient_alias,
        algorithm = %algorithm.uri(),
        attachments = encrypted.len(),
        "Message encrypted"
    );
    Ok(encrypted)
}

/// Whether a received message carries encrypted content.
pub fn is_encrypted(document: &SoapDocument) -> Result<bool, As4Error> {
    Ok(security_header(document)?.is_some_and(|h| h.encrypted_key.is_some()))
}

/// Whether a received message carries a signature.
pub fn is_signed(document: &SoapDocument) -> Result<bool, As4Error> {
    Ok(security_header(document)?.is_some_and(|h| h.signature.is_some()))
}

/// Decrypt body and attachments in place and strip the encryption metadata.
///
/// Returns the decrypted attachments in their original order; a message
/// without an `EncryptedKey` is returned unchanged.
pub fn decrypt(
    document: &mut SoapDocument,
    attachments: &[Attachment],
    keystore: &Keystore,
) -> Result<Vec<Attachment>, As4Error> {
    let mut header = match security_header(document)? {
        Some(header) => header,
        None => return Ok(attachments.to_vec()),
    };
    let key = match header.encrypted_key.take() {
        Some(key) => key,
        None => return Ok(attachments.to_vec()),
    };

    if key.key_wrap_uri != KEY_WRAP_URI {
        return Err(As4Error::security(format!("unsupported key wrap algorithm '{}'", key.key_wrap_uri)));
    }
    if key.agreement_method_uri != KEY_AGREEMENT_URI {
        return Err(As4Error::security(format!(
            "unsupported key agreement algorithm '{}'",
            key.agreement_method_uri
        )));
    }
    if key.key_name != keystore.alias() {
        return Err(As4Error::security(format!(
            "content key is wrapped for '{}', not for '{}'",
            key.key_name,
            keystore.alias()
        )));
    }
    let originator_key: [u8; 32] = decode_cipher(&key.originator_key)?
        .try_into()
        .map_err(|_| As4Error::security("originator key must be 32 bytes"))?;
    let content_key = keystore.unwrap_content_key(&WrappedKey {
        originator_key,
        wrapped: decode_cipher(&key.cipher_value)?,
    })?;

    let body_reference = format!("#{}", BODY_ENCRYPTED_DATA_ID);
    if key.data_references.contains(&body_reference) {
        let element = parse_element(document.body.trim())
            .map_err(|e| As4Error::security(format!("encrypted body unreadable: {}", e)))?;
        let encrypted_body = EncryptedBody::from_element(&element)?;
        let plaintext = algorithm_of(&encrypted_body.algorithm_uri)?
            .decrypt(&content_key, &decode_cipher(&encrypted_body.cipher_value)?)?;
        document.body = String::from_utf8(plaintext)
            .map_err(|_| As4Error::security("decrypted body is not UTF-8"))?;
    }

    let mut decrypted = attachments.to_vec();
    for description in header.encrypted_attachments.drain(..) {
        if !key.data_references.contains(&description.cipher_reference) {
            return Err(As4Error::security(format!(
                "{} is not referenced by the encrypted key",
                description.cipher_reference
            )));
        }
        let slot = decrypted
            .iter_mut()
            .find(|a| a.href() == description.cipher_reference)
            .ok_or_else(|| {
                As4Error::security(format!("encrypted attachment {} is missing", description.cipher_reference))
            })?;
        let plaintext = algorithm_of(&description.algorithm_uri)?.decrypt(&content_key, &slot.read_bytes()?)?;
        *slot = slot.with_content(description.mime_type, plaintext);
    }

    store_security_header(document, &header);
    debug!(recipient = %key.key_name, attachments = decrypted.len(), "Message decrypted");
    Ok(decrypted)
}

fn algorithm_of(uri: &str) -> Result<EncryptAlgorithm, As4Error> {
    EncryptAlgorithm::from_uri(uri)
        .ok_or_else(|| As4Error::security(format!("unsupported encryption algorithm '{}'", uri)))
}

fn decode_cipher(value: &str) -> Result<Vec<u8>, As4Error> {
    BASE64
        .decode(value.as_bytes())
        .map_err(|e| As4Error::security(format!("cipher value is not base64: {}", e)))
}
