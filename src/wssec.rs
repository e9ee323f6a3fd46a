//! WS-Security header model.
//!
//! Covers the subset this crate produces and consumes: one `ds:Signature`
//! with detached references, one `xenc:EncryptedKey` carrying the wrapped
//! content key, and `xenc:EncryptedData` entries for encrypted attachments.

use crate::config::SoapVersion;
use crate::document::XmlElement;
use crate::error::As4Error;

pub const WSSE_NS: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd";
pub const DS_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const XENC_NS: &str = "http://www.w3.org/2001/04/xmlenc#";
pub const EXC_C14N_URI: &str = "http://www.w3.org/2001/10/xml-exc-c14n#";

/// `Type` of encrypted element content.
pub const ENC_TYPE_CONTENT: &str = "http://www.w3.org/2001/04/xmlenc#Content";
/// `Type` of encrypted attachment content.
pub const ENC_TYPE_ATTACHMENT: &str =
    "http://docs.oasis-open.org/wss/oasis-wss-SwAProfile-1.1#Attachment-Content-Only";

/// Id of the encrypted body content.
pub const BODY_ENCRYPTED_DATA_ID: &str = "ed-body";

/// A signature reference with its digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignatureReference {
    /// `#_messaging`, `#_body` or `cid:<content id>`
    pub uri: String,
    pub digest_algorithm_uri: String,
    /// Base64 digest value
    pub digest_value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub signature_method_uri: String,
    pub references: Vec<SignatureReference>,
    /// Base64 signature value
    pub signature_value: String,
    /// Keystore alias of the signer
    pub key_name: String,
}

impl Signature {
    /// The `ds:SignedInfo` element; its canonical bytes are what gets signed.
    pub fn signed_info_element(&self) -> XmlElement {
        let mut signed_info = ds("SignedInfo")
            .with_child(ds("CanonicalizationMethod").with_attr("Algorithm", EXC_C14N_URI))
            .with_child(ds("SignatureMethod").with_attr("Algorithm", self.signature_method_uri.as_str()));
        for reference in &self.references {
            signed_info.push(
                ds("Reference")
                    .with_attr("URI", reference.uri.as_str())
                    .with_child(
                        ds("DigestMethod").with_attr("Algorithm", reference.digest_algorithm_uri.as_str()),
                    )
                    .with_child(ds("DigestValue").with_text(reference.digest_value.as_str())),
            );
        }
        signed_info
    }

    fn to_element(&self) -> XmlElement {
        ds("Signature")
            .with_attr("xmlns:ds", DS_NS)
            .with_child(self.signed_info_element())
            .with_child(ds("SignatureValue").with_text(self.signature_value.as_str()))
            .with_child(key_info(&self.key_name))
    }

    fn from_element(element: &XmlElement) -> Result<(Self, XmlElement), As4Error> {
        let signed_info = element
            .child("SignedInfo")
            .ok_or_else(|| As4Error::security("Signature without SignedInfo"))?;
        let signature_method_uri = algorithm_of(signed_info, "SignatureMethod")?;

        let references = signed_info
            .children_named("Reference")
            .map(|r| {
                Ok(SignatureReference {
                    uri: r
                        .attr("URI")
                        .ok_or_else(|| As4Error::security("Reference without URI"))?
                        .to_string(),
                    digest_algorithm_uri: algorithm_of(r, "DigestMethod")?,
                    digest_value: r
                        .child("DigestValue")
                        .map(|d| d.text_trimmed().to_string())
                        .ok_or_else(|| As4Error::security("Reference without DigestValue"))?,
                })
            })
            .collect::<Result<Vec<_>, As4Error>>()?;

        let signature_value = element
            .child("SignatureValue")
            .map(|v| v.text_trimmed().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| As4Error::security("Signature without SignatureValue"))?;

        Ok((
            Self {
                signature_method_uri,
                references,
                signature_value,
                key_name: key_name_of(element)?,
            },
            signed_info.clone(),
        ))
    }
}

/// The wrapped content-encryption key and what it protects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedKey {
    pub key_wrap_uri: String,
    pub agreement_method_uri: String,
    /// Base64 ephemeral public key of the sender
    pub originator_key: String,
    /// Keystore alias of the recipient whose key wraps the content key
    pub key_name: String,
    /// Base64 wrapped key
    pub cipher_value: String,
    /// `#ed-body` and/or `cid:<content id>` references
    pub data_references: Vec<String>,
}

impl EncryptedKey {
    fn to_element(&self) -> XmlElement {
        let mut reference_list = xenc("ReferenceList");
        for uri in &self.data_references {
            reference_list.push(xenc("DataReference").with_attr("URI", uri.as_str()));
        }
        let agreement = xenc("AgreementMethod")
            .with_attr("Algorithm", self.agreement_method_uri.as_str())
            .with_child(
                xenc("OriginatorKeyInfo").with_child(ds("KeyValue").with_text(self.originator_key.as_str())),
            );
        xenc("EncryptedKey")
            .with_attr("xmlns:xenc", XENC_NS)
            .with_attr("xmlns:ds", DS_NS)
            .with_child(xenc("EncryptionMethod").with_attr("Algorithm", self.key_wrap_uri.as_str()))
            .with_child(key_info(&self.key_name).with_child(agreement))
            .with_child(xenc("CipherData").with_child(xenc("CipherValue").with_text(self.cipher_value.as_str())))
            .with_child(reference_list)
    }

    fn from_element(element: &XmlElement) -> Result<Self, As4Error> {
        let agreement = element
            .child("KeyInfo")
            .and_then(|k| k.child("AgreementMethod"))
            .ok_or_else(|| As4Error::security("EncryptedKey without KeyInfo/AgreementMethod"))?;
        let originator_key = agreement
            .child("OriginatorKeyInfo")
            .and_then(|o| o.child("KeyValue"))
            .map(|v| v.text_trimmed().to_string())
            .filter(|v| !v.is_empty())
            .ok_or_else(|| As4Error::security("AgreementMethod without OriginatorKeyInfo/KeyValue"))?;
        Ok(Self {
            key_wrap_uri: algorithm_of(element, "EncryptionMethod")?,
            agreement_method_uri: agreement
                .attr("Algorithm")
                .map(str::to_string)
                .ok_or_else(|| As4Error::security("AgreementMethod without Algorithm"))?,
            originator_key,
            key_name: key_name_of(element)?,
            cipher_value: cipher_value_of(element)?,
            data_references: element
                .child("ReferenceList")
                .map(|list| {
                    list.children_named("DataReference")
                        .filter_map(|r| r.attr("URI").map(str::to_string))
                        .collect()
                })
                .unwrap_or_default(),
        })
    }
}

/// Description of an attachment encrypted in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedAttachment {
    pub id: String,
    pub algorithm_uri: String,
    /// MIME type of the plaintext
    pub mime_type: String,
    /// `cid:<content id>` of the MIME part holding the ciphertext
    pub cipher_reference: String,
}

impl EncryptedAttachment {
    fn to_element(&self) -> XmlElement {
        xenc("EncryptedData")
            .with_attr("xmlns:xenc", XENC_NS)
            .with_attr("Id", self.id.as_str())
            .with_attr("Type", ENC_TYPE_ATTACHMENT)
            .with_attr("MimeType", self.mime_type.as_str())
            .with_child(xenc("EncryptionMethod").with_attr("Algorithm", self.algorithm_uri.as_str()))
            .with_child(
                xenc("CipherData")
                    .with_child(xenc("CipherReference").with_attr("URI", self.cipher_reference.as_str())),
            )
    }

    fn from_element(element: &XmlElement) -> Result<Self, As4Error> {
        Ok(Self {
            id: element.attr("Id").unwrap_or_default().to_string(),
            algorithm_uri: algorithm_of(element, "EncryptionMethod")?,
            mime_type: element
                .attr("MimeType")
                .unwrap_or("application/octet-stream")
                .to_string(),
            cipher_reference: element
                .child("CipherData")
                .and_then(|c| c.child("CipherReference"))
                .and_then(|r| r.attr("URI"))
                .ok_or_else(|| As4Error::security("EncryptedData without CipherReference"))?
                .to_string(),
        })
    }
}

/// The `xenc:EncryptedData` element replacing encrypted body content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedBody {
    pub algorithm_uri: String,
    /// Base64 `nonce || ciphertext`
    pub cipher_value: String,
}

impl EncryptedBody {
    pub fn to_element(&self) -> XmlElement {
        xenc("EncryptedData")
            .with_attr("xmlns:xenc", XENC_NS)
            .with_attr("Id", BODY_ENCRYPTED_DATA_ID)
            .with_attr("Type", ENC_TYPE_CONTENT)
            .with_child(xenc("EncryptionMethod").with_attr("Algorithm", self.algorithm_uri.as_str()))
            .with_child(xenc("CipherData").with_child(xenc("CipherValue").with_text(self.cipher_value.as_str())))
    }

    pub fn from_element(element: &XmlElement) -> Result<Self, As4Error> {
        if element.local_name != "EncryptedData" || element.attr("Id") != Some(BODY_ENCRYPTED_DATA_ID) {
            return Err(As4Error::security("body does not hold the referenced EncryptedData"));
        }
        Ok(Self {
            algorithm_uri: algorithm_of(element, "EncryptionMethod")?,
            cipher_value: cipher_value_of(element)?,
        })
    }
}

/// The `wsse:Security` header block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SecurityHeader {
    pub must_understand: bool,
    pub encrypted_key: Option<EncryptedKey>,
    pub encrypted_attachments: Vec<EncryptedAttachment>,
    pub signature: Option<Signature>,
    /// `ds:SignedInfo` exactly as received, used for verification
    pub received_signed_info: Option<XmlElement>,
}

impl SecurityHeader {
    pub fn new(must_understand: bool) -> Self {
        Self {
            must_understand,
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.encrypted_key.is_none() && self.encrypted_attachments.is_empty() && self.signature.is_none()
    }

    pub fn to_element(&self, version: SoapVersion) -> XmlElement {
        let mut security = XmlElement::new("wsse", "Security", WSSE_NS)
            .with_attr("xmlns:wsse", WSSE_NS)
            .with_attr(
                &format!("{}:mustUnderstand", version.prefix()),
                version.must_understand_value(self.must_understand),
            );
        if let Some(ref key) = self.encrypted_key {
            security.push(key.to_element());
        }
        for attachment in &self.encrypted_attachments {
            security.push(attachment.to_element());
        }
        if let Some(ref signature) = self.signature {
            security.push(signature.to_element());
        }
        security
    }

    pub fn from_element(element: &XmlElement) -> Result<Self, As4Error> {
        if element.namespace.as_deref() != Some(WSSE_NS) {
            return Err(As4Error::security("Security header in unexpected namespace"));
        }

        let must_understand = matches!(element.attr("mustUnderstand"), Some("1") | Some("true"));

        let encrypted_key = element
            .child("EncryptedKey")
            .map(EncryptedKey::from_element)
            .transpose()?;
        let encrypted_attachments = element
            .children_named("EncryptedData")
            .map(EncryptedAttachment::from_element)
            .collect::<Result<Vec<_>, _>>()?;
        let (signature, received_signed_info) = match element.child("Signature") {
            Some(s) => {
                let (signature, signed_info) = Signature::from_element(s)?;
                (Some(signature), Some(signed_info))
            }
            None => (None, None),
        };

        Ok(Self {
            must_understand,
            encrypted_key,
            encrypted_attachments,
            signature,
            received_signed_info,
        })
    }
}

fn ds(local_name: &str) -> XmlElement {
    XmlElement::new("ds", local_name, DS_NS)
}

fn xenc(local_name: &str) -> XmlElement {
    XmlElement::new("xenc", local_name, XENC_NS)
}

fn key_info(key_name: &str) -> XmlElement {
    ds("KeyInfo").with_child(ds("KeyName").with_text(key_name))
}

fn algorithm_of(parent: &XmlElement, child: &str) -> Result<String, As4Error> {
    parent
        .child(child)
        .and_then(|c| c.attr("Algorithm"))
        .map(str::to_string)
        .ok_or_else(|| As4Error::security(format!("{} without {} algorithm", parent.local_name, child)))
}

fn key_name_of(parent: &XmlElement) -> Result<String, As4Error> {
    parent
        .child("KeyInfo")
        .and_then(|k| k.child("KeyName"))
        .map(|n| n.text_trimmed().to_string())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| As4Error::security(format!("{} without KeyInfo/KeyName", parent.local_name)))
}

fn cipher_value_of(parent: &XmlElement) -> Result<String, As4Error> {
    parent
        .child("CipherData")
        .and_then(|c| c.child("CipherValue"))
        .map(|v| v.text_trimmed().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| As4Error::security(format!("{} without CipherValue", parent.local_name)))
}
