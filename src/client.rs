//! Outbound AS4 client.
//!
//! One client builds and sends one message. The attachment store's
//! temporary resources are released when the send completes, fails, or
//! the client is dropped.

use crate::attachment::{Attachment, AttachmentStore, CompressionMode};
use crate::config::{As4Config, SoapVersion};
use crate::document::SoapDocument;
use crate::envelope::UserMessageBuilder;
use crate::error::As4Error;
use crate::mime::{self, MimeMessage};
use crate::pmode::PModeConfig;
use crate::security::{self, SecurityParameters};
use std::path::Path;
use tracing::{debug, info, warn};

/// What is handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportUnit {
    /// A plain SOAP envelope
    Xml { version: SoapVersion, xml: String },
    /// A multipart/related package
    Mime(MimeMessage),
}

impl TransportUnit {
    pub fn content_type(&self) -> String {
        match self {
            Self::Xml { version, .. } => format!("{}; charset=UTF-8", version.mime_type()),
            Self::Mime(message) => message.content_type(),
        }
    }

    pub fn http_headers(&self) -> Vec<(String, String)> {
        match self {
            Self::Xml { .. } => vec![("Content-Type".to_string(), self.content_type())],
            Self::Mime(message) => message.http_headers(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Self::Xml { xml, .. } => xml.as_bytes().to_vec(),
            Self::Mime(message) => message.to_bytes(),
        }
    }

    pub fn is_mime(&self) -> bool {
        matches!(self, Self::Mime(_))
    }
}

/// How an added attachment is compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AttachmentCompression {
    /// Use the compression mode of the applied PMode, if any
    #[default]
    PModeDefault,
    /// Send as is, even when the PMode asks for compression
    Uncompressed,
    Compressed(CompressionMode),
}

impl AttachmentCompression {
    fn resolve(self, default: Option<CompressionMode>) -> Option<CompressionMode> {
        match self {
            Self::PModeDefault => default,
            Self::Uncompressed => None,
            Self::Compressed(mode) => Some(mode),
        }
    }
}

/// A response returned by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportResponse {
    pub content_type: String,
    pub body: Vec<u8>,
}

/// Delivers transport units. Implementations own all network I/O.
pub trait Transport {
    fn send(&self, url: &str, unit: &TransportUnit) -> Result<TransportResponse, As4Error>;
}

/// A fully built outbound message.
#[derive(Debug, Clone)]
pub struct BuiltMessage {
    pub message_id: String,
    pub unit: TransportUnit,
}

/// Builds, secures and sends one user message.
#[derive(Debug)]
pub struct As4Client {
    builder: UserMessageBuilder,
    soap_version: SoapVersion,
    payload: Option<String>,
    attachments: AttachmentStore,
    security: SecurityParameters,
    /// Compression applied to attachments added without an explicit mode
    default_compression: Option<CompressionMode>,
}

impl Default for As4Client {
    fn default() -> Self {
        Self::new()
    }
}

impl As4Client {
    pub fn new() -> Self {
        Self {
            builder: UserMessageBuilder::new(),
            soap_version: SoapVersion::default(),
            payload: None,
            attachments: AttachmentStore::new(),
            security: SecurityParameters::default(),
            default_compression: None,
        }
    }

    /// Client preset with the configured SOAP version, id prefix and crypto defaults.
    pub fn from_config(config: &As4Config) -> Self {
        let mut client = Self::new();
        client.soap_version = config.settings.soap_version;
        client.builder.message_id_prefix = config.settings.message_id_prefix.clone();
        client.security = SecurityParameters::from_config(&config.crypto);
        client
    }

    pub fn builder(&self) -> &UserMessageBuilder {
        &self.builder
    }

    pub fn builder_mut(&mut self) -> &mut UserMessageBuilder {
        &mut self.builder
    }

    pub fn set_builder(&mut self, builder: UserMessageBuilder) {
        self.builder = builder;
    }

    pub fn soap_version(&self) -> SoapVersion {
        self.soap_version
    }

    pub fn set_soap_version(&mut self, version: SoapVersion) {
        self.soap_version = version;
    }

    /// Body payload, carried verbatim.
    pub fn set_payload(&mut self, payload: impl Into<String>) {
        self.payload = Some(payload.into());
    }

    pub fn security(&self) -> &SecurityParameters {
        &self.security
    }

    pub fn security_mut(&mut self) -> &mut SecurityParameters {
        &mut self.security
    }

    pub fn add_attachment_file(
        &mut self,
        path: impl AsRef<Path>,
        mime_type: &str,
        compression: AttachmentCompression,
    ) -> Result<Attachment, As4Error> {
        let mode = compression.resolve(self.default_compression);
        self.attachments.add_outgoing_file(path, mime_type, mode)
    }

    pub fn add_attachment_bytes(
        &mut self,
        bytes: &[u8],
        mime_type: &str,
        compression: AttachmentCompression,
    ) -> Result<Attachment, As4Error> {
        let mode = compression.resolve(self.default_compression);
        self.attachments.add_outgoing_bytes(bytes, mime_type, mode)
    }

    pub fn attachments(&self) -> &[Attachment] {
        self.attachments.attachments()
    }

    /// Take service, action, agreement, parties and leg-1 policy from a PMode.
    ///
    /// Fields the PMode leaves open keep their current values.
    pub fn apply_pmode(&mut self, pmode: &PModeConfig) {
        let agreement = pmode
            .agreement
            .clone()
            .unwrap_or_else(|| self.builder.agreement_ref_value.clone());
        self.builder.agreement_ref_value = agreement;
        self.builder.agreement_ref_pmode = pmode.id.clone();

        if let Some(ref initiator) = pmode.initiator {
            self.builder.from_role = initiator.role.clone();
            if let Some(id) = initiator.primary_id() {
                self.builder.from_party_id = id.to_string();
            }
        }
        if let Some(ref responder) = pmode.responder {
            self.builder.to_role = responder.role.clone();
            if let Some(id) = responder.primary_id() {
                self.builder.to_party_id = id.to_string();
            }
        }

        if let Some(ref leg) = pmode.leg1 {
            self.soap_version = leg.protocol.soap_version;
            if let Some(ref info) = leg.business_info {
                if let Some(ref service) = info.service {
                    self.builder.service_value = service.clone();
                }
                if let Some(ref action) = info.action {
                    self.builder.action = action.clone();
                }
                if info.mpc_id.is_some() {
                    self.builder.mpc = info.mpc_id.clone();
                }
            }
            if let Some(ref security) = leg.security {
                self.security.sign_algorithm = security.sign_algorithm;
                self.security.sign_digest_algorithm = security.sign_digest_algorithm;
                self.security.encrypt_algorithm = security.encrypt_algorithm;
            }
            if let Some(ref payload_service) = leg.payload_service {
                self.default_compression = payload_service.compression_mode;
            }
        }

        debug!(pmode_id = %pmode.id, "PMode applied to client");
    }

    /// Run the outbound pipeline: build, sign, encrypt, package.
    pub fn build_message(&self) -> Result<BuiltMessage, As4Error> {
        self.builder.check_mandatory()?;

        let signing = self.security.signing()?;
        let encryption = match self.security.encrypt_algorithm {
            Some(algorithm) => {
                let recipient = self
                    .security
                    .recipient_alias
                    .as_deref()
                    .filter(|a| !a.trim().is_empty())
                    .ok_or_else(|| As4Error::precondition("encryption requested but no recipient alias set"))?;
                Some((algorithm, recipient))
            }
            None => None,
        };
        let keystore = self.security.open_keystore()?;

        let mut attachments = self.attachments.attachments().to_vec();
        let mut document = self
            .builder
            .build(self.soap_version, self.payload.as_deref(), &attachments)?;
        let message_id = message_id_of(&document)?;

        if let (Some((sign_alg, digest_alg)), Some(keystore)) = (signing, keystore.as_ref()) {
            security::sign(&mut document, &attachments, sign_alg, digest_alg, keystore)?;
        }
        if let (Some((algorithm, recipient)), Some(keystore)) = (encryption, keystore.as_ref()) {
            attachments = security::encrypt(&mut document, &attachments, algorithm, keystore, recipient)?;
        }

        let unit = if attachments.is_empty() {
            TransportUnit::Xml {
                version: document.version,
                xml: document.to_xml(),
            }
        } else {
            TransportUnit::Mime(mime::pack(&document, &attachments)?)
        };

        info!(
            message_id = %message_id,
            signed = signing.is_some(),
            encrypted = encryption.is_some(),
            attachments = attachments.len(),
            mime = unit.is_mime(),
            "AS4 message built"
        );
        Ok(BuiltMessage { message_id, unit })
    }

    /// Build and hand the message to `transport`.
    ///
    /// Temporary attachment resources are released on every outcome.
    pub fn send_message(&mut self, url: &str, transport: &dyn Transport) -> Result<TransportResponse, As4Error> {
        let result = self
            .build_message()
            .and_then(|built| transport.send(url, &built.unit).map(|r| (built.message_id, r)));
        self.attachments.close();

        match result {
            Ok((message_id, response)) => {
                debug!(message_id = %message_id, url = %url, bytes = response.body.len(), "AS4 message sent");
                Ok(response)
            }
            Err(e) => {
                warn!(url = %url, error = %e, "AS4 message not sent");
                Err(e)
            }
        }
    }
}

fn message_id_of(document: &SoapDocument) -> Result<String, As4Error> {
    document
        .header("Messaging")
        .and_then(|m| m.child("UserMessage"))
        .and_then(|u| u.child("MessageInfo"))
        .and_then(|i| i.child("MessageId"))
        .map(|id| id.text_trimmed().to_string())
        .ok_or_else(|| As4Error::malformed("built message has no MessageId"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KeystoreConfig;
    use crate::crypto::{DigestAlgorithm, EncryptAlgorithm, KeystoreFile, SignAlgorithm};
    use crate::model::Party;
    use crate::parser::parse_soap_document;
    use crate::pmode::{PModeLeg, PModeLegBusinessInfo, PModeLegSecurity, PModePayloadService};
    use std::cell::RefCell;

    fn client() -> As4Client {
        let mut client = As4Client::new();
        client.set_builder(
            UserMessageBuilder::new()
                .action("Deliver")
                .service("urn:type", "urn:svc")
                .conversation_id("conv")
                .agreement_ref("urn:agr", "pm-1")
                .from_party("urn:seller", "seller-1")
                .to_party("urn:buyer", "buyer-1")
                .property("originalSender", "seller-1"),
        );
        client
    }

    fn keystore_config(dir: &Path) -> KeystoreConfig {
        let mut file = KeystoreFile::default();
        file.add_generated_entry("sender", "pw");
        let mut partner = KeystoreFile::default();
        partner.add_generated_entry("receiver", "pw2");
        file.entries
            .insert("receiver".to_string(), partner.public_entry("receiver").unwrap());
        let path = dir.join("sender.yaml");
        file.write(&path).unwrap();
        KeystoreConfig {
            path,
            keystore_type: "yaml".to_string(),
            alias: "sender".to_string(),
            password: "pw".to_string(),
        }
    }

    struct RecordingTransport {
        sent: RefCell<Vec<(String, bool)>>,
        fail: bool,
    }

    impl Transport for RecordingTransport {
        fn send(&self, url: &str, unit: &TransportUnit) -> Result<TransportResponse, As4Error> {
            self.sent.borrow_mut().push((url.to_string(), unit.is_mime()));
            if self.fail {
                return Err(As4Error::Transport("connection refused".to_string()));
            }
            Ok(TransportResponse {
                content_type: "application/soap+xml".to_string(),
                body: b"<ok/>".to_vec(),
            })
        }
    }

    #[test]
    fn test_plain_message_without_attachments() {
        let mut client = client();
        client.set_payload("<p:Order xmlns:p=\"urn:p\"/>");
        let built = client.build_message().unwrap();
        match built.unit {
            TransportUnit::Xml { ref xml, .. } => {
                let doc = parse_soap_document(xml.as_bytes()).unwrap();
                assert_eq!(doc.body, "<p:Order xmlns:p=\"urn:p\"/>");
            }
            TransportUnit::Mime(_) => panic!("expected plain XML"),
        }
    }

    #[test]
    fn test_attachments_yield_mime_without_security() {
        let mut client = client();
        client
            .add_attachment_bytes(b"<a/>", "application/xml", AttachmentCompression::PModeDefault)
            .unwrap();
        let built = client.build_message().unwrap();
        assert!(built.unit.is_mime());
        assert!(built.unit.content_type().starts_with("multipart/related"));
    }

    #[test]
    fn test_missing_mandatory_field_is_precondition() {
        let mut client = client();
        client.builder_mut().conversation_id.clear();
        assert!(matches!(client.build_message(), Err(As4Error::Precondition(_))));
    }

    #[test]
    fn test_missing_keystore_is_precondition() {
        let mut client = client();
        client.security_mut().sign_algorithm = Some(SignAlgorithm::Ed25519);
        client.security_mut().sign_digest_algorithm = Some(DigestAlgorithm::Sha256);
        client.security_mut().keystore = Some(KeystoreConfig {
            path: "/does/not/exist.yaml".into(),
            keystore_type: "yaml".to_string(),
            alias: "sender".to_string(),
            password: "pw".to_string(),
        });
        assert!(matches!(client.build_message(), Err(As4Error::Precondition(_))));
    }

    #[test]
    fn test_encryption_requires_recipient() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = client();
        client.security_mut().encrypt_algorithm = Some(EncryptAlgorithm::Aes128Gcm);
        client.security_mut().keystore = Some(keystore_config(dir.path()));
        assert!(matches!(client.build_message(), Err(As4Error::Precondition(_))));
    }

    #[test]
    fn test_signed_and_encrypted_message() {
        let dir = tempfile::tempdir().unwrap();
        let mut client = client();
        client
            .add_attachment_bytes(b"<a/>", "application/xml", AttachmentCompression::PModeDefault)
            .unwrap();
        {
            let security = client.security_mut();
            security.sign_algorithm = Some(SignAlgorithm::Ed25519);
            security.sign_digest_algorithm = Some(DigestAlgorithm::Sha256);
            security.encrypt_algorithm = Some(EncryptAlgorithm::Aes128Gcm);
            security.keystore = Some(keystore_config(dir.path()));
            security.recipient_alias = Some("receiver".to_string());
        }
        let built = client.build_message().unwrap();
        let TransportUnit::Mime(message) = built.unit else {
            panic!("expected MIME package");
        };
        let root = String::from_utf8(message.parts[0].body.clone()).unwrap();
        assert!(root.contains("Signature"));
        assert!(root.contains("EncryptedKey"));
        assert_eq!(message.parts[1].header("Content-Type"), Some("application/octet-stream"));
    }

    #[test]
    fn test_send_releases_resources_on_failure() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("invoice.xml");
        std::fs::write(&source, b"<invoice/>").unwrap();

        let mut client = client();
        client
            .add_attachment_file(
                &source,
                "application/xml",
                AttachmentCompression::Compressed(CompressionMode::Gzip),
            )
            .unwrap();
        let spooled = match client.attachments()[0].source() {
            crate::attachment::ByteSource::File(path) => path.clone(),
            _ => panic!("expected spooled file"),
        };
        assert!(spooled.exists());

        let transport = RecordingTransport {
            sent: RefCell::new(Vec::new()),
            fail: true,
        };
        assert!(client.send_message("http://partner/as4", &transport).is_err());
        assert!(!spooled.exists());
        assert_eq!(transport.sent.borrow().len(), 1);
        assert!(transport.sent.borrow()[0].1);
    }

    #[test]
    fn test_send_success() {
        let mut client = client();
        let transport = RecordingTransport {
            sent: RefCell::new(Vec::new()),
            fail: false,
        };
        let response = client.send_message("http://partner/as4", &transport).unwrap();
        assert_eq!(response.body, b"<ok/>");
        assert_eq!(transport.sent.borrow()[0].0, "http://partner/as4");
    }

    #[test]
    fn test_apply_pmode() {
        let mut pmode = PModeConfig::default_pmode();
        pmode.id = "pm-orders".to_string();
        pmode.agreement = Some("urn:agreement:orders".to_string());
        pmode.initiator = Some(Party::new("urn:role:initiator", "init-1"));
        pmode.leg1 = Some(PModeLeg {
            business_info: Some(PModeLegBusinessInfo {
                service: Some("urn:svc:orders".to_string()),
                action: Some("Submit".to_string()),
                mpc_id: Some("urn:mpc:orders".to_string()),
            }),
            security: Some(PModeLegSecurity {
                sign_algorithm: Some(SignAlgorithm::Ed25519),
                sign_digest_algorithm: Some(DigestAlgorithm::Sha512),
                ..Default::default()
            }),
            payload_service: Some(PModePayloadService {
                compression_mode: Some(CompressionMode::Gzip),
            }),
            ..Default::default()
        });

        let mut client = client();
        client.apply_pmode(&pmode);
        let builder = client.builder();
        assert_eq!(builder.agreement_ref_pmode, "pm-orders");
        assert_eq!(builder.agreement_ref_value, "urn:agreement:orders");
        assert_eq!(builder.service_value, "urn:svc:orders");
        assert_eq!(builder.action, "Submit");
        assert_eq!(builder.mpc.as_deref(), Some("urn:mpc:orders"));
        assert_eq!(builder.from_party_id, "init-1");
        assert_eq!(builder.to_party_id, "buyer-1");
        assert_eq!(client.security().sign_digest_algorithm, Some(DigestAlgorithm::Sha512));

        let attachment = client
            .add_attachment_bytes(b"data", "text/plain", AttachmentCompression::PModeDefault)
            .unwrap();
        assert_eq!(attachment.compression(), Some(CompressionMode::Gzip));
    }

    #[test]
    fn test_attachment_can_opt_out_of_pmode_compression() {
        let mut pmode = PModeConfig::default_pmode();
        pmode.id = "pm-orders".to_string();
        pmode.leg1 = Some(PModeLeg {
            payload_service: Some(PModePayloadService {
                compression_mode: Some(CompressionMode::Gzip),
            }),
            ..Default::default()
        });
        let mut client = client();
        client.apply_pmode(&pmode);

        let jpeg = client
            .add_attachment_bytes(b"\xff\xd8\xff\xe0", "image/jpeg", AttachmentCompression::Uncompressed)
            .unwrap();
        assert_eq!(jpeg.compression(), None);
        assert_eq!(jpeg.read_bytes().unwrap(), b"\xff\xd8\xff\xe0");

        let csv = client
            .add_attachment_bytes(b"a;b\n", "text/csv", AttachmentCompression::PModeDefault)
            .unwrap();
        assert_eq!(csv.compression(), Some(CompressionMode::Gzip));

        let built = client.build_message().unwrap();
        let TransportUnit::Mime(message) = built.unit else {
            panic!("expected MIME package");
        };
        let root = String::from_utf8(message.parts[0].body.clone()).unwrap();
        assert_eq!(root.matches("CompressionType").count(), 1);
        assert_eq!(message.parts[1].body, b"\xff\xd8\xff\xe0");
    }
}
