//! Integration tests for the as4-envelope crate.
//!
//! These tests exercise the public API surface end-to-end: a client builds,
//! secures and packages a message, a loopback transport hands it to a
//! receiver, and the receiver answers with a signal.

use as4_envelope::attachment::{Attachment, CompressionMode};
use as4_envelope::client::{As4Client, AttachmentCompression, Transport, TransportResponse, TransportUnit};
use as4_envelope::config::{As4Config, KeystoreConfig, SoapVersion};
use as4_envelope::crypto::{DigestAlgorithm, EncryptAlgorithm, Keystore, KeystoreFile, SignAlgorithm};
use as4_envelope::document::SoapDocument;
use as4_envelope::envelope::UserMessageBuilder;
use as4_envelope::error::{As4Error, EbmsErrorCode, Locale};
use as4_envelope::model::{Messaging, Property, UserMessage};
use as4_envelope::mpc::{MpcRegistry, DEFAULT_MPC_ID};
use as4_envelope::parser::parse_soap_document;
use as4_envelope::pmode::{
    Mep, MepBinding, PModeConfig, PModeLeg, PModeLegBusinessInfo, PModeLegSecurity, PModePayloadService,
    PModeRegistry,
};
use as4_envelope::processor::InboundHeaderProcessor;
use as4_envelope::receiver::{As4Receiver, MessageProcessor, ProcessingOutcome, ResponseKind};
use as4_envelope::security;
use as4_envelope::signal::{parse_signal_response, receipt_response, SignalKind};
use proptest::prelude::*;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// Helpers
// ============================================================================

#[derive(Debug, Clone)]
struct Delivered {
    message_id: String,
    payload: Option<String>,
    attachments: Vec<(String, Vec<u8>)>,
}

/// Business processor recording what reached it.
#[derive(Clone, Default)]
struct Inbox(Arc<Mutex<Vec<Delivered>>>);

impl Inbox {
    fn delivered(&self) -> Vec<Delivered> {
        self.0.lock().unwrap().clone()
    }
}

impl MessageProcessor for Inbox {
    fn process(
        &self,
        user_message: Option<&UserMessage>,
        payload: Option<&str>,
        attachments: &[Attachment],
    ) -> ProcessingOutcome {
        self.0.lock().unwrap().push(Delivered {
            message_id: user_message.map(|u| u.message_id().to_string()).unwrap_or_default(),
            payload: payload.map(str::to_string),
            attachments: attachments
                .iter()
                .map(|a| (a.mime_type().to_string(), a.read_bytes().unwrap()))
                .collect(),
        });
        ProcessingOutcome::Accepted
    }
}

/// Transport handing every unit straight to an in-process receiver.
struct Loopback<'a> {
    receiver: &'a As4Receiver,
}

impl Transport for Loopback<'_> {
    fn send(&self, _url: &str, unit: &TransportUnit) -> Result<TransportResponse, As4Error> {
        let response = self.receiver.receive(Some(&unit.content_type()), &unit.to_bytes());
        Ok(TransportResponse {
            content_type: response.content_type,
            body: response.body.into_bytes(),
        })
    }
}

fn leg(security: Option<PModeLegSecurity>, compression: Option<CompressionMode>) -> PModeLeg {
    PModeLeg {
        business_info: Some(PModeLegBusinessInfo {
            service: Some("urn:svc:invoicing".to_string()),
            action: Some("Deliver".to_string()),
            mpc_id: None,
        }),
        security,
        payload_service: compression.map(|mode| PModePayloadService {
            compression_mode: Some(mode),
        }),
        ..Default::default()
    }
}

fn pmode(leg1: PModeLeg) -> PModeConfig {
    PModeConfig {
        id: "invoice-push".to_string(),
        agreement: Some("urn:agreement:invoices".to_string()),
        mep: Some(Mep::OneWay),
        mep_binding: Some(MepBinding::Push),
        leg1: Some(leg1),
        ..Default::default()
    }
}

fn signed_and_encrypted() -> PModeLegSecurity {
    PModeLegSecurity {
        sign_algorithm: Some(SignAlgorithm::Ed25519),
        sign_digest_algorithm: Some(DigestAlgorithm::Sha256),
        encrypt_algorithm: Some(EncryptAlgorithm::Aes128Gcm),
        send_receipt: true,
    }
}

fn builder() -> UserMessageBuilder {
    UserMessageBuilder::new()
        .action("Deliver")
        .service("urn:svc-type", "urn:svc:invoicing")
        .conversation_id("conv-42")
        .agreement_ref("urn:agreement:invoices", "invoice-push")
        .from_party("urn:role:seller", "seller-1")
        .to_party("urn:role:buyer", "buyer-1")
        .property("originalSender", "urn:sender:1")
}

/// Write partner keystores that trust each other.
fn keystores(dir: &Path) -> (KeystoreConfig, KeystoreConfig) {
    let mut sender = KeystoreFile::default();
    sender.add_generated_entry("sender", "sender-pw");
    let mut receiver = KeystoreFile::default();
    receiver.add_generated_entry("receiver", "receiver-pw");

    let sender_public = sender.public_entry("sender").unwrap();
    let receiver_public = receiver.public_entry("receiver").unwrap();
    sender.entries.insert("receiver".to_string(), receiver_public);
    receiver.entries.insert("sender".to_string(), sender_public);

    let sender_path = dir.join("sender.yaml");
    let receiver_path = dir.join("receiver.yaml");
    sender.write(&sender_path).unwrap();
    receiver.write(&receiver_path).unwrap();

    (
        KeystoreConfig {
            path: sender_path,
            keystore_type: "yaml".to_string(),
            alias: "sender".to_string(),
            password: "sender-pw".to_string(),
        },
        KeystoreConfig {
            path: receiver_path,
            keystore_type: "yaml".to_string(),
            alias: "receiver".to_string(),
            password: "receiver-pw".to_string(),
        },
    )
}

fn receiver_for(pmode: PModeConfig, keystore: Option<KeystoreConfig>, inbox: Inbox) -> As4Receiver {
    let mut config = As4Config {
        pmodes: vec![pmode],
        ..Default::default()
    };
    config.crypto.keystore = keystore;
    As4Receiver::from_config(&config, Box::new(inbox)).unwrap()
}

fn client_for(pmode: &PModeConfig) -> As4Client {
    let mut client = As4Client::new();
    client.set_builder(builder());
    client.apply_pmode(pmode);
    client
}

fn mpcs() -> MpcRegistry {
    MpcRegistry::with_default()
}

fn registry(pmode: PModeConfig) -> PModeRegistry {
    let registry = PModeRegistry::new();
    registry.create(pmode).unwrap();
    registry
}

fn attachment(id: &str) -> Attachment {
    Attachment::from_bytes(id, "application/xml", b"<line/>".to_vec())
}

fn edit_user_message(doc: &mut SoapDocument, edit: impl FnOnce(&mut UserMessage)) {
    let mut messaging = Messaging::from_element(doc.header("Messaging").unwrap()).unwrap();
    edit(&mut messaging.user_messages[0]);
    doc.set_header(messaging.to_element(doc.version));
}

// ============================================================================
// End-to-end exchanges
// ============================================================================

#[test]
fn test_plain_exchange_returns_receipt() {
    init_tracing();
    let pmode = pmode(leg(None, None));
    let inbox = Inbox::default();
    let receiver = receiver_for(pmode.clone(), None, inbox.clone());

    let mut client = client_for(&pmode);
    client.set_payload(r#"<inv:Invoice xmlns:inv="urn:inv"><inv:Total>10.00</inv:Total></inv:Invoice>"#);
    let response = client
        .send_message("https://buyer.example/as4", &Loopback { receiver: &receiver })
        .unwrap();

    let delivered = inbox.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(
        delivered[0].payload.as_deref(),
        Some(r#"<inv:Invoice xmlns:inv="urn:inv"><inv:Total>10.00</inv:Total></inv:Invoice>"#)
    );

    let signal = parse_signal_response(&response.body).unwrap();
    assert_eq!(signal.kind, SignalKind::Receipt { non_repudiation: false });
    assert_eq!(signal.ref_to_message_id.as_deref(), Some(delivered[0].message_id.as_str()));
    assert_eq!(receiver.requests_processed(), 1);
    assert_eq!(receiver.requests_rejected(), 0);
}

#[test]
fn test_signed_and_encrypted_exchange_with_attachment() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (sender_keystore, receiver_keystore) = keystores(dir.path());
    let pmode = pmode(leg(Some(signed_and_encrypted()), None));
    let inbox = Inbox::default();
    let receiver = receiver_for(pmode.clone(), Some(receiver_keystore), inbox.clone());

    let mut client = client_for(&pmode);
    client.security_mut().keystore = Some(sender_keystore);
    client.security_mut().recipient_alias = Some("receiver".to_string());
    client.set_payload(r#"<inv:Invoice xmlns:inv="urn:inv"/>"#);
    client
        .add_attachment_bytes(
            b"<inv:Line>widget</inv:Line>",
            "application/xml",
            AttachmentCompression::PModeDefault,
        )
        .unwrap();

    let built = client.build_message().unwrap();
    assert!(built.unit.is_mime());
    let wire = String::from_utf8_lossy(&built.unit.to_bytes()).to_string();
    assert!(!wire.contains("widget"));

    let response = client
        .send_message("https://buyer.example/as4", &Loopback { receiver: &receiver })
        .unwrap();

    let signal = parse_signal_response(&response.body).unwrap();
    assert_eq!(signal.kind, SignalKind::Receipt { non_repudiation: true });

    let delivered = inbox.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].payload.as_deref(), Some(r#"<inv:Invoice xmlns:inv="urn:inv"/>"#));
    assert_eq!(
        delivered[0].attachments,
        vec![("application/xml".to_string(), b"<inv:Line>widget</inv:Line>".to_vec())]
    );
}

#[test]
fn test_compressed_attachment_is_delivered_decompressed() {
    init_tracing();
    let pmode = pmode(leg(None, Some(CompressionMode::Gzip)));
    let inbox = Inbox::default();
    let receiver = receiver_for(pmode.clone(), None, inbox.clone());

    let mut client = client_for(&pmode);
    let content = b"quantity;price\n".repeat(64);
    let added = client
        .add_attachment_bytes(&content, "text/csv", AttachmentCompression::PModeDefault)
        .unwrap();
    assert_eq!(added.compression(), Some(CompressionMode::Gzip));

    let response = client
        .send_message("https://buyer.example/as4", &Loopback { receiver: &receiver })
        .unwrap();
    assert!(matches!(
        parse_signal_response(&response.body).unwrap().kind,
        SignalKind::Receipt { .. }
    ));

    let delivered = inbox.delivered();
    assert_eq!(delivered[0].payload, None);
    assert_eq!(delivered[0].attachments, vec![("text/csv".to_string(), content)]);
}

#[test]
fn test_oversized_decompressed_attachment_is_rejected() {
    init_tracing();
    let pmode = pmode(leg(None, Some(CompressionMode::Gzip)));
    let inbox = Inbox::default();
    let mut config = As4Config {
        pmodes: vec![pmode.clone()],
        ..Default::default()
    };
    config.settings.max_body_size = 64 * 1024;
    let receiver = As4Receiver::from_config(&config, Box::new(inbox.clone())).unwrap();

    let mut client = client_for(&pmode);
    client
        .add_attachment_bytes(
            &vec![0u8; 1_048_576],
            "application/octet-stream",
            AttachmentCompression::PModeDefault,
        )
        .unwrap();
    let response = client
        .send_message("https://buyer.example/as4", &Loopback { receiver: &receiver })
        .unwrap();

    let signal = parse_signal_response(&response.body).unwrap();
    assert_eq!(
        signal.kind,
        SignalKind::Error {
            codes: vec!["EBMS:0303".to_string()]
        }
    );
    assert!(inbox.delivered().is_empty());
    assert_eq!(receiver.requests_rejected(), 1);
}

#[test]
fn test_unsigned_message_violates_policy() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (_, receiver_keystore) = keystores(dir.path());
    let pmode = pmode(leg(Some(signed_and_encrypted()), None));
    let inbox = Inbox::default();
    let receiver = receiver_for(pmode.clone(), Some(receiver_keystore), inbox.clone());

    // Sent without any security.
    let mut client = As4Client::new();
    client.set_builder(builder());
    client.set_payload(r#"<inv:Invoice xmlns:inv="urn:inv"/>"#);
    let response = client
        .send_message("https://buyer.example/as4", &Loopback { receiver: &receiver })
        .unwrap();

    let signal = parse_signal_response(&response.body).unwrap();
    assert_eq!(
        signal.kind,
        SignalKind::Error {
            codes: vec!["EBMS:0103".to_string()]
        }
    );
    assert!(inbox.delivered().is_empty());
    assert_eq!(receiver.requests_rejected(), 1);
}

#[test]
fn test_signal_only_message_is_acknowledged_empty() {
    let pmode = pmode(leg(None, None));
    let receiver = receiver_for(pmode, None, Inbox::default());

    let doc = builder().build(SoapVersion::Soap12, None, &[]).unwrap();
    let user_message = Messaging::from_element(doc.header("Messaging").unwrap())
        .unwrap()
        .user_messages
        .remove(0);
    let receipt = receipt_response(SoapVersion::Soap12, &user_message, None, "receipt-1@as4");

    let response = receiver.receive(Some("application/soap+xml"), receipt.as_bytes());
    assert_eq!(response.kind, ResponseKind::Empty);
    assert_eq!(response.status, 200);
    assert!(response.body.is_empty());
}

#[test]
fn test_receiver_rejects_inconsistent_pmode_config() {
    let mut broken = pmode(leg(None, None));
    broken.mep_binding = Some(MepBinding::PushAndPush);
    let config = As4Config {
        pmodes: vec![broken],
        ..Default::default()
    };
    assert!(matches!(
        As4Receiver::from_config(&config, Box::new(Inbox::default())),
        Err(As4Error::Config(_))
    ));
}

// ============================================================================
// Documented scenarios
// ============================================================================

#[test]
fn test_two_part_infos_with_three_attachments() {
    let registry = registry(pmode(leg(None, None)));
    let mpcs = mpcs();
    let declared = [attachment("a1@as4"), attachment("a2@as4")];
    let doc = builder().build(SoapVersion::Soap12, None, &declared).unwrap();
    let received = [attachment("a1@as4"), attachment("a2@as4"), attachment("a3@as4")];

    let errors = InboundHeaderProcessor::new(&registry, &mpcs, Locale::En)
        .process(&doc, &received)
        .unwrap_err();
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].code, EbmsErrorCode::ExternalPayloadError);
}

#[test]
fn test_compressed_body_part_with_body_payload() {
    let registry = registry(pmode(leg(None, None)));
    let mpcs = mpcs();
    let mut doc = builder()
        .build(SoapVersion::Soap12, Some(r#"<inv:Invoice xmlns:inv="urn:inv"/>"#), &[])
        .unwrap();
    edit_user_message(&mut doc, |um| {
        assert!(um.payload_info[0].href.is_none());
        um.payload_info[0]
            .properties
            .push(Property::new("compressiontype", "application/gzip"));
    });

    let errors = InboundHeaderProcessor::new(&registry, &mpcs, Locale::En)
        .process(&doc, &[])
        .unwrap_err();
    assert_eq!(errors[0].code, EbmsErrorCode::ValueInconsistent);
}

#[test]
fn test_blank_mpc_resolves_to_default() {
    let registry = registry(pmode(leg(None, None)));
    let mpcs = mpcs();
    let xml = builder()
        .build(SoapVersion::Soap12, None, &[])
        .unwrap()
        .to_xml()
        .replace("<eb:UserMessage>", r#"<eb:UserMessage mpc="  ">"#);
    let doc = parse_soap_document(xml.as_bytes()).unwrap();

    let state = InboundHeaderProcessor::new(&registry, &mpcs, Locale::En)
        .process(&doc, &[])
        .unwrap();
    assert_eq!(state.mpc.unwrap().id, DEFAULT_MPC_ID);
    assert_eq!(state.pmode.unwrap().id, "invoice-push");
}

#[test]
fn test_signature_breaks_when_covered_header_changes() {
    let dir = tempfile::tempdir().unwrap();
    let (sender_config, receiver_config) = keystores(dir.path());
    let sender = Keystore::open(&sender_config).unwrap();
    let receiver = Keystore::open(&receiver_config).unwrap();

    let mut doc = builder().build(SoapVersion::Soap11, None, &[]).unwrap();
    security::sign(&mut doc, &[], SignAlgorithm::Ed25519, DigestAlgorithm::Sha512, &sender).unwrap();

    let xml = doc.to_xml();
    let verified = security::verify(&parse_soap_document(xml.as_bytes()).unwrap(), &[], &receiver)
        .unwrap()
        .unwrap();
    assert_eq!(verified.signer_alias, "sender");

    let tampered = parse_soap_document(xml.replace("conv-42", "conv-43").as_bytes()).unwrap();
    assert!(security::verify(&tampered, &[], &receiver).is_err());
}

#[test]
fn test_attachments_without_security_yield_mime() {
    let mut client = As4Client::new();
    client.set_builder(builder());
    let plain = client.build_message().unwrap();
    assert!(!plain.unit.is_mime());

    client
        .add_attachment_bytes(b"<a/>", "application/xml", AttachmentCompression::PModeDefault)
        .unwrap();
    let packaged = client.build_message().unwrap();
    assert!(packaged.unit.is_mime());
    assert!(packaged.unit.content_type().starts_with("multipart/related"));
}

// ============================================================================
// Properties
// ============================================================================

proptest! {
    #[test]
    fn test_message_ids_are_unique(prefix in proptest::option::of("[a-z]{0,8}"), builds in 2usize..16) {
        let mut builder = builder();
        if let Some(prefix) = prefix {
            builder = builder.message_id_prefix(prefix);
        }
        let mut seen = HashSet::new();
        for _ in 0..builds {
            let doc = builder.build(SoapVersion::Soap12, None, &[]).unwrap();
            let messaging = Messaging::from_element(doc.header("Messaging").unwrap()).unwrap();
            prop_assert!(seen.insert(messaging.user_messages[0].message_id().to_string()));
        }
    }

    #[test]
    fn test_invalid_pmode_never_registered(violation in 0usize..4, id in "[a-z]{1,12}") {
        let mut config = pmode(leg(None, None));
        config.id = id.clone();
        match violation {
            0 => config.id = " ".to_string(),
            1 => config.mep = None,
            2 => config.mep_binding = None,
            _ => {
                config.mep = Some(Mep::TwoWay);
                config.mep_binding = Some(MepBinding::PushAndPush);
            }
        }
        let registry = PModeRegistry::new();
        let rejected_id = config.id.clone();
        prop_assert!(registry.create(config).is_err());
        prop_assert!(!registry.contains(&rejected_id));
        prop_assert!(registry.is_empty());
    }
}
