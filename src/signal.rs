//! ebMS3 signal messages: receipts and error signals.

use crate::attachment::generate_id;
use crate::config::SoapVersion;
use crate::document::{XmlElement, WSU_NS};
use crate::error::{error_signal_xml, As4Error, EbmsError};
use crate::model::{format_timestamp, UserMessage, EBMS_NS};
use crate::parser::parse_soap_document;
use crate::security::VerifiedSignature;
use crate::wssec::DS_NS;
use chrono::Utc;

/// ebBP signal namespace (non-repudiation information).
pub const EBBP_NS: &str = "http://docs.oasis-open.org/ebxml-bp/ebbp-signals-2.0";

/// A received signal, reduced to what callers act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignalSummary {
    pub message_id: String,
    pub ref_to_message_id: Option<String>,
    pub kind: SignalKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalKind {
    Receipt { non_repudiation: bool },
    /// Error codes in document order
    Error { codes: Vec<String> },
}

fn eb(local_name: &str) -> XmlElement {
    XmlElement::new("eb", local_name, EBMS_NS)
}

/// Fresh id for an outgoing signal.
pub fn signal_message_id(prefix: Option<&str>) -> String {
    match prefix.map(str::trim) {
        Some(prefix) if !prefix.is_empty() => format!("{}@{}", prefix, generate_id()),
        _ => generate_id(),
    }
}

/// The `eb:SignalMessage` acknowledging `user_message`.
///
/// A signed request is acknowledged with non-repudiation information listing
/// the verified reference digests; otherwise the user message is echoed.
pub fn receipt_signal(
    user_message: &UserMessage,
    signature: Option<&VerifiedSignature>,
    message_id: &str,
) -> XmlElement {
    let receipt_content = match signature {
        Some(signature) => {
            let mut nri = XmlElement::new("ebbp", "NonRepudiationInformation", EBBP_NS)
                .with_attr("xmlns:ebbp", EBBP_NS)
                .with_attr("xmlns:ds", DS_NS);
            for reference in &signature.references {
                nri.push(
                    XmlElement::new("ebbp", "MessagePartNRInformation", EBBP_NS).with_child(
                        XmlElement::new("ds", "Reference", DS_NS)
                            .with_attr("URI", reference.uri.as_str())
                            .with_child(
                                XmlElement::new("ds", "DigestMethod", DS_NS)
                                    .with_attr("Algorithm", reference.digest_algorithm_uri.as_str()),
                            )
                            .with_child(
                                XmlElement::new("ds", "DigestValue", DS_NS)
                                    .with_text(reference.digest_value.as_str()),
                            ),
                    ),
                );
            }
            nri
        }
        None => user_message.to_element(),
    };

    eb("SignalMessage")
        .with_child(
            eb("MessageInfo")
                .with_child(eb("Timestamp").with_text(format_timestamp(&Utc::now())))
                .with_child(eb("MessageId").with_text(message_id))
                .with_child(eb("RefToMessageId").with_text(user_message.message_id())),
        )
        .with_child(eb("Receipt").with_child(receipt_content))
}

/// Wrap a rendered `eb:SignalMessage` into a complete response envelope.
pub fn signal_envelope(version: SoapVersion, signal_xml: &str) -> String {
    let soap = version.prefix();
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><{soap}:Envelope xmlns:{soap}="{ns}" xmlns:eb="{eb}" xmlns:wsu="{wsu}"><{soap}:Header><eb:Messaging {soap}:mustUnderstand="{mu}" wsu:Id="_messaging">{signal}</eb:Messaging></{soap}:Header><{soap}:Body/></{soap}:Envelope>"#,
        soap = soap,
        ns = version.namespace_uri(),
        eb = EBMS_NS,
        wsu = WSU_NS,
        mu = version.must_understand_value(true),
        signal = signal_xml,
    )
}

/// Complete receipt response envelope.
pub fn receipt_response(
    version: SoapVersion,
    user_message: &UserMessage,
    signature: Option<&VerifiedSignature>,
    message_id: &str,
) -> String {
    signal_envelope(version, &receipt_signal(user_message, signature, message_id).to_xml())
}

/// Complete error signal response envelope.
pub fn error_response(version: SoapVersion, errors: &[EbmsError], message_id: &str) -> String {
    signal_envelope(
        version,
        &error_signal_xml(errors, message_id, &format_timestamp(&Utc::now())),
    )
}

/// Read the signal out of a response envelope.
pub fn parse_signal_response(body: &[u8]) -> Result<SignalSummary, As4Error> {
    let document = parse_soap_document(body)?;
    let signal = document
        .header("Messaging")
        .and_then(|m| m.child("SignalMessage"))
        .ok_or_else(|| As4Error::malformed("response carries no eb:SignalMessage"))?;
    let info = signal
        .child("MessageInfo")
        .ok_or_else(|| As4Error::malformed("signal without MessageInfo"))?;

    let message_id = info
        .child("MessageId")
        .map(|m| m.text_trimmed().to_string())
        .filter(|m| !m.is_empty())
        .ok_or_else(|| As4Error::malformed("signal without MessageId"))?;
    let ref_to_message_id = info
        .child("RefToMessageId")
        .map(|r| r.text_trimmed().to_string())
        .filter(|r| !r.is_empty());

    let kind = match signal.child("Receipt") {
        Some(receipt) => SignalKind::Receipt {
            non_repudiation: receipt.child("NonRepudiationInformation").is_some(),
        },
        None => SignalKind::Error {
            codes: signal
                .children_named("Error")
                .filter_map(|e| e.attr("errorCode").map(str::to_string))
                .collect(),
        },
    };

    Ok(SignalSummary {
        message_id,
        ref_to_message_id,
        kind,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::UserMessageBuilder;
    use crate::error::{EbmsErrorCode, Locale};
    use crate::model::Messaging;
    use crate::wssec::SignatureReference;

    fn user_message() -> UserMessage {
        let doc = UserMessageBuilder::new()
            .action("Deliver")
            .service("urn:type", "urn:svc")
            .conversation_id("conv")
            .agreement_ref("urn:agr", "pm-1")
            .from_party("urn:seller", "s1")
            .to_party("urn:buyer", "b1")
            .property("originalSender", "s1")
            .build(SoapVersion::Soap12, None, &[])
            .unwrap();
        Messaging::from_element(doc.header("Messaging").unwrap())
            .unwrap()
            .user_messages
            .remove(0)
    }

    #[test]
    fn test_plain_receipt() {
        let um = user_message();
        let xml = receipt_response(SoapVersion::Soap12, &um, None, "r1@x");
        let summary = parse_signal_response(xml.as_bytes()).unwrap();
        assert_eq!(summary.message_id, "r1@x");
        assert_eq!(summary.ref_to_message_id.as_deref(), Some(um.message_id()));
        assert_eq!(summary.kind, SignalKind::Receipt { non_repudiation: false });
    }

    #[test]
    fn test_non_repudiation_receipt() {
        let um = user_message();
        let signature = VerifiedSignature {
            signer_alias: "sender".to_string(),
            references: vec![SignatureReference {
                uri: "#_body".to_string(),
                digest_algorithm_uri: "urn:sha".to_string(),
                digest_value: "AAAA".to_string(),
            }],
        };
        let xml = receipt_response(SoapVersion::Soap11, &um, Some(&signature), "r2@x");
        assert!(xml.contains("ebbp:MessagePartNRInformation"));
        let summary = parse_signal_response(xml.as_bytes()).unwrap();
        assert_eq!(summary.kind, SignalKind::Receipt { non_repudiation: true });
    }

    #[test]
    fn test_error_response_lists_codes() {
        let errors = vec![
            EbmsError::new(EbmsErrorCode::ValueInconsistent, Locale::En).with_ref_to_message_id(Some("m1")),
            EbmsError::new(EbmsErrorCode::ExternalPayloadError, Locale::En),
        ];
        let xml = error_response(SoapVersion::Soap12, &errors, "e1@x");
        let summary = parse_signal_response(xml.as_bytes()).unwrap();
        assert_eq!(summary.ref_to_message_id.as_deref(), Some("m1"));
        assert_eq!(
            summary.kind,
            SignalKind::Error {
                codes: vec!["EBMS:0003".to_string(), "EBMS:0011".to_string()]
            }
        );
    }

    #[test]
    fn test_response_without_signal_is_malformed() {
        let xml = r#"<S12:Envelope xmlns:S12="http://www.w3.org/2003/05/soap-envelope"><S12:Body/></S12:Envelope>"#;
        assert!(matches!(parse_signal_response(xml.as_bytes()), Err(As4Error::Malformed(_))));
    }
}
