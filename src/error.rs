//! Error types for the AS4 pipeline.
//!
//! Two families live here. [`As4Error`] is returned by outbound operations and
//! aborts them. [`EbmsError`] is a protocol-level error value collected during
//! inbound processing and rendered into an ebMS3 error signal.

use crate::config::SoapVersion;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// AS4 pipeline errors.
#[derive(Error, Debug)]
pub enum As4Error {
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Security failure: {0}")]
    Security(String),

    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("PMode registry is inconsistent:\n{0}")]
    InconsistentRegistry(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl As4Error {
    pub(crate) fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    pub(crate) fn security(msg: impl Into<String>) -> Self {
        Self::Security(msg.into())
    }

    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }
}

/// Display language for error descriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Locale {
    #[default]
    En,
    De,
}

/// ebMS3 error severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Failure,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Failure => "failure",
        }
    }
}

/// ebMS3 core error codes emitted by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EbmsErrorCode {
    /// EBMS:0001
    ValueNotRecognized,
    /// EBMS:0002
    FeatureNotSupported,
    /// EBMS:0003
    ValueInconsistent,
    /// EBMS:0004
    Other,
    /// EBMS:0009
    InvalidHeader,
    /// EBMS:0010
    ProcessingModeMismatch,
    /// EBMS:0011
    ExternalPayloadError,
    /// EBMS:0101
    FailedAuthentication,
    /// EBMS:0102
    FailedDecryption,
    /// EBMS:0103
    PolicyNoncompliance,
    /// EBMS:0303
    DecompressionFailure,
}

impl EbmsErrorCode {
    /// Stable wire code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ValueNotRecognized => "EBMS:0001",
            Self::FeatureNotSupported => "EBMS:0002",
            Self::ValueInconsistent => "EBMS:0003",
            Self::Other => "EBMS:0004",
            Self::InvalidHeader => "EBMS:0009",
            Self::ProcessingModeMismatch => "EBMS:0010",
            Self::ExternalPayloadError => "EBMS:0011",
            Self::FailedAuthentication => "EBMS:0101",
            Self::FailedDecryption => "EBMS:0102",
            Self::PolicyNoncompliance => "EBMS:0103",
            Self::DecompressionFailure => "EBMS:0303",
        }
    }

    pub fn short_description(&self) -> &'static str {
        match self {
            Self::ValueNotRecognized => "ValueNotRecognized",
            Self::FeatureNotSupported => "FeatureNotSupported",
            Self::ValueInconsistent => "ValueInconsistent",
            Self::Other => "Other",
            Self::InvalidHeader => "InvalidHeader",
            Self::ProcessingModeMismatch => "ProcessingModeMismatch",
            Self::ExternalPayloadError => "ExternalPayloadError",
            Self::FailedAuthentication => "FailedAuthentication",
            Self::FailedDecryption => "FailedDecryption",
            Self::PolicyNoncompliance => "PolicyNoncompliance",
            Self::DecompressionFailure => "DecompressionFailure",
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            Self::ValueNotRecognized
            | Self::FeatureNotSupported
            | Self::ValueInconsistent
            | Self::Other
            | Self::InvalidHeader
            | Self::ProcessingModeMismatch => "Content",
            Self::ExternalPayloadError | Self::FailedAuthentication | Self::FailedDecryption => {
                "Processing"
            }
            Self::PolicyNoncompliance => "Processing",
            Self::DecompressionFailure => "Communication",
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::FeatureNotSupported => Severity::Warning,
            _ => Severity::Failure,
        }
    }

    /// Human readable description in the requested locale.
    pub fn description(&self, locale: Locale) -> &'static str {
        match (self, locale) {
            (Self::ValueNotRecognized, Locale::En) => "Although the message document is well formed and schema valid, some element/attribute contains a value that could not be recognized and therefore could not be used by the MSH",
            (Self::ValueNotRecognized, Locale::De) => "Ein Element oder Attribut enthält einen Wert, der vom MSH nicht erkannt wurde",
            (Self::FeatureNotSupported, Locale::En) => "Although the message document is well formed and schema valid, some element/attribute value cannot be processed as expected because the related feature is not supported by the MSH",
            (Self::FeatureNotSupported, Locale::De) => "Ein Element oder Attribut kann nicht verarbeitet werden, da das Feature vom MSH nicht unterstützt wird",
            (Self::ValueInconsistent, Locale::En) => "Although the message document is well formed and schema valid, some element/attribute value is inconsistent either with the content of other element/attribute, or with the processing mode of the MSH, or with the normal rules of the ebMS protocol",
            (Self::ValueInconsistent, Locale::De) => "Ein Element oder Attribut ist inkonsistent mit anderen Werten, dem PMode oder den ebMS Regeln",
            (Self::Other, Locale::En) => "An unspecified error occurred",
            (Self::Other, Locale::De) => "Ein nicht näher spezifizierter Fehler ist aufgetreten",
            (Self::InvalidHeader, Locale::En) => "The ebMS header is either not well formed as an XML document, or does not conform to the ebMS packaging rules",
            (Self::InvalidHeader, Locale::De) => "Der ebMS Header ist kein wohlgeformtes XML oder entspricht nicht den ebMS Regeln",
            (Self::ProcessingModeMismatch, Locale::En) => "The ebMS header or another header (e.g. reliability, security) expected by the MSH is not compatible with the expected content, based on the associated P-Mode",
            (Self::ProcessingModeMismatch, Locale::De) => "Der ebMS Header passt nicht zum zugehörigen P-Mode",
            (Self::ExternalPayloadError, Locale::En) => "The MSH is unable to resolve an external payload reference (i.e. a Part that is not contained within the ebMS Message, as identified by a PartInfo/href URI)",
            (Self::ExternalPayloadError, Locale::De) => "Der MSH kann eine Payload Referenz (PartInfo/href) nicht auflösen",
            (Self::FailedAuthentication, Locale::En) => "The signature in the Security header was not validated successfully",
            (Self::FailedAuthentication, Locale::De) => "Die Signatur im Security Header konnte nicht validiert werden",
            (Self::FailedDecryption, Locale::En) => "The encrypted data reference in the Security header cannot be decrypted",
            (Self::FailedDecryption, Locale::De) => "Die verschlüsselten Daten konnten nicht entschlüsselt werden",
            (Self::PolicyNoncompliance, Locale::En) => "The processor determined that the message's security methods, parameters, scope or other security policy-level requirements or agreements were not satisfied",
            (Self::PolicyNoncompliance, Locale::De) => "Die Sicherheitsanforderungen des P-Mode wurden nicht erfüllt",
            (Self::DecompressionFailure, Locale::En) => "An error occurred during the decompression",
            (Self::DecompressionFailure, Locale::De) => "Bei der Dekomprimierung ist ein Fehler aufgetreten",
        }
    }
}

impl std::fmt::Display for EbmsErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol error collected during inbound processing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EbmsError {
    /// Error code
    pub code: EbmsErrorCode,
    /// Locale-rendered description of the code
    pub description: String,
    /// Specific detail for this occurrence
    pub detail: Option<String>,
    /// Message id of the offending message, when known
    pub ref_to_message_id: Option<String>,
}

impl EbmsError {
    /// Create a new error rendered in the given locale.
    pub fn new(code: EbmsErrorCode, locale: Locale) -> Self {
        Self {
            code,
            description: code.description(locale).to_string(),
            detail: None,
            ref_to_message_id: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_ref_to_message_id(mut self, message_id: Option<&str>) -> Self {
        self.ref_to_message_id = message_id.map(str::to_string);
        self
    }

    pub fn severity(&self) -> Severity {
        self.code.severity()
    }
}

impl std::fmt::Display for EbmsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.detail {
            Some(detail) => write!(f, "[{}] {}: {}", self.code, self.code.short_description(), detail),
            None => write!(f, "[{}] {}", self.code, self.code.short_description()),
        }
    }
}

/// Whether any collected error is of severity `failure`.
pub fn has_failures(errors: &[EbmsError]) -> bool {
    errors.iter().any(|e| e.severity() == Severity::Failure)
}

/// Render the `eb:SignalMessage` error elements for the collected errors.
pub fn error_signal_xml(errors: &[EbmsError], message_id: &str, timestamp: &str) -> String {
    let ref_to = errors.iter().find_map(|e| e.ref_to_message_id.as_deref());
    let ref_to_xml = ref_to
        .map(|id| format!("<eb:RefToMessageId>{}</eb:RefToMessageId>", xml_escape(id)))
        .unwrap_or_default();

    let error_xml = errors
        .iter()
        .map(|e| {
            let ref_attr = e
                .ref_to_message_id
                .as_deref()
                .map(|id| format!(" refToMessageInError=\"{}\"", xml_escape(id)))
                .unwrap_or_default();
            let detail = e
                .detail
                .as_deref()
                .map(|d| format!("<eb:ErrorDetail>{}</eb:ErrorDetail>", xml_escape(d)))
                .unwrap_or_default();
            format!(
                "<eb:Error category=\"{}\" errorCode=\"{}\" origin=\"ebMS\" severity=\"{}\" shortDescription=\"{}\"{}><eb:Description xml:lang=\"en\">{}</eb:Description>{}</eb:Error>",
                e.code.category(),
                e.code.as_str(),
                e.severity().as_str(),
                e.code.short_description(),
                ref_attr,
                xml_escape(&e.description),
                detail
            )
        })
        .collect::<Vec<_>>()
        .join("");

    format!(
        "<eb:SignalMessage><eb:MessageInfo><eb:Timestamp>{}</eb:Timestamp><eb:MessageId>{}</eb:MessageId>{}</eb:MessageInfo>{}</eb:SignalMessage>",
        xml_escape(timestamp),
        xml_escape(message_id),
        ref_to_xml,
        error_xml
    )
}

/// Generate a SOAP Fault body for errors that could not be mapped onto an
/// ebMS header (e.g. the envelope itself is unreadable).
pub fn soap_fault_response(errors: &[EbmsError], soap_version: SoapVersion) -> String {
    let reason = errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ");

    match soap_version {
        SoapVersion::Soap11 => format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<S11:Envelope xmlns:S11="http://schemas.xmlsoap.org/soap/envelope/">
  <S11:Body>
    <S11:Fault>
      <faultcode>S11:Client</faultcode>
      <faultstring>{}</faultstring>
    </S11:Fault>
  </S11:Body>
</S11:Envelope>"#,
            xml_escape(&reason)
        ),
        SoapVersion::Soap12 => format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<S12:Envelope xmlns:S12="http://www.w3.org/2003/05/soap-envelope">
  <S12:Body>
    <S12:Fault>
      <S12:Code>
        <S12:Value>S12:Sender</S12:Value>
      </S12:Code>
      <S12:Reason>
        <S12:Text xml:lang="en">{}</S12:Text>
      </S12:Reason>
    </S12:Fault>
  </S12:Body>
</S12:Envelope>"#,
            xml_escape(&reason)
        ),
    }
}

pub(crate) fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}
