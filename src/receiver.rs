//! Inbound AS4 message handling.
//!
//! Runs the full receive pipeline and turns its outcome into a response:
//! a receipt, an ebMS3 error signal, or a SOAP fault when the request is
//! not readable as an AS4 message at all.

use crate::attachment::Attachment;
use crate::config::{As4Config, SettingsConfig, SoapVersion};
use crate::crypto::Keystore;
use crate::document::SoapDocument;
use crate::error::{soap_fault_response, As4Error, EbmsError, EbmsErrorCode};
use crate::mime::{self, MimeMessage};
use crate::model::UserMessage;
use crate::mpc::MpcRegistry;
use crate::parser::{check_well_formed, parse_soap_document};
use crate::pmode::PModeRegistry;
use crate::processor::InboundHeaderProcessor;
use crate::security;
use crate::signal::{error_response, receipt_response, signal_message_id};
use crate::state::As4MessageState;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Result of business processing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessingOutcome {
    Accepted,
    Rejected(String),
}

/// Business callback invoked for messages that passed every check.
pub trait MessageProcessor: Send + Sync {
    fn process(
        &self,
        user_message: Option<&UserMessage>,
        payload: Option<&str>,
        attachments: &[Attachment],
    ) -> ProcessingOutcome;
}

/// What kind of response the receiver produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseKind {
    Receipt,
    ErrorSignal,
    SoapFault,
    /// Signal-only request, nothing to acknowledge
    Empty,
}

/// Response to hand back to the transport.
#[derive(Debug, Clone)]
pub struct ReceiverResponse {
    pub kind: ResponseKind,
    pub status: u16,
    pub content_type: String,
    pub body: String,
    pub errors: Vec<EbmsError>,
}

impl ReceiverResponse {
    pub fn is_receipt(&self) -> bool {
        self.kind == ResponseKind::Receipt
    }
}

/// Receives AS4 messages.
pub struct As4Receiver {
    settings: SettingsConfig,
    pmodes: Arc<PModeRegistry>,
    mpcs: Arc<MpcRegistry>,
    keystore: Option<Keystore>,
    processor: Box<dyn MessageProcessor>,
    /// Metrics tracking
    requests_processed: AtomicU64,
    requests_rejected: AtomicU64,
}

impl As4Receiver {
    pub fn new(
        settings: SettingsConfig,
        pmodes: Arc<PModeRegistry>,
        mpcs: Arc<MpcRegistry>,
        processor: Box<dyn MessageProcessor>,
    ) -> Self {
        Self {
            settings,
            pmodes,
            mpcs,
            keystore: None,
            processor,
            requests_processed: AtomicU64::new(0),
            requests_rejected: AtomicU64::new(0),
        }
    }

    /// Keystore used to decrypt and verify inbound messages.
    pub fn with_keystore(mut self, keystore: Keystore) -> Self {
        self.keystore = Some(keystore);
        self
    }

    /// Build registries and keystore from the configuration.
    ///
    /// Fails when the PMode set is inconsistent or the keystore cannot be opened.
    pub fn from_config(config: &As4Config, processor: Box<dyn MessageProcessor>) -> Result<Self, As4Error> {
        let pmodes = PModeRegistry::from_config(config)?;
        pmodes.validate_all()?;
        let mpcs = MpcRegistry::from_config(config)?;

        let mut receiver = Self::new(config.settings.clone(), Arc::new(pmodes), Arc::new(mpcs), processor);
        if let Some(ref keystore) = config.crypto.keystore {
            receiver.keystore = Some(Keystore::open(keystore)?);
        }

        info!(
            pmodes = receiver.pmodes.len(),
            mpcs = receiver.mpcs.len(),
            keystore = receiver.keystore.is_some(),
            "AS4 receiver configured"
        );
        Ok(receiver)
    }

    pub fn pmodes(&self) -> &PModeRegistry {
        &self.pmodes
    }

    pub fn mpcs(&self) -> &MpcRegistry {
        &self.mpcs
    }

    pub fn requests_processed(&self) -> u64 {
        self.requests_processed.load(Ordering::Relaxed)
    }

    pub fn requests_rejected(&self) -> u64 {
        self.requests_rejected.load(Ordering::Relaxed)
    }

    /// Handle one request body.
    pub fn receive(&self, content_type: Option<&str>, body: &[u8]) -> ReceiverResponse {
        self.requests_processed.fetch_add(1, Ordering::Relaxed);
        let response = self.process_request(content_type, body);
        match response.kind {
            ResponseKind::Receipt | ResponseKind::Empty => {
                debug!(kind = ?response.kind, "AS4 request accepted");
            }
            ResponseKind::ErrorSignal | ResponseKind::SoapFault => {
                self.requests_rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    kind = ?response.kind,
                    errors = response.errors.len(),
                    "AS4 request rejected"
                );
            }
        }
        response
    }

    fn process_request(&self, content_type: Option<&str>, body: &[u8]) -> ReceiverResponse {
        if body.len() > self.settings.max_body_size {
            let error = self.ebms_error(EbmsErrorCode::Other).with_detail(format!(
                "Request body size {} exceeds maximum {}",
                body.len(),
                self.settings.max_body_size
            ));
            return self.fault(vec![error], self.settings.soap_version);
        }

        let (mut document, attachments) = match self.read_message(content_type, body) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Unreadable AS4 request");
                let error = self.ebms_error(EbmsErrorCode::InvalidHeader).with_detail(e.to_string());
                return self.fault(vec![error], self.settings.soap_version);
            }
        };
        let version = document.version;

        let (attachments, decrypted) = match self.decrypt(&mut document, attachments) {
            Ok(result) => result,
            Err(error) => return self.error_signal(version, vec![error]),
        };
        let signature = match self.verify(&document, &attachments) {
            Ok(signature) => signature,
            Err(error) => return self.error_signal(version, vec![error]),
        };

        let processor = InboundHeaderProcessor::new(self.pmodes.as_ref(), &self.mpcs, self.settings.locale);
        let mut state = match processor.process(&document, &attachments) {
            Ok(state) => state,
            Err(errors) => return self.error_signal(version, errors),
        };
        state.decrypted = decrypted;
        state.signature = signature;

        let user_message = match state.user_message() {
            Some(user_message) => user_message.clone(),
            None => {
                return ReceiverResponse {
                    kind: ResponseKind::Empty,
                    status: 200,
                    content_type: content_type_for(version),
                    body: String::new(),
                    errors: Vec::new(),
                }
            }
        };
        let message_id = Some(user_message.message_id());

        if let Err(error) = self.check_policy(&state) {
            return self.error_signal(version, vec![error.with_ref_to_message_id(message_id)]);
        }

        let attachments = match self.decompress(&state, &attachments) {
            Ok(attachments) => attachments,
            Err(error) => return self.error_signal(version, vec![error.with_ref_to_message_id(message_id)]),
        };

        let payload = state.soap_body_payload_present.then_some(document.body.as_str());
        match self.processor.process(Some(&user_message), payload, &attachments) {
            ProcessingOutcome::Accepted => {
                info!(
                    message_id = %user_message.message_id(),
                    pmode_id = ?state.pmode.as_ref().map(|p| p.id.as_str()),
                    signed = state.is_signed(),
                    encrypted = state.decrypted,
                    attachments = attachments.len(),
                    "AS4 user message accepted"
                );
                let receipt_id = signal_message_id(self.settings.message_id_prefix.as_deref());
                ReceiverResponse {
                    kind: ResponseKind::Receipt,
                    status: 200,
                    content_type: content_type_for(version),
                    body: receipt_response(version, &user_message, state.signature.as_ref(), &receipt_id),
                    errors: Vec::new(),
                }
            }
            ProcessingOutcome::Rejected(reason) => {
                let error = self
                    .ebms_error(EbmsErrorCode::Other)
                    .with_detail(reason)
                    .with_ref_to_message_id(message_id);
                self.error_signal(version, vec![error])
            }
        }
    }

    fn read_message(&self, content_type: Option<&str>, body: &[u8]) -> Result<(SoapDocument, Vec<Attachment>), As4Error> {
        match content_type {
            Some(ct) if ct.trim().to_ascii_lowercase().starts_with("multipart/related") => {
                mime::unpack(&MimeMessage::parse(ct, body)?)
            }
            _ => {
                check_well_formed(body)?;
                Ok((parse_soap_document(body)?, Vec::new()))
            }
        }
    }

    fn decrypt(&self, document: &mut SoapDocument, attachments: Vec<Attachment>) -> Result<(Vec<Attachment>, bool), EbmsError> {
        let encrypted = security::is_encrypted(document)
            .map_err(|e| self.ebms_error(EbmsErrorCode::FailedDecryption).with_detail(e.to_string()))?;
        if !encrypted {
            return Ok((attachments, false));
        }
        let keystore = self.keystore.as_ref().ok_or_else(|| {
            self.ebms_error(EbmsErrorCode::FailedDecryption)
                .with_detail("no keystore configured for decryption")
        })?;
        security::decrypt(document, &attachments, keystore)
            .map(|decrypted| (decrypted, true))
            .map_err(|e| self.ebms_error(EbmsErrorCode::FailedDecryption).with_detail(e.to_string()))
    }

    fn verify(
        &self,
        document: &SoapDocument,
        attachments: &[Attachment],
    ) -> Result<Option<security::VerifiedSignature>, EbmsError> {
        let signed = security::is_signed(document)
            .map_err(|e| self.ebms_error(EbmsErrorCode::FailedAuthentication).with_detail(e.to_string()))?;
        if !signed {
            return Ok(None);
        }
        let keystore = self.keystore.as_ref().ok_or_else(|| {
            self.ebms_error(EbmsErrorCode::FailedAuthentication)
                .with_detail("no keystore configured for signature verification")
        })?;
        security::verify(document, attachments, keystore)
            .map_err(|e| self.ebms_error(EbmsErrorCode::FailedAuthentication).with_detail(e.to_string()))
    }

    /// The selected leg's security requirements must be met.
    fn check_policy(&self, state: &As4MessageState) -> Result<(), EbmsError> {
        let security = match state.leg().and_then(|l| l.security.as_ref()) {
            Some(security) => security,
            None => return Ok(()),
        };
        if security.requires_signature() && !state.is_signed() {
            return Err(self
                .ebms_error(EbmsErrorCode::PolicyNoncompliance)
                .with_detail("PMode requires a signed message"));
        }
        if security.requires_encryption() && !state.decrypted {
            return Err(self
                .ebms_error(EbmsErrorCode::PolicyNoncompliance)
                .with_detail("PMode requires an encrypted message"));
        }
        Ok(())
    }

    fn decompress(&self, state: &As4MessageState, attachments: &[Attachment]) -> Result<Vec<Attachment>, EbmsError> {
        let limit = self.settings.max_body_size as u64;
        attachments
            .iter()
            .map(|attachment| match state.compression_of(attachment.content_id()) {
                Some(mode) => attachment.decompressed(mode, limit).map_err(|e| {
                    self.ebms_error(EbmsErrorCode::DecompressionFailure)
                        .with_detail(format!("{}: {}", attachment.content_id(), e))
                }),
                None => Ok(attachment.clone()),
            })
            .collect()
    }

    fn ebms_error(&self, code: EbmsErrorCode) -> EbmsError {
        EbmsError::new(code, self.settings.locale)
    }

    fn error_signal(&self, version: SoapVersion, errors: Vec<EbmsError>) -> ReceiverResponse {
        for e in &errors {
            debug!(code = %e.code.as_str(), detail = ?e.detail, "ebMS error");
        }
        let signal_id = signal_message_id(self.settings.message_id_prefix.as_deref());
        ReceiverResponse {
            kind: ResponseKind::ErrorSignal,
            status: 200,
            content_type: content_type_for(version),
            body: error_response(version, &errors, &signal_id),
            errors,
        }
    }

    fn fault(&self, errors: Vec<EbmsError>, version: SoapVersion) -> ReceiverResponse {
        ReceiverResponse {
            kind: ResponseKind::SoapFault,
            status: 500,
            content_type: content_type_for(version),
            body: soap_fault_response(&errors, version),
            errors,
        }
    }
}

fn content_type_for(version: SoapVersion) -> String {
    format!("{}; charset=utf-8", version.mime_type())
}
