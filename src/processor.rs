//! Inbound `eb:Messaging` header processing.
//!
//! Runs a fixed sequence of checks over a received envelope. The first check
//! that fails halts processing and yields the collected errors; a message that
//! passes every check yields a populated [`As4MessageState`].

use crate::attachment::{Attachment, CompressionMode};
use crate::document::SoapDocument;
use crate::error::{EbmsError, EbmsErrorCode, Locale};
use crate::model::{Messaging, UserMessage, PART_PROPERTY_COMPRESSION_TYPE};
use crate::mpc::MpcRegistry;
use crate::pmode::{PModeConfig, PModeLeg, PModeResolver};
use crate::state::As4MessageState;
use std::collections::HashMap;
use tracing::{debug, warn};

type Stage<T> = Result<T, Vec<EbmsError>>;

/// Validates the messaging header of inbound envelopes against the
/// PMode and MPC registries.
pub struct InboundHeaderProcessor<'a> {
    pmodes: &'a dyn PModeResolver,
    mpcs: &'a MpcRegistry,
    locale: Locale,
}

impl<'a> InboundHeaderProcessor<'a> {
    pub fn new(pmodes: &'a dyn PModeResolver, mpcs: &'a MpcRegistry, locale: Locale) -> Self {
        Self { pmodes, mpcs, locale }
    }

    /// Process the messaging header of `document`.
    ///
    /// `attachments` are the attachments received alongside the envelope,
    /// already decrypted.
    pub fn process(&self, document: &SoapDocument, attachments: &[Attachment]) -> Stage<As4MessageState> {
        let messaging = self.parse_header(document)?;
        let user_message = match self.check_single_user_message(&messaging)? {
            Some(user_message) => user_message.clone(),
            None => {
                debug!(signals = messaging.signal_message_count, "Messaging header without user message");
                return Ok(As4MessageState {
                    messaging: Some(messaging),
                    soap_body_payload_present: document.has_body_payload(),
                    original_attachments: attachments.to_vec(),
                    ..Default::default()
                });
            }
        };
        let message_id = Some(user_message.message_id());

        let pmode = self.resolve_pmode(&user_message)?;
        let leg_number = if has_text(user_message.message_info.ref_to_message_id.as_deref()) { 2 } else { 1 };

        let mut leg = None;
        if let Some(ref pmode) = pmode {
            self.check_leg_count(pmode, message_id)?;
            leg = Some(self.select_leg(pmode, leg_number, message_id)?);
        }
        let mpc = self.check_mpc(&user_message, leg, message_id)?;

        let body_present = document.has_body_payload();
        self.check_body_payload_consistency(&user_message, body_present)?;
        self.check_part_info_vs_attachments(&user_message, attachments)?;
        let compressed = self.check_compression_consistency(&user_message, body_present)?;

        let state = As4MessageState {
            leg_number: pmode.as_ref().map(|_| leg_number),
            pmode,
            mpc: Some(mpc),
            original_attachments: attachments.to_vec(),
            compressed_attachment_ids: compressed,
            soap_body_payload_present: body_present,
            initiator_id: user_message.party_info.from.primary_id().map(str::to_string),
            responder_id: user_message.party_info.to.primary_id().map(str::to_string),
            messaging: Some(messaging),
            ..Default::default()
        };

        debug!(
            message_id = %user_message.message_id(),
            pmode_id = ?state.pmode.as_ref().map(|p| p.id.as_str()),
            mpc = ?state.mpc.as_ref().map(|m| m.id.as_str()),
            attachments = attachments.len(),
            "Messaging header accepted"
        );
        Ok(state)
    }

    fn error(&self, code: EbmsErrorCode, detail: impl Into<String>, message_id: Option<&str>) -> Vec<EbmsError> {
        let detail = detail.into();
        warn!(code = %code.as_str(), message_id = ?message_id, detail = %detail, "Messaging header rejected");
        vec![EbmsError::new(code, self.locale)
            .with_detail(detail)
            .with_ref_to_message_id(message_id)]
    }

    fn parse_header(&self, document: &SoapDocument) -> Stage<Messaging> {
        let mut headers = document.headers_named("Messaging");
        let element = match (headers.next(), headers.next()) {
            (Some(element), None) => element,
            (None, _) => {
                return Err(self.error(EbmsErrorCode::InvalidHeader, "no eb:Messaging header present", None))
            }
            (Some(_), Some(_)) => {
                return Err(self.error(EbmsErrorCode::InvalidHeader, "more than one eb:Messaging header", None))
            }
        };

        Messaging::from_element(element).map_err(|problems| {
            warn!(problems = problems.len(), "Messaging header is invalid");
            problems
                .into_iter()
                .map(|p| EbmsError::new(EbmsErrorCode::InvalidHeader, self.locale).with_detail(p))
                .collect()
        })
    }

    fn check_single_user_message<'m>(&self, messaging: &'m Messaging) -> Stage<Option<&'m UserMessage>> {
        match messaging.user_messages.as_slice() {
            [] => Ok(None),
            [single] => Ok(Some(single)),
            many => Err(self.error(
                EbmsErrorCode::ValueInconsistent,
                format!("too many UserMessage elements: {}", many.len()),
                None,
            )),
        }
    }

    fn resolve_pmode(&self, user_message: &UserMessage) -> Stage<Option<PModeConfig>> {
        let collaboration = match user_message.collaboration_info {
            Some(ref collaboration) => collaboration,
            None => return Ok(None),
        };
        let pmode_id = collaboration
            .agreement_ref
            .as_ref()
            .and_then(|a| a.pmode.as_deref());

        match self
            .pmodes
            .resolve(pmode_id, &collaboration.service.value, &collaboration.action)
        {
            Some(pmode) => Ok(Some(pmode)),
            None => Err(self.error(
                EbmsErrorCode::ProcessingModeMismatch,
                format!(
                    "failed to resolve PMode '{}' for service '{}' and action '{}'",
                    pmode_id.unwrap_or_default(),
                    collaboration.service.value,
                    collaboration.action
                ),
                Some(user_message.message_id()),
            )),
        }
    }

    fn check_leg_count(&self, pmode: &PModeConfig, message_id: Option<&str>) -> Stage<()> {
        let required = pmode.mep_binding.map(|b| b.required_legs()).unwrap_or(1);
        if required == 2 && (pmode.leg1.is_none() || pmode.leg2.is_none()) {
            return Err(self.error(
                EbmsErrorCode::ProcessingModeMismatch,
                format!("PMode {} requires two legs", pmode.id),
                message_id,
            ));
        }
        Ok(())
    }

    fn select_leg<'p>(&self, pmode: &'p PModeConfig, leg_number: u8, message_id: Option<&str>) -> Stage<&'p PModeLeg> {
        let leg = if leg_number == 2 { pmode.leg2.as_ref() } else { pmode.leg1.as_ref() };
        leg.ok_or_else(|| {
            self.error(
                EbmsErrorCode::ProcessingModeMismatch,
                format!("PMode {} does not contain leg {}", pmode.id, leg_number),
                message_id,
            )
        })
    }

    /// The leg's MPC must be known; the message's own MPC takes precedence
    /// over the leg's, and a blank id means the default MPC.
    fn check_mpc(
        &self,
        user_message: &UserMessage,
        leg: Option<&PModeLeg>,
        message_id: Option<&str>,
    ) -> Stage<crate::mpc::Mpc> {
        let leg_mpc = leg
            .and_then(|l| l.business_info.as_ref())
            .and_then(|b| b.mpc_id.as_deref());

        if let Some(id) = leg_mpc {
            if !self.mpcs.contains(id) {
                return Err(self.error(
                    EbmsErrorCode::ProcessingModeMismatch,
                    format!("PMode MPC '{}' is unknown", id),
                    message_id,
                ));
            }
        }

        let effective = user_message
            .mpc
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .or(leg_mpc);
        self.mpcs.resolve(effective).ok_or_else(|| {
            self.error(
                EbmsErrorCode::ValueInconsistent,
                format!("effective MPC '{}' is unknown", effective.unwrap_or_default()),
                message_id,
            )
        })
    }

    fn check_body_payload_consistency(&self, user_message: &UserMessage, body_present: bool) -> Stage<()> {
        let message_id = Some(user_message.message_id());
        if user_message.payload_info.is_empty() && body_present {
            return Err(self.error(
                EbmsErrorCode::ValueInconsistent,
                "no PartInfo is specified, so no body payload is allowed",
                message_id,
            ));
        }
        if !body_present && user_message.payload_info.iter().any(|p| !has_text(p.href.as_deref())) {
            return Err(self.error(
                EbmsErrorCode::ValueInconsistent,
                "PartInfo without href announces a body payload but the body is empty",
                message_id,
            ));
        }
        Ok(())
    }

    fn check_part_info_vs_attachments(&self, user_message: &UserMessage, attachments: &[Attachment]) -> Stage<()> {
        let message_id = Some(user_message.message_id());
        let parts = &user_message.payload_info;
        if parts.is_empty() {
            if !attachments.is_empty() {
                return Err(self.error(
                    EbmsErrorCode::ExternalPayloadError,
                    "no PartInfo is specified, so no attachments are allowed",
                    message_id,
                ));
            }
            return Ok(());
        }

        let announced: Vec<&str> = parts.iter().filter_map(|p| p.content_id()).collect();
        if announced.len() != attachments.len() {
            return Err(self.error(
                EbmsErrorCode::ExternalPayloadError,
                format!(
                    "expected {} attachments but received {}",
                    announced.len(),
                    attachments.len()
                ),
                message_id,
            ));
        }
        if let Some(missing) = announced
            .iter()
            .find(|id| !attachments.iter().any(|a| a.content_id() == **id))
        {
            return Err(self.error(
                EbmsErrorCode::ExternalPayloadError,
                format!("attachment cid:{} was not received", missing),
                message_id,
            ));
        }
        Ok(())
    }

    fn check_compression_consistency(
        &self,
        user_message: &UserMessage,
        body_present: bool,
    ) -> Stage<HashMap<String, CompressionMode>> {
        let message_id = Some(user_message.message_id());
        let mut compressed = HashMap::new();

        for part in &user_message.payload_info {
            let value = match part.property(PART_PROPERTY_COMPRESSION_TYPE) {
                Some(value) => value,
                None => continue,
            };
            if body_present {
                return Err(self.error(
                    EbmsErrorCode::ValueInconsistent,
                    "a compressed part cannot be combined with a body payload",
                    message_id,
                ));
            }
            let mode = CompressionMode::from_mime_type(value).ok_or_else(|| {
                self.error(
                    EbmsErrorCode::ValueInconsistent,
                    format!("CompressionType '{}' is not supported", value),
                    message_id,
                )
            })?;
            if let Some(content_id) = part.content_id() {
                compressed.insert(content_id.to_string(), mode);
            }
        }
        Ok(compressed)
    }
}

fn has_text(value: Option<&str>) -> bool {
    value.is_some_and(|v| !v.trim().is_empty())
}
