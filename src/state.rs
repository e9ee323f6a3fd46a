//! Per-request inbound processing state.

use crate::attachment::{Attachment, CompressionMode};
use crate::model::{Messaging, UserMessage};
use crate::mpc::Mpc;
use crate::pmode::{PModeConfig, PModeLeg};
use crate::security::VerifiedSignature;
use std::collections::HashMap;

/// What the inbound pipeline learned about one received message.
///
/// A new instance is created for every request and handed through the
/// processing stages by exclusive reference.
#[derive(Debug, Clone, Default)]
pub struct As4MessageState {
    pub messaging: Option<Messaging>,
    pub pmode: Option<PModeConfig>,
    /// Leg selected by the presence of `RefToMessageId` (1 or 2)
    pub leg_number: Option<u8>,
    pub mpc: Option<Mpc>,
    pub original_attachments: Vec<Attachment>,
    /// Content id (without `cid:`) to compression mode
    pub compressed_attachment_ids: HashMap<String, CompressionMode>,
    pub soap_body_payload_present: bool,
    pub initiator_id: Option<String>,
    pub responder_id: Option<String>,
    pub decrypted: bool,
    pub signature: Option<VerifiedSignature>,
}

impl As4MessageState {
    pub fn new() -> Self {
        Self::default()
    }

    /// The single user message, if the envelope carried one.
    pub fn user_message(&self) -> Option<&UserMessage> {
        self.messaging.as_ref().and_then(|m| m.user_messages.first())
    }

    pub fn message_id(&self) -> Option<&str> {
        self.user_message().map(UserMessage::message_id)
    }

    /// The PMode leg selected for this message.
    pub fn leg(&self) -> Option<&PModeLeg> {
        let pmode = self.pmode.as_ref()?;
        match self.leg_number? {
            1 => pmode.leg1.as_ref(),
            2 => pmode.leg2.as_ref(),
            _ => None,
        }
    }

    pub fn compression_of(&self, content_id: &str) -> Option<CompressionMode> {
        self.compressed_attachment_ids.get(content_id).copied()
    }

    pub fn is_signed(&self) -> bool {
        self.signature.is_some()
    }
}
