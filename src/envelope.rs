//! Outbound user message construction.

use crate::attachment::{generate_id, Attachment};
use crate::config::SoapVersion;
use crate::document::SoapDocument;
use crate::error::As4Error;
use crate::model::{
    AgreementRef, CollaborationInfo, MessageInfo, Messaging, PartInfo, Party, PartyInfo, Property,
    Service, UserMessage, PART_PROPERTY_COMPRESSION_TYPE, PART_PROPERTY_MIME_TYPE,
};
use crate::parser::parse_element;
use chrono::Utc;
use tracing::debug;

/// Field set of an outbound user message.
///
/// Every call to [`build`](Self::build) produces a message with a new id.
#[derive(Debug, Clone, Default)]
pub struct UserMessageBuilder {
    pub message_id_prefix: Option<String>,
    pub ref_to_message_id: Option<String>,
    pub mpc: Option<String>,
    pub action: String,
    pub service_type: String,
    pub service_value: String,
    pub conversation_id: String,
    pub agreement_ref_value: String,
    pub agreement_ref_pmode: String,
    pub from_role: String,
    pub from_party_id: String,
    pub to_role: String,
    pub to_party_id: String,
    pub message_properties: Vec<Property>,
}

impl UserMessageBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.action = action.into();
        self
    }

    pub fn service(mut self, service_type: impl Into<String>, service_value: impl Into<String>) -> Self {
        self.service_type = service_type.into();
        self.service_value = service_value.into();
        self
    }

    pub fn conversation_id(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = conversation_id.into();
        self
    }

    pub fn agreement_ref(mut self, value: impl Into<String>, pmode_id: impl Into<String>) -> Self {
        self.agreement_ref_value = value.into();
        self.agreement_ref_pmode = pmode_id.into();
        self
    }

    pub fn from_party(mut self, role: impl Into<String>, party_id: impl Into<String>) -> Self {
        self.from_role = role.into();
        self.from_party_id = party_id.into();
        self
    }

    pub fn to_party(mut self, role: impl Into<String>, party_id: impl Into<String>) -> Self {
        self.to_role = role.into();
        self.to_party_id = party_id.into();
        self
    }

    pub fn property(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.message_properties.push(Property::new(name, value));
        self
    }

    pub fn ref_to_message_id(mut self, message_id: impl Into<String>) -> Self {
        self.ref_to_message_id = Some(message_id.into());
        self
    }

    pub fn mpc(mut self, mpc: impl Into<String>) -> Self {
        self.mpc = Some(mpc.into());
        self
    }

    pub fn message_id_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.message_id_prefix = Some(prefix.into());
        self
    }

    /// Fail unless every mandatory field is set.
    pub fn check_mandatory(&self) -> Result<(), As4Error> {
        let fields = [
            ("action", &self.action),
            ("service type", &self.service_type),
            ("service value", &self.service_value),
            ("conversation id", &self.conversation_id),
            ("agreement reference PMode", &self.agreement_ref_pmode),
            ("agreement reference value", &self.agreement_ref_value),
            ("from role", &self.from_role),
            ("from party id", &self.from_party_id),
            ("to role", &self.to_role),
            ("to party id", &self.to_party_id),
        ];
        let mut missing: Vec<&str> = fields
            .iter()
            .filter(|(_, value)| value.trim().is_empty())
            .map(|(name, _)| *name)
            .collect();
        if self.message_properties.is_empty() {
            missing.push("message properties (originalSender and finalRecipient)");
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(As4Error::precondition(format!(
                "mandatory fields not set: {}",
                missing.join(", ")
            )))
        }
    }

    /// Fresh message id, prefixed when a prefix is configured.
    pub fn next_message_id(&self) -> String {
        match self.message_id_prefix.as_deref().map(str::trim) {
            Some(prefix) if !prefix.is_empty() => format!("{}@{}", prefix, generate_id()),
            _ => generate_id(),
        }
    }

    /// Assemble the user message header for the given payload and attachments.
    pub fn build_user_message(&self, has_body_payload: bool, attachments: &[Attachment]) -> Result<UserMessage, As4Error> {
        self.check_mandatory()?;

        let mut payload_info = Vec::with_capacity(attachments.len() + 1);
        if has_body_payload {
            payload_info.push(PartInfo::default());
        }
        for attachment in attachments {
            let mut properties = vec![Property::new(PART_PROPERTY_MIME_TYPE, attachment.mime_type())];
            if let Some(mode) = attachment.compression() {
                properties.push(Property::new(PART_PROPERTY_COMPRESSION_TYPE, mode.mime_type()));
            }
            payload_info.push(PartInfo {
                href: Some(attachment.href()),
                properties,
            });
        }

        Ok(UserMessage {
            message_info: MessageInfo {
                timestamp: Utc::now(),
                message_id: self.next_message_id(),
                ref_to_message_id: self
                    .ref_to_message_id
                    .clone()
                    .filter(|id| !id.trim().is_empty()),
            },
            mpc: self.mpc.clone().filter(|mpc| !mpc.trim().is_empty()),
            party_info: PartyInfo {
                from: Party::new(self.from_role.as_str(), self.from_party_id.as_str()),
                to: Party::new(self.to_role.as_str(), self.to_party_id.as_str()),
            },
            collaboration_info: Some(CollaborationInfo {
                agreement_ref: Some(AgreementRef {
                    value: self.agreement_ref_value.clone(),
                    pmode: Some(self.agreement_ref_pmode.clone()),
                }),
                service: Service {
                    service_type: Some(self.service_type.clone()),
                    value: self.service_value.clone(),
                },
                action: self.action.clone(),
                conversation_id: self.conversation_id.clone(),
            }),
            payload_info,
            message_properties: self.message_properties.clone(),
        })
    }

    /// Build the SOAP document. The body carries `payload` verbatim.
    pub fn build(
        &self,
        version: SoapVersion,
        payload: Option<&str>,
        attachments: &[Attachment],
    ) -> Result<SoapDocument, As4Error> {
        if let Some(payload) = payload {
            parse_element(payload).map_err(|e| {
                As4Error::precondition(format!("body payload is not a well-formed element: {}", e))
            })?;
        }

        let user_message = self.build_user_message(payload.is_some(), attachments)?;
        debug!(
            message_id = %user_message.message_id(),
            attachments = attachments.len(),
            body_payload = payload.is_some(),
            "User message built"
        );

        let messaging = Messaging {
            user_messages: vec![user_message],
            signal_message_count: 0,
        };

        let mut document = SoapDocument::new(version);
        document.headers.push(messaging.to_element(version));
        document.body = payload.unwrap_or_default().to_string();
        Ok(document)
    }
}
