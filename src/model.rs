//! ebMS3 header model.
//!
//! Typed view of the `eb:Messaging` header block. Converting to an element
//! tree is deterministic: the same values always produce the same canonical
//! bytes, which is what the signature references cover.

use crate::config::SoapVersion;
use crate::document::XmlElement;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// ebMS3 core namespace.
pub const EBMS_NS: &str = "http://docs.oasis-open.org/ebxml-msg/ebms/v3.0/ns/core/200704/";

/// `wsu:Id` of the Messaging header.
pub const MESSAGING_ID: &str = "_messaging";

/// Property name of the payload MIME type in a PartInfo.
pub const PART_PROPERTY_MIME_TYPE: &str = "MimeType";

/// Property name of the compression MIME type in a PartInfo.
pub const PART_PROPERTY_COMPRESSION_TYPE: &str = "CompressionType";

/// Prefix of attachment references in PartInfo hrefs.
pub const CID_PREFIX: &str = "cid:";

/// The `eb:Messaging` header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Messaging {
    pub user_messages: Vec<UserMessage>,
    /// Number of signal message units, which are not modeled further
    pub signal_message_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserMessage {
    pub message_info: MessageInfo,
    /// Message partition channel; absent means the default channel
    pub mpc: Option<String>,
    pub party_info: PartyInfo,
    pub collaboration_info: Option<CollaborationInfo>,
    pub payload_info: Vec<PartInfo>,
    pub message_properties: Vec<Property>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageInfo {
    pub timestamp: DateTime<Utc>,
    pub message_id: String,
    pub ref_to_message_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartyInfo {
    pub from: Party,
    pub to: Party,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Party {
    pub role: String,
    pub party_ids: Vec<PartyId>,
}

impl Party {
    /// Party with a single untyped id.
    pub fn new(role: impl Into<String>, party_id: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            party_ids: vec![PartyId {
                party_type: None,
                value: party_id.into(),
            }],
        }
    }

    /// Value of the first party id.
    pub fn primary_id(&self) -> Option<&str> {
        self.party_ids.first().map(|p| p.value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PartyId {
    #[serde(default, rename = "type")]
    pub party_type: Option<String>,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollaborationInfo {
    pub agreement_ref: Option<AgreementRef>,
    pub service: Service,
    pub action: String,
    pub conversation_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgreementRef {
    pub value: String,
    /// PMode id the agreement refers to
    pub pmode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Service {
    #[serde(default, rename = "type")]
    pub service_type: Option<String>,
    pub value: String,
}

/// Descriptor of one payload part.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PartInfo {
    /// `cid:` reference to an attachment; absent for the body payload
    pub href: Option<String>,
    pub properties: Vec<Property>,
}

impl PartInfo {
    /// Property value, matching the name case-insensitively.
    pub fn property(&self, name: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|p| p.name.eq_ignore_ascii_case(name))
            .map(|p| p.value.as_str())
    }

    /// Attachment content id with the `cid:` prefix stripped.
    pub fn content_id(&self) -> Option<&str> {
        self.href
            .as_deref()
            .map(|href| href.strip_prefix(CID_PREFIX).unwrap_or(href))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub name: String,
    pub value: String,
}

impl Property {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Render a timestamp the way it appears on the wire.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn eb(local_name: &str) -> XmlElement {
    XmlElement::new("eb", local_name, EBMS_NS)
}

impl Messaging {
    /// Build the header block for the given SOAP version.
    pub fn to_element(&self, version: SoapVersion) -> XmlElement {
        let mut messaging = eb("Messaging")
            .with_attr("xmlns:eb", EBMS_NS)
            .with_attr(
                &format!("{}:mustUnderstand", version.prefix()),
                version.must_understand_value(true),
            )
            .with_attr("wsu:Id", MESSAGING_ID);
        for user_message in &self.user_messages {
            messaging.push(user_message.to_element());
        }
        messaging
    }

    /// Map a parsed header block onto the typed model, collecting every
    /// structural problem found.
    pub fn from_element(element: &XmlElement) -> Result<Self, Vec<String>> {
        let mut errors = Vec::new();

        if element.local_name != "Messaging" || element.namespace.as_deref() != Some(EBMS_NS) {
            errors.push(format!(
                "expected eb:Messaging in namespace {}, found {}",
                EBMS_NS,
                element.qualified_name()
            ));
            return Err(errors);
        }

        let mut user_messages = Vec::new();
        for (idx, child) in element.children_named("UserMessage").enumerate() {
            let before = errors.len();
            let user_message = UserMessage::from_element(child, &mut errors);
            if errors.len() > before {
                for error in errors.iter_mut().skip(before) {
                    *error = format!("UserMessage[{}]: {}", idx, error);
                }
            } else if let Some(user_message) = user_message {
                user_messages.push(user_message);
            }
        }

        if errors.is_empty() {
            Ok(Self {
                user_messages,
                signal_message_count: element.children_named("SignalMessage").count(),
            })
        } else {
            Err(errors)
        }
    }
}

impl UserMessage {
    pub fn message_id(&self) -> &str {
        &self.message_info.message_id
    }

    pub fn to_element(&self) -> XmlElement {
        let mut user_message = eb("UserMessage");
        if let Some(ref mpc) = self.mpc {
            user_message.set_attr("mpc", mpc.as_str());
        }

        let mut message_info = eb("MessageInfo")
            .with_child(eb("Timestamp").with_text(format_timestamp(&self.message_info.timestamp)))
            .with_child(eb("MessageId").with_text(self.message_info.message_id.as_str()));
        if let Some(ref ref_to) = self.message_info.ref_to_message_id {
            message_info.push(eb("RefToMessageId").with_text(ref_to.as_str()));
        }
        user_message.push(message_info);

        user_message.push(
            eb("PartyInfo")
                .with_child(party_element("From", &self.party_info.from))
                .with_child(party_element("To", &self.party_info.to)),
        );

        if let Some(ref collaboration) = self.collaboration_info {
            let mut element = eb("CollaborationInfo");
            if let Some(ref agreement) = collaboration.agreement_ref {
                let mut agreement_el = eb("AgreementRef").with_text(agreement.value.as_str());
                if let Some(ref pmode) = agreement.pmode {
                    agreement_el.set_attr("pmode", pmode.as_str());
                }
                element.push(agreement_el);
            }
            let mut service = eb("Service").with_text(collaboration.service.value.as_str());
            if let Some(ref service_type) = collaboration.service.service_type {
                service.set_attr("type", service_type.as_str());
            }
            element.push(service);
            element.push(eb("Action").with_text(collaboration.action.as_str()));
            element.push(eb("ConversationId").with_text(collaboration.conversation_id.as_str()));
            user_message.push(element);
        }

        if !self.message_properties.is_empty() {
            user_message.push(properties_element("MessageProperties", &self.message_properties));
        }

        if !self.payload_info.is_empty() {
            let mut payload_info = eb("PayloadInfo");
            for part in &self.payload_info {
                let mut part_el = eb("PartInfo");
                if let Some(ref href) = part.href {
                    part_el.set_attr("href", href.as_str());
                }
                if !part.properties.is_empty() {
                    part_el.push(properties_element("PartProperties", &part.properties));
                }
                payload_info.push(part_el);
            }
            user_message.push(payload_info);
        }

        user_message
    }

    fn from_element(element: &XmlElement, errors: &mut Vec<String>) -> Option<Self> {
        let message_info = match element.child("MessageInfo") {
            Some(info) => parse_message_info(info, errors),
            None => {
                errors.push("missing MessageInfo".to_string());
                None
            }
        };

        let party_info = match element.child("PartyInfo") {
            Some(info) => PartyInfo {
                from: parse_party(info, "From", errors),
                to: parse_party(info, "To", errors),
            },
            None => {
                errors.push("missing PartyInfo".to_string());
                PartyInfo::default()
            }
        };

        let collaboration_info = element
            .child("CollaborationInfo")
            .map(|c| parse_collaboration_info(c, errors));

        let message_properties = element
            .child("MessageProperties")
            .map(|p| parse_properties(p, errors))
            .unwrap_or_default();

        let payload_info = element
            .child("PayloadInfo")
            .map(|p| {
                p.children_named("PartInfo")
                    .map(|part| PartInfo {
                        href: part.attr("href").map(str::to_string),
                        properties: part
                            .child("PartProperties")
                            .map(|props| parse_properties(props, errors))
                            .unwrap_or_default(),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Some(Self {
            message_info: message_info?,
            mpc: element.attr("mpc").map(str::to_string),
            party_info,
            collaboration_info,
            payload_info,
            message_properties,
        })
    }
}

fn party_element(name: &str, party: &Party) -> XmlElement {
    let mut element = eb(name);
    for party_id in &party.party_ids {
        let mut id = eb("PartyId").with_text(party_id.value.as_str());
        if let Some(ref party_type) = party_id.party_type {
            id.set_attr("type", party_type.as_str());
        }
        element.push(id);
    }
    element.push(eb("Role").with_text(party.role.as_str()));
    element
}

fn properties_element(name: &str, properties: &[Property]) -> XmlElement {
    let mut element = eb(name);
    for property in properties {
        element.push(
            eb("Property")
                .with_attr("name", property.name.as_str())
                .with_text(property.value.as_str()),
        );
    }
    element
}

fn required_text(parent: &XmlElement, name: &str, errors: &mut Vec<String>) -> String {
    match parent.child(name).map(|c| c.text_trimmed()) {
        Some(text) if !text.is_empty() => text.to_string(),
        Some(_) => {
            errors.push(format!("{}/{} is empty", parent.local_name, name));
            String::new()
        }
        None => {
            errors.push(format!("{}/{} is missing", parent.local_name, name));
            String::new()
        }
    }
}

fn parse_message_info(element: &XmlElement, errors: &mut Vec<String>) -> Option<MessageInfo> {
    let timestamp_text = required_text(element, "Timestamp", errors);
    let message_id = required_text(element, "MessageId", errors);

    let timestamp = if timestamp_text.is_empty() {
        None
    } else {
        match DateTime::parse_from_rfc3339(&timestamp_text) {
            Ok(ts) => Some(ts.with_timezone(&Utc)),
            Err(e) => {
                errors.push(format!("MessageInfo/Timestamp '{}' is invalid: {}", timestamp_text, e));
                None
            }
        }
    };

    let ref_to_message_id = element
        .child("RefToMessageId")
        .map(|r| r.text_trimmed().to_string())
        .filter(|r| !r.is_empty());

    Some(MessageInfo {
        timestamp: timestamp?,
        message_id,
        ref_to_message_id,
    })
}

fn parse_party(party_info: &XmlElement, name: &str, errors: &mut Vec<String>) -> Party {
    let Some(element) = party_info.child(name) else {
        errors.push(format!("PartyInfo/{} is missing", name));
        return Party::default();
    };

    let party_ids: Vec<PartyId> = element
        .children_named("PartyId")
        .map(|id| PartyId {
            party_type: id.attr("type").map(str::to_string),
            value: id.text_trimmed().to_string(),
        })
        .collect();
    if party_ids.is_empty() || party_ids.iter().any(|p| p.value.is_empty()) {
        errors.push(format!("PartyInfo/{} requires at least one non-empty PartyId", name));
    }

    Party {
        role: required_text(element, "Role", errors),
        party_ids,
    }
}

fn parse_collaboration_info(element: &XmlElement, errors: &mut Vec<String>) -> CollaborationInfo {
    let agreement_ref = element.child("AgreementRef").map(|a| AgreementRef {
        value: a.text_trimmed().to_string(),
        pmode: a.attr("pmode").map(str::to_string),
    });

    let service = match element.child("Service") {
        Some(s) if !s.text_trimmed().is_empty() => Service {
            service_type: s.attr("type").map(str::to_string),
            value: s.text_trimmed().to_string(),
        },
        _ => {
            errors.push("CollaborationInfo/Service is missing or empty".to_string());
            Service::default()
        }
    };

    CollaborationInfo {
        agreement_ref,
        service,
        action: required_text(element, "Action", errors),
        conversation_id: required_text(element, "ConversationId", errors),
    }
}

fn parse_properties(element: &XmlElement, errors: &mut Vec<String>) -> Vec<Property> {
    element
        .children_named("Property")
        .filter_map(|p| match p.attr("name") {
            Some(name) if !name.trim().is_empty() => {
                Some(Property::new(name, p.text_trimmed()))
            }
            _ => {
                errors.push(format!("{}/Property without a name", element.local_name));
                None
            }
        })
        .collect()
}
