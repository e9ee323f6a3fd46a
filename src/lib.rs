//! AS4 Message Envelope and Security Pipeline
//!
//! Builds, secures and validates ebMS3/AS4 messages exchanged between
//! business partners over SOAP.
//!
//! # Features
//!
//! - PMode (processing mode) registry with validation and audit hooks
//! - Message partition channel (MPC) registry with a default channel
//! - User message construction with mandatory field checks
//! - WS-Security style signing and encryption of header, body and attachments
//! - MIME multipart packaging with scoped attachment storage
//! - Inbound `eb:Messaging` header validation producing ebMS3 error signals
//! - Receipts and error signals, SOAP fault generation
//!
//! # Example
//!
//! ```ignore
//! use as4_envelope::{As4Client, As4Config, As4Receiver};
//!
//! let config = As4Config::load("as4.yaml")?;
//! let mut client = As4Client::from_config(&config);
//! client.builder_mut().action("Deliver");
//! let response = client.send_message("https://partner.example/as4", &transport)?;
//! ```

pub mod attachment;
pub mod client;
pub mod config;
pub mod crypto;
pub mod document;
pub mod envelope;
pub mod error;
pub mod mime;
pub mod model;
pub mod mpc;
pub mod parser;
pub mod pmode;
pub mod processor;
pub mod receiver;
pub mod security;
pub mod signal;
pub mod state;
pub mod wssec;

pub use attachment::{Attachment, AttachmentStore, CompressionMode};
pub use client::{As4Client, AttachmentCompression, Transport, TransportResponse, TransportUnit};
pub use config::{As4Config, SoapVersion};
pub use error::{As4Error, EbmsError, EbmsErrorCode};
pub use envelope::UserMessageBuilder;
pub use mpc::{Mpc, MpcRegistry};
pub use pmode::{PModeConfig, PModeRegistry};
pub use processor::InboundHeaderProcessor;
pub use receiver::{As4Receiver, MessageProcessor, ProcessingOutcome};
pub use state::As4MessageState;
