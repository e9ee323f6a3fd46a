//! Configuration types for the AS4 pipeline.

use crate::crypto::{DigestAlgorithm, EncryptAlgorithm, SignAlgorithm};
use crate::error::{As4Error, Locale};
use crate::mpc::Mpc;
use crate::pmode::PModeConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// SOAP namespace URIs.
pub const SOAP_11_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const SOAP_12_NS: &str = "http://www.w3.org/2003/05/soap-envelope";

/// Main configuration for an AS4 endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct As4Config {
    /// Config version
    pub version: String,

    /// General settings
    pub settings: SettingsConfig,

    /// Keystore and default algorithms
    pub crypto: CryptoConfig,

    /// Message partition channels known to this endpoint
    pub mpcs: Vec<Mpc>,

    /// Processing modes known to this endpoint
    pub pmodes: Vec<PModeConfig>,
}

impl Default for As4Config {
    fn default() -> Self {
        Self {
            version: "1".to_string(),
            settings: SettingsConfig::default(),
            crypto: CryptoConfig::default(),
            mpcs: vec![Mpc::default_mpc()],
            pmodes: Vec::new(),
        }
    }
}

impl As4Config {
    /// Parse configuration from YAML text.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, As4Error> {
        serde_yaml::from_str(yaml).map_err(|e| As4Error::Config(format!("invalid YAML: {}", e)))
    }

    /// Load configuration from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, As4Error> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&content)
    }
}

/// General settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SettingsConfig {
    /// Maximum inbound message size (bytes)
    pub max_body_size: usize,

    /// SOAP version used for outbound messages
    pub soap_version: SoapVersion,

    /// Locale used to render ebMS error descriptions
    pub locale: Locale,

    /// Optional prefix for generated message ids
    pub message_id_prefix: Option<String>,
}

impl Default for SettingsConfig {
    fn default() -> Self {
        Self {
            max_body_size: 16 * 1_048_576, // 16MB
            soap_version: SoapVersion::default(),
            locale: Locale::default(),
            message_id_prefix: None,
        }
    }
}

/// SOAP versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SoapVersion {
    /// SOAP 1.1 (namespace: http://schemas.xmlsoap.org/soap/envelope/)
    #[serde(rename = "1.1")]
    Soap11,
    /// SOAP 1.2 (namespace: http://www.w3.org/2003/05/soap-envelope), the AS4 default
    #[serde(rename = "1.2")]
    #[default]
    Soap12,
}

impl SoapVersion {
    pub fn namespace_uri(&self) -> &'static str {
        match self {
            Self::Soap11 => SOAP_11_NS,
            Self::Soap12 => SOAP_12_NS,
        }
    }

    pub fn from_namespace_uri(uri: &str) -> Option<Self> {
        match uri {
            SOAP_11_NS => Some(Self::Soap11),
            SOAP_12_NS => Some(Self::Soap12),
            _ => None,
        }
    }

    /// Namespace prefix used when serializing.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::Soap11 => "S11",
            Self::Soap12 => "S12",
        }
    }

    /// MIME type of a bare envelope.
    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Soap11 => "text/xml",
            Self::Soap12 => "application/soap+xml",
        }
    }

    /// Value of the `mustUnderstand` attribute.
    pub fn must_understand_value(&self, must_understand: bool) -> &'static str {
        match (self, must_understand) {
            (Self::Soap11, true) => "1",
            (Self::Soap11, false) => "0",
            (Self::Soap12, true) => "true",
            (Self::Soap12, false) => "false",
        }
    }
}

/// Keystore and algorithm defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CryptoConfig {
    /// Keystore used for signing, encryption and verification
    pub keystore: Option<KeystoreConfig>,

    /// Default signature algorithm for outbound messages
    pub sign_algorithm: Option<SignAlgorithm>,

    /// Default signature digest algorithm
    pub sign_digest_algorithm: Option<DigestAlgorithm>,

    /// Default encryption algorithm
    pub encrypt_algorithm: Option<EncryptAlgorithm>,
}

/// Keystore location and credentials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeystoreConfig {
    /// Path to the keystore file
    pub path: PathBuf,

    /// Keystore type
    #[serde(rename = "type", default = "default_keystore_type")]
    pub keystore_type: String,

    /// Alias of the own key entry
    pub alias: String,

    /// Password of the key entry
    pub password: String,
}

fn default_keystore_type() -> String {
    "yaml".to_string()
}

impl KeystoreConfig {
    /// Check that the keystore exists and is fully specified.
    ///
    /// Runs before any cryptographic call is attempted.
    pub fn validate(&self) -> Result<(), As4Error> {
        if self.path.as_os_str().is_empty() {
            return Err(As4Error::precondition("Key store file is not configured"));
        }
        if !self.path.exists() {
            return Err(As4Error::precondition(format!(
                "Key store file does not exist: {}",
                self.path.display()
            )));
        }
        if self.keystore_type.trim().is_empty() {
            return Err(As4Error::precondition("Key store type is not configured"));
        }
        if self.alias.trim().is_empty() {
            return Err(As4Error::precondition("Key store alias is not configured"));
        }
        if self.password.trim().is_empty() {
            return Err(As4Error::precondition("Key store password is not configured"));
        }
        Ok(())
    }
}
