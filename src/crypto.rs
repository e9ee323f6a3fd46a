//! Cryptographic algorithm selection and keystore access.
//!
//! Algorithms are closed enums; every use site matches exhaustively, so adding
//! an algorithm is a compile-checked change. The primitives themselves come
//! from `sha2`, `ed25519-dalek`, `aes-gcm` and `chacha20poly1305`.
//!
//! Content keys travel to the recipient by ephemeral-static X25519 key
//! agreement. The shared secret is run through HKDF-SHA256 and the result
//! wraps the content key with AES-256-GCM. A keystore entry therefore holds
//! a private half only for the own alias; partner entries are public keys.

use crate::config::KeystoreConfig;
use crate::error::As4Error;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::{XChaCha20Poly1305, XNonce};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;
use x25519_dalek::{EphemeralSecret, PublicKey as AgreementKey, SharedSecret, StaticSecret};

/// Algorithm wrapping content-encryption keys with the derived key.
pub const KEY_WRAP_URI: &str = "http://www.w3.org/2009/xmlenc11#aes256-gcm";

/// Key agreement producing the key-wrapping key.
pub const KEY_AGREEMENT_URI: &str = "http://www.w3.org/2021/04/xmldsig-more#x25519";

/// HKDF context string binding derived keys to their use.
const KEY_WRAP_INFO: &[u8] = b"as4-envelope content key wrap";

/// Signature algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SignAlgorithm {
    #[serde(rename = "ed25519")]
    #[default]
    Ed25519,
}

impl SignAlgorithm {
    pub fn uri(&self) -> &'static str {
        match self {
            Self::Ed25519 => "http://www.w3.org/2021/04/xmldsig-more#eddsa-ed25519",
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        [Self::Ed25519].into_iter().find(|a| a.uri() == uri)
    }
}

/// Digest algorithms used for signature references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl DigestAlgorithm {
    pub fn uri(&self) -> &'static str {
        match self {
            Self::Sha256 => "http://www.w3.org/2001/04/xmlenc#sha256",
            Self::Sha384 => "http://www.w3.org/2001/04/xmldsig-more#sha384",
            Self::Sha512 => "http://www.w3.org/2001/04/xmlenc#sha512",
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        [Self::Sha256, Self::Sha384, Self::Sha512]
            .into_iter()
            .find(|a| a.uri() == uri)
    }

    pub fn digest(&self, data: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha256 => Sha256::digest(data).to_vec(),
            Self::Sha384 => Sha384::digest(data).to_vec(),
            Self::Sha512 => Sha512::digest(data).to_vec(),
        }
    }
}

/// Content encryption algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum EncryptAlgorithm {
    /// AS4 profile default
    #[serde(rename = "aes128-gcm")]
    #[default]
    Aes128Gcm,
    #[serde(rename = "aes256-gcm")]
    Aes256Gcm,
    #[serde(rename = "xchacha20-poly1305")]
    XChaCha20Poly1305,
}

impl EncryptAlgorithm {
    pub fn uri(&self) -> &'static str {
        match self {
            Self::Aes128Gcm => "http://www.w3.org/2009/xmlenc11#aes128-gcm",
            Self::Aes256Gcm => "http://www.w3.org/2009/xmlenc11#aes256-gcm",
            Self::XChaCha20Poly1305 => "urn:as4-envelope:xmlenc:xchacha20-poly1305",
        }
    }

    pub fn from_uri(uri: &str) -> Option<Self> {
        [Self::Aes128Gcm, Self::Aes256Gcm, Self::XChaCha20Poly1305]
            .into_iter()
            .find(|a| a.uri() == uri)
    }

    pub fn key_len(&self) -> usize {
        match self {
            Self::Aes128Gcm => 16,
            Self::Aes256Gcm | Self::XChaCha20Poly1305 => 32,
        }
    }

    fn nonce_len(&self) -> usize {
        match self {
            Self::Aes128Gcm | Self::Aes256Gcm => 12,
            Self::XChaCha20Poly1305 => 24,
        }
    }

    /// Generate a fresh random content-encryption key.
    pub fn generate_key(&self) -> Vec<u8> {
        let mut key = vec![0u8; self.key_len()];
        rand::thread_rng().fill_bytes(&mut key);
        key
    }

    /// Encrypt and return `nonce || ciphertext`.
    pub fn encrypt(&self, key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, As4Error> {
        let mut nonce = vec![0u8; self.nonce_len()];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = match self {
            Self::Aes128Gcm => Aes128Gcm::new_from_slice(key)
                .map_err(|e| As4Error::security(format!("invalid AES-128 key: {}", e)))?
                .encrypt(aes_gcm::Nonce::from_slice(&nonce), plaintext),
            Self::Aes256Gcm => Aes256Gcm::new_from_slice(key)
                .map_err(|e| As4Error::security(format!("invalid AES-256 key: {}", e)))?
                .encrypt(aes_gcm::Nonce::from_slice(&nonce), plaintext),
            Self::XChaCha20Poly1305 => XChaCha20Poly1305::new_from_slice(key)
                .map_err(|e| As4Error::security(format!("invalid XChaCha20 key: {}", e)))?
                .encrypt(XNonce::from_slice(&nonce), plaintext),
        }
        .map_err(|e| As4Error::security(format!("encryption failed: {}", e)))?;

        nonce.extend_from_slice(&ciphertext);
        Ok(nonce)
    }

    /// Decrypt `nonce || ciphertext`.
    pub fn decrypt(&self, key: &[u8], data: &[u8]) -> Result<Vec<u8>, As4Error> {
        let nonce_len = self.nonce_len();
        if data.len() < nonce_len {
            return Err(As4Error::security("ciphertext shorter than nonce"));
        }
        let (nonce, ciphertext) = data.split_at(nonce_len);

        match self {
            Self::Aes128Gcm => Aes128Gcm::new_from_slice(key)
                .map_err(|e| As4Error::security(format!("invalid AES-128 key: {}", e)))?
                .decrypt(aes_gcm::Nonce::from_slice(nonce), ciphertext),
            Self::Aes256Gcm => Aes256Gcm::new_from_slice(key)
                .map_err(|e| As4Error::security(format!("invalid AES-256 key: {}", e)))?
                .decrypt(aes_gcm::Nonce::from_slice(nonce), ciphertext),
            Self::XChaCha20Poly1305 => XChaCha20Poly1305::new_from_slice(key)
                .map_err(|e| As4Error::security(format!("invalid XChaCha20 key: {}", e)))?
                .decrypt(XNonce::from_slice(nonce), ciphertext),
        }
        .map_err(|_| As4Error::security("decryption failed: authentication tag mismatch"))
    }
}

fn wrap_key(kek: &[u8; 32], cek: &[u8]) -> Result<Vec<u8>, As4Error> {
    EncryptAlgorithm::Aes256Gcm.encrypt(kek, cek)
}

fn unwrap_key(kek: &[u8; 32], wrapped: &[u8]) -> Result<Vec<u8>, As4Error> {
    EncryptAlgorithm::Aes256Gcm.decrypt(kek, wrapped)
}

/// Key-wrapping key for one agreement, salted with both public keys.
fn derive_kek(
    shared: &SharedSecret,
    originator: &AgreementKey,
    recipient: &AgreementKey,
) -> Result<[u8; 32], As4Error> {
    if !shared.was_contributory() {
        return Err(As4Error::security("key agreement with a low-order public key"));
    }
    let mut salt = [0u8; 64];
    salt[..32].copy_from_slice(originator.as_bytes());
    salt[32..].copy_from_slice(recipient.as_bytes());

    let mut kek = [0u8; 32];
    Hkdf::<Sha256>::new(Some(&salt), shared.as_bytes())
        .expand(KEY_WRAP_INFO, &mut kek)
        .map_err(|e| As4Error::security(format!("key derivation failed: {}", e)))?;
    Ok(kek)
}

/// A content-encryption key wrapped for one recipient.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    /// Ephemeral X25519 public key of the sender
    pub originator_key: [u8; 32],
    /// `nonce || ciphertext` of the content key
    pub wrapped: Vec<u8>,
}

/// On-disk keystore layout.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeystoreFile {
    pub entries: BTreeMap<String, KeystoreFileEntry>,
}

/// One keystore entry, all binary values hex encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeystoreFileEntry {
    /// SHA-256 of the entry password; entries without one are trusted partner keys
    #[serde(default)]
    pub password_sha256: Option<String>,
    /// Ed25519 seed; only present for the own key
    #[serde(default)]
    pub signing_seed: Option<String>,
    pub verifying_key: String,
    /// X25519 secret; only present for the own key
    #[serde(default)]
    pub agreement_secret: Option<String>,
    /// X25519 public key content keys are wrapped for
    pub agreement_key: String,
}

impl KeystoreFile {
    /// Add a freshly generated private entry.
    pub fn add_generated_entry(&mut self, alias: &str, password: &str) -> &KeystoreFileEntry {
        let signing_key = SigningKey::generate(&mut OsRng);
        let agreement_secret = StaticSecret::random_from_rng(OsRng);
        let entry = KeystoreFileEntry {
            password_sha256: Some(hex::encode(Sha256::digest(password.as_bytes()))),
            signing_seed: Some(hex::encode(signing_key.to_bytes())),
            verifying_key: hex::encode(signing_key.verifying_key().to_bytes()),
            agreement_secret: Some(hex::encode(agreement_secret.to_bytes())),
            agreement_key: hex::encode(AgreementKey::from(&agreement_secret).as_bytes()),
        };
        self.entries.insert(alias.to_string(), entry);
        &self.entries[alias]
    }

    /// Copy of an entry holding only public keys, for the partner's keystore.
    pub fn public_entry(&self, alias: &str) -> Option<KeystoreFileEntry> {
        self.entries.get(alias).map(|e| KeystoreFileEntry {
            password_sha256: None,
            signing_seed: None,
            verifying_key: e.verifying_key.clone(),
            agreement_secret: None,
            agreement_key: e.agreement_key.clone(),
        })
    }

    pub fn to_yaml(&self) -> Result<String, As4Error> {
        serde_yaml::to_string(self).map_err(|e| As4Error::Config(e.to_string()))
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<(), As4Error> {
        std::fs::write(path, self.to_yaml()?)?;
        Ok(())
    }
}

struct KeyEntry {
    signing_key: Option<SigningKey>,
    verifying_key: VerifyingKey,
    agreement_secret: Option<StaticSecret>,
    agreement_key: AgreementKey,
}

/// An opened keystore.
pub struct Keystore {
    alias: String,
    entries: BTreeMap<String, KeyEntry>,
}

impl std::fmt::Debug for Keystore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keystore")
            .field("alias", &self.alias)
            .field("entries", &self.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Keystore {
    /// Open the keystore described by `config`.
    ///
    /// Fails with a precondition error when the config is incomplete and with a
    /// security error when the key material cannot be unlocked.
    pub fn open(config: &KeystoreConfig) -> Result<Self, As4Error> {
        config.validate()?;

        if !config.keystore_type.eq_ignore_ascii_case("yaml") {
            return Err(As4Error::security(format!(
                "unsupported keystore type '{}'",
                config.keystore_type
            )));
        }

        let content = std::fs::read_to_string(&config.path)?;
        let file: KeystoreFile = serde_yaml::from_str(&content)
            .map_err(|e| As4Error::security(format!("unreadable keystore: {}", e)))?;

        Self::from_file(file, &config.alias, &config.password)
    }

    /// Build a keystore from already loaded key material.
    pub fn from_file(file: KeystoreFile, alias: &str, password: &str) -> Result<Self, As4Error> {
        let own = file
            .entries
            .get(alias)
            .ok_or_else(|| As4Error::security(format!("no key entry with alias '{}'", alias)))?;

        let expected = own
            .password_sha256
            .as_deref()
            .ok_or_else(|| As4Error::security(format!("key entry '{}' is not a private entry", alias)))?;
        if !hex::encode(Sha256::digest(password.as_bytes())).eq_ignore_ascii_case(expected) {
            return Err(As4Error::security(format!("wrong password for key entry '{}'", alias)));
        }

        let mut entries = BTreeMap::new();
        for (entry_alias, entry) in file.entries {
            entries.insert(entry_alias.clone(), decode_entry(&entry_alias, &entry)?);
        }

        match entries.get(alias) {
            Some(own) if own.signing_key.is_none() => {
                return Err(As4Error::security(format!("key entry '{}' has no signing key", alias)))
            }
            Some(own) if own.agreement_secret.is_none() => {
                return Err(As4Error::security(format!("key entry '{}' has no agreement secret", alias)))
            }
            _ => {}
        }

        debug!(alias = %alias, entries = entries.len(), "Keystore opened");

        Ok(Self {
            alias: alias.to_string(),
            entries,
        })
    }

    /// Alias of the own key entry.
    pub fn alias(&self) -> &str {
        &self.alias
    }

    pub fn contains(&self, alias: &str) -> bool {
        self.entries.contains_key(alias)
    }

    pub fn verifying_key(&self, alias: &str) -> Option<&VerifyingKey> {
        self.entries.get(alias).map(|e| &e.verifying_key)
    }

    pub fn agreement_key(&self, alias: &str) -> Option<&AgreementKey> {
        self.entries.get(alias).map(|e| &e.agreement_key)
    }

    /// Wrap a content key so only the holder of `recipient_alias`'s secret can unwrap it.
    pub fn wrap_content_key(&self, recipient_alias: &str, cek: &[u8]) -> Result<WrappedKey, As4Error> {
        let recipient = self
            .agreement_key(recipient_alias)
            .ok_or_else(|| As4Error::security(format!("no agreement key for '{}'", recipient_alias)))?;
        let ephemeral = EphemeralSecret::random_from_rng(OsRng);
        let originator = AgreementKey::from(&ephemeral);
        let shared = ephemeral.diffie_hellman(recipient);
        let kek = derive_kek(&shared, &originator, recipient)?;
        Ok(WrappedKey {
            originator_key: originator.to_bytes(),
            wrapped: wrap_key(&kek, cek)?,
        })
    }

    /// Unwrap a content key addressed to the own alias.
    pub fn unwrap_content_key(&self, key: &WrappedKey) -> Result<Vec<u8>, As4Error> {
        let own = self
            .entries
            .get(&self.alias)
            .ok_or_else(|| As4Error::security("own key entry unavailable"))?;
        let secret = own
            .agreement_secret
            .as_ref()
            .ok_or_else(|| As4Error::security("own agreement secret unavailable"))?;
        let originator = AgreementKey::from(key.originator_key);
        let shared = secret.diffie_hellman(&originator);
        let kek = derive_kek(&shared, &originator, &own.agreement_key)?;
        unwrap_key(&kek, &key.wrapped)
            .map_err(|_| As4Error::security(format!("content key is not wrapped for '{}'", self.alias)))
    }

    /// Sign with the own key.
    pub fn sign(&self, algorithm: SignAlgorithm, data: &[u8]) -> Result<Vec<u8>, As4Error> {
        let signing_key = self
            .entries
            .get(&self.alias)
            .and_then(|e| e.signing_key.as_ref())
            .ok_or_else(|| As4Error::security("own signing key unavailable"))?;
        match algorithm {
            SignAlgorithm::Ed25519 => Ok(signing_key.sign(data).to_bytes().to_vec()),
        }
    }

    /// Verify a signature made by the entry `alias`.
    pub fn verify(
        &self,
        algorithm: SignAlgorithm,
        alias: &str,
        data: &[u8],
        signature: &[u8],
    ) -> Result<(), As4Error> {
        let key = self
            .verifying_key(alias)
            .ok_or_else(|| As4Error::security(format!("no trusted key for '{}'", alias)))?;
        match algorithm {
            SignAlgorithm::Ed25519 => {
                let bytes: [u8; 64] = signature
                    .try_into()
                    .map_err(|_| As4Error::security("Ed25519 signature must be 64 bytes"))?;
                key.verify(data, &ed25519_dalek::Signature::from_bytes(&bytes))
                    .map_err(|e| As4Error::security(format!("signature mismatch: {}", e)))
            }
        }
    }
}

fn decode_entry(alias: &str, entry: &KeystoreFileEntry) -> Result<KeyEntry, As4Error> {
    let signing_key = entry
        .signing_seed
        .as_deref()
        .map(|seed| decode_32(alias, "signing_seed", seed).map(|b| SigningKey::from_bytes(&b)))
        .transpose()?;

    let verifying_bytes = decode_32(alias, "verifying_key", &entry.verifying_key)?;
    let verifying_key = VerifyingKey::from_bytes(&verifying_bytes)
        .map_err(|e| As4Error::security(format!("invalid verifying key for '{}': {}", alias, e)))?;

    if let Some(ref sk) = signing_key {
        if sk.verifying_key() != verifying_key {
            return Err(As4Error::security(format!(
                "verifying key of '{}' does not match its signing key",
                alias
            )));
        }
    }

    let agreement_secret = entry
        .agreement_secret
        .as_deref()
        .map(|secret| decode_32(alias, "agreement_secret", secret).map(StaticSecret::from))
        .transpose()?;
    let agreement_key = AgreementKey::from(decode_32(alias, "agreement_key", &entry.agreement_key)?);

    if let Some(ref secret) = agreement_secret {
        if AgreementKey::from(secret) != agreement_key {
            return Err(As4Error::security(format!(
                "agreement key of '{}' does not match its secret",
                alias
            )));
        }
    }

    Ok(KeyEntry {
        signing_key,
        verifying_key,
        agreement_secret,
        agreement_key,
    })
}

fn decode_32(alias: &str, field: &str, value: &str) -> Result<[u8; 32], As4Error> {
    let bytes = hex::decode(value.trim())
        .map_err(|e| As4Error::security(format!("{} of '{}' is not hex: {}", field, alias, e)))?;
    bytes
        .try_into()
        .map_err(|_| As4Error::security(format!("{} of '{}' must be 32 bytes", field, alias)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keystore_file() -> KeystoreFile {
        let mut file = KeystoreFile::default();
        file.add_generated_entry("sender", "changeit");
        file
    }

    #[test]
    fn test_algorithm_uri_roundtrip() {
        for alg in [EncryptAlgorithm::Aes128Gcm, EncryptAlgorithm::Aes256Gcm, EncryptAlgorithm::XChaCha20Poly1305] {
            assert_eq!(EncryptAlgorithm::from_uri(alg.uri()), Some(alg));
        }
        assert_eq!(DigestAlgorithm::from_uri(DigestAlgorithm::Sha512.uri()), Some(DigestAlgorithm::Sha512));
        assert_eq!(SignAlgorithm::from_uri("urn:unknown"), None);
    }

    #[test]
    fn test_digest_lengths() {
        assert_eq!(DigestAlgorithm::Sha256.digest(b"abc").len(), 32);
        assert_eq!(DigestAlgorithm::Sha384.digest(b"abc").len(), 48);
        assert_eq!(DigestAlgorithm::Sha512.digest(b"abc").len(), 64);
    }

    #[test]
    fn test_encrypt_decrypt_each_algorithm() {
        for alg in [EncryptAlgorithm::Aes128Gcm, EncryptAlgorithm::Aes256Gcm, EncryptAlgorithm::XChaCha20Poly1305] {
            let key = alg.generate_key();
            let ciphertext = alg.encrypt(&key, b"invoice 4711").unwrap();
            assert_eq!(alg.decrypt(&key, &ciphertext).unwrap(), b"invoice 4711");
        }
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let alg = EncryptAlgorithm::Aes128Gcm;
        let key = alg.generate_key();
        let mut ciphertext = alg.encrypt(&key, b"secret").unwrap();
        let last = ciphertext.len() - 1;
        ciphertext[last] ^= 0xFF;
        assert!(matches!(alg.decrypt(&key, &ciphertext), Err(As4Error::Security(_))));
    }

    #[test]
    fn test_key_wrap_roundtrip() {
        let kek = [7u8; 32];
        let cek = EncryptAlgorithm::Aes128Gcm.generate_key();
        let wrapped = wrap_key(&kek, &cek).unwrap();
        assert_eq!(unwrap_key(&kek, &wrapped).unwrap(), cek);
        assert!(unwrap_key(&[8u8; 32], &wrapped).is_err());
    }

    /// Own keystores of `sender` and `receiver`, each trusting the other's public entry.
    fn partner_keystores() -> (Keystore, Keystore) {
        let mut sender = keystore_file();
        let mut receiver = KeystoreFile::default();
        receiver.add_generated_entry("receiver", "pw");
        sender
            .entries
            .insert("receiver".to_string(), receiver.public_entry("receiver").unwrap());
        receiver
            .entries
            .insert("sender".to_string(), sender.public_entry("sender").unwrap());
        (
            Keystore::from_file(sender, "sender", "changeit").unwrap(),
            Keystore::from_file(receiver, "receiver", "pw").unwrap(),
        )
    }

    #[test]
    fn test_public_entry_carries_no_secret() {
        let file = keystore_file();
        let own = &file.entries["sender"];
        let public = file.public_entry("sender").unwrap();
        assert!(public.password_sha256.is_none());
        assert!(public.signing_seed.is_none());
        assert!(public.agreement_secret.is_none());
        assert_eq!(public.verifying_key, own.verifying_key);
        assert_eq!(public.agreement_key, own.agreement_key);

        let yaml = KeystoreFile {
            entries: BTreeMap::from([("sender".to_string(), public)]),
        }
        .to_yaml()
        .unwrap();
        assert!(!yaml.contains(own.agreement_secret.as_deref().unwrap()));
        assert!(!yaml.contains(own.signing_seed.as_deref().unwrap()));
    }

    #[test]
    fn test_content_key_wrap_for_recipient() {
        let (sender, receiver) = partner_keystores();
        let cek = EncryptAlgorithm::Aes256Gcm.generate_key();
        let wrapped = sender.wrap_content_key("receiver", &cek).unwrap();
        assert_eq!(receiver.unwrap_content_key(&wrapped).unwrap(), cek);

        let again = sender.wrap_content_key("receiver", &cek).unwrap();
        assert_ne!(again.originator_key, wrapped.originator_key);

        // The sender holds only the receiver's public key.
        assert!(matches!(sender.unwrap_content_key(&wrapped), Err(As4Error::Security(_))));
    }

    #[test]
    fn test_low_order_originator_key_rejected() {
        let (_, receiver) = partner_keystores();
        let forged = WrappedKey {
            originator_key: [0u8; 32],
            wrapped: vec![0u8; 60],
        };
        let err = receiver.unwrap_content_key(&forged).unwrap_err();
        assert!(err.to_string().contains("low-order"));
    }

    #[test]
    fn test_mismatched_agreement_key_rejected() {
        let mut file = keystore_file();
        let mut other = KeystoreFile::default();
        other.add_generated_entry("other", "pw");
        file.entries.get_mut("sender").unwrap().agreement_key = other.entries["other"].agreement_key.clone();
        let result = Keystore::from_file(file, "sender", "changeit");
        assert!(matches!(result, Err(As4Error::Security(_))));
    }

    #[test]
    fn test_keystore_sign_verify() {
        let keystore = Keystore::from_file(keystore_file(), "sender", "changeit").unwrap();
        let signature = keystore.sign(SignAlgorithm::Ed25519, b"data").unwrap();
        assert!(keystore.verify(SignAlgorithm::Ed25519, "sender", b"data", &signature).is_ok());
        assert!(keystore.verify(SignAlgorithm::Ed25519, "sender", b"other", &signature).is_err());
    }

    #[test]
    fn test_keystore_wrong_password() {
        let result = Keystore::from_file(keystore_file(), "sender", "wrong");
        assert!(matches!(result, Err(As4Error::Security(_))));
    }

    #[test]
    fn test_keystore_unknown_alias() {
        let result = Keystore::from_file(keystore_file(), "nobody", "changeit");
        assert!(matches!(result, Err(As4Error::Security(_))));
    }

    #[test]
    fn test_keystore_open_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys.yaml");
        let mut file = keystore_file();
        let partner = {
            let mut other = KeystoreFile::default();
            other.add_generated_entry("receiver", "pw");
            other.public_entry("receiver").unwrap()
        };
        file.entries.insert("receiver".to_string(), partner);
        file.write(&path).unwrap();

        let config = KeystoreConfig {
            path,
            keystore_type: "yaml".to_string(),
            alias: "sender".to_string(),
            password: "changeit".to_string(),
        };
        let keystore = Keystore::open(&config).unwrap();
        assert_eq!(keystore.alias(), "sender");
        assert!(keystore.contains("receiver"));
        assert!(keystore.agreement_key("receiver").is_some());
    }

    #[test]
    fn test_keystore_unsupported_type() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let config = KeystoreConfig {
            path: file.path().to_path_buf(),
            keystore_type: "jks".to_string(),
            alias: "a".to_string(),
            password: "p".to_string(),
        };
        assert!(matches!(Keystore::open(&config), Err(As4Error::Security(_))));
    }
}
