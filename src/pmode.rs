//! Processing mode (PMode) configuration and registry.
//!
//! The registry is shared by every request: lookups take a read lock, mutations
//! take the write lock. A config that fails validation is never stored.

use crate::attachment::CompressionMode;
use crate::config::{As4Config, SoapVersion};
use crate::crypto::{DigestAlgorithm, EncryptAlgorithm, SignAlgorithm};
use crate::error::As4Error;
use crate::model::Party;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

/// Id of the PMode installed by [`PModeRegistry::with_default_pmode`].
pub const DEFAULT_PMODE_ID: &str = "default-pmode";

/// Message exchange pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mep {
    OneWay,
    TwoWay,
}

/// How the exchange pattern maps onto transport channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MepBinding {
    Push,
    Pull,
    Sync,
    PushAndPush,
    PushAndPull,
    PullAndPush,
}

impl MepBinding {
    pub fn required_legs(&self) -> usize {
        match self {
            Self::Push | Self::Pull | Self::Sync => 1,
            Self::PushAndPush | Self::PushAndPull | Self::PullAndPush => 2,
        }
    }
}

/// Policy for one direction of an exchange.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PModeLeg {
    pub protocol: PModeLegProtocol,
    pub business_info: Option<PModeLegBusinessInfo>,
    pub security: Option<PModeLegSecurity>,
    pub payload_service: Option<PModePayloadService>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PModeLegProtocol {
    /// Endpoint URL of the responding MSH
    pub address: Option<String>,
    pub soap_version: SoapVersion,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PModeLegBusinessInfo {
    pub service: Option<String>,
    pub action: Option<String>,
    pub mpc_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PModeLegSecurity {
    pub sign_algorithm: Option<SignAlgorithm>,
    pub sign_digest_algorithm: Option<DigestAlgorithm>,
    pub encrypt_algorithm: Option<EncryptAlgorithm>,
    /// Answer with a receipt signal
    pub send_receipt: bool,
}

impl PModeLegSecurity {
    pub fn requires_signature(&self) -> bool {
        self.sign_algorithm.is_some()
    }

    pub fn requires_encryption(&self) -> bool {
        self.encrypt_algorithm.is_some()
    }
}

/// Payload handling expected on a leg.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PModePayloadService {
    pub compression_mode: Option<CompressionMode>,
}

/// A processing mode.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PModeConfig {
    pub id: String,
    /// Agreement reference announced in outbound messages
    pub agreement: Option<String>,
    pub initiator: Option<Party>,
    pub responder: Option<Party>,
    pub mep: Option<Mep>,
    pub mep_binding: Option<MepBinding>,
    pub leg1: Option<PModeLeg>,
    pub leg2: Option<PModeLeg>,
}

impl PModeConfig {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    /// The one-way push PMode used when nothing else is configured.
    pub fn default_pmode() -> Self {
        Self {
            id: DEFAULT_PMODE_ID.to_string(),
            agreement: None,
            initiator: None,
            responder: None,
            mep: Some(Mep::OneWay),
            mep_binding: Some(MepBinding::Push),
            leg1: Some(PModeLeg::default()),
            leg2: None,
        }
    }

    /// Check the mandatory fields, returning every violation found.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.id.trim().is_empty() {
            errors.push("No PMode ID present".to_string());
        }
        if self.mep_binding.is_none() {
            errors.push("No PMode MEP binding present (push, pull, sync, ...)".to_string());
        }
        if self.mep.is_none() {
            errors.push("No PMode MEP present".to_string());
        }
        if let Some(binding) = self.mep_binding {
            if binding.required_legs() == 2 {
                if self.leg1.is_none() {
                    errors.push(format!("MEP binding {:?} requires leg 1", binding));
                }
                if self.leg2.is_none() {
                    errors.push(format!("MEP binding {:?} requires leg 2", binding));
                }
            }
        }
        errors
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_empty()
    }

    fn matches_service_and_action(&self, service: &str, action: &str) -> bool {
        self.leg1
            .as_ref()
            .and_then(|leg| leg.business_info.as_ref())
            .map(|bi| bi.service.as_deref() == Some(service) && bi.action.as_deref() == Some(action))
            .unwrap_or(false)
    }
}

/// Outcome of a registry mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Changed,
    Unchanged,
}

impl Change {
    pub fn is_changed(&self) -> bool {
        matches!(self, Self::Changed)
    }
}

/// Registry events reported to the audit hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditEvent<'a> {
    Created { id: &'a str },
    CreateRejected { id: &'a str, errors: &'a [String] },
    Updated { id: &'a str },
    UpdateFailed { id: &'a str, reason: &'a str },
    MarkedDeleted { id: &'a str },
    Deleted { id: &'a str },
    DeleteFailed { id: &'a str, reason: &'a str },
}

/// Fire-and-forget audit hook for registry mutations.
pub trait PModeAuditor: Send + Sync {
    fn record(&self, event: AuditEvent<'_>);
}

/// Auditor that writes events to the log.
#[derive(Debug, Default)]
pub struct TracingAuditor;

impl PModeAuditor for TracingAuditor {
    fn record(&self, event: AuditEvent<'_>) {
        match event {
            AuditEvent::Created { id } => info!(pmode_id = %id, "Created PMode"),
            AuditEvent::CreateRejected { id, errors } => {
                warn!(pmode_id = %id, errors = ?errors, "Rejected invalid PMode")
            }
            AuditEvent::Updated { id } => info!(pmode_id = %id, "Updated PMode"),
            AuditEvent::UpdateFailed { id, reason } => {
                warn!(pmode_id = %id, reason = %reason, "PMode update failed")
            }
            AuditEvent::MarkedDeleted { id } => info!(pmode_id = %id, "Marked PMode as deleted"),
            AuditEvent::Deleted { id } => info!(pmode_id = %id, "Deleted PMode"),
            AuditEvent::DeleteFailed { id, reason } => {
                warn!(pmode_id = %id, reason = %reason, "PMode delete failed")
            }
        }
    }
}

/// Lookup contract used by inbound processing.
pub trait PModeResolver: Send + Sync {
    /// Resolve by PMode id, falling back to the (service, action) pair.
    fn resolve(&self, pmode_id: Option<&str>, service: &str, action: &str) -> Option<PModeConfig>;
}

struct StoredPMode {
    config: PModeConfig,
    deleted_at: Option<DateTime<Utc>>,
}

/// Keyed store of PModes.
pub struct PModeRegistry {
    entries: RwLock<BTreeMap<String, StoredPMode>>,
    auditor: Box<dyn PModeAuditor>,
}

impl PModeRegistry {
    pub fn new() -> Self {
        Self::with_auditor(Box::new(TracingAuditor))
    }

    pub fn with_auditor(auditor: Box<dyn PModeAuditor>) -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
            auditor,
        }
    }

    /// Registry pre-populated with [`PModeConfig::default_pmode`].
    pub fn with_default_pmode() -> Self {
        let registry = Self::new();
        // The default PMode is valid by construction.
        let _ = registry.create(PModeConfig::default_pmode());
        registry
    }

    /// Registry holding every PMode of the configuration. Any invalid entry
    /// is a configuration error.
    pub fn from_config(config: &As4Config) -> Result<Self, As4Error> {
        let registry = Self::new();
        for pmode in &config.pmodes {
            registry.create(pmode.clone()).map_err(|errors| {
                As4Error::Config(format!("PMode '{}': {}", pmode.id, errors.join("; ")))
            })?;
        }
        Ok(registry)
    }

    /// Store a validated config. On rejection the accumulated violations are
    /// returned and the registry is left untouched.
    pub fn create(&self, config: PModeConfig) -> Result<PModeConfig, Vec<String>> {
        let errors = config.validate();
        if !errors.is_empty() {
            self.auditor.record(AuditEvent::CreateRejected {
                id: &config.id,
                errors: &errors,
            });
            return Err(errors);
        }

        self.entries.write().insert(
            config.id.clone(),
            StoredPMode {
                config: config.clone(),
                deleted_at: None,
            },
        );
        self.auditor.record(AuditEvent::Created { id: &config.id });
        Ok(config)
    }

    /// Update when the id exists, create otherwise.
    pub fn create_or_update(&self, config: PModeConfig) -> Result<Change, Vec<String>> {
        if self.entries.read().contains_key(&config.id) {
            let errors = config.validate();
            if !errors.is_empty() {
                return Err(errors);
            }
            Ok(self.update(config))
        } else {
            self.create(config).map(|_| Change::Changed)
        }
    }

    /// Replace a stored config. Unknown ids and invalid configs leave the
    /// registry unchanged.
    pub fn update(&self, config: PModeConfig) -> Change {
        let errors = config.validate();
        if !errors.is_empty() {
            self.auditor.record(AuditEvent::UpdateFailed {
                id: &config.id,
                reason: "invalid",
            });
            return Change::Unchanged;
        }

        let id = config.id.clone();
        let updated = match self.entries.write().get_mut(&id) {
            Some(stored) => {
                stored.config = config;
                true
            }
            None => false,
        };

        if updated {
            self.auditor.record(AuditEvent::Updated { id: &id });
            Change::Changed
        } else {
            self.auditor.record(AuditEvent::UpdateFailed {
                id: &id,
                reason: "no-such-id",
            });
            Change::Unchanged
        }
    }

    /// Soft delete: the config stays stored but is no longer resolved.
    pub fn mark_deleted(&self, id: &str) -> Change {
        let failure = match self.entries.write().get_mut(id) {
            Some(stored) if stored.deleted_at.is_none() => {
                stored.deleted_at = Some(Utc::now());
                None
            }
            Some(_) => Some("already-deleted"),
            None => Some("no-such-id"),
        };

        match failure {
            None => {
                self.auditor.record(AuditEvent::MarkedDeleted { id });
                Change::Changed
            }
            Some(reason) => {
                self.auditor.record(AuditEvent::DeleteFailed { id, reason });
                Change::Unchanged
            }
        }
    }

    /// Hard delete.
    pub fn delete(&self, id: &str) -> Change {
        let removed = self.entries.write().remove(id).is_some();
        if removed {
            self.auditor.record(AuditEvent::Deleted { id });
            Change::Changed
        } else {
            self.auditor.record(AuditEvent::DeleteFailed {
                id,
                reason: "no-such-id",
            });
            Change::Unchanged
        }
    }

    /// Active (not deleted) config with the given id.
    pub fn by_id(&self, id: &str) -> Option<PModeConfig> {
        self.entries
            .read()
            .get(id)
            .filter(|stored| stored.deleted_at.is_none())
            .map(|stored| stored.config.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.read().contains_key(id)
    }

    pub fn is_deleted(&self, id: &str) -> bool {
        self.entries
            .read()
            .get(id)
            .map(|stored| stored.deleted_at.is_some())
            .unwrap_or(false)
    }

    /// First active config whose leg 1 business info matches both values.
    /// Iteration order is ascending by id.
    pub fn by_service_and_action(&self, service: &str, action: &str) -> Option<PModeConfig> {
        self.entries
            .read()
            .values()
            .filter(|stored| stored.deleted_at.is_none())
            .find(|stored| stored.config.matches_service_and_action(service, action))
            .map(|stored| stored.config.clone())
    }

    /// All stored configs, including soft-deleted ones.
    pub fn all(&self) -> Vec<PModeConfig> {
        self.entries.read().values().map(|s| s.config.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Re-validate every stored config. Any violation means the store is
    /// inconsistent.
    pub fn validate_all(&self) -> Result<(), As4Error> {
        let entries = self.entries.read();
        let violations: Vec<String> = entries
            .values()
            .flat_map(|stored| {
                stored
                    .config
                    .validate()
                    .into_iter()
                    .map(move |e| format!("PMode {}: {}", stored.config.id, e))
            })
            .collect();

        if violations.is_empty() {
            Ok(())
        } else {
            Err(As4Error::InconsistentRegistry(violations.join("\n")))
        }
    }

    #[cfg(test)]
    pub(crate) fn insert_unchecked(&self, config: PModeConfig) {
        self.entries.write().insert(
            config.id.clone(),
            StoredPMode {
                config,
                deleted_at: None,
            },
        );
    }
}

impl Default for PModeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PModeResolver for PModeRegistry {
    fn resolve(&self, pmode_id: Option<&str>, service: &str, action: &str) -> Option<PModeConfig> {
        pmode_id
            .filter(|id| !id.trim().is_empty())
            .and_then(|id| self.by_id(id))
            .or_else(|| self.by_service_and_action(service, action))
    }
}

impl std::fmt::Debug for PModeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PModeRegistry")
            .field("pmodes", &self.entries.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn leg(service: &str, action: &str) -> PModeLeg {
        PModeLeg {
            business_info: Some(PModeLegBusinessInfo {
                service: Some(service.to_string()),
                action: Some(action.to_string()),
                mpc_id: None,
            }),
            ..Default::default()
        }
    }

    fn valid(id: &str) -> PModeConfig {
        PModeConfig {
            id: id.to_string(),
            mep: Some(Mep::OneWay),
            mep_binding: Some(MepBinding::Push),
            leg1: Some(leg("urn:svc", "Deliver")),
            ..Default::default()
        }
    }

    #[derive(Default)]
    struct RecordingAuditor(Arc<Mutex<Vec<String>>>);

    impl PModeAuditor for RecordingAuditor {
        fn record(&self, event: AuditEvent<'_>) {
            if let Ok(mut events) = self.0.lock() {
                events.push(format!("{:?}", event));
            }
        }
    }

    #[test]
    fn test_create_and_lookup() {
        let registry = PModeRegistry::new();
        assert!(registry.create(valid("pm-1")).is_ok());
        assert_eq!(registry.by_id("pm-1").unwrap().id, "pm-1");
        assert_eq!(registry.by_service_and_action("urn:svc", "Deliver").unwrap().id, "pm-1");
        assert!(registry.by_service_and_action("urn:svc", "Other").is_none());
    }

    #[test]
    fn test_create_again_with_changed_id_keeps_both() {
        let registry = PModeRegistry::new();
        let first = registry.create(valid("pm-1")).unwrap();
        let mut second = first.clone();
        second.id = "pm-2".to_string();
        registry.create(second).unwrap();

        assert_eq!(registry.by_id("pm-1").unwrap(), first);
        assert_eq!(registry.by_id("pm-2").unwrap().id, "pm-2");
        assert_eq!(registry.by_service_and_action("urn:svc", "Deliver").unwrap().id, "pm-1");
    }

    #[test]
    fn test_create_rejects_each_missing_field() {
        let registry = PModeRegistry::new();

        let mut no_id = valid("");
        no_id.id = "  ".to_string();
        let mut no_mep = valid("no-mep");
        no_mep.mep = None;
        let mut no_binding = valid("no-binding");
        no_binding.mep_binding = None;
        let mut missing_leg2 = valid("missing-leg2");
        missing_leg2.mep_binding = Some(MepBinding::PushAndPush);

        for config in [no_id, no_mep, no_binding, missing_leg2] {
            let id = config.id.clone();
            let errors = registry.create(config).unwrap_err();
            assert_eq!(errors.len(), 1);
            assert!(!registry.contains(&id));
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_two_leg_binding_with_both_legs() {
        let mut config = valid("two-way");
        config.mep = Some(Mep::TwoWay);
        config.mep_binding = Some(MepBinding::PushAndPull);
        config.leg2 = Some(leg("urn:svc", "Reply"));
        assert!(config.is_valid());
    }

    #[test]
    fn test_update_unknown_id_is_unchanged() {
        let registry = PModeRegistry::new();
        assert_eq!(registry.update(valid("ghost")), Change::Unchanged);
        assert!(!registry.contains("ghost"));
    }

    #[test]
    fn test_update_replaces_config() {
        let registry = PModeRegistry::new();
        registry.create(valid("pm-1")).unwrap();
        let mut changed = valid("pm-1");
        changed.agreement = Some("urn:agreement:2".to_string());
        assert_eq!(registry.update(changed), Change::Changed);
        assert_eq!(registry.by_id("pm-1").unwrap().agreement.as_deref(), Some("urn:agreement:2"));
    }

    #[test]
    fn test_create_or_update() {
        let registry = PModeRegistry::new();
        assert_eq!(registry.create_or_update(valid("pm-1")), Ok(Change::Changed));
        assert_eq!(registry.create_or_update(valid("pm-1")), Ok(Change::Changed));
        assert_eq!(registry.len(), 1);
        assert!(registry.create_or_update(PModeConfig::new("pm-2")).is_err());
    }

    #[test]
    fn test_mark_deleted_hides_config() {
        let registry = PModeRegistry::new();
        registry.create(valid("pm-1")).unwrap();
        assert_eq!(registry.mark_deleted("pm-1"), Change::Changed);
        assert_eq!(registry.mark_deleted("pm-1"), Change::Unchanged);
        assert!(registry.contains("pm-1"));
        assert!(registry.is_deleted("pm-1"));
        assert!(registry.by_id("pm-1").is_none());
        assert!(registry.by_service_and_action("urn:svc", "Deliver").is_none());
    }

    #[test]
    fn test_delete() {
        let registry = PModeRegistry::new();
        registry.create(valid("pm-1")).unwrap();
        assert_eq!(registry.delete("pm-1"), Change::Changed);
        assert_eq!(registry.delete("pm-1"), Change::Unchanged);
        assert_eq!(registry.mark_deleted("pm-1"), Change::Unchanged);
        assert!(!registry.contains("pm-1"));
    }

    #[test]
    fn test_service_action_first_match_is_deterministic() {
        let registry = PModeRegistry::new();
        registry.create(valid("pm-b")).unwrap();
        registry.create(valid("pm-a")).unwrap();
        for _ in 0..3 {
            assert_eq!(registry.by_service_and_action("urn:svc", "Deliver").unwrap().id, "pm-a");
        }
    }

    #[test]
    fn test_resolver_prefers_id() {
        let registry = PModeRegistry::new();
        registry.create(valid("pm-a")).unwrap();
        let mut other = valid("pm-z");
        other.leg1 = Some(leg("urn:other", "Other"));
        registry.create(other).unwrap();

        assert_eq!(registry.resolve(Some("pm-z"), "urn:svc", "Deliver").unwrap().id, "pm-z");
        assert_eq!(registry.resolve(Some("missing"), "urn:svc", "Deliver").unwrap().id, "pm-a");
        assert_eq!(registry.resolve(None, "urn:other", "Other").unwrap().id, "pm-z");
        assert!(registry.resolve(None, "urn:none", "None").is_none());
    }

    #[test]
    fn test_validate_all_reports_inconsistency() {
        let registry = PModeRegistry::new();
        registry.create(valid("pm-1")).unwrap();
        assert!(registry.validate_all().is_ok());

        let mut broken = valid("pm-broken");
        broken.mep = None;
        broken.mep_binding = None;
        registry.insert_unchecked(broken);

        let err = registry.validate_all().unwrap_err();
        let message = err.to_string();
        assert!(matches!(err, As4Error::InconsistentRegistry(_)));
        assert!(message.contains("PMode pm-broken: No PMode MEP present"));
        assert!(message.contains("PMode pm-broken: No PMode MEP binding present"));
    }

    #[test]
    fn test_audit_hook_records_outcomes() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let registry = PModeRegistry::with_auditor(Box::new(RecordingAuditor(Arc::clone(&events))));
        registry.create(valid("pm-1")).unwrap();
        let _ = registry.create(PModeConfig::new("bad"));
        registry.delete("missing");

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert!(events[0].starts_with("Created"));
        assert!(events[1].starts_with("CreateRejected"));
        assert!(events[2].starts_with("DeleteFailed"));
    }

    #[test]
    fn test_default_pmode_registry() {
        let registry = PModeRegistry::with_default_pmode();
        let pmode = registry.by_id(DEFAULT_PMODE_ID).unwrap();
        assert_eq!(pmode.mep, Some(Mep::OneWay));
        assert_eq!(pmode.mep_binding, Some(MepBinding::Push));
    }

    #[test]
    fn test_pmode_from_yaml() {
        let yaml = r#"
id: orders
agreement: urn:agreement:orders
mep: two-way
mep_binding: push-and-push
leg1:
  protocol:
    address: https://partner.example.com/as4
    soap_version: "1.2"
  business_info:
    service: urn:svc:orders
    action: Submit
    mpc_id: urn:mpc:orders
  security:
    sign_algorithm: ed25519
    encrypt_algorithm: aes128-gcm
    send_receipt: true
  payload_service:
    compression_mode: gzip
leg2: {}
"#;
        let config: PModeConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.is_valid());
        let leg1 = config.leg1.unwrap();
        assert_eq!(leg1.business_info.unwrap().mpc_id.as_deref(), Some("urn:mpc:orders"));
        assert!(leg1.security.unwrap().requires_encryption());
        assert_eq!(leg1.payload_service.unwrap().compression_mode, Some(CompressionMode::Gzip));
    }
}
