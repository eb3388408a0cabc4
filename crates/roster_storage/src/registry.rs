#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use roster_kernel_contracts::identity::{IdentityRecord, IdentityReport, ResolvedKey};
use roster_kernel_contracts::{ContractViolation, UnixTimeMs, Validate};

use crate::journal::{NoopJournal, RegistryJournal, RegistryMutation};

const TABLE: &str = "identity_records";
const MAX_MERGE_ATTEMPTS: u8 = 2;
const MAX_VERIFIED_NAME_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    #[error("validation failed: {0}")]
    Validation(#[from] ContractViolation),
    #[error("{table}: no row for key {key}")]
    NotFound { table: &'static str, key: String },
    #[error("{table}: duplicate key {key}")]
    DuplicateKey { table: &'static str, key: String },
    #[error("persistence failure: {reason}")]
    Persistence { reason: String },
}

impl StorageError {
    pub fn persistence(reason: impl Into<String>) -> Self {
        StorageError::Persistence {
            reason: reason.into(),
        }
    }

    /// Whether the caller should resend the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Persistence { .. })
    }

    fn duplicate(key: &ResolvedKey) -> Self {
        StorageError::DuplicateKey {
            table: TABLE,
            key: key.as_str().to_string(),
        }
    }

    fn not_found(key: &ResolvedKey) -> Self {
        StorageError::NotFound {
            table: TABLE,
            key: key.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    pub lock_timeout: Duration,
}

impl RegistryConfig {
    pub fn mvp_v1() -> Self {
        Self {
            lock_timeout: Duration::from_millis(2_000),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    Inserted,
    Updated,
    /// An anonymous, address-keyed record was moved under the reported device id.
    Rekeyed { from: ResolvedKey },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportCommit {
    pub outcome: ReportOutcome,
    pub record: IdentityRecord,
}

/// Canonical store of identity records, one per resolved key.
///
/// Mutations take async per-key locks (both candidate keys for a report that
/// carries a device id, acquired in key order) so reports for one client are
/// serialized while reports for other clients proceed. Reads never lock keys
/// and always observe whole records. A re-key holds `rekey_gate` exclusively
/// while it moves a row, and `list` holds it shared, so a listing sees the row
/// under exactly one of its keys.
pub struct IdentityRegistry {
    config: RegistryConfig,
    records: DashMap<ResolvedKey, IdentityRecord>,
    key_locks: DashMap<ResolvedKey, Arc<Mutex<()>>>,
    rekey_gate: RwLock<()>,
    journal: Arc<dyn RegistryJournal>,
}

impl IdentityRegistry {
    pub fn new_in_memory() -> Self {
        Self::with_journal(RegistryConfig::mvp_v1(), Arc::new(NoopJournal))
    }

    pub fn with_journal(config: RegistryConfig, journal: Arc<dyn RegistryJournal>) -> Self {
        Self {
            config,
            records: DashMap::new(),
            key_locks: DashMap::new(),
            rekey_gate: RwLock::new(()),
            journal,
        }
    }

    /// Restores a registry from persisted rows. Rows are validated; a repeated key is rejected.
    pub fn from_records(
        config: RegistryConfig,
        journal: Arc<dyn RegistryJournal>,
        records: Vec<IdentityRecord>,
    ) -> Result<Self, StorageError> {
        let registry = Self::with_journal(config, journal);
        for record in records {
            record.validate()?;
            match registry.records.entry(record.resolved_key.clone()) {
                Entry::Occupied(_) => return Err(StorageError::duplicate(&record.resolved_key)),
                Entry::Vacant(slot) => {
                    slot.insert(record);
                }
            }
        }
        Ok(registry)
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Merges one client report. Idempotent per key; see `ReportOutcome` for the paths.
    pub async fn report(
        &self,
        report: &IdentityReport,
        now: UnixTimeMs,
    ) -> Result<ReportCommit, StorageError> {
        report.validate()?;
        let primary = report.resolved_key();
        let mut keys = BTreeSet::from([primary.clone()]);
        if let Some(candidate) = report.upgrade_candidate_key() {
            keys.insert(candidate);
        }
        let _guards = self.lock_keys(&keys).await?;
        retry_key_conflict(|| self.apply_report(report, &primary, now))
    }

    fn apply_report(
        &self,
        report: &IdentityReport,
        primary: &ResolvedKey,
        now: UnixTimeMs,
    ) -> Result<ReportCommit, StorageError> {
        let existing = self.records.get(primary).map(|r| r.value().clone());
        if let Some(existing) = existing {
            let merged = existing.merged_with(report, now);
            self.journal
                .commit(&RegistryMutation::Update(merged.clone()))?;
            self.records.insert(primary.clone(), merged.clone());
            debug!(key = %primary, last_seen = merged.last_seen.0, "identity record updated");
            return Ok(ReportCommit {
                outcome: ReportOutcome::Updated,
                record: merged,
            });
        }

        if let Some(candidate) = report.upgrade_candidate_key() {
            let anonymous = self
                .records
                .get(&candidate)
                .map(|r| r.value().clone())
                .filter(IdentityRecord::is_anonymous);
            if let Some(anonymous) = anonymous {
                let rekeyed = anonymous.merged_with(report, now);
                let _gate = self
                    .rekey_gate
                    .write()
                    .unwrap_or_else(PoisonError::into_inner);
                self.insert_vacant(
                    RegistryMutation::Rekey {
                        from: candidate.clone(),
                        record: rekeyed.clone(),
                    },
                    rekeyed.clone(),
                )?;
                self.records.remove(&candidate);
                info!(from = %candidate, to = %primary, "anonymous identity upgraded to device id");
                return Ok(ReportCommit {
                    outcome: ReportOutcome::Rekeyed { from: candidate },
                    record: rekeyed,
                });
            }
        }

        let record = IdentityRecord::from_first_report(report, now);
        self.insert_vacant(RegistryMutation::Insert(record.clone()), record.clone())?;
        info!(key = %primary, source = ?report.key_source(), "identity record created");
        Ok(ReportCommit {
            outcome: ReportOutcome::Inserted,
            record,
        })
    }

    fn insert_vacant(
        &self,
        mutation: RegistryMutation,
        record: IdentityRecord,
    ) -> Result<(), StorageError> {
        let key = record.resolved_key.clone();
        if self.records.contains_key(&key) {
            return Err(StorageError::duplicate(&key));
        }
        self.journal.commit(&mutation)?;
        match self.records.entry(key) {
            Entry::Occupied(slot) => Err(StorageError::duplicate(slot.key())),
            Entry::Vacant(slot) => {
                slot.insert(record);
                Ok(())
            }
        }
    }

    /// Administrative allow gate. Never touched by `report`.
    pub async fn set_allowed(
        &self,
        key: &ResolvedKey,
        allowed: bool,
    ) -> Result<IdentityRecord, StorageError> {
        let _guards = self.lock_keys(&BTreeSet::from([key.clone()])).await?;
        let mut record = self.get(key).ok_or_else(|| StorageError::not_found(key))?;
        if record.allowed == allowed {
            return Ok(record);
        }
        self.journal.commit(&RegistryMutation::SetAllowed {
            key: key.clone(),
            allowed,
        })?;
        record.allowed = allowed;
        self.records.insert(key.clone(), record.clone());
        info!(key = %key, allowed, "allow gate changed");
        Ok(record)
    }

    /// Operator-assigned name; survives every later report.
    pub async fn set_verified_name(
        &self,
        key: &ResolvedKey,
        verified_name: &str,
    ) -> Result<IdentityRecord, StorageError> {
        let verified_name = verified_name.trim();
        if verified_name.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "verified_name",
                reason: "must not be empty",
            }
            .into());
        }
        if verified_name.chars().count() > MAX_VERIFIED_NAME_LEN {
            return Err(ContractViolation::InvalidValue {
                field: "verified_name",
                reason: "must be <= 256 chars",
            }
            .into());
        }
        let _guards = self.lock_keys(&BTreeSet::from([key.clone()])).await?;
        let mut record = self.get(key).ok_or_else(|| StorageError::not_found(key))?;
        if record.verified_name == verified_name {
            return Ok(record);
        }
        self.journal.commit(&RegistryMutation::SetVerifiedName {
            key: key.clone(),
            verified_name: verified_name.to_string(),
        })?;
        record.verified_name = verified_name.to_string();
        self.records.insert(key.clone(), record.clone());
        info!(key = %key, "verified name changed");
        Ok(record)
    }

    /// Unknown keys read as not allowed.
    pub fn is_allowed(&self, key: &ResolvedKey) -> bool {
        self.records.get(key).map(|r| r.allowed).unwrap_or(false)
    }

    pub fn get(&self, key: &ResolvedKey) -> Option<IdentityRecord> {
        self.records.get(key).map(|r| r.value().clone())
    }

    /// Every record, ordered by resolved key. Each row is whole; rows may come
    /// from slightly different instants under concurrent writes, but a row being
    /// re-keyed appears exactly once.
    pub fn list(&self) -> Vec<IdentityRecord> {
        let _gate = self
            .rekey_gate
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut rows: Vec<IdentityRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        rows.sort_by(|a, b| a.resolved_key.cmp(&b.resolved_key));
        rows
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn key_lock(&self, key: &ResolvedKey) -> Arc<Mutex<()>> {
        let slot = self
            .key_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())));
        Arc::clone(slot.value())
    }

    async fn lock_keys(
        &self,
        keys: &BTreeSet<ResolvedKey>,
    ) -> Result<KeyGuards<'_>, StorageError> {
        let mut guards = KeyGuards {
            registry: self,
            keys: Vec::with_capacity(keys.len()),
            held: Vec::with_capacity(keys.len()),
        };
        // BTreeSet order is the global lock order.
        for key in keys {
            let lock = self.key_lock(key);
            guards.keys.push(key.clone());
            match tokio::time::timeout(self.config.lock_timeout, lock.lock_owned()).await {
                Ok(guard) => guards.held.push(guard),
                Err(_) => {
                    warn!(
                        key = %key,
                        timeout_ms = self.config.lock_timeout.as_millis() as u64,
                        "identity key lock timed out"
                    );
                    return Err(StorageError::persistence(format!(
                        "{TABLE}: lock timeout on key {key}"
                    )));
                }
            }
        }
        Ok(guards)
    }
}

/// Held per-key locks. On drop, lock entries nobody else is holding or waiting
/// on are removed, so the lock table only tracks keys with work in flight.
struct KeyGuards<'a> {
    registry: &'a IdentityRegistry,
    keys: Vec<ResolvedKey>,
    held: Vec<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuards<'_> {
    fn drop(&mut self) {
        self.held.clear();
        for key in &self.keys {
            // Clones happen under the shard lock, so a count of one means the
            // table holds the only handle.
            self.registry
                .key_locks
                .remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
        }
    }
}

/// Runs a merge, retrying once on a key conflict. A second conflict is
/// surfaced as a retryable persistence failure.
fn retry_key_conflict<T>(
    mut apply: impl FnMut() -> Result<T, StorageError>,
) -> Result<T, StorageError> {
    let mut attempt = 0u8;
    loop {
        attempt += 1;
        match apply() {
            Err(StorageError::DuplicateKey { key, .. }) if attempt < MAX_MERGE_ATTEMPTS => {
                warn!(key = %key, attempt, "identity merge conflict, retrying under lock");
            }
            Err(StorageError::DuplicateKey { key, .. }) => {
                warn!(key = %key, "identity merge conflict persisted after retry");
                return Err(StorageError::persistence(format!(
                    "{TABLE}: unresolved key conflict on {key}"
                )));
            }
            other => return other,
        }
    }
}

impl Default for IdentityRegistry {
    fn default() -> Self {
        Self::new_in_memory()
    }
}
