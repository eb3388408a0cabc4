#![forbid(unsafe_code)]

use roster_kernel_contracts::identity::{IdentityRecord, ResolvedKey};

use crate::registry::StorageError;

/// A registry mutation, offered to the journal before it is applied in memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryMutation {
    Insert(IdentityRecord),
    Update(IdentityRecord),
    Rekey {
        from: ResolvedKey,
        record: IdentityRecord,
    },
    SetAllowed {
        key: ResolvedKey,
        allowed: bool,
    },
    SetVerifiedName {
        key: ResolvedKey,
        verified_name: String,
    },
}

impl RegistryMutation {
    pub fn key(&self) -> &ResolvedKey {
        match self {
            RegistryMutation::Insert(r) | RegistryMutation::Update(r) => &r.resolved_key,
            RegistryMutation::Rekey { record, .. } => &record.resolved_key,
            RegistryMutation::SetAllowed { key, .. }
            | RegistryMutation::SetVerifiedName { key, .. } => key,
        }
    }
}

/// Write-through seam to durable storage.
///
/// `commit` runs while the registry holds the per-key locks of the mutation and
/// before memory changes; an error aborts the mutation. Commits are keyed
/// upserts and may be repeated for the same mutation.
///
/// `commit` is synchronous and the registry does not time it out, so an
/// implementation must bound its own I/O and report expiry as
/// `StorageError::Persistence`. A re-key commits while readers of `list` wait.
pub trait RegistryJournal: Send + Sync {
    fn commit(&self, mutation: &RegistryMutation) -> Result<(), StorageError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopJournal;

impl RegistryJournal for NoopJournal {
    fn commit(&self, _mutation: &RegistryMutation) -> Result<(), StorageError> {
        Ok(())
    }
}
