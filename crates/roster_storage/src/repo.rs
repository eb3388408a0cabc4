#![forbid(unsafe_code)]

use async_trait::async_trait;

use roster_kernel_contracts::identity::{IdentityRecord, IdentityReport, ResolvedKey};
use roster_kernel_contracts::UnixTimeMs;

use crate::registry::{IdentityRegistry, ReportCommit, StorageError};

/// Typed repository interface for client report ingest and snapshot reads.
#[async_trait]
pub trait IdentityReportRepo: Send + Sync {
    async fn report_row(
        &self,
        report: &IdentityReport,
        now: UnixTimeMs,
    ) -> Result<ReportCommit, StorageError>;

    fn get_row(&self, key: &ResolvedKey) -> Option<IdentityRecord>;
    fn list_rows(&self) -> Vec<IdentityRecord>;
}

/// The allow-gate collaborator's view: one boolean per resolved key, plus the
/// operator-assigned name.
#[async_trait]
pub trait AllowGateRepo: Send + Sync {
    fn is_allowed_row(&self, key: &ResolvedKey) -> bool;

    async fn set_allowed_row(
        &self,
        key: &ResolvedKey,
        allowed: bool,
    ) -> Result<IdentityRecord, StorageError>;

    async fn set_verified_name_row(
        &self,
        key: &ResolvedKey,
        verified_name: &str,
    ) -> Result<IdentityRecord, StorageError>;
}

#[async_trait]
impl IdentityReportRepo for IdentityRegistry {
    async fn report_row(
        &self,
        report: &IdentityReport,
        now: UnixTimeMs,
    ) -> Result<ReportCommit, StorageError> {
        self.report(report, now).await
    }

    fn get_row(&self, key: &ResolvedKey) -> Option<IdentityRecord> {
        self.get(key)
    }

    fn list_rows(&self) -> Vec<IdentityRecord> {
        self.list()
    }
}

#[async_trait]
impl AllowGateRepo for IdentityRegistry {
    fn is_allowed_row(&self, key: &ResolvedKey) -> bool {
        self.is_allowed(key)
    }

    async fn set_allowed_row(
        &self,
        key: &ResolvedKey,
        allowed: bool,
    ) -> Result<IdentityRecord, StorageError> {
        self.set_allowed(key, allowed).await
    }

    async fn set_verified_name_row(
        &self,
        key: &ResolvedKey,
        verified_name: &str,
    ) -> Result<IdentityRecord, StorageError> {
        self.set_verified_name(key, verified_name).await
    }
}
