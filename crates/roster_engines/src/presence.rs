#![forbid(unsafe_code)]

use roster_kernel_contracts::identity::IdentityRecord;
use roster_kernel_contracts::presence::{
    FreshnessWindow, LicenseStatus, PresenceStatus, PresenceSummary, PresenceView,
};
use roster_kernel_contracts::UnixTimeMs;

use crate::directory::DisplayNameDirectory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PresenceEvaluatorConfig {
    pub window: FreshnessWindow,
}

impl PresenceEvaluatorConfig {
    pub fn mvp_v1() -> Self {
        Self {
            window: FreshnessWindow::default(),
        }
    }
}

/// `now - last_seen < window`, strictly. A timestamp ahead of `now` is treated
/// as malformed and reads inactive.
pub fn is_active(last_seen: UnixTimeMs, now: UnixTimeMs, window: FreshnessWindow) -> bool {
    now.checked_since(last_seen)
        .map(|elapsed| elapsed < window.as_millis())
        .unwrap_or(false)
}

/// Stateless annotation of a registry snapshot.
pub fn annotate(
    records: &[IdentityRecord],
    now: UnixTimeMs,
    window: FreshnessWindow,
    directory: &dyn DisplayNameDirectory,
) -> Vec<PresenceView> {
    records
        .iter()
        .map(|r| project(r, now, window, directory))
        .collect()
}

/// Presentation view of one record at `now`.
pub fn project(
    record: &IdentityRecord,
    now: UnixTimeMs,
    window: FreshnessWindow,
    directory: &dyn DisplayNameDirectory,
) -> PresenceView {
    let active = is_active(record.last_seen, now, window);
    PresenceView {
        key: record.resolved_key.as_str().to_string(),
        device_id: record.device_id.as_ref().map(|d| d.as_str().to_string()),
        ip: record.address.as_str().to_string(),
        server: record.tag.clone(),
        nickname: record.display_name.clone(),
        verified_name: record.verified_name.clone(),
        operator_label: directory.label_for(&record.address),
        license: LicenseStatus::from_flag(record.license_active),
        allowed: record.allowed,
        active,
        status: PresenceStatus::from_active(active),
        last_seen_ms: record.last_seen.0,
        seconds_since_seen: now.checked_since(record.last_seen).map(|ms| ms / 1_000),
    }
}

pub fn summarize(views: &[PresenceView]) -> PresenceSummary {
    views.iter().fold(PresenceSummary::default(), |mut s, v| {
        s.total += 1;
        s.active += u32::from(v.active);
        s.allowed += u32::from(v.allowed);
        s.licensed += u32::from(v.license == LicenseStatus::Activated);
        s
    })
}

#[derive(Debug, Clone, Copy)]
pub struct PresenceEvaluator {
    config: PresenceEvaluatorConfig,
}

impl PresenceEvaluator {
    pub fn new(config: PresenceEvaluatorConfig) -> Self {
        Self { config }
    }

    pub fn window(&self) -> FreshnessWindow {
        self.config.window
    }

    pub fn annotate(
        &self,
        records: &[IdentityRecord],
        now: UnixTimeMs,
        directory: &dyn DisplayNameDirectory,
    ) -> Vec<PresenceView> {
        annotate(records, now, self.config.window, directory)
    }

    pub fn view(
        &self,
        record: &IdentityRecord,
        now: UnixTimeMs,
        directory: &dyn DisplayNameDirectory,
    ) -> PresenceView {
        project(record, now, self.config.window, directory)
    }
}
