#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::ContractViolation;

/// Fixed duration within which a report counts as "active". Not client-configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FreshnessWindow(u64);

impl FreshnessWindow {
    pub const MIN_SECS: u64 = 1;
    pub const MAX_SECS: u64 = 3_600;

    pub fn from_secs(secs: u64) -> Result<Self, ContractViolation> {
        if !(Self::MIN_SECS..=Self::MAX_SECS).contains(&secs) {
            return Err(ContractViolation::InvalidRange {
                field: "freshness_window_secs",
                min: Self::MIN_SECS,
                max: Self::MAX_SECS,
                got: secs,
            });
        }
        Ok(Self(secs * 1_000))
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }
}

impl Default for FreshnessWindow {
    fn default() -> Self {
        Self(30_000)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Offline,
}

impl PresenceStatus {
    pub fn from_active(active: bool) -> Self {
        if active {
            Self::Online
        } else {
            Self::Offline
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseStatus {
    Activated,
    NotActivated,
}

impl LicenseStatus {
    pub fn from_flag(license_active: bool) -> Self {
        if license_active {
            Self::Activated
        } else {
            Self::NotActivated
        }
    }
}

/// Display-ready projection of one identity record at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceView {
    pub key: String,
    pub device_id: Option<String>,
    pub ip: String,
    pub server: String,
    pub nickname: String,
    pub verified_name: String,
    pub operator_label: Option<String>,
    pub license: LicenseStatus,
    pub allowed: bool,
    pub active: bool,
    pub status: PresenceStatus,
    pub last_seen_ms: u64,
    /// `None` when the stored timestamp is ahead of the evaluation time.
    pub seconds_since_seen: Option<u64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceSummary {
    pub total: u32,
    pub active: u32,
    pub allowed: u32,
    pub licensed: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GateDecision {
    Allowed,
    Denied,
}

impl GateDecision {
    pub fn from_flag(allowed: bool) -> Self {
        if allowed {
            Self::Allowed
        } else {
            Self::Denied
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn as_token(&self) -> &'static str {
        match self {
            Self::Allowed => "true",
            Self::Denied => "false",
        }
    }
}
