#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{ContractViolation, SchemaVersion, UnixTimeMs, Validate};

/// Device identifier value clients send when they have no stable id yet.
pub const ANONYMOUS_DEVICE_MARKER: &str = "-";
/// Catch-all value for unknown device ids, tags, and display names.
pub const UNKNOWN_SENTINEL: &str = "unknown";
pub const LICENSE_ACTIVATED: &str = "activated";
pub const VERIFIED_NAME_PLACEHOLDER: &str = "unverified";

const MAX_KEY_LEN: usize = 128;
const MAX_LABEL_LEN: usize = 256;

fn is_device_sentinel(raw: &str) -> bool {
    raw.is_empty() || raw == ANONYMOUS_DEVICE_MARKER || raw.eq_ignore_ascii_case(UNKNOWN_SENTINEL)
}

fn validate_key_text(field: &'static str, value: &str) -> Result<(), ContractViolation> {
    if value.trim().is_empty() {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not be empty",
        });
    }
    if value.chars().count() > MAX_KEY_LEN {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be <= 128 chars",
        });
    }
    Ok(())
}

fn validate_label(field: &'static str, value: &str) -> Result<(), ContractViolation> {
    if value.trim().is_empty() {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must not be empty",
        });
    }
    if value.chars().count() > MAX_LABEL_LEN {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must be <= 256 chars",
        });
    }
    Ok(())
}

fn label_or_unknown(raw: Option<&str>) -> String {
    match raw.map(str::trim) {
        Some(v) if !v.is_empty() => v.to_string(),
        _ => UNKNOWN_SENTINEL.to_string(),
    }
}

/// Stable identifier a client presents once it has one. Never a sentinel.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let d = Self(id.into());
        d.validate()?;
        Ok(d)
    }

    /// Reads a client-supplied device id. Blank, `-` and `unknown` mean "no id".
    pub fn from_reported(raw: Option<&str>) -> Result<Option<Self>, ContractViolation> {
        match raw.map(str::trim) {
            None => Ok(None),
            Some(v) if is_device_sentinel(v) => Ok(None),
            Some(v) => Self::new(v).map(Some),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for DeviceId {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_key_text("device_id", &self.0)?;
        if is_device_sentinel(self.0.trim()) {
            return Err(ContractViolation::InvalidValue {
                field: "device_id",
                reason: "must not be a sentinel value",
            });
        }
        Ok(())
    }
}

impl TryFrom<String> for DeviceId {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DeviceId> for String {
    fn from(value: DeviceId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NetworkAddress(String);

impl NetworkAddress {
    pub fn new(address: impl Into<String>) -> Result<Self, ContractViolation> {
        let a = Self(address.into().trim().to_string());
        a.validate()?;
        Ok(a)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Validate for NetworkAddress {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_key_text("address", &self.0)
    }
}

impl TryFrom<String> for NetworkAddress {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NetworkAddress> for String {
    fn from(value: NetworkAddress) -> Self {
        value.0
    }
}

/// Canonical uniqueness key of an identity record.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResolvedKey(String);

impl ResolvedKey {
    pub fn new(key: impl Into<String>) -> Result<Self, ContractViolation> {
        let k = Self(key.into());
        validate_key_text("resolved_key", &k.0)?;
        Ok(k)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResolvedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&DeviceId> for ResolvedKey {
    fn from(value: &DeviceId) -> Self {
        Self(value.0.clone())
    }
}

impl From<&NetworkAddress> for ResolvedKey {
    fn from(value: &NetworkAddress) -> Self {
        Self(value.0.clone())
    }
}

impl TryFrom<String> for ResolvedKey {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ResolvedKey> for String {
    fn from(value: ResolvedKey) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeySource {
    DeviceId,
    Address,
}

/// The single resolution rule shared by writes and point lookups.
pub fn resolve_key(device_id: Option<&DeviceId>, address: &NetworkAddress) -> ResolvedKey {
    match device_id {
        Some(d) => ResolvedKey::from(d),
        None => ResolvedKey::from(address),
    }
}

/// Resolves raw lookup parameters. Unusable input yields `None`, never an error.
pub fn resolve_lookup_key(device_id: Option<&str>, address: Option<&str>) -> Option<ResolvedKey> {
    if let Ok(Some(d)) = DeviceId::from_reported(device_id) {
        return Some(ResolvedKey::from(&d));
    }
    address
        .and_then(|a| NetworkAddress::new(a).ok())
        .map(|a| ResolvedKey::from(&a))
}

pub fn license_active_from_status(status: Option<&str>) -> bool {
    status.map(str::trim) == Some(LICENSE_ACTIVATED)
}

/// One validated client report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityReport {
    pub device_id: Option<DeviceId>,
    pub address: NetworkAddress,
    pub tag: String,
    pub display_name: String,
    pub license_active: bool,
}

impl IdentityReport {
    pub fn v1(
        device_id: Option<DeviceId>,
        address: NetworkAddress,
        tag: String,
        display_name: String,
        license_active: bool,
    ) -> Result<Self, ContractViolation> {
        let r = Self {
            device_id,
            address,
            tag,
            display_name,
            license_active,
        };
        r.validate()?;
        Ok(r)
    }

    /// Builds a report from raw wire fields, applying sentinels and defaults.
    pub fn from_wire(
        device_id: Option<&str>,
        address: Option<&str>,
        tag: Option<&str>,
        display_name: Option<&str>,
        license_status: Option<&str>,
    ) -> Result<Self, ContractViolation> {
        let address = match address.map(str::trim) {
            Some(a) if !a.is_empty() => NetworkAddress::new(a)?,
            _ => {
                return Err(ContractViolation::MissingField {
                    field: "identity_report.address",
                })
            }
        };
        Self::v1(
            DeviceId::from_reported(device_id)?,
            address,
            label_or_unknown(tag),
            label_or_unknown(display_name),
            license_active_from_status(license_status),
        )
    }

    pub fn resolved_key(&self) -> ResolvedKey {
        resolve_key(self.device_id.as_ref(), &self.address)
    }

    pub fn key_source(&self) -> KeySource {
        if self.device_id.is_some() {
            KeySource::DeviceId
        } else {
            KeySource::Address
        }
    }

    /// Address key an anonymous record of this client would live under, if the
    /// report carries a device id and could therefore upgrade that record.
    pub fn upgrade_candidate_key(&self) -> Option<ResolvedKey> {
        self.device_id
            .as_ref()
            .map(|_| ResolvedKey::from(&self.address))
    }
}

impl Validate for IdentityReport {
    fn validate(&self) -> Result<(), ContractViolation> {
        if let Some(d) = &self.device_id {
            d.validate()?;
        }
        self.address.validate()?;
        validate_label("identity_report.tag", &self.tag)?;
        validate_label("identity_report.display_name", &self.display_name)?;
        Ok(())
    }
}

/// Latest known state of one canonical client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub schema_version: SchemaVersion,
    pub resolved_key: ResolvedKey,
    pub device_id: Option<DeviceId>,
    pub address: NetworkAddress,
    pub tag: String,
    pub display_name: String,
    pub verified_name: String,
    pub license_active: bool,
    pub allowed: bool,
    pub first_seen: UnixTimeMs,
    pub last_seen: UnixTimeMs,
}

impl IdentityRecord {
    /// First sighting: the allow gate starts closed.
    pub fn from_first_report(report: &IdentityReport, now: UnixTimeMs) -> Self {
        Self {
            schema_version: SchemaVersion(1),
            resolved_key: report.resolved_key(),
            device_id: report.device_id.clone(),
            address: report.address.clone(),
            tag: report.tag.clone(),
            display_name: report.display_name.clone(),
            verified_name: VERIFIED_NAME_PLACEHOLDER.to_string(),
            license_active: report.license_active,
            allowed: false,
            first_seen: now,
            last_seen: now,
        }
    }

    /// Applies a report to this record. `allowed` and `verified_name` are kept;
    /// `last_seen` never moves backward. Re-keys when the report resolves differently.
    pub fn merged_with(&self, report: &IdentityReport, now: UnixTimeMs) -> Self {
        Self {
            schema_version: self.schema_version,
            resolved_key: report.resolved_key(),
            device_id: report.device_id.clone(),
            address: report.address.clone(),
            tag: report.tag.clone(),
            display_name: report.display_name.clone(),
            verified_name: self.verified_name.clone(),
            license_active: report.license_active,
            allowed: self.allowed,
            first_seen: self.first_seen,
            last_seen: self.last_seen.max(now),
        }
    }

    pub fn is_anonymous(&self) -> bool {
        self.device_id.is_none()
    }
}

impl Validate for IdentityRecord {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.schema_version != SchemaVersion(1) {
            return Err(ContractViolation::InvalidValue {
                field: "identity_record.schema_version",
                reason: "unsupported schema version",
            });
        }
        if let Some(d) = &self.device_id {
            d.validate()?;
        }
        self.address.validate()?;
        if self.resolved_key != resolve_key(self.device_id.as_ref(), &self.address) {
            return Err(ContractViolation::InvalidValue {
                field: "identity_record.resolved_key",
                reason: "must match device_id, or address when device_id is absent",
            });
        }
        validate_label("identity_record.tag", &self.tag)?;
        validate_label("identity_record.display_name", &self.display_name)?;
        validate_label("identity_record.verified_name", &self.verified_name)?;
        if self.last_seen < self.first_seen {
            return Err(ContractViolation::InvalidValue {
                field: "identity_record.last_seen",
                reason: "must be >= first_seen",
            });
        }
        Ok(())
    }
}
