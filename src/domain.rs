use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::SipError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(String);

impl ObjectId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ObjectId {
    type Err = SipError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        if !is_path_safe(normalized) {
            return Err(SipError::InvalidObjectId(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

/// Identifier of one packaging attempt. Defaults to the object id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PackageId(String);

impl PackageId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PackageId {
    type Err = SipError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim();
        if !is_path_safe(normalized) {
            return Err(SipError::InvalidPackageId(value.to_string()));
        }
        Ok(Self(normalized.to_string()))
    }
}

impl From<&ObjectId> for PackageId {
    fn from(value: &ObjectId) -> Self {
        Self(value.0.clone())
    }
}

/// The sole key correlating all four stages.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageKey {
    pub object_id: ObjectId,
    pub package_id: PackageId,
}

impl PackageKey {
    pub fn new(object_id: ObjectId, package_id: Option<PackageId>) -> Self {
        let package_id = package_id.unwrap_or_else(|| PackageId::from(&object_id));
        Self {
            object_id,
            package_id,
        }
    }

    /// Whether the package id was overridden by the caller.
    pub fn has_custom_package_id(&self) -> bool {
        self.package_id.as_str() != self.object_id.as_str()
    }
}

impl fmt::Display for PackageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.object_id, self.package_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    NotStarted,
    Downloaded,
    Packaged,
    Submitted,
    Accepted,
    Rejected,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::NotStarted => "not_started",
            Stage::Downloaded => "downloaded",
            Stage::Packaged => "packaged",
            Stage::Submitted => "submitted",
            Stage::Accepted => "accepted",
            Stage::Rejected => "rejected",
        };
        f.write_str(name)
    }
}

/// Verdict published by the preservation service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ServiceOutcome {
    Accepted,
    Rejected,
}

impl ServiceOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceOutcome::Accepted => "accepted",
            ServiceOutcome::Rejected => "rejected",
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            ServiceOutcome::Accepted => Stage::Accepted,
            ServiceOutcome::Rejected => Stage::Rejected,
        }
    }
}

impl fmt::Display for ServiceOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceOutcome {
    type Err = SipError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "accepted" => Ok(ServiceOutcome::Accepted),
            "rejected" => Ok(ServiceOutcome::Rejected),
            other => Err(SipError::Precondition(format!(
                "{other} is not a valid status"
            ))),
        }
    }
}

/// Parses a timestamp and normalizes it to UTC.
///
/// Accepts RFC 3339 with an offset, and the catalogue's own
/// `YYYY-MM-DD HH:MM:SS[.fff]` form which is always UTC.
pub fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, SipError> {
    let trimmed = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(parsed.with_timezone(&Utc));
    }
    const NAIVE_FORMATS: &[&str] = &[
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
    ];
    for format in NAIVE_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(parsed.and_utc());
        }
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        if let Some(midnight) = date.and_hms_opt(0, 0, 0) {
            return Ok(midnight.and_utc());
        }
    }
    Err(SipError::InvalidDate(value.to_string()))
}

fn is_path_safe(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= 128
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
}
