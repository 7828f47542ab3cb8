//! Strongly-typed identifiers used across the domain.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;

/// Longest tenant identifier accepted, in bytes.
pub const MAX_TENANT_ID_LEN: usize = 256;

/// Identifier of a tenant (multi-tenant boundary).
///
/// Tenant ids are opaque: the UI layer derives them from a browser session or
/// a random value. They are never placed in SQL identifiers directly; see
/// [`crate::SchemaName`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    /// Validate and wrap an opaque tenant identifier.
    pub fn new(value: impl Into<String>) -> Result<Self, DomainError> {
        let value = value.into();
        if value.trim().is_empty() {
            return Err(DomainError::invalid_id("TenantId: must not be empty"));
        }
        if value.len() > MAX_TENANT_ID_LEN {
            return Err(DomainError::invalid_id(format!(
                "TenantId: {} bytes exceeds limit of {MAX_TENANT_ID_LEN}",
                value.len()
            )));
        }
        if value.contains('\0') {
            return Err(DomainError::invalid_id("TenantId: must not contain NUL"));
        }
        Ok(Self(value))
    }

    /// Generate a fresh tenant id for a new session.
    ///
    /// Uses UUIDv7 (time-ordered). Prefer passing ids explicitly in tests.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl core::fmt::Display for TenantId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TenantId {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for TenantId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TenantId> for String {
    fn from(value: TenantId) -> Self {
        value.0
    }
}

/// Row identifier assigned by the store on append.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(i64);

impl RecordId {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    pub fn get(&self) -> i64 {
        self.0
    }
}

impl core::fmt::Display for RecordId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

impl From<i64> for RecordId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}
