//! Tenant namespace naming.
//!
//! Tenant ids are arbitrary strings, so they are never interpolated into SQL.
//! Instead each tenant id is mapped to a name-based UUID and rendered as
//! `tenant_<32 hex>`; only that fixed-charset name reaches an identifier.

use core::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;
use crate::id::TenantId;

/// Prefix shared by every tenant namespace.
pub const SCHEMA_PREFIX: &str = "tenant_";

const HEX_LEN: usize = 32;

/// UUIDv5 namespace for tenant schema names. Changing it orphans every
/// existing namespace.
const TENANT_NAMESPACE: Uuid = Uuid::from_u128(0x6d61_696c_6368_6174_8000_7465_6e61_6e74);

/// Sanitized Postgres schema name for a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SchemaName(String);

impl SchemaName {
    /// Derive the namespace for a tenant. Deterministic across processes.
    pub fn for_tenant(tenant_id: &TenantId) -> Self {
        let uuid = Uuid::new_v5(&TENANT_NAMESPACE, tenant_id.as_str().as_bytes());
        Self(format!("{SCHEMA_PREFIX}{}", uuid.simple()))
    }

    /// Validate a name read back from storage.
    pub fn parse(value: &str) -> Result<Self, DomainError> {
        let Some(hex) = value.strip_prefix(SCHEMA_PREFIX) else {
            return Err(DomainError::invalid_id(format!(
                "SchemaName: missing '{SCHEMA_PREFIX}' prefix: {value:?}"
            )));
        };
        let valid = hex.len() == HEX_LEN
            && hex.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(DomainError::invalid_id(format!(
                "SchemaName: expected {HEX_LEN} lowercase hex chars: {value:?}"
            )));
        }
        Ok(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Double-quoted identifier for use in SQL text.
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl core::fmt::Display for SchemaName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SchemaName {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SchemaName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SchemaName> for String {
    fn from(value: SchemaName) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tenant(s: &str) -> TenantId {
        TenantId::new(s).unwrap()
    }

    #[test]
    fn distinct_tenants_get_distinct_schemas() {
        let a = SchemaName::for_tenant(&tenant("t1"));
        let b = SchemaName::for_tenant(&tenant("t2"));
        assert_ne!(a, b);
    }

    #[test]
    fn hostile_tenant_ids_are_neutralised() {
        let name = SchemaName::for_tenant(&tenant("x\"; DROP SCHEMA public CASCADE; --"));
        assert!(name.as_str().starts_with(SCHEMA_PREFIX));
        assert!(!name.as_str().contains('"'));
        assert_eq!(name.quoted(), format!("\"{}\"", name.as_str()));
    }

    #[test]
    fn parse_rejects_foreign_names() {
        assert!(SchemaName::parse("public").is_err());
        assert!(SchemaName::parse("tenant_").is_err());
        assert!(SchemaName::parse("tenant_0123456789ABCDEF0123456789abcdef").is_err());
        assert!(SchemaName::parse("tenant_0123456789abcdef0123456789abcdeg").is_err());
        assert!(SchemaName::parse("tenant_0123456789abcdef0123456789abcdef").is_ok());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: every tenant id maps to a stable name inside the allow-list.
        #[test]
        fn schema_names_stay_in_allow_list(raw in "[^\\x00]{1,60}") {
            prop_assume!(!raw.trim().is_empty());
            let id = tenant(&raw);
            let name = SchemaName::for_tenant(&id);

            prop_assert_eq!(name.as_str().len(), SCHEMA_PREFIX.len() + HEX_LEN);
            prop_assert!(name.as_str().bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'_'));
            prop_assert_eq!(SchemaName::parse(name.as_str()).unwrap(), name.clone());
            prop_assert_eq!(SchemaName::for_tenant(&id), name);
        }
    }
}
