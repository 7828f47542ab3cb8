//! DDL for tenant namespaces and the shared tenant registry.
//!
//! Only [`SchemaName`] values (fixed charset, always quoted) are spliced into
//! statement text. Tenant ids themselves are always bound as parameters.

use mailchat_core::SchemaName;

/// Shared table mapping namespaces to tenants and their last activity.
pub const REGISTRY_TABLE: &str = "tenant_registry";

/// Advisory lock key guarding creation of the registry table.
pub const REGISTRY_LOCK_KEY: i64 = 0x6d61_696c_6368_6174;

/// Tables provisioned in every tenant namespace.
pub const TENANT_TABLES: [&str; 3] = ["conversations", "email_activities", "token_usage"];

pub fn registry_ddl() -> Vec<String> {
    vec![
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {REGISTRY_TABLE} (
                schema_name TEXT PRIMARY KEY,
                tenant_id TEXT NOT NULL UNIQUE,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                last_activity_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {REGISTRY_TABLE}_last_activity_idx \
             ON {REGISTRY_TABLE} (last_activity_at)"
        ),
    ]
}

/// Statements creating a tenant namespace. Every statement is idempotent.
pub fn tenant_ddl(schema: &SchemaName) -> Vec<String> {
    let s = schema.quoted();
    vec![
        format!("CREATE SCHEMA IF NOT EXISTS {s}"),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {s}.conversations (
                id BIGSERIAL PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                role TEXT NOT NULL CHECK (role IN ('system', 'user', 'assistant')),
                content TEXT NOT NULL,
                context TEXT,
                generated_text TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp()
            )
            "#
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS conversations_recent_idx \
             ON {s}.conversations (tenant_id, created_at DESC, id DESC)"
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {s}.email_activities (
                id BIGSERIAL PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                recipient TEXT NOT NULL,
                subject TEXT NOT NULL,
                context TEXT NOT NULL,
                body TEXT NOT NULL,
                generated_text TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp()
            )
            "#
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS email_activities_recent_idx \
             ON {s}.email_activities (tenant_id, created_at DESC, id DESC)"
        ),
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {s}.token_usage (
                id BIGSERIAL PRIMARY KEY,
                tenant_id TEXT NOT NULL,
                tokens_used BIGINT NOT NULL CHECK (tokens_used >= 0),
                operation_type TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT clock_timestamp()
            )
            "#
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS token_usage_recent_idx \
             ON {s}.token_usage (tenant_id, created_at DESC, id DESC)"
        ),
    ]
}

pub fn drop_tenant_ddl(schema: &SchemaName) -> String {
    format!("DROP SCHEMA IF EXISTS {} CASCADE", schema.quoted())
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailchat_core::TenantId;

    #[test]
    fn tenant_ddl_only_references_the_quoted_schema() {
        let tenant = TenantId::new("evil\"; DROP TABLE x; --").unwrap();
        let schema = SchemaName::for_tenant(&tenant);
        let quoted = schema.quoted();

        let ddl = tenant_ddl(&schema);
        assert!(ddl[0].starts_with("CREATE SCHEMA IF NOT EXISTS"));
        for stmt in &ddl {
            assert!(stmt.contains(&quoted), "statement lacks schema: {stmt}");
            assert!(!stmt.contains(tenant.as_str()));
        }
        for table in TENANT_TABLES {
            assert!(ddl.iter().any(|s| s.contains(&format!("{quoted}.{table} ("))));
        }
    }

    #[test]
    fn drop_is_cascading_and_quoted() {
        let schema = SchemaName::for_tenant(&TenantId::new("t1").unwrap());
        assert_eq!(
            drop_tenant_ddl(&schema),
            format!("DROP SCHEMA IF EXISTS \"{}\" CASCADE", schema.as_str())
        );
    }
}
