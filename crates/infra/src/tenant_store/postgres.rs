//! Postgres-backed tenant store implementation.
//!
//! Each tenant gets its own schema (named by [`SchemaName`]) holding the
//! `conversations`, `email_activities` and `token_usage` tables. A shared
//! `tenant_registry` table records which tenant owns which schema and when it
//! was last active; the cleanup sweep works off that column.
//!
//! ## Locking
//!
//! | Operation | Locks taken (in order) |
//! |-----------|------------------------|
//! | `ensure_schema` | advisory xact lock on the schema name, registry row, DDL |
//! | `append_*` | registry row (via `UPDATE`), tenant table |
//! | `cleanup_stale_tenants` | advisory xact lock on the schema name, registry row (`FOR UPDATE`), `DROP SCHEMA` |
//!
//! All writers touch the registry row before the tenant tables, so appends,
//! provisioning and drops of the same tenant serialize without deadlocking.
//!
//! ## Thread Safety
//!
//! `PostgresTenantStore` is `Send + Sync` and cheap to clone; all clones share
//! the injected SQLx pool.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{info, instrument, warn, Span};

use mailchat_core::{
    ConversationRecord, ConversationRole, EmailActivityRecord, NewConversation, NewEmailActivity,
    NewTokenUsage, RecordId, SchemaName, TenantActivity, TenantId, TokenUsageRecord,
    TokenUsageSummary,
};

use super::r#trait::{StoreError, TenantStore};
use super::stale_cutoff;
use super::schema::{
    REGISTRY_LOCK_KEY, REGISTRY_TABLE, TENANT_TABLES, drop_tenant_ddl, registry_ddl, tenant_ddl,
};
use crate::config::StoreConfig;
use crate::db::{connect_pool, is_numeric_overflow, is_unique_violation, map_sqlx_error};
use crate::retry::{RetryPolicy, retry_transient};

/// Postgres-backed, schema-per-tenant activity store.
///
/// ## Tenant Isolation
///
/// Queries address the tenant's own schema AND filter on the `tenant_id`
/// column; rows that come back are checked against the requested tenant
/// before being returned.
///
/// ## Failure Handling
///
/// - Transient errors (`StoreError::Connection`) are retried per the
///   configured [`RetryPolicy`].
/// - Appends that hit a missing namespace run `ensure_schema` once and retry.
/// - Everything else is returned to the caller.
#[derive(Debug, Clone)]
pub struct PostgresTenantStore {
    pool: Arc<PgPool>,
    retry: RetryPolicy,
}

/// A row to append, borrowed from the caller's record.
#[derive(Debug, Clone, Copy)]
enum NewRow<'r> {
    Conversation(&'r NewConversation),
    EmailActivity(&'r NewEmailActivity),
    TokenUsage(&'r NewTokenUsage),
}

impl NewRow<'_> {
    fn operation(&self) -> &'static str {
        match self {
            NewRow::Conversation(_) => "append_conversation",
            NewRow::EmailActivity(_) => "append_email_activity",
            NewRow::TokenUsage(_) => "append_token_usage",
        }
    }
}

impl PostgresTenantStore {
    /// Create a store over an existing pool.
    ///
    /// Call [`migrate`](Self::migrate) once before first use.
    pub fn new(pool: PgPool, retry: RetryPolicy) -> Self {
        Self {
            pool: Arc::new(pool),
            retry,
        }
    }

    /// Connect a pool from configuration and install the registry.
    pub async fn connect(config: &StoreConfig) -> Result<Self, StoreError> {
        let pool = connect_pool(&config.database_url, &config.pool, &config.retry).await?;
        let store = Self::new(pool, config.retry.clone());
        store.migrate().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Close the underlying pool, waiting for checked-out connections.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Create the shared tenant registry if it does not exist.
    ///
    /// Serialized across processes by a fixed advisory lock.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        retry_transient(&self.retry, "migrate", move || async move {
            let mut tx = self.begin("migrate").await?;
            sqlx::query("SELECT pg_advisory_xact_lock($1)")
                .bind(REGISTRY_LOCK_KEY)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("registry_lock", e))?;
            for stmt in registry_ddl() {
                sqlx::query(&stmt)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| map_sqlx_error("registry_ddl", e))?;
            }
            commit(tx, "migrate").await
        })
        .await
    }

    /// Idempotently provision the tenant's namespace.
    ///
    /// Concurrent callers for the same tenant are serialized by a
    /// transaction-scoped advisory lock keyed by the schema name. A duplicate
    /// object error that still surfaces (e.g. a schema created out of band)
    /// is resolved by confirming the namespace exists.
    #[instrument(skip(self, tenant_id), fields(tenant = %SchemaName::for_tenant(tenant_id)), err)]
    pub async fn ensure_schema(&self, tenant_id: &TenantId) -> Result<(), StoreError> {
        let schema = &SchemaName::for_tenant(tenant_id);
        let result = retry_transient(&self.retry, "ensure_schema", move || {
            self.provision(tenant_id, schema)
        })
        .await;

        match result {
            Err(StoreError::SchemaRace(msg)) => {
                warn!(error = %msg, "concurrent namespace creation detected; verifying namespace");
                if self.namespace_exists(schema).await? {
                    Ok(())
                } else {
                    retry_transient(&self.retry, "ensure_schema", move || {
                        self.provision(tenant_id, schema)
                    })
                    .await
                    .map_err(|e| match e {
                        StoreError::SchemaRace(msg) => StoreError::Query(msg),
                        other => other,
                    })
                }
            }
            other => other,
        }
    }

    async fn provision(&self, tenant_id: &TenantId, schema: &SchemaName) -> Result<(), StoreError> {
        let mut tx = self.begin("ensure_schema").await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(schema.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("tenant_lock", e))?;

        let owner = sqlx::query_scalar::<_, String>(&format!(
            r#"
            INSERT INTO {REGISTRY_TABLE} (schema_name, tenant_id)
            VALUES ($1, $2)
            ON CONFLICT (schema_name)
            DO UPDATE SET last_activity_at = NOW()
            RETURNING tenant_id
            "#
        ))
        .bind(schema.as_str())
        .bind(tenant_id.as_str())
        .fetch_one(&mut *tx)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                StoreError::SchemaRace(format!("registry entry for {schema} created concurrently"))
            } else {
                map_sqlx_error("register_tenant", e)
            }
        })?;

        if owner != tenant_id.as_str() {
            rollback(tx, "ensure_schema").await?;
            return Err(StoreError::TenantIsolation(format!(
                "namespace {schema} is registered to another tenant"
            )));
        }

        for stmt in tenant_ddl(schema) {
            sqlx::query(&stmt).execute(&mut *tx).await.map_err(|e| {
                if is_unique_violation(&e) {
                    StoreError::SchemaRace(format!("objects in {schema} created concurrently"))
                } else {
                    map_sqlx_error("tenant_ddl", e)
                }
            })?;
        }

        commit(tx, "ensure_schema").await?;
        info!(tenant = %schema, "tenant namespace ensured");
        Ok(())
    }

    async fn namespace_exists(&self, schema: &SchemaName) -> Result<bool, StoreError> {
        retry_transient(&self.retry, "namespace_exists", move || async move {
            sqlx::query_scalar::<_, bool>(&format!(
                r#"
                SELECT
                    EXISTS (SELECT 1 FROM pg_namespace WHERE nspname = $1)
                    AND EXISTS (SELECT 1 FROM {REGISTRY_TABLE} WHERE schema_name = $1)
                "#
            ))
            .bind(schema.as_str())
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("namespace_exists", e))
        })
        .await
    }

    #[instrument(skip(self, tenant_id, record), fields(tenant = %SchemaName::for_tenant(tenant_id), role = %record.role), err)]
    pub async fn append_conversation(
        &self,
        tenant_id: &TenantId,
        record: NewConversation,
    ) -> Result<RecordId, StoreError> {
        self.append_with_repair(tenant_id, NewRow::Conversation(&record))
            .await
    }

    #[instrument(skip(self, tenant_id), fields(tenant = %SchemaName::for_tenant(tenant_id)), err)]
    pub async fn recent_conversations(
        &self,
        tenant_id: &TenantId,
        limit: usize,
    ) -> Result<Vec<ConversationRecord>, StoreError> {
        let schema = SchemaName::for_tenant(tenant_id);
        let sql = format!(
            r#"
            SELECT id, tenant_id, role, content, context, generated_text, created_at
            FROM {}.conversations
            WHERE tenant_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
            schema.quoted()
        );
        let rows = self.fetch_recent(tenant_id, "recent_conversations", &sql, limit).await?;
        rows.iter()
            .map(|row| conversation_from_row(row, tenant_id))
            .collect()
    }

    #[instrument(skip(self, tenant_id, record), fields(tenant = %SchemaName::for_tenant(tenant_id)), err)]
    pub async fn append_email_activity(
        &self,
        tenant_id: &TenantId,
        record: NewEmailActivity,
    ) -> Result<RecordId, StoreError> {
        record.validate()?;
        self.append_with_repair(tenant_id, NewRow::EmailActivity(&record))
            .await
    }

    #[instrument(skip(self, tenant_id), fields(tenant = %SchemaName::for_tenant(tenant_id)), err)]
    pub async fn recent_email_activities(
        &self,
        tenant_id: &TenantId,
        limit: usize,
    ) -> Result<Vec<EmailActivityRecord>, StoreError> {
        let schema = SchemaName::for_tenant(tenant_id);
        let sql = format!(
            r#"
            SELECT id, tenant_id, recipient, subject, context, body, generated_text, created_at
            FROM {}.email_activities
            WHERE tenant_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
            schema.quoted()
        );
        let rows = self.fetch_recent(tenant_id, "recent_email_activities", &sql, limit).await?;
        rows.iter()
            .map(|row| email_activity_from_row(row, tenant_id))
            .collect()
    }

    #[instrument(skip(self, tenant_id, record), fields(tenant = %SchemaName::for_tenant(tenant_id), operation_type = %record.operation_type), err)]
    pub async fn append_token_usage(
        &self,
        tenant_id: &TenantId,
        record: NewTokenUsage,
    ) -> Result<RecordId, StoreError> {
        record.validate()?;
        self.append_with_repair(tenant_id, NewRow::TokenUsage(&record))
            .await
    }

    #[instrument(skip(self, tenant_id), fields(tenant = %SchemaName::for_tenant(tenant_id)), err)]
    pub async fn recent_token_usage(
        &self,
        tenant_id: &TenantId,
        limit: usize,
    ) -> Result<Vec<TokenUsageRecord>, StoreError> {
        let schema = SchemaName::for_tenant(tenant_id);
        let sql = format!(
            r#"
            SELECT id, tenant_id, tokens_used, operation_type, created_at
            FROM {}.token_usage
            WHERE tenant_id = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
            schema.quoted()
        );
        let rows = self.fetch_recent(tenant_id, "recent_token_usage", &sql, limit).await?;
        rows.iter()
            .map(|row| token_usage_from_row(row, tenant_id))
            .collect()
    }

    #[instrument(skip(self, tenant_id), fields(tenant = %SchemaName::for_tenant(tenant_id)), err)]
    pub async fn token_usage_summary(
        &self,
        tenant_id: &TenantId,
    ) -> Result<TokenUsageSummary, StoreError> {
        let schema = SchemaName::for_tenant(tenant_id);
        let sql = format!(
            r#"
            SELECT operation_type, SUM(tokens_used)::BIGINT AS tokens, COUNT(*) AS records
            FROM {}.token_usage
            WHERE tenant_id = $1
            GROUP BY operation_type
            "#,
            schema.quoted()
        );

        let sql = &sql;
        let result = retry_transient(&self.retry, "token_usage_summary", move || async move {
            sqlx::query(sql)
                .bind(tenant_id.as_str())
                .fetch_all(&*self.pool)
                .await
                .map_err(|e| {
                    if is_numeric_overflow(&e) {
                        StoreError::InvalidInput("token usage total overflows i64".to_string())
                    } else {
                        map_sqlx_error("token_usage_summary", e)
                    }
                })
        })
        .await;

        let rows = match result {
            Ok(rows) => rows,
            Err(StoreError::NotFound(_)) => return Ok(TokenUsageSummary::default()),
            Err(e) => return Err(e),
        };

        let mut summary = TokenUsageSummary::default();
        for row in rows {
            let operation_type: String = row.try_get("operation_type").map_err(decode_error)?;
            let tokens: i64 = row.try_get("tokens").map_err(decode_error)?;
            let records: i64 = row.try_get("records").map_err(decode_error)?;
            summary.add(&operation_type, tokens, records as u64)?;
        }
        Ok(summary)
    }

    /// Delete every record of a tenant while keeping its namespace.
    #[instrument(skip(self, tenant_id), fields(tenant = %SchemaName::for_tenant(tenant_id)), err)]
    pub async fn clear_tenant(&self, tenant_id: &TenantId) -> Result<(), StoreError> {
        let schema = &SchemaName::for_tenant(tenant_id);
        let result = retry_transient(&self.retry, "clear_tenant", move || async move {
            let mut tx = self.begin("clear_tenant").await?;
            for table in TENANT_TABLES {
                let sql = format!("DELETE FROM {}.{table} WHERE tenant_id = $1", schema.quoted());
                if let Err(e) = sqlx::query(&sql).bind(tenant_id.as_str()).execute(&mut *tx).await {
                    let err = map_sqlx_error("clear_tenant", e);
                    rollback(tx, "clear_tenant").await?;
                    return Err(err);
                }
            }
            commit(tx, "clear_tenant").await
        })
        .await;

        match result {
            Err(StoreError::NotFound(_)) => Ok(()),
            other => other,
        }
    }

    /// Drop namespaces whose last activity is older than `age_threshold`.
    ///
    /// Staleness is judged against the database clock, and re-checked under
    /// the tenant's advisory lock and registry row lock right before the
    /// drop. Per-tenant failures are logged and skipped.
    #[instrument(skip(self), fields(age_secs = age_threshold.as_secs(), candidates = tracing::field::Empty), err)]
    pub async fn cleanup_stale_tenants(&self, age_threshold: Duration) -> Result<u64, StoreError> {
        stale_cutoff(age_threshold)?;
        let age_secs = age_threshold.as_secs_f64();

        let candidates = retry_transient(&self.retry, "cleanup_candidates", move || async move {
            sqlx::query_scalar::<_, String>(&format!(
                r#"
                SELECT schema_name
                FROM {REGISTRY_TABLE}
                WHERE last_activity_at < NOW() - ($1 * INTERVAL '1 second')
                ORDER BY last_activity_at ASC
                "#
            ))
            .bind(age_secs)
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("cleanup_candidates", e))
        })
        .await?;

        let span = Span::current();
        span.record("candidates", candidates.len());

        let mut dropped = 0u64;
        for name in candidates {
            let schema = match SchemaName::parse(&name) {
                Ok(s) => s,
                Err(e) => {
                    warn!(schema = %name, error = %e, "skipping unrecognised registry entry");
                    continue;
                }
            };
            match self.drop_if_stale(&schema, age_secs).await {
                Ok(true) => {
                    info!(tenant = %schema, "dropped stale tenant namespace");
                    dropped += 1;
                }
                Ok(false) => {}
                Err(e) => warn!(tenant = %schema, error = %e, "failed to drop stale tenant namespace"),
            }
        }
        Ok(dropped)
    }

    async fn drop_if_stale(&self, schema: &SchemaName, age_secs: f64) -> Result<bool, StoreError> {
        let mut tx = self.begin("drop_tenant").await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(schema.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("tenant_lock", e))?;

        let stale = sqlx::query_scalar::<_, bool>(&format!(
            r#"
            SELECT last_activity_at < NOW() - ($2 * INTERVAL '1 second')
            FROM {REGISTRY_TABLE}
            WHERE schema_name = $1
            FOR UPDATE
            "#
        ))
        .bind(schema.as_str())
        .bind(age_secs)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("recheck_activity", e))?;

        if stale != Some(true) {
            rollback(tx, "drop_tenant").await?;
            return Ok(false);
        }

        sqlx::query(&drop_tenant_ddl(schema))
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("drop_schema", e))?;
        sqlx::query(&format!("DELETE FROM {REGISTRY_TABLE} WHERE schema_name = $1"))
            .bind(schema.as_str())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("unregister_tenant", e))?;

        commit(tx, "drop_tenant").await?;
        Ok(true)
    }

    #[instrument(skip(self), err)]
    pub async fn list_tenants(&self) -> Result<Vec<TenantActivity>, StoreError> {
        let rows = retry_transient(&self.retry, "list_tenants", move || async move {
            sqlx::query(&format!(
                r#"
                SELECT tenant_id, schema_name, created_at, last_activity_at
                FROM {REGISTRY_TABLE}
                ORDER BY last_activity_at DESC
                "#
            ))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_tenants", e))
        })
        .await?;

        rows.iter()
            .map(|row| -> Result<TenantActivity, StoreError> {
                let tenant_id: String = row.try_get("tenant_id").map_err(decode_error)?;
                let schema_name: String = row.try_get("schema_name").map_err(decode_error)?;
                Ok(TenantActivity {
                    tenant_id: TenantId::new(tenant_id)?,
                    schema_name: SchemaName::parse(&schema_name)?,
                    created_at: row.try_get("created_at").map_err(decode_error)?,
                    last_activity_at: row.try_get("last_activity_at").map_err(decode_error)?,
                })
            })
            .collect()
    }

    async fn begin(&self, operation: &str) -> Result<Transaction<'static, Postgres>, StoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error(operation, e))
    }

    /// Run an append, provisioning the namespace once if it is missing.
    async fn append_with_repair(
        &self,
        tenant_id: &TenantId,
        row: NewRow<'_>,
    ) -> Result<RecordId, StoreError> {
        let schema = &SchemaName::for_tenant(tenant_id);
        let operation = row.operation();

        let first = retry_transient(&self.retry, operation, move || {
            self.insert(tenant_id, schema, row)
        })
        .await;

        match first {
            Err(StoreError::NotFound(msg)) => {
                warn!(tenant = %schema, operation, error = %msg, "tenant namespace missing; provisioning and retrying once");
                self.ensure_schema(tenant_id).await?;
                retry_transient(&self.retry, operation, move || {
                    self.insert(tenant_id, schema, row)
                })
                .await
            }
            other => other,
        }
    }

    /// Insert one row inside a transaction that first bumps the tenant's
    /// registry activity. A missing registry row means the namespace is gone.
    async fn insert(
        &self,
        tenant_id: &TenantId,
        schema: &SchemaName,
        row: NewRow<'_>,
    ) -> Result<RecordId, StoreError> {
        let operation = row.operation();
        let mut tx = self.begin(operation).await?;

        let touched = sqlx::query(&format!(
            r#"
            UPDATE {REGISTRY_TABLE}
            SET last_activity_at = NOW()
            WHERE schema_name = $1 AND tenant_id = $2
            "#
        ))
        .bind(schema.as_str())
        .bind(tenant_id.as_str())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("touch_tenant", e))?;

        if touched.rows_affected() == 0 {
            rollback(tx, operation).await?;
            return Err(StoreError::NotFound(format!("no registry entry for {schema}")));
        }

        let inserted = match row {
            NewRow::Conversation(r) => {
                sqlx::query_scalar::<_, i64>(&format!(
                    r#"
                    INSERT INTO {}.conversations (tenant_id, role, content, context, generated_text)
                    VALUES ($1, $2, $3, $4, $5)
                    RETURNING id
                    "#,
                    schema.quoted()
                ))
                .bind(tenant_id.as_str())
                .bind(r.role.as_str())
                .bind(&r.content)
                .bind(r.context.as_deref())
                .bind(r.generated_text.as_deref())
                .fetch_one(&mut *tx)
                .await
            }
            NewRow::EmailActivity(r) => {
                sqlx::query_scalar::<_, i64>(&format!(
                    r#"
                    INSERT INTO {}.email_activities
                        (tenant_id, recipient, subject, context, body, generated_text)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    RETURNING id
                    "#,
                    schema.quoted()
                ))
                .bind(tenant_id.as_str())
                .bind(&r.recipient)
                .bind(&r.subject)
                .bind(&r.context)
                .bind(&r.body)
                .bind(r.generated_text.as_deref())
                .fetch_one(&mut *tx)
                .await
            }
            NewRow::TokenUsage(r) => {
                sqlx::query_scalar::<_, i64>(&format!(
                    r#"
                    INSERT INTO {}.token_usage (tenant_id, tokens_used, operation_type)
                    VALUES ($1, $2, $3)
                    RETURNING id
                    "#,
                    schema.quoted()
                ))
                .bind(tenant_id.as_str())
                .bind(r.tokens_used)
                .bind(&r.operation_type)
                .fetch_one(&mut *tx)
                .await
            }
        };

        let id = match inserted {
            Ok(id) => id,
            Err(e) => {
                let err = map_sqlx_error(operation, e);
                rollback(tx, operation).await?;
                return Err(err);
            }
        };

        commit(tx, operation).await?;
        Ok(RecordId::new(id))
    }

    async fn fetch_recent(
        &self,
        tenant_id: &TenantId,
        operation: &'static str,
        sql: &str,
        limit: usize,
    ) -> Result<Vec<PgRow>, StoreError> {
        if limit == 0 {
            return Ok(vec![]);
        }
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let result = retry_transient(&self.retry, operation, move || async move {
            sqlx::query(sql)
                .bind(tenant_id.as_str())
                .bind(limit)
                .fetch_all(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error(operation, e))
        })
        .await;

        match result {
            // A tenant that was never provisioned has no records yet.
            Err(StoreError::NotFound(_)) => Ok(vec![]),
            other => other,
        }
    }
}

async fn commit(tx: Transaction<'static, Postgres>, operation: &str) -> Result<(), StoreError> {
    tx.commit().await.map_err(|e| map_sqlx_error(operation, e))
}

async fn rollback(tx: Transaction<'static, Postgres>, operation: &str) -> Result<(), StoreError> {
    tx.rollback().await.map_err(|e| map_sqlx_error(operation, e))
}

fn decode_error(err: sqlx::Error) -> StoreError {
    StoreError::Query(format!("failed to decode row: {err}"))
}

fn owned_by(row: &PgRow, tenant_id: &TenantId) -> Result<TenantId, StoreError> {
    let owner: String = row.try_get("tenant_id").map_err(decode_error)?;
    if owner != tenant_id.as_str() {
        return Err(StoreError::TenantIsolation(
            "row tenant_id does not match requested tenant".to_string(),
        ));
    }
    Ok(tenant_id.clone())
}

fn conversation_from_row(row: &PgRow, tenant_id: &TenantId) -> Result<ConversationRecord, StoreError> {
    let role: String = row.try_get("role").map_err(decode_error)?;
    Ok(ConversationRecord {
        id: RecordId::new(row.try_get("id").map_err(decode_error)?),
        tenant_id: owned_by(row, tenant_id)?,
        role: role.parse::<ConversationRole>()?,
        content: row.try_get("content").map_err(decode_error)?,
        context: row.try_get("context").map_err(decode_error)?,
        generated_text: row.try_get("generated_text").map_err(decode_error)?,
        timestamp: row.try_get::<DateTime<Utc>, _>("created_at").map_err(decode_error)?,
    })
}

fn email_activity_from_row(
    row: &PgRow,
    tenant_id: &TenantId,
) -> Result<EmailActivityRecord, StoreError> {
    Ok(EmailActivityRecord {
        id: RecordId::new(row.try_get("id").map_err(decode_error)?),
        tenant_id: owned_by(row, tenant_id)?,
        recipient: row.try_get("recipient").map_err(decode_error)?,
        subject: row.try_get("subject").map_err(decode_error)?,
        context: row.try_get("context").map_err(decode_error)?,
        body: row.try_get("body").map_err(decode_error)?,
        generated_text: row.try_get("generated_text").map_err(decode_error)?,
        timestamp: row.try_get::<DateTime<Utc>, _>("created_at").map_err(decode_error)?,
    })
}

fn token_usage_from_row(row: &PgRow, tenant_id: &TenantId) -> Result<TokenUsageRecord, StoreError> {
    Ok(TokenUsageRecord {
        id: RecordId::new(row.try_get("id").map_err(decode_error)?),
        tenant_id: owned_by(row, tenant_id)?,
        tokens_used: row.try_get("tokens_used").map_err(decode_error)?,
        operation_type: row.try_get("operation_type").map_err(decode_error)?,
        timestamp: row.try_get::<DateTime<Utc>, _>("created_at").map_err(decode_error)?,
    })
}

// Implement TenantStore trait

#[async_trait::async_trait]
impl TenantStore for PostgresTenantStore {
    async fn ensure_schema(&self, tenant_id: &TenantId) -> Result<(), StoreError> {
        self.ensure_schema(tenant_id).await
    }

    async fn append_conversation(
        &self,
        tenant_id: &TenantId,
        record: NewConversation,
    ) -> Result<RecordId, StoreError> {
        self.append_conversation(tenant_id, record).await
    }

    async fn recent_conversations(
        &self,
        tenant_id: &TenantId,
        limit: usize,
    ) -> Result<Vec<ConversationRecord>, StoreError> {
        self.recent_conversations(tenant_id, limit).await
    }

    async fn append_email_activity(
        &self,
        tenant_id: &TenantId,
        record: NewEmailActivity,
    ) -> Result<RecordId, StoreError> {
        self.append_email_activity(tenant_id, record).await
    }

    async fn recent_email_activities(
        &self,
        tenant_id: &TenantId,
        limit: usize,
    ) -> Result<Vec<EmailActivityRecord>, StoreError> {
        self.recent_email_activities(tenant_id, limit).await
    }

    async fn append_token_usage(
        &self,
        tenant_id: &TenantId,
        record: NewTokenUsage,
    ) -> Result<RecordId, StoreError> {
        self.append_token_usage(tenant_id, record).await
    }

    async fn recent_token_usage(
        &self,
        tenant_id: &TenantId,
        limit: usize,
    ) -> Result<Vec<TokenUsageRecord>, StoreError> {
        self.recent_token_usage(tenant_id, limit).await
    }

    async fn token_usage_summary(
        &self,
        tenant_id: &TenantId,
    ) -> Result<TokenUsageSummary, StoreError> {
        self.token_usage_summary(tenant_id).await
    }

    async fn clear_tenant(&self, tenant_id: &TenantId) -> Result<(), StoreError> {
        self.clear_tenant(tenant_id).await
    }

    async fn cleanup_stale_tenants(&self, age_threshold: Duration) -> Result<u64, StoreError> {
        self.cleanup_stale_tenants(age_threshold).await
    }

    async fn list_tenants(&self) -> Result<Vec<TenantActivity>, StoreError> {
        self.list_tenants().await
    }
}

