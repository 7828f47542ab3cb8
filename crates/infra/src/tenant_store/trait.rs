use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use mailchat_core::{
    ConversationRecord, DomainError, EmailActivityRecord, NewConversation, NewEmailActivity,
    NewTokenUsage, RecordId, TenantActivity, TenantId, TokenUsageRecord, TokenUsageSummary,
};

/// Tenant store operation error.
///
/// These are **infrastructure errors** (connectivity, missing namespaces,
/// rejected queries) as opposed to domain validation errors, which are
/// carried in `InvalidInput`.
///
/// ## Error Categories
///
/// - **Connection**: pool exhausted or database unreachable; retried by the
///   store's `RetryPolicy` before it reaches the caller
/// - **PoolClosed**: the owning application closed the pool
/// - **SchemaRace**: concurrent namespace creation; resolved inside
///   `ensure_schema` and never returned from it
/// - **NotFound**: the tenant namespace is missing; appends repair it once
/// - **Query**: malformed query, constraint violation, undecodable row
/// - **TenantIsolation**: a row or registry entry belongs to another tenant
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("connection pool closed")]
    PoolClosed,

    #[error("concurrent schema creation: {0}")]
    SchemaRace(String),

    #[error("tenant namespace not found: {0}")]
    NotFound(String),

    #[error("query failed: {0}")]
    Query(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),
}

impl StoreError {
    /// Whether the failure is transient and the operation may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Connection(_))
    }
}

impl From<DomainError> for StoreError {
    fn from(err: DomainError) -> Self {
        StoreError::InvalidInput(err.to_string())
    }
}

/// Tenant-isolated activity store.
///
/// Every tenant owns one namespace holding its conversation, email and token
/// usage logs. Namespaces are created lazily: `ensure_schema` may be called
/// up front, and appends provision a missing namespace on their own.
///
/// ## Isolation
///
/// Rows carry their tenant id both through the namespace they live in and in
/// a `tenant_id` column. Reads filter on both.
///
/// ## Ordering
///
/// `recent_*` operations return newest first (timestamp descending, ties
/// broken by descending record id).
#[async_trait]
pub trait TenantStore: Send + Sync {
    /// Idempotently create the tenant's namespace and tables.
    async fn ensure_schema(&self, tenant_id: &TenantId) -> Result<(), StoreError>;

    async fn append_conversation(
        &self,
        tenant_id: &TenantId,
        record: NewConversation,
    ) -> Result<RecordId, StoreError>;

    async fn recent_conversations(
        &self,
        tenant_id: &TenantId,
        limit: usize,
    ) -> Result<Vec<ConversationRecord>, StoreError>;

    async fn append_email_activity(
        &self,
        tenant_id: &TenantId,
        record: NewEmailActivity,
    ) -> Result<RecordId, StoreError>;

    async fn recent_email_activities(
        &self,
        tenant_id: &TenantId,
        limit: usize,
    ) -> Result<Vec<EmailActivityRecord>, StoreError>;

    async fn append_token_usage(
        &self,
        tenant_id: &TenantId,
        record: NewTokenUsage,
    ) -> Result<RecordId, StoreError>;

    async fn recent_token_usage(
        &self,
        tenant_id: &TenantId,
        limit: usize,
    ) -> Result<Vec<TokenUsageRecord>, StoreError>;

    /// Aggregate the tenant's token usage per operation type.
    async fn token_usage_summary(&self, tenant_id: &TenantId)
    -> Result<TokenUsageSummary, StoreError>;

    /// Remove all records of a tenant, keeping its namespace.
    async fn clear_tenant(&self, tenant_id: &TenantId) -> Result<(), StoreError>;

    /// Drop namespaces idle for longer than `age_threshold`.
    ///
    /// Best-effort: failures on individual tenants are logged and skipped.
    /// Returns the number of namespaces dropped.
    async fn cleanup_stale_tenants(&self, age_threshold: Duration) -> Result<u64, StoreError>;

    /// Snapshot of all known tenant namespaces, most recently active first.
    async fn list_tenants(&self) -> Result<Vec<TenantActivity>, StoreError>;
}

#[async_trait]
impl<S> TenantStore for Arc<S>
where
    S: TenantStore + ?Sized,
{
    async fn ensure_schema(&self, tenant_id: &TenantId) -> Result<(), StoreError> {
        (**self).ensure_schema(tenant_id).await
    }

    async fn append_conversation(
        &self,
        tenant_id: &TenantId,
        record: NewConversation,
    ) -> Result<RecordId, StoreError> {
        (**self).append_conversation(tenant_id, record).await
    }

    async fn recent_conversations(
        &self,
        tenant_id: &TenantId,
        limit: usize,
    ) -> Result<Vec<ConversationRecord>, StoreError> {
        (**self).recent_conversations(tenant_id, limit).await
    }

    async fn append_email_activity(
        &self,
        tenant_id: &TenantId,
        record: NewEmailActivity,
    ) -> Result<RecordId, StoreError> {
        (**self).append_email_activity(tenant_id, record).await
    }

    async fn recent_email_activities(
        &self,
        tenant_id: &TenantId,
        limit: usize,
    ) -> Result<Vec<EmailActivityRecord>, StoreError> {
        (**self).recent_email_activities(tenant_id, limit).await
    }

    async fn append_token_usage(
        &self,
        tenant_id: &TenantId,
        record: NewTokenUsage,
    ) -> Result<RecordId, StoreError> {
        (**self).append_token_usage(tenant_id, record).await
    }

    async fn recent_token_usage(
        &self,
        tenant_id: &TenantId,
        limit: usize,
    ) -> Result<Vec<TokenUsageRecord>, StoreError> {
        (**self).recent_token_usage(tenant_id, limit).await
    }

    async fn token_usage_summary(
        &self,
        tenant_id: &TenantId,
    ) -> Result<TokenUsageSummary, StoreError> {
        (**self).token_usage_summary(tenant_id).await
    }

    async fn clear_tenant(&self, tenant_id: &TenantId) -> Result<(), StoreError> {
        (**self).clear_tenant(tenant_id).await
    }

    async fn cleanup_stale_tenants(&self, age_threshold: Duration) -> Result<u64, StoreError> {
        (**self).cleanup_stale_tenants(age_threshold).await
    }

    async fn list_tenants(&self) -> Result<Vec<TenantActivity>, StoreError> {
        (**self).list_tenants().await
    }
}
