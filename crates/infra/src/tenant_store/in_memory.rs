use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use mailchat_core::{
    ConversationRecord, EmailActivityRecord, NewConversation, NewEmailActivity, NewTokenUsage,
    RecordId, SchemaName, TenantActivity, TenantId, TokenUsageRecord, TokenUsageSummary,
};

use super::r#trait::{StoreError, TenantStore};
use super::stale_cutoff;

#[derive(Debug)]
struct Namespace {
    tenant_id: TenantId,
    created_at: DateTime<Utc>,
    last_activity_at: DateTime<Utc>,
    conversations: Vec<ConversationRecord>,
    email_activities: Vec<EmailActivityRecord>,
    token_usage: Vec<TokenUsageRecord>,
}

impl Namespace {
    fn new(tenant_id: TenantId, now: DateTime<Utc>) -> Self {
        Self {
            tenant_id,
            created_at: now,
            last_activity_at: now,
            conversations: Vec::new(),
            email_activities: Vec::new(),
            token_usage: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    namespaces: HashMap<SchemaName, Namespace>,
    next_id: i64,
    last_tick: Option<DateTime<Utc>>,
}

impl State {
    /// Wall-clock time, never earlier than the previous tick.
    fn tick(&mut self) -> DateTime<Utc> {
        let now = match self.last_tick {
            Some(prev) => Utc::now().max(prev),
            None => Utc::now(),
        };
        self.last_tick = Some(now);
        now
    }

    fn next_record_id(&mut self) -> RecordId {
        self.next_id += 1;
        RecordId::new(self.next_id)
    }

    /// Namespace for `tenant_id`, provisioning it on first touch.
    fn namespace_mut(&mut self, tenant_id: &TenantId, now: DateTime<Utc>) -> Result<&mut Namespace, StoreError> {
        let schema = SchemaName::for_tenant(tenant_id);
        let ns = self.namespaces.entry(schema.clone()).or_insert_with(|| {
            debug!(tenant = %schema, "provisioned in-memory namespace");
            Namespace::new(tenant_id.clone(), now)
        });
        if &ns.tenant_id != tenant_id {
            return Err(StoreError::TenantIsolation(format!(
                "namespace {schema} belongs to another tenant"
            )));
        }
        Ok(ns)
    }

    fn namespace(&self, tenant_id: &TenantId) -> Result<Option<&Namespace>, StoreError> {
        let schema = SchemaName::for_tenant(tenant_id);
        match self.namespaces.get(&schema) {
            Some(ns) if &ns.tenant_id != tenant_id => Err(StoreError::TenantIsolation(format!(
                "namespace {schema} belongs to another tenant"
            ))),
            other => Ok(other),
        }
    }
}

/// In-memory tenant store for tests/dev.
///
/// Mirrors the Postgres store's contract (lazy namespaces, newest-first
/// reads, idle sweeps) without a database.
#[derive(Debug, Default)]
pub struct InMemoryTenantStore {
    inner: RwLock<State>,
}

impl InMemoryTenantStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of provisioned namespaces.
    pub fn namespace_count(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .namespaces
            .len()
    }

    /// Move a tenant's last activity into the past.
    #[cfg(test)]
    pub(crate) fn backdate(&self, tenant_id: &TenantId, by: Duration) {
        let mut state = self.inner.write().unwrap();
        let ns = state
            .namespaces
            .get_mut(&SchemaName::for_tenant(tenant_id))
            .expect("tenant namespace exists");
        ns.last_activity_at -= chrono::Duration::from_std(by).unwrap();
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, State>, StoreError> {
        self.inner
            .read()
            .map_err(|_| StoreError::Query("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, State>, StoreError> {
        self.inner
            .write()
            .map_err(|_| StoreError::Query("lock poisoned".to_string()))
    }
}

/// Newest first: timestamp descending, then id descending.
fn most_recent<T: Clone>(
    rows: &[T],
    limit: usize,
    key: impl Fn(&T) -> (DateTime<Utc>, RecordId),
) -> Vec<T> {
    let mut sorted: Vec<&T> = rows.iter().collect();
    sorted.sort_by(|a, b| key(b).cmp(&key(a)));
    sorted.into_iter().take(limit).cloned().collect()
}

#[async_trait]
impl TenantStore for InMemoryTenantStore {
    async fn ensure_schema(&self, tenant_id: &TenantId) -> Result<(), StoreError> {
        let mut state = self.write()?;
        let now = state.tick();
        let ns = state.namespace_mut(tenant_id, now)?;
        ns.last_activity_at = now;
        Ok(())
    }

    async fn append_conversation(
        &self,
        tenant_id: &TenantId,
        record: NewConversation,
    ) -> Result<RecordId, StoreError> {
        let mut state = self.write()?;
        let now = state.tick();
        let id = state.next_record_id();
        let ns = state.namespace_mut(tenant_id, now)?;
        ns.conversations.push(ConversationRecord {
            id,
            tenant_id: tenant_id.clone(),
            role: record.role,
            content: record.content,
            context: record.context,
            generated_text: record.generated_text,
            timestamp: now,
        });
        ns.last_activity_at = now;
        Ok(id)
    }

    async fn recent_conversations(
        &self,
        tenant_id: &TenantId,
        limit: usize,
    ) -> Result<Vec<ConversationRecord>, StoreError> {
        let state = self.read()?;
        Ok(state
            .namespace(tenant_id)?
            .map(|ns| most_recent(&ns.conversations, limit, |r| (r.timestamp, r.id)))
            .unwrap_or_default())
    }

    async fn append_email_activity(
        &self,
        tenant_id: &TenantId,
        record: NewEmailActivity,
    ) -> Result<RecordId, StoreError> {
        record.validate()?;
        let mut state = self.write()?;
        let now = state.tick();
        let id = state.next_record_id();
        let ns = state.namespace_mut(tenant_id, now)?;
        ns.email_activities.push(EmailActivityRecord {
            id,
            tenant_id: tenant_id.clone(),
            recipient: record.recipient,
            subject: record.subject,
            context: record.context,
            body: record.body,
            generated_text: record.generated_text,
            timestamp: now,
        });
        ns.last_activity_at = now;
        Ok(id)
    }

    async fn recent_email_activities(
        &self,
        tenant_id: &TenantId,
        limit: usize,
    ) -> Result<Vec<EmailActivityRecord>, StoreError> {
        let state = self.read()?;
        Ok(state
            .namespace(tenant_id)?
            .map(|ns| most_recent(&ns.email_activities, limit, |r| (r.timestamp, r.id)))
            .unwrap_or_default())
    }

    async fn append_token_usage(
        &self,
        tenant_id: &TenantId,
        record: NewTokenUsage,
    ) -> Result<RecordId, StoreError> {
        record.validate()?;
        let mut state = self.write()?;
        let now = state.tick();
        let id = state.next_record_id();
        let ns = state.namespace_mut(tenant_id, now)?;
        ns.token_usage.push(TokenUsageRecord {
            id,
            tenant_id: tenant_id.clone(),
            tokens_used: record.tokens_used,
            operation_type: record.operation_type,
            timestamp: now,
        });
        ns.last_activity_at = now;
        Ok(id)
    }

    async fn recent_token_usage(
        &self,
        tenant_id: &TenantId,
        limit: usize,
    ) -> Result<Vec<TokenUsageRecord>, StoreError> {
        let state = self.read()?;
        Ok(state
            .namespace(tenant_id)?
            .map(|ns| most_recent(&ns.token_usage, limit, |r| (r.timestamp, r.id)))
            .unwrap_or_default())
    }

    async fn token_usage_summary(
        &self,
        tenant_id: &TenantId,
    ) -> Result<TokenUsageSummary, StoreError> {
        let state = self.read()?;
        Ok(state
            .namespace(tenant_id)?
            .map(|ns| TokenUsageSummary::from_records(&ns.token_usage))
            .transpose()?
            .unwrap_or_default())
    }

    async fn clear_tenant(&self, tenant_id: &TenantId) -> Result<(), StoreError> {
        let mut state = self.write()?;
        if let Some(ns) = state.namespaces.get_mut(&SchemaName::for_tenant(tenant_id)) {
            if &ns.tenant_id == tenant_id {
                ns.conversations.clear();
                ns.email_activities.clear();
                ns.token_usage.clear();
            }
        }
        Ok(())
    }

    async fn cleanup_stale_tenants(&self, age_threshold: Duration) -> Result<u64, StoreError> {
        let cutoff = stale_cutoff(age_threshold)?;

        let mut state = self.write()?;
        let before = state.namespaces.len();
        state.namespaces.retain(|schema, ns| {
            let stale = ns.last_activity_at < cutoff;
            if stale {
                info!(tenant = %schema, last_activity_at = %ns.last_activity_at, "dropped stale tenant namespace");
            }
            !stale
        });
        Ok((before - state.namespaces.len()) as u64)
    }

    async fn list_tenants(&self) -> Result<Vec<TenantActivity>, StoreError> {
        let state = self.read()?;
        let mut tenants: Vec<TenantActivity> = state
            .namespaces
            .iter()
            .map(|(schema, ns)| TenantActivity {
                tenant_id: ns.tenant_id.clone(),
                schema_name: schema.clone(),
                created_at: ns.created_at,
                last_activity_at: ns.last_activity_at,
            })
            .collect();
        tenants.sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
        Ok(tenants)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailchat_core::ConversationRole;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn tenant(s: &str) -> TenantId {
        TenantId::new(s).unwrap()
    }

    fn email(recipient: &str) -> NewEmailActivity {
        NewEmailActivity::new(recipient, "Hello", "launch", format!("Dear {recipient}"))
    }

    #[tokio::test]
    async fn ensure_schema_is_idempotent() {
        let store = InMemoryTenantStore::new();
        let t1 = tenant("t1");

        store.ensure_schema(&t1).await.unwrap();
        store.ensure_schema(&t1).await.unwrap();

        assert_eq!(store.namespace_count(), 1);
        assert_eq!(store.list_tenants().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn recent_email_activities_are_newest_first() {
        let store = InMemoryTenantStore::new();
        let t1 = tenant("t1");

        for r in ["a@x.com", "b@x.com", "c@x.com"] {
            store.append_email_activity(&t1, email(r)).await.unwrap();
        }

        let recent = store.recent_email_activities(&t1, 2).await.unwrap();
        let recipients: Vec<&str> = recent.iter().map(|r| r.recipient.as_str()).collect();
        assert_eq!(recipients, ["c@x.com", "b@x.com"]);
    }

    #[tokio::test]
    async fn tenants_never_see_each_other() {
        let store = InMemoryTenantStore::new();
        let a = tenant("a");
        let b = tenant("b");

        store
            .append_conversation(&a, NewConversation::new(ConversationRole::User, "secret"))
            .await
            .unwrap();
        store.append_email_activity(&a, email("a@x.com")).await.unwrap();
        store.append_token_usage(&a, NewTokenUsage::new(42, "chat")).await.unwrap();

        assert!(store.recent_conversations(&b, 10).await.unwrap().is_empty());
        assert!(store.recent_email_activities(&b, 10).await.unwrap().is_empty());
        assert!(store.recent_token_usage(&b, 10).await.unwrap().is_empty());
        assert_eq!(store.token_usage_summary(&b).await.unwrap(), TokenUsageSummary::default());

        let mine = store.recent_conversations(&a, 10).await.unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0].tenant_id, a);
    }

    #[tokio::test]
    async fn appends_provision_missing_namespaces() {
        let store = InMemoryTenantStore::new();
        let t1 = tenant("fresh");

        store
            .append_conversation(
                &t1,
                NewConversation::new(ConversationRole::Assistant, "hi").with_context("ctx"),
            )
            .await
            .unwrap();

        assert_eq!(store.namespace_count(), 1);
        let turns = store.recent_conversations(&t1, 5).await.unwrap();
        assert_eq!(turns[0].context.as_deref(), Some("ctx"));
    }

    #[tokio::test]
    async fn invalid_records_are_rejected() {
        let store = InMemoryTenantStore::new();
        let t1 = tenant("t1");

        let err = store
            .append_token_usage(&t1, NewTokenUsage::new(-5, "chat"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidInput(_)));
        assert_eq!(store.namespace_count(), 0);
    }

    #[tokio::test]
    async fn zero_limit_returns_nothing() {
        let store = InMemoryTenantStore::new();
        let t1 = tenant("t1");
        store.append_email_activity(&t1, email("a@x.com")).await.unwrap();

        assert!(store.recent_email_activities(&t1, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn token_usage_is_summarised() {
        let store = InMemoryTenantStore::new();
        let t1 = tenant("t1");
        store.append_token_usage(&t1, NewTokenUsage::new(100, "chat")).await.unwrap();
        store.append_token_usage(&t1, NewTokenUsage::new(40, "email")).await.unwrap();
        store.append_token_usage(&t1, NewTokenUsage::new(60, "chat")).await.unwrap();

        let summary = store.token_usage_summary(&t1).await.unwrap();
        assert_eq!(summary.total_tokens, 200);
        assert_eq!(summary.record_count, 3);
        assert_eq!(summary.by_operation["chat"], 160);

        let recent = store.recent_token_usage(&t1, 1).await.unwrap();
        assert_eq!(recent[0].tokens_used, 60);
    }

    #[tokio::test]
    async fn clear_tenant_keeps_namespace_and_other_tenants() {
        let store = InMemoryTenantStore::new();
        let a = tenant("a");
        let b = tenant("b");
        store.append_email_activity(&a, email("a@x.com")).await.unwrap();
        store.append_email_activity(&b, email("b@x.com")).await.unwrap();

        store.clear_tenant(&a).await.unwrap();

        assert!(store.recent_email_activities(&a, 10).await.unwrap().is_empty());
        assert_eq!(store.recent_email_activities(&b, 10).await.unwrap().len(), 1);
        assert_eq!(store.namespace_count(), 2);
    }

    #[tokio::test]
    async fn cleanup_only_drops_idle_namespaces() {
        let store = InMemoryTenantStore::new();
        let idle = tenant("idle");
        let active = tenant("active");
        store.ensure_schema(&idle).await.unwrap();
        store.ensure_schema(&active).await.unwrap();
        store.backdate(&idle, Duration::from_secs(7200));

        let dropped = store.cleanup_stale_tenants(Duration::from_secs(3600)).await.unwrap();

        assert_eq!(dropped, 1);
        let remaining = store.list_tenants().await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].tenant_id, active);
    }

    #[tokio::test]
    async fn activity_after_backdating_protects_namespace() {
        let store = InMemoryTenantStore::new();
        let t1 = tenant("t1");
        store.ensure_schema(&t1).await.unwrap();
        store.backdate(&t1, Duration::from_secs(7200));
        store.append_email_activity(&t1, email("a@x.com")).await.unwrap();

        let dropped = store.cleanup_stale_tenants(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(dropped, 0);
        assert_eq!(store.recent_email_activities(&t1, 5).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn ensure_schema_refreshes_activity_of_existing_namespace() {
        let store = InMemoryTenantStore::new();
        let t1 = tenant("t1");
        store.ensure_schema(&t1).await.unwrap();
        store.backdate(&t1, Duration::from_secs(7200));

        store.ensure_schema(&t1).await.unwrap();

        let dropped = store.cleanup_stale_tenants(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(dropped, 0);
        assert_eq!(store.namespace_count(), 1);
    }

    #[tokio::test]
    async fn summary_overflow_is_an_error_not_a_panic() {
        let store = InMemoryTenantStore::new();
        let t1 = tenant("t1");
        store.append_token_usage(&t1, NewTokenUsage::new(i64::MAX, "chat")).await.unwrap();
        store.append_token_usage(&t1, NewTokenUsage::new(1, "email")).await.unwrap();

        let err = store.token_usage_summary(&t1).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidInput(_)), "{err:?}");
    }

    #[test]
    fn namespace_count_survives_a_poisoned_lock() {
        let store = Arc::new(InMemoryTenantStore::new());
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        rt.block_on(store.ensure_schema(&tenant("t1"))).unwrap();

        let poisoner = Arc::clone(&store);
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.inner.write().unwrap();
            panic!("poison the lock");
        })
        .join();

        assert!(store.inner.is_poisoned());
        assert_eq!(store.namespace_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_first_touch_creates_one_namespace() {
        let store = Arc::new(InMemoryTenantStore::new());
        let t1 = tenant("racer");

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                let t1 = t1.clone();
                tokio::spawn(async move { store.ensure_schema(&t1).await })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(store.namespace_count(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Property: asking for k of N records yields exactly the k newest, newest first.
        #[test]
        fn recent_returns_k_newest(n in 1usize..40, k_seed in 0usize..40) {
            let k = k_seed % (n + 1);
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let store = InMemoryTenantStore::new();
            let t1 = tenant("prop");

            let recent = rt.block_on(async {
                for i in 0..n {
                    store
                        .append_conversation(&t1, NewConversation::new(ConversationRole::User, i.to_string()))
                        .await
                        .unwrap();
                }
                store.recent_conversations(&t1, k).await.unwrap()
            });

            let contents: Vec<String> = recent.iter().map(|r| r.content.clone()).collect();
            let expected: Vec<String> = (0..n).rev().take(k).map(|i| i.to_string()).collect();
            prop_assert_eq!(contents, expected);
        }
    }
}
