//! Tenant-owned activity records.
//!
//! `New*` types are what callers hand to the store; the `*Record` types are
//! what comes back, with the row id, owning tenant and timestamp attached.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{DomainError, DomainResult};
use crate::id::{RecordId, TenantId};
use crate::schema_name::SchemaName;

/// Speaker of a conversation turn.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationRole {
    System,
    User,
    Assistant,
}

impl ConversationRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationRole::System => "system",
            ConversationRole::User => "user",
            ConversationRole::Assistant => "assistant",
        }
    }
}

impl core::fmt::Display for ConversationRole {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for ConversationRole {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Self::System),
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            other => Err(DomainError::validation(format!("unknown conversation role: {other:?}"))),
        }
    }
}

/// A conversation turn ready to be appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewConversation {
    pub role: ConversationRole,
    pub content: String,
    pub context: Option<String>,
    pub generated_text: Option<String>,
}

impl NewConversation {
    pub fn new(role: ConversationRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            context: None,
            generated_text: None,
        }
    }

    /// Build a turn whose content is structured (a message list or object).
    ///
    /// Strings are stored as-is; any other JSON value is stored as its
    /// compact JSON text.
    pub fn from_json(role: ConversationRole, content: &JsonValue) -> Self {
        let content = match content {
            JsonValue::String(s) => s.clone(),
            other => other.to_string(),
        };
        Self::new(role, content)
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_generated_text(mut self, generated_text: impl Into<String>) -> Self {
        self.generated_text = Some(generated_text.into());
        self
    }
}

/// A stored conversation turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub id: RecordId,
    pub tenant_id: TenantId,
    pub role: ConversationRole,
    pub content: String,
    pub context: Option<String>,
    pub generated_text: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// An outbound email ready to be logged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEmailActivity {
    pub recipient: String,
    pub subject: String,
    pub context: String,
    pub body: String,
    pub generated_text: Option<String>,
}

impl NewEmailActivity {
    pub fn new(
        recipient: impl Into<String>,
        subject: impl Into<String>,
        context: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            recipient: recipient.into(),
            subject: subject.into(),
            context: context.into(),
            body: body.into(),
            generated_text: None,
        }
    }

    pub fn with_generated_text(mut self, generated_text: impl Into<String>) -> Self {
        self.generated_text = Some(generated_text.into());
        self
    }

    /// Reject activities the email log cannot meaningfully hold.
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.recipient.trim().is_empty() {
            return Err(DomainError::validation("email recipient must not be empty"));
        }
        Ok(())
    }
}

/// A logged email.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailActivityRecord {
    pub id: RecordId,
    pub tenant_id: TenantId,
    pub recipient: String,
    pub subject: String,
    pub context: String,
    pub body: String,
    pub generated_text: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// LLM token consumption for one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTokenUsage {
    pub tokens_used: i64,
    pub operation_type: String,
}

impl NewTokenUsage {
    pub fn new(tokens_used: i64, operation_type: impl Into<String>) -> Self {
        Self {
            tokens_used,
            operation_type: operation_type.into(),
        }
    }

    pub fn validate(&self) -> Result<(), DomainError> {
        if self.tokens_used < 0 {
            return Err(DomainError::validation(format!(
                "tokens_used must be non-negative, got {}",
                self.tokens_used
            )));
        }
        if self.operation_type.trim().is_empty() {
            return Err(DomainError::validation("operation_type must not be empty"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsageRecord {
    pub id: RecordId,
    pub tenant_id: TenantId,
    pub tokens_used: i64,
    pub operation_type: String,
    pub timestamp: DateTime<Utc>,
}

/// Aggregated token usage for a tenant.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsageSummary {
    pub total_tokens: i64,
    pub record_count: u64,
    pub by_operation: BTreeMap<String, i64>,
}

impl TokenUsageSummary {
    /// Fold individual records into a summary.
    ///
    /// Fails if a total no longer fits in an `i64`.
    pub fn from_records<'a>(
        records: impl IntoIterator<Item = &'a TokenUsageRecord>,
    ) -> DomainResult<Self> {
        let mut summary = Self::default();
        for r in records {
            summary.add(&r.operation_type, r.tokens_used, 1)?;
        }
        Ok(summary)
    }

    /// Add `tokens` spread across `count` records of one operation type.
    ///
    /// On overflow the summary is left unchanged.
    pub fn add(&mut self, operation_type: &str, tokens: i64, count: u64) -> DomainResult<()> {
        let overflow = || DomainError::validation("token usage total overflows i64");

        let total = self.total_tokens.checked_add(tokens).ok_or_else(overflow)?;
        let records = self.record_count.checked_add(count).ok_or_else(overflow)?;
        let per_op = self
            .by_operation
            .get(operation_type)
            .copied()
            .unwrap_or(0)
            .checked_add(tokens)
            .ok_or_else(overflow)?;

        self.total_tokens = total;
        self.record_count = records;
        self.by_operation.insert(operation_type.to_string(), per_op);
        Ok(())
    }
}

/// Registry entry describing a tenant namespace and its last activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantActivity {
    pub tenant_id: TenantId,
    pub schema_name: SchemaName,
    pub created_at: DateTime<Utc>,
    pub last_activity_at: DateTime<Utc>,
}
