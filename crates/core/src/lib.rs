//! `mailchat-core`: tenant and record primitives.
//!
//! This crate contains **pure domain** types (no infrastructure concerns).
//! Storage adapters live in `mailchat-infra`.

pub mod error;
pub mod id;
pub mod record;
pub mod schema_name;

pub use error::{DomainError, DomainResult};
pub use id::{RecordId, TenantId};
pub use record::{
    ConversationRecord, ConversationRole, EmailActivityRecord, NewConversation, NewEmailActivity,
    NewTokenUsage, TenantActivity, TokenUsageRecord, TokenUsageSummary,
};
pub use schema_name::SchemaName;
