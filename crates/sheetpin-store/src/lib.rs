//! Durable tables behind sheetpin: tenants, mappings, the recording ledger and
//! writer credentials.
//!
//! Uniqueness and atomic commit are part of the storage contract itself, so the
//! guarantees hold for every backend: `register_mapping` rejects an existing
//! `(team, channel, emoji)` triple and `try_commit` hands out exactly one
//! `Committed` per source message no matter how many callers race.

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

mod memory;
mod sqlite;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by store implementations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("mapping for emoji '{emoji}' in channel '{channel_id}' of team '{team_id}' already exists")]
    DuplicateMapping {
        team_id: String,
        channel_id: String,
        emoji: String,
    },
    #[error("invalid persisted value for '{field}': {value}")]
    InvalidPersistedValue { field: &'static str, value: String },
    #[error("storage worker failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Chrono(#[from] chrono::ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// One authorized installation of the bot into a Slack workspace.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantWorkspace {
    pub team_id: String,
    pub team_name: String,
    pub bot_token: String,
    /// Socket Mode app-level token; tenants without one use the process default.
    pub app_token: Option<String>,
    pub installed_at: DateTime<Utc>,
}

impl TenantWorkspace {
    pub fn new(
        team_id: impl Into<String>,
        team_name: impl Into<String>,
        bot_token: impl Into<String>,
    ) -> Self {
        Self {
            team_id: team_id.into(),
            team_name: team_name.into(),
            bot_token: bot_token.into(),
            app_token: None,
            installed_at: Utc::now(),
        }
    }
}

impl fmt::Debug for TenantWorkspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantWorkspace")
            .field("team_id", &self.team_id)
            .field("team_name", &self.team_name)
            .field("bot_token", &"<redacted>")
            .field("app_token", &self.app_token.as_ref().map(|_| "<redacted>"))
            .field("installed_at", &self.installed_at)
            .finish()
    }
}

/// Registration request for a new channel+emoji route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMapping {
    pub team_id: String,
    pub channel_id: String,
    pub emoji: String,
    pub spreadsheet_id: String,
    pub writer_ref: Option<String>,
}

/// Stored route from `(team, channel, emoji)` to a spreadsheet and writer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mapping {
    pub team_id: String,
    pub channel_id: String,
    pub emoji: String,
    pub spreadsheet_id: String,
    pub writer_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Mapping {
    fn from_new(mapping: NewMapping, created_at: DateTime<Utc>) -> Self {
        Self {
            team_id: mapping.team_id,
            channel_id: mapping.channel_id,
            emoji: mapping.emoji,
            spreadsheet_id: mapping.spreadsheet_id,
            writer_ref: mapping.writer_ref,
            created_at,
        }
    }
}

/// Ledger row proving a source message was appended to its spreadsheet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordingEntry {
    pub source_message_id: String,
    pub team_id: String,
    pub channel_id: String,
    pub message_ts: String,
    pub spreadsheet_id: String,
    pub recorded_at: DateTime<Utc>,
}

impl RecordingEntry {
    pub fn new(
        team_id: &str,
        channel_id: &str,
        message_ts: &str,
        spreadsheet_id: &str,
    ) -> Self {
        Self {
            source_message_id: source_message_id(team_id, channel_id, message_ts),
            team_id: team_id.to_string(),
            channel_id: channel_id.to_string(),
            message_ts: message_ts.to_string(),
            spreadsheet_id: spreadsheet_id.to_string(),
            recorded_at: Utc::now(),
        }
    }
}

/// Builds the ledger key of a message: unique per team, channel and timestamp.
pub fn source_message_id(team_id: &str, channel_id: &str, message_ts: &str) -> String {
    format!("{team_id}:{channel_id}:{message_ts}")
}

/// Outcome of [`RecordingLedger::try_commit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed,
    AlreadyRecorded,
}

/// Exchanged token material authorizing spreadsheet writes for one writer.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct WriterCredential {
    pub writer_ref: String,
    pub payload: Value,
    pub updated_at: DateTime<Utc>,
}

impl WriterCredential {
    pub fn new(writer_ref: impl Into<String>, payload: Value) -> Self {
        Self {
            writer_ref: writer_ref.into(),
            payload,
            updated_at: Utc::now(),
        }
    }
}

impl fmt::Debug for WriterCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterCredential")
            .field("writer_ref", &self.writer_ref)
            .field("payload", &"<redacted>")
            .field("updated_at", &self.updated_at)
            .finish()
    }
}

/// Channel+emoji routing table.
#[async_trait]
pub trait MappingStore: Send + Sync {
    /// Inserts the mapping or fails with [`StoreError::DuplicateMapping`],
    /// leaving any existing row untouched.
    async fn register_mapping(&self, mapping: NewMapping) -> StoreResult<Mapping>;
    async fn lookup_mapping(
        &self,
        team_id: &str,
        channel_id: &str,
        emoji: &str,
    ) -> StoreResult<Option<Mapping>>;
    async fn list_channel_mappings(
        &self,
        team_id: &str,
        channel_id: &str,
    ) -> StoreResult<Vec<Mapping>>;
}

/// Set of source messages already appended to a spreadsheet.
#[async_trait]
pub trait RecordingLedger: Send + Sync {
    async fn is_recorded(&self, source_message_id: &str) -> StoreResult<bool>;
    /// Linearizable per key: concurrent callers for one id see exactly one
    /// `Committed`.
    async fn try_commit(&self, entry: RecordingEntry) -> StoreResult<CommitOutcome>;
}

/// Tenant tokens, writer credentials and consumed exchange codes.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn upsert_tenant(&self, tenant: TenantWorkspace) -> StoreResult<()>;
    async fn get_tenant(&self, team_id: &str) -> StoreResult<Option<TenantWorkspace>>;
    async fn list_tenants(&self) -> StoreResult<Vec<TenantWorkspace>>;
    async fn put_writer_credential(&self, credential: WriterCredential) -> StoreResult<()>;
    async fn get_writer_credential(&self, writer_ref: &str)
        -> StoreResult<Option<WriterCredential>>;
    /// Returns `true` the first time a digest is seen, `false` afterwards.
    async fn consume_exchange_code(&self, code_digest: &str) -> StoreResult<bool>;
}

/// Everything the runtime needs from durable storage.
pub trait Store: MappingStore + RecordingLedger + CredentialStore {}

impl<T> Store for T where T: MappingStore + RecordingLedger + CredentialStore {}
