//! SQLite-backed store with durable persistence.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::{
    CommitOutcome, CredentialStore, Mapping, MappingStore, NewMapping, RecordingEntry,
    RecordingLedger, StoreError, StoreResult, TenantWorkspace, WriterCredential,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Persistent SQLite store shared by every tenant in the process.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    db_path: PathBuf,
}

impl SqliteStore {
    /// Opens (or creates) the database at `path` and applies the schema.
    pub fn new(path: impl AsRef<Path>) -> StoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let store = Self { db_path };
        let connection = open_connection(&store.db_path)?;
        initialize_schema(&connection)?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    async fn with_connection<T, F>(&self, operation: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
    {
        let db_path = self.db_path.clone();
        tokio::task::spawn_blocking(move || {
            let connection = open_connection(&db_path)?;
            operation(&connection)
        })
        .await?
    }
}

fn open_connection(db_path: &Path) -> StoreResult<Connection> {
    let connection = Connection::open(db_path)?;
    connection.busy_timeout(BUSY_TIMEOUT)?;
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        "#,
    )?;
    Ok(connection)
}

fn initialize_schema(connection: &Connection) -> StoreResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS tenants (
            team_id TEXT PRIMARY KEY,
            team_name TEXT NOT NULL,
            bot_token TEXT NOT NULL,
            app_token TEXT NULL,
            installed_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS mappings (
            team_id TEXT NOT NULL,
            channel_id TEXT NOT NULL,
            emoji TEXT NOT NULL,
            spreadsheet_id TEXT NOT NULL,
            writer_ref TEXT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (team_id, channel_id, emoji)
        );

        CREATE TABLE IF NOT EXISTS recordings (
            source_message_id TEXT PRIMARY KEY,
            team_id TEXT NOT NULL,
            channel_id TEXT NOT NULL,
            message_ts TEXT NOT NULL,
            spreadsheet_id TEXT NOT NULL,
            recorded_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS writer_credentials (
            writer_ref TEXT PRIMARY KEY,
            payload_json TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS consumed_exchange_codes (
            code_digest TEXT PRIMARY KEY,
            consumed_at TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

#[async_trait]
impl MappingStore for SqliteStore {
    async fn register_mapping(&self, mapping: NewMapping) -> StoreResult<Mapping> {
        self.with_connection(move |connection| {
            let created_at = Utc::now();
            let inserted = connection.execute(
                r#"
                INSERT INTO mappings (
                    team_id, channel_id, emoji, spreadsheet_id, writer_ref, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT (team_id, channel_id, emoji) DO NOTHING
                "#,
                params![
                    mapping.team_id,
                    mapping.channel_id,
                    mapping.emoji,
                    mapping.spreadsheet_id,
                    mapping.writer_ref,
                    timestamp_to_db(created_at),
                ],
            )?;
            if inserted == 0 {
                return Err(StoreError::DuplicateMapping {
                    team_id: mapping.team_id,
                    channel_id: mapping.channel_id,
                    emoji: mapping.emoji,
                });
            }
            Ok(Mapping::from_new(mapping, created_at))
        })
        .await
    }

    async fn lookup_mapping(
        &self,
        team_id: &str,
        channel_id: &str,
        emoji: &str,
    ) -> StoreResult<Option<Mapping>> {
        let team_id = team_id.to_string();
        let channel_id = channel_id.to_string();
        let emoji = emoji.to_string();
        self.with_connection(move |connection| {
            connection
                .query_row(
                    r#"
                    SELECT team_id, channel_id, emoji, spreadsheet_id, writer_ref, created_at
                    FROM mappings
                    WHERE team_id = ?1 AND channel_id = ?2 AND emoji = ?3
                    "#,
                    params![team_id, channel_id, emoji],
                    mapping_columns,
                )
                .optional()?
                .map(mapping_from_columns)
                .transpose()
        })
        .await
    }

    async fn list_channel_mappings(
        &self,
        team_id: &str,
        channel_id: &str,
    ) -> StoreResult<Vec<Mapping>> {
        let team_id = team_id.to_string();
        let channel_id = channel_id.to_string();
        self.with_connection(move |connection| {
            let mut statement = connection.prepare(
                r#"
                SELECT team_id, channel_id, emoji, spreadsheet_id, writer_ref, created_at
                FROM mappings
                WHERE team_id = ?1 AND channel_id = ?2
                ORDER BY emoji
                "#,
            )?;
            let rows = statement.query_map(params![team_id, channel_id], mapping_columns)?;
            let mut mappings = Vec::new();
            for row in rows {
                mappings.push(mapping_from_columns(row?)?);
            }
            Ok(mappings)
        })
        .await
    }
}

#[async_trait]
impl RecordingLedger for SqliteStore {
    async fn is_recorded(&self, source_message_id: &str) -> StoreResult<bool> {
        let source_message_id = source_message_id.to_string();
        self.with_connection(move |connection| {
            let exists = connection
                .query_row(
                    "SELECT 1 FROM recordings WHERE source_message_id = ?1",
                    params![source_message_id],
                    |row| row.get::<_, i64>(0),
                )
                .optional()?;
            Ok(exists.is_some())
        })
        .await
    }

    async fn try_commit(&self, entry: RecordingEntry) -> StoreResult<CommitOutcome> {
        self.with_connection(move |connection| {
            // One statement: the primary key decides the winner under WAL locking.
            let inserted = connection.execute(
                r#"
                INSERT INTO recordings (
                    source_message_id, team_id, channel_id, message_ts, spreadsheet_id,
                    recorded_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT (source_message_id) DO NOTHING
                "#,
                params![
                    entry.source_message_id,
                    entry.team_id,
                    entry.channel_id,
                    entry.message_ts,
                    entry.spreadsheet_id,
                    timestamp_to_db(entry.recorded_at),
                ],
            )?;
            Ok(if inserted == 1 {
                CommitOutcome::Committed
            } else {
                CommitOutcome::AlreadyRecorded
            })
        })
        .await
    }
}

#[async_trait]
impl CredentialStore for SqliteStore {
    async fn upsert_tenant(&self, tenant: TenantWorkspace) -> StoreResult<()> {
        self.with_connection(move |connection| {
            connection.execute(
                r#"
                INSERT INTO tenants (team_id, team_name, bot_token, app_token, installed_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT (team_id) DO UPDATE SET
                    team_name = excluded.team_name,
                    bot_token = excluded.bot_token,
                    app_token = COALESCE(excluded.app_token, tenants.app_token),
                    installed_at = excluded.installed_at
                "#,
                params![
                    tenant.team_id,
                    tenant.team_name,
                    tenant.bot_token,
                    tenant.app_token,
                    timestamp_to_db(tenant.installed_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_tenant(&self, team_id: &str) -> StoreResult<Option<TenantWorkspace>> {
        let team_id = team_id.to_string();
        self.with_connection(move |connection| {
            connection
                .query_row(
                    r#"
                    SELECT team_id, team_name, bot_token, app_token, installed_at
                    FROM tenants
                    WHERE team_id = ?1
                    "#,
                    params![team_id],
                    tenant_columns,
                )
                .optional()?
                .map(tenant_from_columns)
                .transpose()
        })
        .await
    }

    async fn list_tenants(&self) -> StoreResult<Vec<TenantWorkspace>> {
        self.with_connection(|connection| {
            let mut statement = connection.prepare(
                r#"
                SELECT team_id, team_name, bot_token, app_token, installed_at
                FROM tenants
                ORDER BY team_id
                "#,
            )?;
            let rows = statement.query_map([], tenant_columns)?;
            let mut tenants = Vec::new();
            for row in rows {
                tenants.push(tenant_from_columns(row?)?);
            }
            Ok(tenants)
        })
        .await
    }

    async fn put_writer_credential(&self, credential: WriterCredential) -> StoreResult<()> {
        self.with_connection(move |connection| {
            connection.execute(
                r#"
                INSERT INTO writer_credentials (writer_ref, payload_json, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT (writer_ref) DO UPDATE SET
                    payload_json = excluded.payload_json,
                    updated_at = excluded.updated_at
                "#,
                params![
                    credential.writer_ref,
                    serde_json::to_string(&credential.payload)?,
                    timestamp_to_db(credential.updated_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get_writer_credential(
        &self,
        writer_ref: &str,
    ) -> StoreResult<Option<WriterCredential>> {
        let writer_ref = writer_ref.to_string();
        self.with_connection(move |connection| {
            connection
                .query_row(
                    r#"
                    SELECT writer_ref, payload_json, updated_at
                    FROM writer_credentials
                    WHERE writer_ref = ?1
                    "#,
                    params![writer_ref],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()?
                .map(
                    |(writer_ref, payload_json, updated_at)| -> StoreResult<WriterCredential> {
                        Ok(WriterCredential {
                            writer_ref,
                            payload: serde_json::from_str(&payload_json)?,
                            updated_at: timestamp_from_db(&updated_at)?,
                        })
                    },
                )
                .transpose()
        })
        .await
    }

    async fn consume_exchange_code(&self, code_digest: &str) -> StoreResult<bool> {
        let code_digest = code_digest.to_string();
        self.with_connection(move |connection| {
            let inserted = connection.execute(
                r#"
                INSERT INTO consumed_exchange_codes (code_digest, consumed_at)
                VALUES (?1, ?2)
                ON CONFLICT (code_digest) DO NOTHING
                "#,
                params![code_digest, timestamp_to_db(Utc::now())],
            )?;
            Ok(inserted == 1)
        })
        .await
    }
}

type MappingColumns = (String, String, String, String, Option<String>, String);

fn mapping_columns(row: &rusqlite::Row<'_>) -> rusqlite::Result<MappingColumns> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
    ))
}

fn mapping_from_columns(
    (team_id, channel_id, emoji, spreadsheet_id, writer_ref, created_at): MappingColumns,
) -> StoreResult<Mapping> {
    Ok(Mapping {
        team_id,
        channel_id,
        emoji,
        spreadsheet_id,
        writer_ref,
        created_at: timestamp_from_db(&created_at)?,
    })
}

type TenantColumns = (String, String, String, Option<String>, String);

fn tenant_columns(row: &rusqlite::Row<'_>) -> rusqlite::Result<TenantColumns> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn tenant_from_columns(
    (team_id, team_name, bot_token, app_token, installed_at): TenantColumns,
) -> StoreResult<TenantWorkspace> {
    if bot_token.trim().is_empty() {
        return Err(StoreError::InvalidPersistedValue {
            field: "bot_token",
            value: format!("empty token for team {team_id}"),
        });
    }
    Ok(TenantWorkspace {
        team_id,
        team_name,
        bot_token,
        app_token,
        installed_at: timestamp_from_db(&installed_at)?,
    })
}

fn timestamp_to_db(value: DateTime<Utc>) -> String {
    value.to_rfc3339()
}

fn timestamp_from_db(value: &str) -> StoreResult<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}
