//! In-memory store used by tests and ephemeral runs.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::{
    CommitOutcome, CredentialStore, Mapping, MappingStore, NewMapping, RecordingEntry,
    RecordingLedger, StoreError, StoreResult, TenantWorkspace, WriterCredential,
};

type MappingKey = (String, String, String);

#[derive(Debug, Default)]
struct MemoryState {
    tenants: BTreeMap<String, TenantWorkspace>,
    mappings: BTreeMap<MappingKey, Mapping>,
    recordings: HashMap<String, RecordingEntry>,
    writer_credentials: HashMap<String, WriterCredential>,
    consumed_codes: HashSet<String>,
}

/// Volatile store; every mutation happens under one write lock.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn recording_count(&self) -> usize {
        self.state.read().await.recordings.len()
    }
}

#[async_trait]
impl MappingStore for InMemoryStore {
    async fn register_mapping(&self, mapping: NewMapping) -> StoreResult<Mapping> {
        let mut state = self.state.write().await;
        let key = (
            mapping.team_id.clone(),
            mapping.channel_id.clone(),
            mapping.emoji.clone(),
        );
        if state.mappings.contains_key(&key) {
            return Err(StoreError::DuplicateMapping {
                team_id: mapping.team_id,
                channel_id: mapping.channel_id,
                emoji: mapping.emoji,
            });
        }
        let stored = Mapping::from_new(mapping, Utc::now());
        state.mappings.insert(key, stored.clone());
        Ok(stored)
    }

    async fn lookup_mapping(
        &self,
        team_id: &str,
        channel_id: &str,
        emoji: &str,
    ) -> StoreResult<Option<Mapping>> {
        let key = (
            team_id.to_string(),
            channel_id.to_string(),
            emoji.to_string(),
        );
        Ok(self.state.read().await.mappings.get(&key).cloned())
    }

    async fn list_channel_mappings(
        &self,
        team_id: &str,
        channel_id: &str,
    ) -> StoreResult<Vec<Mapping>> {
        Ok(self
            .state
            .read()
            .await
            .mappings
            .values()
            .filter(|mapping| mapping.team_id == team_id && mapping.channel_id == channel_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl RecordingLedger for InMemoryStore {
    async fn is_recorded(&self, source_message_id: &str) -> StoreResult<bool> {
        Ok(self
            .state
            .read()
            .await
            .recordings
            .contains_key(source_message_id))
    }

    async fn try_commit(&self, entry: RecordingEntry) -> StoreResult<CommitOutcome> {
        let mut state = self.state.write().await;
        if state.recordings.contains_key(&entry.source_message_id) {
            return Ok(CommitOutcome::AlreadyRecorded);
        }
        state
            .recordings
            .insert(entry.source_message_id.clone(), entry);
        Ok(CommitOutcome::Committed)
    }
}

#[async_trait]
impl CredentialStore for InMemoryStore {
    async fn upsert_tenant(&self, mut tenant: TenantWorkspace) -> StoreResult<()> {
        let mut state = self.state.write().await;
        if tenant.app_token.is_none() {
            tenant.app_token = state
                .tenants
                .get(&tenant.team_id)
                .and_then(|existing| existing.app_token.clone());
        }
        state.tenants.insert(tenant.team_id.clone(), tenant);
        Ok(())
    }

    async fn get_tenant(&self, team_id: &str) -> StoreResult<Option<TenantWorkspace>> {
        Ok(self.state.read().await.tenants.get(team_id).cloned())
    }

    async fn list_tenants(&self) -> StoreResult<Vec<TenantWorkspace>> {
        Ok(self.state.read().await.tenants.values().cloned().collect())
    }

    async fn put_writer_credential(&self, credential: WriterCredential) -> StoreResult<()> {
        self.state
            .write()
            .await
            .writer_credentials
            .insert(credential.writer_ref.clone(), credential);
        Ok(())
    }

    async fn get_writer_credential(
        &self,
        writer_ref: &str,
    ) -> StoreResult<Option<WriterCredential>> {
        Ok(self
            .state
            .read()
            .await
            .writer_credentials
            .get(writer_ref)
            .cloned())
    }

    async fn consume_exchange_code(&self, code_digest: &str) -> StoreResult<bool> {
        Ok(self
            .state
            .write()
            .await
            .consumed_codes
            .insert(code_digest.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::InMemoryStore;
    use crate::{
        CommitOutcome, CredentialStore, MappingStore, NewMapping, RecordingEntry,
        RecordingLedger, StoreError, TenantWorkspace,
    };

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn integration_concurrent_commits_yield_exactly_one_winner() {
        let store = Arc::new(InMemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..64 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store
                    .try_commit(RecordingEntry::new("T1", "C1", "42.000001", "sheet-a"))
                    .await
                    .expect("try commit")
            }));
        }

        let mut outcomes = Vec::new();
        for handle in handles {
            outcomes.push(handle.await.expect("join"));
        }
        let committed = outcomes
            .iter()
            .filter(|outcome| **outcome == CommitOutcome::Committed)
            .count();
        assert_eq!(committed, 1);
        assert_eq!(outcomes.len() - committed, 63);
        assert_eq!(store.recording_count().await, 1);
    }

    #[tokio::test]
    async fn functional_duplicate_registration_keeps_original_mapping() {
        let store = InMemoryStore::new();
        let mapping = NewMapping {
            team_id: "T1".to_string(),
            channel_id: "C1".to_string(),
            emoji: "check".to_string(),
            spreadsheet_id: "sheet-a".to_string(),
            writer_ref: None,
        };
        store
            .register_mapping(mapping.clone())
            .await
            .expect("first registration");
        let error = store
            .register_mapping(NewMapping {
                spreadsheet_id: "sheet-b".to_string(),
                ..mapping
            })
            .await
            .expect_err("duplicate registration");
        assert!(matches!(error, StoreError::DuplicateMapping { .. }));
        let stored = store
            .lookup_mapping("T1", "C1", "check")
            .await
            .expect("lookup")
            .expect("mapping");
        assert_eq!(stored.spreadsheet_id, "sheet-a");
        assert!(stored.writer_ref.is_none());
    }

    #[tokio::test]
    async fn unit_reinstall_without_app_token_keeps_previous_app_token() {
        let store = InMemoryStore::new();
        let mut tenant = TenantWorkspace::new("T1", "Acme", "xoxb-1");
        tenant.app_token = Some("xapp-1".to_string());
        store.upsert_tenant(tenant).await.expect("install");
        store
            .upsert_tenant(TenantWorkspace::new("T1", "Acme", "xoxb-2"))
            .await
            .expect("reinstall");

        let stored = store.get_tenant("T1").await.expect("get").expect("tenant");
        assert_eq!(stored.bot_token, "xoxb-2");
        assert_eq!(stored.app_token.as_deref(), Some("xapp-1"));
        assert!(store.consume_exchange_code("x").await.expect("consume"));
        assert!(!store.consume_exchange_code("x").await.expect("consume again"));
    }
}
