use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use serde_json::{json, Value};
use sheetpin_sheets::{AppendOutcome, SheetWriter};
use sheetpin_slack::{ChatPlatform, SourceMessage};
use sheetpin_store::{InMemoryStore, TenantWorkspace};

use crate::dispatcher::ChatPlatformProvider;
use crate::state_token::StateSigner;
use crate::vault::{CredentialVault, WriterAuthorizer};

pub(crate) fn test_vault(
    store: Arc<InMemoryStore>,
    authorizer: Arc<FakeAuthorizer>,
) -> CredentialVault {
    CredentialVault::new(
        store,
        authorizer,
        StateSigner::new("test-secret").expect("signer"),
    )
}

#[derive(Default)]
pub(crate) struct FakeAuthorizer {
    exchanges: Mutex<Vec<String>>,
    fail_next: AtomicBool,
}

impl FakeAuthorizer {
    pub(crate) fn exchanges(&self) -> Vec<String> {
        self.exchanges.lock().expect("exchanges").clone()
    }

    pub(crate) fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl WriterAuthorizer for FakeAuthorizer {
    fn authorization_url(&self, state: &str) -> Result<String> {
        Ok(format!("https://consent.test/auth?state={state}"))
    }

    async fn exchange_code(&self, code: &str) -> Result<Value> {
        self.exchanges.lock().expect("exchanges").push(code.to_string());
        if self.fail_next.swap(false, Ordering::SeqCst) {
            bail!("invalid_grant");
        }
        Ok(json!({ "access_token": format!("token-for-{code}") }))
    }
}

type Posted = (String, String, String);

pub(crate) struct FakeChatPlatform {
    messages: HashMap<(String, String), SourceMessage>,
    users: HashMap<String, String>,
    replies: Mutex<Vec<Posted>>,
    ephemerals: Mutex<Vec<Posted>>,
}

impl Default for FakeChatPlatform {
    fn default() -> Self {
        Self {
            messages: HashMap::new(),
            users: HashMap::from([
                ("U1".to_string(), "alice".to_string()),
                ("U2".to_string(), "bob".to_string()),
            ]),
            replies: Mutex::new(Vec::new()),
            ephemerals: Mutex::new(Vec::new()),
        }
    }
}

impl FakeChatPlatform {
    pub(crate) fn with_message(channel_id: &str, ts: &str, author_id: &str, text: &str) -> Self {
        let mut platform = Self::default();
        platform.messages.insert(
            (channel_id.to_string(), ts.to_string()),
            SourceMessage {
                ts: ts.to_string(),
                author_id: author_id.to_string(),
                text: text.to_string(),
                client_message_id: Some(format!("client-{ts}")),
            },
        );
        platform
    }

    /// Thread replies as `(channel, thread_ts, text)`.
    pub(crate) fn replies(&self) -> Vec<Posted> {
        self.replies.lock().expect("replies").clone()
    }

    /// Ephemeral messages as `(channel, user, text)`.
    pub(crate) fn ephemerals(&self) -> Vec<Posted> {
        self.ephemerals.lock().expect("ephemerals").clone()
    }
}

#[async_trait]
impl ChatPlatform for FakeChatPlatform {
    async fn fetch_message(&self, channel_id: &str, message_ts: &str) -> Result<SourceMessage> {
        self.messages
            .get(&(channel_id.to_string(), message_ts.to_string()))
            .cloned()
            .ok_or_else(|| anyhow!("slack conversations.history failed: message_not_found"))
    }

    async fn permalink(&self, channel_id: &str, message_ts: &str) -> Result<String> {
        Ok(format!(
            "https://acme.slack.test/archives/{channel_id}/p{}",
            message_ts.replace('.', "")
        ))
    }

    async fn user_display_name(&self, user_id: &str) -> Result<String> {
        Ok(self
            .users
            .get(user_id)
            .cloned()
            .unwrap_or_else(|| user_id.to_string()))
    }

    async fn post_thread_reply(&self, channel_id: &str, thread_ts: &str, text: &str) -> Result<()> {
        self.replies.lock().expect("replies").push((
            channel_id.to_string(),
            thread_ts.to_string(),
            text.to_string(),
        ));
        Ok(())
    }

    async fn post_ephemeral(&self, channel_id: &str, user_id: &str, text: &str) -> Result<()> {
        self.ephemerals.lock().expect("ephemerals").push((
            channel_id.to_string(),
            user_id.to_string(),
            text.to_string(),
        ));
        Ok(())
    }
}

pub(crate) struct FixedPlatformProvider(pub(crate) Arc<FakeChatPlatform>);

impl ChatPlatformProvider for FixedPlatformProvider {
    fn for_tenant(&self, _tenant: &TenantWorkspace) -> Result<Arc<dyn ChatPlatform>> {
        Ok(self.0.clone())
    }
}

#[derive(Default)]
pub(crate) struct FakeSheetWriter {
    rows: Mutex<Vec<(String, Vec<String>)>>,
    failing_sheet: Option<String>,
    delay: Option<Duration>,
    refreshed_credential: Option<Value>,
}

impl FakeSheetWriter {
    pub(crate) fn failing_for(spreadsheet_id: &str) -> Self {
        Self {
            failing_sheet: Some(spreadsheet_id.to_string()),
            ..Self::default()
        }
    }

    pub(crate) fn delayed(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub(crate) fn refreshing(payload: Value) -> Self {
        Self {
            refreshed_credential: Some(payload),
            ..Self::default()
        }
    }

    /// Appended rows as `(spreadsheet_id, values)`.
    pub(crate) fn rows(&self) -> Vec<(String, Vec<String>)> {
        self.rows.lock().expect("rows").clone()
    }
}

#[async_trait]
impl SheetWriter for FakeSheetWriter {
    async fn append_row(
        &self,
        _credential: &Value,
        spreadsheet_id: &str,
        row: &[String],
    ) -> Result<AppendOutcome> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing_sheet.as_deref() == Some(spreadsheet_id) {
            bail!("google sheets append to '{spreadsheet_id}' failed with status 403");
        }
        self.rows
            .lock()
            .expect("rows")
            .push((spreadsheet_id.to_string(), row.to_vec()));
        Ok(AppendOutcome {
            refreshed_credential: self.refreshed_credential.clone(),
        })
    }
}
