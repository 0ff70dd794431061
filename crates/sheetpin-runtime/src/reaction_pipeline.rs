//! Reaction to spreadsheet row, at most once per source message.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result};
use sheetpin_sheets::SheetWriter;
use sheetpin_slack::{ChatPlatform, ReactionAdded};
use sheetpin_store::{source_message_id, CommitOutcome, RecordingEntry, Store};

use crate::normalize_emoji;
use crate::vault::CredentialVault;

pub(crate) const RECORDED_REPLY: &str = "Recorded";
pub(crate) const ALREADY_RECORDED_REPLY: &str = "This message was already recorded.";
pub(crate) const NOT_AUTHORIZED_REPLY: &str =
    "The spreadsheet writer for this mapping is not yet authorized, so nothing was recorded.";

/// Where a reaction left the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    Unmapped,
    SourceUnavailable,
    AlreadyRecorded,
    NotAuthorized,
    Recorded,
}

type MessageLock = Arc<tokio::sync::Mutex<()>>;

/// Per-message locks serializing the check-append-commit section in this
/// process. Later deliveries wait for the holder, then see its ledger entry.
#[derive(Debug, Clone, Default)]
struct InFlightMessages {
    inner: Arc<Mutex<HashMap<String, MessageLock>>>,
}

impl InFlightMessages {
    async fn claim(&self, record_id: &str) -> InFlightGuard {
        let lock = {
            let mut in_flight = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(in_flight.entry(record_id.to_string()).or_default())
        };
        let permit = lock.lock_owned().await;
        InFlightGuard {
            messages: self.clone(),
            record_id: record_id.to_string(),
            _permit: permit,
        }
    }
}

/// Releases the message lock when dropped, including when the handler is
/// cancelled.
struct InFlightGuard {
    messages: InFlightMessages,
    record_id: String,
    _permit: tokio::sync::OwnedMutexGuard<()>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut in_flight = self
            .messages
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // Only the map and this permit hold the lock: nobody is waiting.
        let idle = in_flight
            .get(&self.record_id)
            .is_some_and(|lock| Arc::strong_count(lock) <= 2);
        if idle {
            in_flight.remove(&self.record_id);
        }
    }
}

#[derive(Clone)]
pub struct ReactionPipeline {
    store: Arc<dyn Store>,
    vault: CredentialVault,
    writer: Arc<dyn SheetWriter>,
    in_flight: InFlightMessages,
}

impl ReactionPipeline {
    pub fn new(store: Arc<dyn Store>, vault: CredentialVault, writer: Arc<dyn SheetWriter>) -> Self {
        Self {
            store,
            vault,
            writer,
            in_flight: InFlightMessages::default(),
        }
    }

    /// Runs one reaction through mapping lookup, source fetch, duplicate
    /// pre-check, credential gate, append-then-commit and acknowledgment.
    ///
    /// `Err` means a transient fault: nothing was committed and the event can
    /// safely be delivered again.
    pub async fn handle_reaction(
        &self,
        platform: &dyn ChatPlatform,
        reaction: &ReactionAdded,
    ) -> Result<PipelineOutcome> {
        let team_id = reaction.team_id.as_str();
        let channel_id = reaction.channel_id.as_str();
        let message_ts = reaction.message_ts.as_str();
        let emoji = normalize_emoji(&reaction.emoji);

        let Some(mapping) = self
            .store
            .lookup_mapping(team_id, channel_id, &emoji)
            .await?
        else {
            tracing::debug!(team_id, channel_id, emoji = %emoji, "reaction has no mapping");
            return Ok(PipelineOutcome::Unmapped);
        };

        let message = match platform.fetch_message(channel_id, message_ts).await {
            Ok(message) => message,
            Err(error) => {
                tracing::warn!(
                    team_id,
                    channel_id,
                    message_ts,
                    error = %format!("{error:#}"),
                    "source message unavailable; dropping reaction"
                );
                return Ok(PipelineOutcome::SourceUnavailable);
            }
        };

        let record_id = source_message_id(team_id, channel_id, message_ts);
        let _claim = self.in_flight.claim(&record_id).await;
        if self.store.is_recorded(&record_id).await? {
            platform
                .post_thread_reply(channel_id, message_ts, ALREADY_RECORDED_REPLY)
                .await?;
            return Ok(PipelineOutcome::AlreadyRecorded);
        }

        let credential = match mapping.writer_ref.as_deref() {
            Some(writer_ref) => self.vault.get_writer_credential(writer_ref).await?,
            None => None,
        };
        let Some(credential) = credential else {
            tracing::debug!(team_id, channel_id, emoji = %emoji, "mapping writer not authorized");
            platform
                .post_thread_reply(channel_id, message_ts, NOT_AUTHORIZED_REPLY)
                .await?;
            return Ok(PipelineOutcome::NotAuthorized);
        };

        let author_name = if message.author_id.is_empty() {
            String::new()
        } else {
            platform.user_display_name(&message.author_id).await?
        };
        let reactor_name = platform.user_display_name(&reaction.reacting_user).await?;
        let permalink = platform.permalink(channel_id, message_ts).await?;
        let row = vec![
            message_ts.to_string(),
            channel_id.to_string(),
            message.text,
            author_name,
            permalink,
            reactor_name,
        ];

        let appended = self
            .writer
            .append_row(&credential.payload, &mapping.spreadsheet_id, &row)
            .await
            .with_context(|| format!("append to spreadsheet {} failed", mapping.spreadsheet_id))?;
        if let Some(refreshed) = appended.refreshed_credential {
            if let Err(error) = self
                .vault
                .store_refreshed_writer_credential(&credential.writer_ref, refreshed)
                .await
            {
                tracing::warn!(writer_ref = %credential.writer_ref, error = %error, "failed to persist refreshed writer credential");
            }
        }

        let entry = RecordingEntry::new(team_id, channel_id, message_ts, &mapping.spreadsheet_id);
        let outcome = match self.store.try_commit(entry).await {
            Ok(CommitOutcome::Committed) => PipelineOutcome::Recorded,
            Ok(CommitOutcome::AlreadyRecorded) => PipelineOutcome::AlreadyRecorded,
            Err(error) => {
                // Append succeeded; acknowledge without a ledger entry.
                tracing::error!(
                    team_id,
                    channel_id,
                    message_ts,
                    error = %error,
                    "row appended but ledger commit failed"
                );
                PipelineOutcome::Recorded
            }
        };

        let reply = match outcome {
            PipelineOutcome::Recorded => RECORDED_REPLY,
            _ => ALREADY_RECORDED_REPLY,
        };
        platform
            .post_thread_reply(channel_id, message_ts, reply)
            .await?;
        tracing::info!(
            team_id,
            channel_id,
            message_ts,
            spreadsheet_id = %mapping.spreadsheet_id,
            ?outcome,
            "reaction processed"
        );
        Ok(outcome)
    }
}
