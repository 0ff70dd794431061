//! Slack collaborator for sheetpin.
//!
//! Hosts the Web API client used to resolve messages and post replies, the
//! Socket Mode session that delivers reaction and slash-command events, and the
//! OAuth v2 exchange that turns an install redirect into a bot token.

use anyhow::Result;
use async_trait::async_trait;

mod slack_api_client;
mod slack_helpers;
mod slack_oauth;
mod socket_mode;

pub use slack_api_client::{SlackApiClient, SlackAuthIdentity};
pub use slack_helpers::truncate_for_error;
pub use slack_oauth::{SlackInstallation, SlackOAuthClient, SLACK_BOT_SCOPES};
pub use socket_mode::{
    normalize_socket_envelope, parse_socket_envelope, run_socket_session, InboundEvent,
    ReactionAdded, SlashCommandInvocation, SocketEnvelope, SocketSessionEnd,
};

/// Message resolved from a channel and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMessage {
    pub ts: String,
    pub author_id: String,
    pub text: String,
    pub client_message_id: Option<String>,
}

/// Chat-platform operations the reaction pipeline and command handler need.
#[async_trait]
pub trait ChatPlatform: Send + Sync {
    async fn fetch_message(&self, channel_id: &str, message_ts: &str) -> Result<SourceMessage>;
    async fn permalink(&self, channel_id: &str, message_ts: &str) -> Result<String>;
    async fn user_display_name(&self, user_id: &str) -> Result<String>;
    async fn post_thread_reply(&self, channel_id: &str, thread_ts: &str, text: &str)
        -> Result<()>;
    async fn post_ephemeral(&self, channel_id: &str, user_id: &str, text: &str) -> Result<()>;
}
