//! Slack Web API client bound to one tenant's bot token.

use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;

use crate::slack_helpers::{non_empty, truncate_for_error};
use crate::{ChatPlatform, SourceMessage};

#[derive(Debug, Clone, Deserialize)]
struct SlackAuthTestResponse {
    ok: bool,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    team_id: Option<String>,
    #[serde(default)]
    team: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackOpenSocketResponse {
    ok: bool,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackHistoryResponse {
    ok: bool,
    #[serde(default)]
    messages: Vec<SlackHistoryMessage>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackHistoryMessage {
    ts: String,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    bot_id: Option<String>,
    #[serde(default)]
    text: String,
    #[serde(default)]
    client_msg_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackPermalinkResponse {
    ok: bool,
    #[serde(default)]
    permalink: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackUserInfoResponse {
    ok: bool,
    #[serde(default)]
    user: Option<SlackUser>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackUser {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    real_name: Option<String>,
    #[serde(default)]
    profile: Option<SlackUserProfile>,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackUserProfile {
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    real_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackOkResponse {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
}

/// Identity reported by `auth.test` for a bot token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlackAuthIdentity {
    pub team_id: String,
    pub team_name: String,
    pub bot_user_id: String,
}

#[derive(Clone)]
pub struct SlackApiClient {
    http: reqwest::Client,
    api_base: String,
    bot_token: String,
}

impl SlackApiClient {
    pub fn new(api_base: &str, bot_token: &str, request_timeout_ms: u64) -> Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::USER_AGENT,
            reqwest::header::HeaderValue::from_static("sheetpin-slack"),
        );
        headers.insert(
            reqwest::header::ACCEPT,
            reqwest::header::HeaderValue::from_static("application/json"),
        );
        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(request_timeout_ms.max(1)))
            .build()
            .context("failed to create slack api client")?;

        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            bot_token: bot_token.trim().to_string(),
        })
    }

    pub async fn auth_test(&self) -> Result<SlackAuthIdentity> {
        let response: SlackAuthTestResponse = self
            .request_json("auth.test", || {
                self.http
                    .post(self.endpoint("auth.test"))
                    .bearer_auth(&self.bot_token)
            })
            .await?;
        ensure_ok("auth.test", response.ok, response.error)?;

        let team_id = non_empty(response.team_id)
            .ok_or_else(|| anyhow!("slack auth.test did not return team_id"))?;
        Ok(SlackAuthIdentity {
            team_name: non_empty(response.team).unwrap_or_else(|| team_id.clone()),
            team_id,
            bot_user_id: non_empty(response.user_id)
                .ok_or_else(|| anyhow!("slack auth.test did not return user_id"))?,
        })
    }

    /// Requests a fresh Socket Mode websocket URL using an app-level token.
    pub async fn open_socket_connection(&self, app_token: &str) -> Result<String> {
        let app_token = app_token.trim();
        let response: SlackOpenSocketResponse = self
            .request_json("apps.connections.open", || {
                self.http
                    .post(self.endpoint("apps.connections.open"))
                    .bearer_auth(app_token)
            })
            .await?;
        ensure_ok("apps.connections.open", response.ok, response.error)?;
        non_empty(response.url)
            .ok_or_else(|| anyhow!("slack apps.connections.open did not return url"))
    }

    async fn find_in_history(
        &self,
        channel_id: &str,
        message_ts: &str,
    ) -> Result<Option<SlackHistoryMessage>> {
        let response: SlackHistoryResponse = self
            .request_json("conversations.history", || {
                self.http
                    .get(self.endpoint("conversations.history"))
                    .bearer_auth(&self.bot_token)
                    .query(&[
                        ("channel", channel_id),
                        ("latest", message_ts),
                        ("inclusive", "true"),
                        ("limit", "1"),
                    ])
            })
            .await?;
        ensure_ok("conversations.history", response.ok, response.error)?;
        Ok(response
            .messages
            .into_iter()
            .find(|message| message.ts == message_ts))
    }

    async fn find_in_replies(
        &self,
        channel_id: &str,
        message_ts: &str,
    ) -> Result<Option<SlackHistoryMessage>> {
        let response: SlackHistoryResponse = self
            .request_json("conversations.replies", || {
                self.http
                    .get(self.endpoint("conversations.replies"))
                    .bearer_auth(&self.bot_token)
                    .query(&[
                        ("channel", channel_id),
                        ("ts", message_ts),
                        ("latest", message_ts),
                        ("oldest", message_ts),
                        ("inclusive", "true"),
                        // The thread parent is always listed first.
                        ("limit", "2"),
                    ])
            })
            .await?;
        ensure_ok("conversations.replies", response.ok, response.error)?;
        Ok(response
            .messages
            .into_iter()
            .find(|message| message.ts == message_ts))
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}/{method}", self.api_base)
    }

    async fn request_json<T, F>(&self, operation: &str, builder: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: FnOnce() -> reqwest::RequestBuilder,
    {
        let response = builder()
            .send()
            .await
            .with_context(|| format!("slack api {operation} request failed"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!(
                "slack api {operation} failed with status {}: {}",
                status.as_u16(),
                truncate_for_error(&body, 800)
            );
        }
        response
            .json::<T>()
            .await
            .with_context(|| format!("failed to decode slack {operation}"))
    }
}

#[async_trait]
impl ChatPlatform for SlackApiClient {
    async fn fetch_message(&self, channel_id: &str, message_ts: &str) -> Result<SourceMessage> {
        // Thread replies never show up in channel history.
        let message = match self.find_in_history(channel_id, message_ts).await? {
            Some(message) => message,
            None => self
                .find_in_replies(channel_id, message_ts)
                .await?
                .ok_or_else(|| {
                    anyhow!("slack message {message_ts} not found in channel {channel_id}")
                })?,
        };

        let author_id = non_empty(message.user)
            .or_else(|| non_empty(message.bot_id))
            .unwrap_or_default();
        Ok(SourceMessage {
            ts: message.ts,
            author_id,
            text: message.text,
            client_message_id: non_empty(message.client_msg_id),
        })
    }

    async fn permalink(&self, channel_id: &str, message_ts: &str) -> Result<String> {
        let response: SlackPermalinkResponse = self
            .request_json("chat.getPermalink", || {
                self.http
                    .get(self.endpoint("chat.getPermalink"))
                    .bearer_auth(&self.bot_token)
                    .query(&[("channel", channel_id), ("message_ts", message_ts)])
            })
            .await?;
        ensure_ok("chat.getPermalink", response.ok, response.error)?;
        non_empty(response.permalink)
            .ok_or_else(|| anyhow!("slack chat.getPermalink did not return permalink"))
    }

    async fn user_display_name(&self, user_id: &str) -> Result<String> {
        let response: SlackUserInfoResponse = self
            .request_json("users.info", || {
                self.http
                    .get(self.endpoint("users.info"))
                    .bearer_auth(&self.bot_token)
                    .query(&[("user", user_id)])
            })
            .await?;
        ensure_ok("users.info", response.ok, response.error)?;
        let Some(user) = response.user else {
            return Ok(user_id.to_string());
        };
        let profile = user.profile;
        Ok(profile
            .as_ref()
            .and_then(|profile| non_empty(profile.display_name.clone()))
            .or_else(|| profile.and_then(|profile| non_empty(profile.real_name)))
            .or_else(|| non_empty(user.real_name))
            .or_else(|| non_empty(user.name))
            .unwrap_or_else(|| user_id.to_string()))
    }

    async fn post_thread_reply(
        &self,
        channel_id: &str,
        thread_ts: &str,
        text: &str,
    ) -> Result<()> {
        let payload = json!({
            "channel": channel_id,
            "thread_ts": thread_ts,
            "text": text,
            "unfurl_links": false,
            "unfurl_media": false,
        });
        let response: SlackOkResponse = self
            .request_json("chat.postMessage", || {
                self.http
                    .post(self.endpoint("chat.postMessage"))
                    .bearer_auth(&self.bot_token)
                    .json(&payload)
            })
            .await?;
        ensure_ok("chat.postMessage", response.ok, response.error)
    }

    async fn post_ephemeral(&self, channel_id: &str, user_id: &str, text: &str) -> Result<()> {
        let payload = json!({
            "channel": channel_id,
            "user": user_id,
            "text": text,
        });
        let response: SlackOkResponse = self
            .request_json("chat.postEphemeral", || {
                self.http
                    .post(self.endpoint("chat.postEphemeral"))
                    .bearer_auth(&self.bot_token)
                    .json(&payload)
            })
            .await?;
        ensure_ok("chat.postEphemeral", response.ok, response.error)
    }
}

fn ensure_ok(operation: &str, ok: bool, error: Option<String>) -> Result<()> {
    if !ok {
        bail!(
            "slack {operation} failed: {}",
            error.unwrap_or_else(|| "unknown error".to_string())
        );
    }
    Ok(())
}
