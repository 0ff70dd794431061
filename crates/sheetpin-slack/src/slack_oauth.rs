use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use url::Url;

use crate::slack_helpers::{non_empty, truncate_for_error};

/// Bot scopes requested at install time.
pub const SLACK_BOT_SCOPES: &[&str] = &[
    "channels:history",
    "groups:history",
    "chat:write",
    "commands",
    "reactions:read",
    "users:read",
];

#[derive(Debug, Clone, Deserialize)]
struct SlackOAuthAccessResponse {
    ok: bool,
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    bot_user_id: Option<String>,
    #[serde(default)]
    team: Option<SlackOAuthTeam>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SlackOAuthTeam {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

/// Result of a completed workspace install.
#[derive(Clone, PartialEq, Eq)]
pub struct SlackInstallation {
    pub team_id: String,
    pub team_name: String,
    pub bot_token: String,
    pub bot_user_id: Option<String>,
}

impl std::fmt::Debug for SlackInstallation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlackInstallation")
            .field("team_id", &self.team_id)
            .field("team_name", &self.team_name)
            .field("bot_token", &"<redacted>")
            .field("bot_user_id", &self.bot_user_id)
            .finish()
    }
}

/// OAuth v2 install flow for distributing the app to additional workspaces.
#[derive(Clone)]
pub struct SlackOAuthClient {
    http: reqwest::Client,
    api_base: String,
    authorize_url: String,
    client_id: String,
    client_secret: String,
}

impl SlackOAuthClient {
    pub fn new(
        api_base: &str,
        authorize_url: &str,
        client_id: &str,
        client_secret: &str,
        request_timeout_ms: u64,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(request_timeout_ms.max(1)))
            .build()
            .context("failed to create slack oauth client")?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            authorize_url: authorize_url.to_string(),
            client_id: client_id.trim().to_string(),
            client_secret: client_secret.trim().to_string(),
        })
    }

    pub fn authorize_url(&self, state: &str, redirect_uri: &str) -> Result<String> {
        let mut url = Url::parse(&self.authorize_url)
            .with_context(|| format!("invalid slack authorize url '{}'", self.authorize_url))?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("scope", &SLACK_BOT_SCOPES.join(","))
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("state", state);
        Ok(url.into())
    }

    pub async fn exchange_code(&self, code: &str, redirect_uri: &str) -> Result<SlackInstallation> {
        let response = self
            .http
            .post(format!("{}/oauth.v2.access", self.api_base))
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("code", code), ("redirect_uri", redirect_uri)])
            .send()
            .await
            .context("slack oauth.v2.access request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!(
                "slack oauth.v2.access failed with status {}: {}",
                status.as_u16(),
                truncate_for_error(&body, 800)
            );
        }
        let parsed = response
            .json::<SlackOAuthAccessResponse>()
            .await
            .context("failed to decode slack oauth.v2.access")?;
        if !parsed.ok {
            bail!(
                "slack oauth.v2.access failed: {}",
                parsed.error.unwrap_or_else(|| "unknown error".to_string())
            );
        }

        let team = parsed
            .team
            .ok_or_else(|| anyhow!("slack oauth.v2.access did not return team"))?;
        let team_id =
            non_empty(team.id).ok_or_else(|| anyhow!("slack oauth.v2.access returned empty team id"))?;
        Ok(SlackInstallation {
            team_name: non_empty(team.name).unwrap_or_else(|| team_id.clone()),
            team_id,
            bot_token: non_empty(parsed.access_token)
                .ok_or_else(|| anyhow!("slack oauth.v2.access did not return access_token"))?,
            bot_user_id: non_empty(parsed.bot_user_id),
        })
    }
}
