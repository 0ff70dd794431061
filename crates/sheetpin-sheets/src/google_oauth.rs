use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use crate::truncate_for_error;

pub const SPREADSHEETS_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets";

/// Seconds before the reported expiry at which a token is treated as stale.
const EXPIRY_SKEW_SECONDS: i64 = 60;

#[derive(Debug, Clone)]
pub struct GoogleOAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_url: String,
    pub auth_base: String,
    pub token_url: String,
    pub request_timeout_ms: u64,
}

/// Token material persisted as a writer credential payload.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GoogleToken {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scope: String,
    #[serde(default)]
    pub token_type: String,
}

impl std::fmt::Debug for GoogleToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GoogleToken")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}

impl GoogleToken {
    pub fn from_payload(payload: &Value) -> Result<Self> {
        serde_json::from_value(payload.clone()).context("writer credential is not a google token")
    }

    pub fn to_payload(&self) -> Result<Value> {
        serde_json::to_value(self).context("failed to encode google token")
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| {
            now + chrono::Duration::seconds(EXPIRY_SKEW_SECONDS) >= expires_at
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenEndpointResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
}

#[derive(Clone)]
pub struct GoogleOAuthClient {
    http: reqwest::Client,
    config: GoogleOAuthConfig,
}

impl GoogleOAuthClient {
    pub fn new(config: GoogleOAuthConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms.max(1)))
            .build()
            .context("failed to create google oauth client")?;
        Ok(Self { http, config })
    }

    /// Consent URL requesting offline access to spreadsheets.
    pub fn authorization_url(&self, state: &str) -> Result<String> {
        let mut url = Url::parse(&self.config.auth_base).with_context(|| {
            format!("invalid google authorization base '{}'", self.config.auth_base)
        })?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_url)
            .append_pair("response_type", "code")
            .append_pair("scope", SPREADSHEETS_SCOPE)
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent")
            .append_pair("state", state);
        Ok(url.into())
    }

    pub async fn exchange_code(&self, code: &str) -> Result<GoogleToken> {
        let response = self
            .token_request(&[
                ("grant_type", "authorization_code"),
                ("code", code),
                ("redirect_uri", self.config.redirect_url.as_str()),
            ])
            .await?;
        Ok(token_from_response(response, None, Utc::now()))
    }

    /// Exchanges the refresh token for a new access token. Google usually
    /// omits the refresh token on refresh, so the existing one is carried over.
    pub async fn refresh(&self, token: &GoogleToken) -> Result<GoogleToken> {
        let Some(refresh_token) = token.refresh_token.as_deref() else {
            bail!("google credential has expired and carries no refresh token");
        };
        let response = self
            .token_request(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .await?;
        Ok(token_from_response(
            response,
            token.refresh_token.clone(),
            Utc::now(),
        ))
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenEndpointResponse> {
        let mut form = vec![
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ];
        form.extend_from_slice(params);
        let response = self
            .http
            .post(&self.config.token_url)
            .form(&form)
            .send()
            .await
            .context("google token request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!(
                "google token endpoint failed with status {}: {}",
                status.as_u16(),
                truncate_for_error(&body, 800)
            );
        }
        response
            .json::<TokenEndpointResponse>()
            .await
            .context("failed to decode google token response")
    }
}

fn token_from_response(
    response: TokenEndpointResponse,
    previous_refresh_token: Option<String>,
    now: DateTime<Utc>,
) -> GoogleToken {
    GoogleToken {
        access_token: response.access_token,
        refresh_token: response.refresh_token.or(previous_refresh_token),
        expires_at: response
            .expires_in
            .map(|seconds| now + chrono::Duration::seconds(seconds)),
        scope: response.scope.unwrap_or_default(),
        token_type: response.token_type.unwrap_or_else(|| "Bearer".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use httpmock::prelude::*;
    use serde_json::json;
    use url::Url;

    use super::{GoogleOAuthClient, GoogleOAuthConfig, GoogleToken, SPREADSHEETS_SCOPE};

    fn config(token_url: String) -> GoogleOAuthConfig {
        GoogleOAuthConfig {
            client_id: "google-client".to_string(),
            client_secret: "google-secret".to_string(),
            redirect_url: "https://bot.example/google/oauth/callback".to_string(),
            auth_base: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url,
            request_timeout_ms: 2_000,
        }
    }

    #[test]
    fn unit_authorization_url_requests_offline_consent() {
        let client =
            GoogleOAuthClient::new(config("https://oauth2.test/token".to_string())).expect("client");
        let url = Url::parse(&client.authorization_url("opaque-state").expect("url")).expect("parse");
        let pairs = url.query_pairs().into_owned().collect::<Vec<_>>();
        for expected in [
            ("access_type", "offline"),
            ("prompt", "consent"),
            ("response_type", "code"),
            ("scope", SPREADSHEETS_SCOPE),
            ("state", "opaque-state"),
        ] {
            assert!(
                pairs.contains(&(expected.0.to_string(), expected.1.to_string())),
                "missing {expected:?}"
            );
        }
    }

    #[tokio::test]
    async fn integration_exchange_code_returns_refreshable_token() {
        let server = MockServer::start();
        let token = server.mock(|when, then| {
            when.method(POST)
                .path("/token")
                .body_includes("grant_type=authorization_code")
                .body_includes("code=auth-code");
            then.status(200).json_body(json!({
                "access_token": "ya29.a",
                "refresh_token": "1//r",
                "expires_in": 3599,
                "scope": SPREADSHEETS_SCOPE,
                "token_type": "Bearer"
            }));
        });
        let client = GoogleOAuthClient::new(config(server.url("/token"))).expect("client");

        let exchanged = client.exchange_code("auth-code").await.expect("exchange");
        assert_eq!(exchanged.access_token, "ya29.a");
        assert_eq!(exchanged.refresh_token.as_deref(), Some("1//r"));
        assert!(!exchanged.is_expired(Utc::now()));
        token.assert();
    }

    #[tokio::test]
    async fn functional_refresh_keeps_previous_refresh_token() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST)
                .path("/token")
                .body_includes("grant_type=refresh_token");
            then.status(200)
                .json_body(json!({"access_token": "ya29.b", "expires_in": 3599}));
        });
        let client = GoogleOAuthClient::new(config(server.url("/token"))).expect("client");
        let stale = GoogleToken {
            access_token: "ya29.a".to_string(),
            refresh_token: Some("1//r".to_string()),
            expires_at: Some(Utc::now() - Duration::seconds(5)),
            scope: String::new(),
            token_type: "Bearer".to_string(),
        };
        assert!(stale.is_expired(Utc::now()));

        let refreshed = client.refresh(&stale).await.expect("refresh");
        assert_eq!(refreshed.access_token, "ya29.b");
        assert_eq!(refreshed.refresh_token.as_deref(), Some("1//r"));
    }

    #[tokio::test]
    async fn regression_rejected_code_is_an_error() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/token");
            then.status(400).json_body(json!({"error": "invalid_grant"}));
        });
        let client = GoogleOAuthClient::new(config(server.url("/token"))).expect("client");

        let error = client.exchange_code("used").await.expect_err("invalid grant");
        assert!(error.to_string().contains("invalid_grant"));
    }

    #[test]
    fn unit_token_payload_round_trips_and_redacts() {
        let token = GoogleToken {
            access_token: "ya29.secret".to_string(),
            refresh_token: None,
            expires_at: None,
            scope: SPREADSHEETS_SCOPE.to_string(),
            token_type: "Bearer".to_string(),
        };
        let payload = token.to_payload().expect("payload");
        assert_eq!(GoogleToken::from_payload(&payload).expect("decode"), token);
        assert!(!format!("{token:?}").contains("ya29.secret"));
        assert!(!token.is_expired(Utc::now()));
    }
}
