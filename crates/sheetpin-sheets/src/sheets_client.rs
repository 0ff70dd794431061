use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use url::Url;

use crate::google_oauth::{GoogleOAuthClient, GoogleToken};
use crate::{truncate_for_error, AppendOutcome, SheetWriter};

/// Sheets v4 `values.append` client.
#[derive(Clone)]
pub struct GoogleSheetsClient {
    http: reqwest::Client,
    api_base: String,
    range: String,
    oauth: GoogleOAuthClient,
}

impl GoogleSheetsClient {
    pub fn new(
        api_base: &str,
        range: &str,
        oauth: GoogleOAuthClient,
        request_timeout_ms: u64,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(request_timeout_ms.max(1)))
            .build()
            .context("failed to create google sheets client")?;
        Ok(Self {
            http,
            api_base: api_base.trim_end_matches('/').to_string(),
            range: range.to_string(),
            oauth,
        })
    }

    fn append_url(&self, spreadsheet_id: &str) -> Result<Url> {
        let mut url = Url::parse(&self.api_base)
            .with_context(|| format!("invalid sheets api base '{}'", self.api_base))?;
        let range_segment = format!("{}:append", self.range);
        url.path_segments_mut()
            .map_err(|()| anyhow!("sheets api base '{}' cannot carry a path", self.api_base))?
            .pop_if_empty()
            .extend([
                "v4",
                "spreadsheets",
                spreadsheet_id,
                "values",
                range_segment.as_str(),
            ]);
        // Stored verbatim: message ts keeps its digits and text is never a formula.
        url.query_pairs_mut()
            .append_pair("valueInputOption", "RAW")
            .append_pair("insertDataOption", "INSERT_ROWS");
        Ok(url)
    }
}

#[async_trait]
impl SheetWriter for GoogleSheetsClient {
    async fn append_row(
        &self,
        credential: &Value,
        spreadsheet_id: &str,
        row: &[String],
    ) -> Result<AppendOutcome> {
        let mut token = GoogleToken::from_payload(credential)?;
        let mut refreshed_credential = None;
        if token.is_expired(Utc::now()) {
            token = self
                .oauth
                .refresh(&token)
                .await
                .context("failed to refresh writer credential")?;
            tracing::debug!(spreadsheet_id, "refreshed writer access token");
            refreshed_credential = Some(token.to_payload()?);
        }

        let response = self
            .http
            .post(self.append_url(spreadsheet_id)?)
            .bearer_auth(&token.access_token)
            .json(&json!({ "majorDimension": "ROWS", "values": [row] }))
            .send()
            .await
            .context("google sheets append request failed")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!(
                "google sheets append to '{spreadsheet_id}' failed with status {}: {}",
                status.as_u16(),
                truncate_for_error(&body, 800)
            );
        }

        Ok(AppendOutcome {
            refreshed_credential,
        })
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use httpmock::prelude::*;
    use serde_json::json;

    use super::GoogleSheetsClient;
    use crate::{GoogleOAuthClient, GoogleOAuthConfig, GoogleToken, SheetWriter};

    fn sheets_client(server: &MockServer) -> GoogleSheetsClient {
        let oauth = GoogleOAuthClient::new(GoogleOAuthConfig {
            client_id: "google-client".to_string(),
            client_secret: "google-secret".to_string(),
            redirect_url: "https://bot.example/google/oauth/callback".to_string(),
            auth_base: "https://accounts.google.com/o/oauth2/v2/auth".to_string(),
            token_url: server.url("/token"),
            request_timeout_ms: 2_000,
        })
        .expect("oauth");
        GoogleSheetsClient::new(&server.base_url(), "Sheet1!A2", oauth, 2_000).expect("sheets")
    }

    fn row() -> Vec<String> {
        ["10.5", "C1", "hello", "alice", "https://slack.test/p", "bob"]
            .map(str::to_string)
            .to_vec()
    }

    #[tokio::test]
    async fn integration_append_row_posts_raw_values() {
        let server = MockServer::start();
        let append = server.mock(|when, then| {
            when.method(POST)
                .path("/v4/spreadsheets/sheet-a/values/Sheet1!A2:append")
                .query_param("valueInputOption", "RAW")
                .query_param("insertDataOption", "INSERT_ROWS")
                .header("authorization", "Bearer ya29.live")
                .json_body_includes(
                    r#"{"values":[["10.5","C1","hello","alice","https://slack.test/p","bob"]]}"#,
                );
            then.status(200).json_body(json!({"updates": {"updatedRows": 1}}));
        });
        let credential = json!({"access_token": "ya29.live", "refresh_token": "1//r"});

        let outcome = sheets_client(&server)
            .append_row(&credential, "sheet-a", &row())
            .await
            .expect("append");
        assert!(outcome.refreshed_credential.is_none());
        append.assert();
    }

    #[tokio::test]
    async fn regression_formula_text_and_long_ts_are_sent_unparsed() {
        let server = MockServer::start();
        let append = server.mock(|when, then| {
            when.method(POST)
                .path("/v4/spreadsheets/sheet-a/values/Sheet1!A2:append")
                .query_param("valueInputOption", "RAW")
                .json_body_includes(
                    r#"{"values":[["1700000000.000100","C1","=IMPORTXML(\"x\")","alice","https://slack.test/p","bob"]]}"#,
                );
            then.status(200).json_body(json!({}));
        });
        let mut values = row();
        values[0] = "1700000000.000100".to_string();
        values[2] = "=IMPORTXML(\"x\")".to_string();

        sheets_client(&server)
            .append_row(&json!({"access_token": "ya29.live"}), "sheet-a", &values)
            .await
            .expect("append");
        append.assert();
    }

    #[tokio::test]
    async fn functional_expired_token_is_refreshed_before_append() {
        let server = MockServer::start();
        let refresh = server.mock(|when, then| {
            when.method(POST)
                .path("/token")
                .body_includes("grant_type=refresh_token");
            then.status(200)
                .json_body(json!({"access_token": "ya29.fresh", "expires_in": 3599}));
        });
        let append = server.mock(|when, then| {
            when.method(POST)
                .path("/v4/spreadsheets/sheet-a/values/Sheet1!A2:append")
                .header("authorization", "Bearer ya29.fresh");
            then.status(200).json_body(json!({}));
        });
        let stale = GoogleToken {
            access_token: "ya29.stale".to_string(),
            refresh_token: Some("1//r".to_string()),
            expires_at: Some(Utc::now() - Duration::minutes(5)),
            scope: String::new(),
            token_type: "Bearer".to_string(),
        };

        let outcome = sheets_client(&server)
            .append_row(&stale.to_payload().expect("payload"), "sheet-a", &row())
            .await
            .expect("append");
        let refreshed = GoogleToken::from_payload(
            outcome
                .refreshed_credential
                .as_ref()
                .expect("refreshed credential"),
        )
        .expect("decode");
        assert_eq!(refreshed.access_token, "ya29.fresh");
        assert_eq!(refreshed.refresh_token.as_deref(), Some("1//r"));
        refresh.assert();
        append.assert();
    }

    #[tokio::test]
    async fn regression_permission_denied_is_reported_once() {
        let server = MockServer::start();
        let append = server.mock(|when, then| {
            when.method(POST)
                .path("/v4/spreadsheets/sheet-a/values/Sheet1!A2:append");
            then.status(403)
                .json_body(json!({"error": {"status": "PERMISSION_DENIED"}}));
        });

        let error = sheets_client(&server)
            .append_row(&json!({"access_token": "ya29.live"}), "sheet-a", &row())
            .await
            .expect_err("forbidden");
        assert!(error.to_string().contains("403"));
        assert!(error.to_string().contains("PERMISSION_DENIED"));
        assert_eq!(append.calls(), 1);
    }

    #[tokio::test]
    async fn regression_malformed_credential_fails_without_network() {
        let server = MockServer::start();
        let append = server.mock(|when, then| {
            when.method(POST);
            then.status(200);
        });

        let error = sheets_client(&server)
            .append_row(&json!({"unexpected": true}), "sheet-a", &row())
            .await
            .expect_err("bad credential");
        assert!(error.to_string().contains("google token"));
        assert_eq!(append.calls(), 0);
    }
}
