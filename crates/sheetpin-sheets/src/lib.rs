//! Spreadsheet-writer collaborator: Google OAuth2 and Sheets row appends.

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;

mod google_oauth;
mod sheets_client;

pub use google_oauth::{GoogleOAuthClient, GoogleOAuthConfig, GoogleToken, SPREADSHEETS_SCOPE};
pub use sheets_client::GoogleSheetsClient;

/// Result of a successful append.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppendOutcome {
    /// Replacement credential payload when the access token was refreshed
    /// before writing. Callers persist it under the same writer reference.
    pub refreshed_credential: Option<Value>,
}

/// Appends rows on behalf of a writer identity.
#[async_trait]
pub trait SheetWriter: Send + Sync {
    async fn append_row(
        &self,
        credential: &Value,
        spreadsheet_id: &str,
        row: &[String],
    ) -> Result<AppendOutcome>;
}

/// Pulls a spreadsheet id out of a Google Sheets URL, or returns a bare id
/// unchanged. Returns `None` for anything that is neither.
pub fn extract_spreadsheet_id(target: &str) -> Option<String> {
    let target = target.trim().trim_start_matches('<').trim_end_matches('>');
    if target.is_empty() {
        return None;
    }
    if let Ok(url) = url::Url::parse(target) {
        if url.host_str() != Some("docs.google.com") {
            return None;
        }
        let mut segments = url.path_segments()?;
        while let Some(segment) = segments.next() {
            if segment == "d" {
                return segments
                    .next()
                    .filter(|id| is_spreadsheet_id(id))
                    .map(str::to_string);
            }
        }
        return None;
    }
    is_spreadsheet_id(target).then(|| target.to_string())
}

/// Truncates upstream bodies on char boundaries before they are embedded in
/// error messages, marking the cut with `...`.
pub(crate) fn truncate_for_error(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    let mut truncated = value.chars().take(max_chars).collect::<String>();
    truncated.push_str("...");
    truncated
}

fn is_spreadsheet_id(value: &str) -> bool {
    !value.is_empty()
        && value
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
}
