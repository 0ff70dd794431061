use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_non_empty(value: &str) -> Result<String, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err("value must not be empty".to_string());
    }
    Ok(trimmed.to_string())
}

#[derive(Debug, Parser)]
#[command(
    name = "sheetpin",
    about = "Archive reacted Slack messages into Google Sheets",
    version
)]
pub struct Cli {
    #[arg(
        long = "database-path",
        env = "SHEETPIN_DATABASE_PATH",
        default_value = ".sheetpin/sheetpin.sqlite",
        help = "SQLite database holding tenants, mappings, credentials and the recording ledger"
    )]
    pub database_path: PathBuf,

    #[arg(
        long = "bind",
        env = "SHEETPIN_BIND",
        default_value = "127.0.0.1:3000",
        help = "Address for the OAuth redirect endpoints"
    )]
    pub bind: SocketAddr,

    #[arg(
        long = "public-base-url",
        env = "SHEETPIN_PUBLIC_BASE_URL",
        default_value = "http://127.0.0.1:3000",
        value_parser = parse_non_empty,
        help = "Externally reachable base URL used to build OAuth redirect URLs"
    )]
    pub public_base_url: String,

    #[arg(
        long = "slack-app-token",
        env = "SHEETPIN_SLACK_APP_TOKEN",
        hide_env_values = true,
        value_parser = parse_non_empty,
        help = "Slack Socket Mode app token (xapp-...)"
    )]
    pub slack_app_token: String,

    #[arg(
        long = "slack-api-base",
        env = "SHEETPIN_SLACK_API_BASE",
        default_value = "https://slack.com/api",
        help = "Slack Web API base URL"
    )]
    pub slack_api_base: String,

    #[arg(
        long = "slack-authorize-url",
        env = "SHEETPIN_SLACK_AUTHORIZE_URL",
        default_value = "https://slack.com/oauth/v2/authorize",
        help = "Slack install consent URL"
    )]
    pub slack_authorize_url: String,

    #[arg(
        long = "slack-bot-token",
        env = "SHEETPIN_SLACK_BOT_TOKEN",
        hide_env_values = true,
        help = "Optional bot token (xoxb-...) registered as a tenant at startup"
    )]
    pub slack_bot_token: Option<String>,

    #[arg(
        long = "slack-client-id",
        env = "SHEETPIN_SLACK_CLIENT_ID",
        requires = "slack_client_secret",
        help = "Slack app client id; enables the workspace install endpoint"
    )]
    pub slack_client_id: Option<String>,

    #[arg(
        long = "slack-client-secret",
        env = "SHEETPIN_SLACK_CLIENT_SECRET",
        hide_env_values = true,
        requires = "slack_client_id",
        help = "Slack app client secret"
    )]
    pub slack_client_secret: Option<String>,

    #[arg(
        long = "google-client-id",
        env = "SHEETPIN_GOOGLE_CLIENT_ID",
        value_parser = parse_non_empty,
        help = "Google OAuth client id"
    )]
    pub google_client_id: String,

    #[arg(
        long = "google-client-secret",
        env = "SHEETPIN_GOOGLE_CLIENT_SECRET",
        hide_env_values = true,
        value_parser = parse_non_empty,
        help = "Google OAuth client secret"
    )]
    pub google_client_secret: String,

    #[arg(
        long = "google-redirect-url",
        env = "SHEETPIN_GOOGLE_REDIRECT_URL",
        help = "Google OAuth redirect URL (defaults to {public-base-url}/google/oauth/callback)"
    )]
    pub google_redirect_url: Option<String>,

    #[arg(
        long = "google-auth-base",
        env = "SHEETPIN_GOOGLE_AUTH_BASE",
        default_value = "https://accounts.google.com/o/oauth2/v2/auth",
        help = "Google OAuth consent URL"
    )]
    pub google_auth_base: String,

    #[arg(
        long = "google-token-url",
        env = "SHEETPIN_GOOGLE_TOKEN_URL",
        default_value = "https://oauth2.googleapis.com/token",
        help = "Google OAuth token endpoint"
    )]
    pub google_token_url: String,

    #[arg(
        long = "sheets-api-base",
        env = "SHEETPIN_SHEETS_API_BASE",
        default_value = "https://sheets.googleapis.com",
        help = "Google Sheets API base URL"
    )]
    pub sheets_api_base: String,

    #[arg(
        long = "sheets-range",
        env = "SHEETPIN_SHEETS_RANGE",
        default_value = "Sheet1!A2",
        help = "A1 range rows are appended after"
    )]
    pub sheets_range: String,

    #[arg(
        long = "state-secret",
        env = "SHEETPIN_STATE_SECRET",
        hide_env_values = true,
        value_parser = parse_non_empty,
        help = "Secret used to sign OAuth state parameters"
    )]
    pub state_secret: String,

    #[arg(
        long = "command-name",
        env = "SHEETPIN_COMMAND_NAME",
        default_value = "/sheetpin",
        help = "Slash command name shown in usage text"
    )]
    pub command_name: String,

    #[arg(
        long = "request-timeout-ms",
        env = "SHEETPIN_REQUEST_TIMEOUT_MS",
        default_value_t = 10_000,
        value_parser = parse_positive_u64,
        help = "Timeout for each outbound HTTP request"
    )]
    pub request_timeout_ms: u64,

    #[arg(
        long = "event-timeout-ms",
        env = "SHEETPIN_EVENT_TIMEOUT_MS",
        default_value_t = 30_000,
        value_parser = parse_positive_u64,
        help = "Upper bound for handling a single inbound event"
    )]
    pub event_timeout_ms: u64,

    #[arg(
        long = "reconnect-delay-ms",
        env = "SHEETPIN_RECONNECT_DELAY_MS",
        default_value_t = 2_000,
        value_parser = parse_positive_u64,
        help = "Delay before reopening a dropped Socket Mode session"
    )]
    pub reconnect_delay_ms: u64,
}

impl Cli {
    pub fn public_base_url(&self) -> &str {
        self.public_base_url.trim_end_matches('/')
    }

    pub fn google_redirect_url(&self) -> String {
        self.google_redirect_url
            .clone()
            .unwrap_or_else(|| format!("{}/google/oauth/callback", self.public_base_url()))
    }

    pub fn slack_redirect_url(&self) -> String {
        format!("{}/slack/oauth/callback", self.public_base_url())
    }
}
