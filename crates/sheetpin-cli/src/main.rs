mod bootstrap_helpers;
mod cli_args;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use sheetpin_gateway::{run_gateway_server, GatewayState, SlackInstallFlow};
use sheetpin_runtime::{
    CommandHandler, CredentialVault, EventDispatcher, ReactionPipeline, RunningTenants,
    SlackPlatformProvider, SlackTenantConnector, StateSigner, TenantConnectionManager,
};
use sheetpin_sheets::{GoogleOAuthClient, GoogleOAuthConfig, GoogleSheetsClient};
use sheetpin_slack::{SlackApiClient, SlackOAuthClient};
use sheetpin_store::{SqliteStore, Store, TenantWorkspace};

use crate::bootstrap_helpers::init_tracing;
use crate::cli_args::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    run(cli).await
}

async fn run(cli: Cli) -> Result<()> {
    let store: Arc<dyn Store> = Arc::new(
        SqliteStore::new(&cli.database_path).with_context(|| {
            format!("failed to open database {}", cli.database_path.display())
        })?,
    );
    let signer = StateSigner::new(&cli.state_secret)?;

    let google_oauth = GoogleOAuthClient::new(GoogleOAuthConfig {
        client_id: cli.google_client_id.clone(),
        client_secret: cli.google_client_secret.clone(),
        redirect_url: cli.google_redirect_url(),
        auth_base: cli.google_auth_base.clone(),
        token_url: cli.google_token_url.clone(),
        request_timeout_ms: cli.request_timeout_ms,
    })?;
    let sheets = GoogleSheetsClient::new(
        &cli.sheets_api_base,
        &cli.sheets_range,
        google_oauth.clone(),
        cli.request_timeout_ms,
    )?;
    let vault = CredentialVault::new(store.clone(), Arc::new(google_oauth), signer.clone());

    let dispatcher = EventDispatcher::new(
        store.clone(),
        Arc::new(SlackPlatformProvider::new(
            &cli.slack_api_base,
            cli.request_timeout_ms,
        )),
        ReactionPipeline::new(store.clone(), vault.clone(), Arc::new(sheets)),
        CommandHandler::new(store.clone(), vault.clone(), &cli.command_name),
        Duration::from_millis(cli.event_timeout_ms),
    );
    let connector = SlackTenantConnector::new(
        &cli.slack_api_base,
        Some(cli.slack_app_token.clone()),
        cli.request_timeout_ms,
        Duration::from_millis(cli.reconnect_delay_ms),
        dispatcher,
    );
    let manager = TenantConnectionManager::new(
        RunningTenants::new(),
        Arc::new(connector),
        store.clone(),
    );

    if let Some(bot_token) = cli.slack_bot_token.as_deref() {
        register_bootstrap_tenant(&cli, &vault, bot_token).await?;
    }

    let started = manager
        .start_known_tenants()
        .await
        .context("failed to replay stored tenants")?;
    tracing::info!(started, "tenant subscriptions started");

    let slack_install = match (&cli.slack_client_id, &cli.slack_client_secret) {
        (Some(client_id), Some(client_secret)) => Some(SlackInstallFlow {
            oauth: SlackOAuthClient::new(
                &cli.slack_api_base,
                &cli.slack_authorize_url,
                client_id,
                client_secret,
                cli.request_timeout_ms,
            )?,
            redirect_uri: cli.slack_redirect_url(),
        }),
        _ => None,
    };
    if slack_install.is_none() {
        tracing::info!("slack client credentials not set; workspace install endpoint disabled");
    }

    let state = Arc::new(GatewayState::new(vault, manager, signer, slack_install));
    run_gateway_server(cli.bind, state).await
}

/// Registers the workspace behind a directly supplied bot token.
async fn register_bootstrap_tenant(
    cli: &Cli,
    vault: &CredentialVault,
    bot_token: &str,
) -> Result<()> {
    let client = SlackApiClient::new(&cli.slack_api_base, bot_token, cli.request_timeout_ms)?;
    let identity = client
        .auth_test()
        .await
        .context("slack bot token was rejected by auth.test")?;
    tracing::info!(
        team_id = %identity.team_id,
        bot_user_id = %identity.bot_user_id,
        "registering bootstrap tenant"
    );
    vault
        .store_tenant_token(TenantWorkspace::new(
            identity.team_id,
            identity.team_name,
            bot_token,
        ))
        .await?;
    Ok(())
}
