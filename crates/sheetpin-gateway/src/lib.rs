//! HTTP redirect targets for the Slack install and Google authorization flows.
//!
//! Responses are plain text; the handlers only verify the redirect and hand
//! off to the credential vault and connection manager.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use sheetpin_runtime::{
    complete_tenant_install, CredentialVault, StartOutcome, StatePurpose, StateSigner,
    TenantConnectionManager, VaultError,
};
use sheetpin_slack::SlackOAuthClient;
use sheetpin_store::TenantWorkspace;
use tokio::net::TcpListener;

pub const HEALTHZ_ENDPOINT: &str = "/healthz";
pub const SLACK_INSTALL_ENDPOINT: &str = "/slack/install";
pub const SLACK_OAUTH_CALLBACK_ENDPOINT: &str = "/slack/oauth/callback";
pub const GOOGLE_OAUTH_CALLBACK_ENDPOINT: &str = "/google/oauth/callback";

const INSTALL_STATE_SUBJECT: &str = "slack-install";

/// Workspace install flow; absent when the app is not distributed.
#[derive(Clone)]
pub struct SlackInstallFlow {
    pub oauth: SlackOAuthClient,
    pub redirect_uri: String,
}

#[derive(Clone)]
pub struct GatewayState {
    vault: CredentialVault,
    manager: TenantConnectionManager,
    signer: StateSigner,
    slack_install: Option<SlackInstallFlow>,
}

impl GatewayState {
    pub fn new(
        vault: CredentialVault,
        manager: TenantConnectionManager,
        signer: StateSigner,
        slack_install: Option<SlackInstallFlow>,
    ) -> Self {
        Self {
            vault,
            manager,
            signer,
            slack_install,
        }
    }
}

#[derive(Debug)]
struct GatewayError {
    status: StatusCode,
    message: String,
}

impl GatewayError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

impl From<VaultError> for GatewayError {
    fn from(error: VaultError) -> Self {
        match error {
            VaultError::ExchangeFailed(reason) => {
                Self::bad_request(format!("authorization failed: {reason}"))
            }
            other => {
                tracing::error!(error = %other, "credential vault failure");
                Self::internal("internal storage error")
            }
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct OAuthCallbackQuery {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl OAuthCallbackQuery {
    fn into_code_and_state(self) -> Result<(String, String), GatewayError> {
        if let Some(error) = self.error {
            return Err(GatewayError::bad_request(format!(
                "authorization was declined: {error}"
            )));
        }
        match (self.code, self.state) {
            (Some(code), Some(state)) if !code.trim().is_empty() => Ok((code, state)),
            _ => Err(GatewayError::bad_request(
                "missing code or state query parameter",
            )),
        }
    }
}

pub fn build_gateway_router(state: Arc<GatewayState>) -> Router {
    Router::new()
        .route(HEALTHZ_ENDPOINT, get(handle_healthz))
        .route(SLACK_INSTALL_ENDPOINT, get(handle_slack_install))
        .route(SLACK_OAUTH_CALLBACK_ENDPOINT, get(handle_slack_oauth_callback))
        .route(
            GOOGLE_OAUTH_CALLBACK_ENDPOINT,
            get(handle_google_oauth_callback),
        )
        .with_state(state)
}

/// Serves the redirect endpoints until ctrl-c.
pub async fn run_gateway_server(bind: SocketAddr, state: Arc<GatewayState>) -> Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .with_context(|| format!("failed to bind gateway on {bind}"))?;
    let local_addr = listener
        .local_addr()
        .context("failed to resolve bound gateway address")?;
    tracing::info!(addr = %local_addr, "gateway listening");

    axum::serve(listener, build_gateway_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("gateway server exited unexpectedly")
}

async fn handle_healthz(State(state): State<Arc<GatewayState>>) -> String {
    format!("ok running_tenants={}", state.manager.running().len())
}

async fn handle_slack_install(
    State(state): State<Arc<GatewayState>>,
) -> Result<Redirect, GatewayError> {
    let Some(install) = state.slack_install.as_ref() else {
        return Err(GatewayError::new(
            StatusCode::NOT_FOUND,
            "workspace install is not configured",
        ));
    };
    let signed = state
        .signer
        .sign(StatePurpose::SlackInstall, INSTALL_STATE_SUBJECT)
        .map_err(|error| GatewayError::internal(error.to_string()))?;
    let url = install
        .oauth
        .authorize_url(&signed, &install.redirect_uri)
        .map_err(|error| GatewayError::internal(error.to_string()))?;
    Ok(Redirect::to(&url))
}

async fn handle_slack_oauth_callback(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<OAuthCallbackQuery>,
) -> Result<String, GatewayError> {
    let Some(install) = state.slack_install.as_ref() else {
        return Err(GatewayError::new(
            StatusCode::NOT_FOUND,
            "workspace install is not configured",
        ));
    };
    let (code, signed) = query.into_code_and_state()?;
    state
        .signer
        .verify(StatePurpose::SlackInstall, &signed)
        .map_err(|error| GatewayError::bad_request(error.to_string()))?;

    let installation = install
        .oauth
        .exchange_code(&code, &install.redirect_uri)
        .await
        .map_err(|error| {
            tracing::warn!(error = %format!("{error:#}"), "slack install exchange failed");
            GatewayError::new(StatusCode::BAD_GATEWAY, "slack rejected the install")
        })?;

    let team_name = installation.team_name.clone();
    let tenant = TenantWorkspace::new(
        installation.team_id,
        installation.team_name,
        installation.bot_token,
    );
    let outcome = complete_tenant_install(&state.vault, &state.manager, tenant).await?;
    Ok(match outcome {
        StartOutcome::Started => format!("Installed into {team_name}. The bot is now listening."),
        StartOutcome::AlreadyRunning => {
            format!("Reinstalled into {team_name}. The bot token was updated.")
        }
    })
}

async fn handle_google_oauth_callback(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<OAuthCallbackQuery>,
) -> Result<String, GatewayError> {
    let (code, signed) = query.into_code_and_state()?;
    let writer_ref = state
        .vault
        .complete_writer_authorization(&code, &signed)
        .await?;
    tracing::info!(writer_ref = %writer_ref, "writer authorization completed");
    Ok("Google Sheets access granted. Return to Slack and run the register command again."
        .to_string())
}
