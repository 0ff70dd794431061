//! One live Socket Mode subscription per installed tenant.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sheetpin_slack::{run_socket_session, SlackApiClient};
use sheetpin_store::{Store, StoreError, TenantWorkspace};

use crate::dispatcher::EventDispatcher;
use crate::vault::{CredentialVault, VaultError};

/// Slack error codes after which reconnecting with the same token is futile.
const FATAL_SLACK_ERRORS: &[&str] = &[
    "invalid_auth",
    "not_authed",
    "token_revoked",
    "account_inactive",
    "team_disabled",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
}

/// Tenants with a live subscription task, keyed by team id.
#[derive(Debug, Clone, Default)]
pub struct RunningTenants {
    inner: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
}

impl RunningTenants {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomic check-and-insert; `true` when the caller now owns the slot.
    fn try_claim(&self, team_id: &str) -> bool {
        let mut running = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if running.contains_key(team_id) {
            return false;
        }
        running.insert(team_id.to_string(), Utc::now());
        true
    }

    fn release(&self, team_id: &str) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(team_id);
    }

    pub fn contains(&self, team_id: &str) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(team_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sorted team ids.
    pub fn team_ids(&self) -> Vec<String> {
        let mut ids = self
            .inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }
}

/// Long-lived event subscription for one tenant. Returning ends the
/// subscription; the manager then forgets the tenant.
#[async_trait]
pub trait TenantConnector: Send + Sync + 'static {
    async fn run(&self, tenant: TenantWorkspace) -> Result<()>;
}

#[derive(Clone)]
pub struct TenantConnectionManager {
    running: RunningTenants,
    connector: Arc<dyn TenantConnector>,
    store: Arc<dyn Store>,
}

impl TenantConnectionManager {
    pub fn new(
        running: RunningTenants,
        connector: Arc<dyn TenantConnector>,
        store: Arc<dyn Store>,
    ) -> Self {
        Self {
            running,
            connector,
            store,
        }
    }

    /// Spawns the tenant's subscription unless one is already live. Must be
    /// called from within a tokio runtime.
    pub fn start_if_not_running(&self, tenant: TenantWorkspace) -> StartOutcome {
        if !self.running.try_claim(&tenant.team_id) {
            tracing::debug!(team_id = %tenant.team_id, "tenant subscription already running");
            return StartOutcome::AlreadyRunning;
        }

        tracing::info!(team_id = %tenant.team_id, team_name = %tenant.team_name, "starting tenant subscription");
        let running = self.running.clone();
        let connector = Arc::clone(&self.connector);
        tokio::spawn(async move {
            let team_id = tenant.team_id.clone();
            match connector.run(tenant).await {
                Ok(()) => tracing::info!(team_id = %team_id, "tenant subscription ended"),
                Err(error) => {
                    tracing::error!(team_id = %team_id, error = %format!("{error:#}"), "tenant subscription stopped")
                }
            }
            running.release(&team_id);
        });
        StartOutcome::Started
    }

    /// Boot replay: starts every stored tenant and returns how many started.
    pub async fn start_known_tenants(&self) -> Result<usize, StoreError> {
        let tenants = self.store.list_tenants().await?;
        let total = tenants.len();
        let started = tenants
            .into_iter()
            .map(|tenant| self.start_if_not_running(tenant))
            .filter(|outcome| *outcome == StartOutcome::Started)
            .count();
        tracing::info!(known = total, started, "replayed known tenants");
        Ok(started)
    }

    pub fn running_tenants(&self) -> Vec<String> {
        self.running.team_ids()
    }

    pub fn running(&self) -> &RunningTenants {
        &self.running
    }
}

/// Install completion: persist the tenant token, then make sure it is live.
pub async fn complete_tenant_install(
    vault: &CredentialVault,
    manager: &TenantConnectionManager,
    tenant: TenantWorkspace,
) -> Result<StartOutcome, VaultError> {
    vault.store_tenant_token(tenant.clone()).await?;
    Ok(manager.start_if_not_running(tenant))
}

/// Socket Mode subscription that reconnects until the tenant's tokens are
/// rejected outright.
#[derive(Clone)]
pub struct SlackTenantConnector {
    api_base: String,
    default_app_token: Option<String>,
    request_timeout_ms: u64,
    reconnect_delay: Duration,
    dispatcher: EventDispatcher,
}

impl SlackTenantConnector {
    pub fn new(
        api_base: &str,
        default_app_token: Option<String>,
        request_timeout_ms: u64,
        reconnect_delay: Duration,
        dispatcher: EventDispatcher,
    ) -> Self {
        Self {
            api_base: api_base.to_string(),
            default_app_token,
            request_timeout_ms,
            reconnect_delay,
            dispatcher,
        }
    }
}

#[async_trait]
impl TenantConnector for SlackTenantConnector {
    async fn run(&self, tenant: TenantWorkspace) -> Result<()> {
        let Some(app_token) = tenant
            .app_token
            .clone()
            .or_else(|| self.default_app_token.clone())
        else {
            bail!("no socket mode app token for team {}", tenant.team_id);
        };
        let client = SlackApiClient::new(&self.api_base, &tenant.bot_token, self.request_timeout_ms)?;

        loop {
            let socket_url = match client.open_socket_connection(&app_token).await {
                Ok(url) => url,
                Err(error) if is_fatal_slack_error(&error) => return Err(error),
                Err(error) => {
                    tracing::warn!(team_id = %tenant.team_id, error = %error, "failed to open socket connection");
                    tokio::time::sleep(self.reconnect_delay).await;
                    continue;
                }
            };

            tracing::info!(team_id = %tenant.team_id, "slack socket connected");
            let dispatcher = self.dispatcher.clone();
            match run_socket_session(&socket_url, move |event| {
                dispatcher.dispatch(event);
            })
            .await
            {
                Ok(end) => tracing::info!(team_id = %tenant.team_id, ?end, "slack socket session ended"),
                Err(error) => {
                    tracing::warn!(team_id = %tenant.team_id, error = %format!("{error:#}"), "slack socket session error")
                }
            }
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }
}

fn is_fatal_slack_error(error: &anyhow::Error) -> bool {
    let rendered = format!("{error:#}");
    FATAL_SLACK_ERRORS
        .iter()
        .any(|code| rendered.contains(code))
}
