//! Routes inbound events to their handler, one short-lived task per event.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sheetpin_slack::{ChatPlatform, InboundEvent, SlackApiClient};
use sheetpin_store::{Store, TenantWorkspace};
use tokio::task::JoinHandle;

use crate::command_handler::CommandHandler;
use crate::reaction_pipeline::ReactionPipeline;

/// Builds the chat client acting with a tenant's bot token.
pub trait ChatPlatformProvider: Send + Sync {
    fn for_tenant(&self, tenant: &TenantWorkspace) -> Result<Arc<dyn ChatPlatform>>;
}

#[derive(Debug, Clone)]
pub struct SlackPlatformProvider {
    api_base: String,
    request_timeout_ms: u64,
}

impl SlackPlatformProvider {
    pub fn new(api_base: &str, request_timeout_ms: u64) -> Self {
        Self {
            api_base: api_base.to_string(),
            request_timeout_ms,
        }
    }
}

impl ChatPlatformProvider for SlackPlatformProvider {
    fn for_tenant(&self, tenant: &TenantWorkspace) -> Result<Arc<dyn ChatPlatform>> {
        Ok(Arc::new(SlackApiClient::new(
            &self.api_base,
            &tenant.bot_token,
            self.request_timeout_ms,
        )?))
    }
}

struct DispatcherInner {
    store: Arc<dyn Store>,
    platforms: Arc<dyn ChatPlatformProvider>,
    pipeline: ReactionPipeline,
    commands: CommandHandler,
    event_timeout: Duration,
}

/// Events are routed by the team id they carry, so any tenant's socket may
/// deliver any tenant's event.
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<DispatcherInner>,
}

impl EventDispatcher {
    pub fn new(
        store: Arc<dyn Store>,
        platforms: Arc<dyn ChatPlatformProvider>,
        pipeline: ReactionPipeline,
        commands: CommandHandler,
        event_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                store,
                platforms,
                pipeline,
                commands,
                event_timeout,
            }),
        }
    }

    /// Spawns a bounded handler task. Its failure or timeout is logged and
    /// never reaches the caller.
    pub fn dispatch(&self, event: InboundEvent) -> JoinHandle<()> {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let team_id = event.team_id().to_string();
            let kind = match &event {
                InboundEvent::ReactionAdded(_) => "reaction_added",
                InboundEvent::SlashCommand(_) => "slash_command",
            };
            match tokio::time::timeout(dispatcher.inner.event_timeout, dispatcher.handle(event))
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(error)) => tracing::warn!(
                    team_id = %team_id,
                    kind,
                    error = %format!("{error:#}"),
                    "event dropped"
                ),
                Err(_) => tracing::warn!(
                    team_id = %team_id,
                    kind,
                    timeout_ms = dispatcher.inner.event_timeout.as_millis() as u64,
                    "event timed out"
                ),
            }
        })
    }

    pub async fn handle(&self, event: InboundEvent) -> Result<()> {
        let Some(tenant) = self.inner.store.get_tenant(event.team_id()).await? else {
            tracing::warn!(team_id = %event.team_id(), "event for unknown tenant ignored");
            return Ok(());
        };
        let platform = self.inner.platforms.for_tenant(&tenant)?;
        match event {
            InboundEvent::ReactionAdded(reaction) => {
                self.inner
                    .pipeline
                    .handle_reaction(platform.as_ref(), &reaction)
                    .await?;
            }
            InboundEvent::SlashCommand(invocation) => {
                self.inner
                    .commands
                    .handle(platform.as_ref(), &invocation)
                    .await?;
            }
        }
        Ok(())
    }
}
