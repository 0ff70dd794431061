//! Core of sheetpin: credential vault, tenant connection lifecycle, the
//! reaction pipeline, the command handler and the event dispatcher that ties
//! them to inbound Slack events.

mod command_handler;
mod connection_manager;
mod dispatcher;
mod reaction_pipeline;
mod state_token;
mod vault;

#[cfg(test)]
mod test_support;

pub use command_handler::{parse_command, Command, CommandHandler};
pub use connection_manager::{
    complete_tenant_install, RunningTenants, SlackTenantConnector, StartOutcome,
    TenantConnectionManager, TenantConnector,
};
pub use dispatcher::{ChatPlatformProvider, EventDispatcher, SlackPlatformProvider};
pub use reaction_pipeline::{PipelineOutcome, ReactionPipeline};
pub use state_token::{StatePurpose, StateSigner};
pub use vault::{CredentialVault, VaultError, WriterAuthorizer};

/// Writer identities are scoped to the tenant they were authorized from.
pub fn writer_ref(team_id: &str, user_id: &str) -> String {
    format!("{team_id}:{user_id}")
}

/// Canonical emoji name: no surrounding colons, no skin-tone suffix, lower case.
pub fn normalize_emoji(raw: &str) -> String {
    let trimmed = raw.trim().trim_matches(':');
    let base = trimmed.split("::").next().unwrap_or(trimmed);
    base.to_ascii_lowercase()
}
