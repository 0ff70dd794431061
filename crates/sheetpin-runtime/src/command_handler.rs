//! Slash-command parsing and replies.

use std::sync::Arc;

use anyhow::Result;
use sheetpin_sheets::extract_spreadsheet_id;
use sheetpin_slack::{ChatPlatform, SlashCommandInvocation};
use sheetpin_store::{NewMapping, Store, StoreError};

use crate::vault::CredentialVault;
use crate::{normalize_emoji, writer_ref};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Help,
    /// `target` is the spreadsheet id, already extracted from a URL if one
    /// was given.
    Register { emoji: String, target: String },
    List,
    Unknown { reason: String },
}

pub fn parse_command(text: &str) -> Command {
    let trimmed = text.trim();
    let mut parts = trimmed.split_whitespace();
    let Some(verb) = parts.next() else {
        return Command::Help;
    };
    let args = parts.collect::<Vec<_>>();

    match (verb.to_ascii_lowercase().as_str(), args.as_slice()) {
        ("help", []) => Command::Help,
        ("list", []) => Command::List,
        ("register", [raw_emoji, raw_target]) => {
            let emoji = normalize_emoji(raw_emoji);
            if !is_emoji_name(&emoji) {
                return Command::Unknown {
                    reason: format!("'{raw_emoji}' is not an emoji name"),
                };
            }
            match extract_spreadsheet_id(raw_target) {
                Some(target) => Command::Register { emoji, target },
                None => Command::Unknown {
                    reason: format!("'{raw_target}' is not a spreadsheet id or Google Sheets URL"),
                },
            }
        }
        ("register", _) => Command::Unknown {
            reason: "register takes an emoji and a spreadsheet".to_string(),
        },
        ("help" | "list", _) => Command::Unknown {
            reason: format!("{verb} takes no arguments"),
        },
        _ => Command::Unknown {
            reason: format!("unknown command '{verb}'"),
        },
    }
}

fn is_emoji_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '-' | '+' | '\''))
}

#[derive(Clone)]
pub struct CommandHandler {
    store: Arc<dyn Store>,
    vault: CredentialVault,
    command_name: String,
}

impl CommandHandler {
    pub fn new(store: Arc<dyn Store>, vault: CredentialVault, command_name: &str) -> Self {
        Self {
            store,
            vault,
            command_name: command_name.to_string(),
        }
    }

    pub fn usage(&self) -> String {
        let name = &self.command_name;
        [
            format!("Supported `{name}` commands:"),
            format!("- `{name} help`"),
            format!("- `{name} register :emoji: <spreadsheet id or URL>`"),
            format!("- `{name} list`"),
            "React to a message with a registered emoji to append it to the spreadsheet."
                .to_string(),
        ]
        .join("\n")
    }

    /// Parses and executes an invocation, then replies privately to the issuer.
    pub async fn handle(
        &self,
        platform: &dyn ChatPlatform,
        invocation: &SlashCommandInvocation,
    ) -> Result<()> {
        let reply = self.respond(invocation).await?;
        platform
            .post_ephemeral(&invocation.channel_id, &invocation.user_id, &reply)
            .await
    }

    pub async fn respond(&self, invocation: &SlashCommandInvocation) -> Result<String> {
        let command = parse_command(&invocation.text);
        tracing::debug!(
            team_id = %invocation.team_id,
            channel_id = %invocation.channel_id,
            ?command,
            "handling slash command"
        );
        match command {
            Command::Help => Ok(self.usage()),
            Command::List => self.list(invocation).await,
            Command::Register { emoji, target } => self.register(invocation, emoji, target).await,
            Command::Unknown { reason } => Ok(format!("{reason}.\n{}", self.usage())),
        }
    }

    async fn register(
        &self,
        invocation: &SlashCommandInvocation,
        emoji: String,
        target: String,
    ) -> Result<String> {
        let writer = writer_ref(&invocation.team_id, &invocation.user_id);
        if self.vault.get_writer_credential(&writer).await?.is_none() {
            let url = self.vault.begin_writer_authorization(&writer)?;
            tracing::info!(writer_ref = %writer, "register blocked on writer authorization");
            return Ok(format!(
                "Authorize access to Google Sheets first: {url}\nThen run `{} register :{emoji}: {target}` again.",
                self.command_name
            ));
        }

        let mapping = NewMapping {
            team_id: invocation.team_id.clone(),
            channel_id: invocation.channel_id.clone(),
            emoji,
            spreadsheet_id: target,
            writer_ref: Some(writer),
        };
        match self.store.register_mapping(mapping).await {
            Ok(mapping) => {
                tracing::info!(
                    team_id = %mapping.team_id,
                    channel_id = %mapping.channel_id,
                    emoji = %mapping.emoji,
                    spreadsheet_id = %mapping.spreadsheet_id,
                    "mapping registered"
                );
                Ok(format!(
                    "Registered :{}: in this channel. Reacted messages will be appended to spreadsheet `{}`.",
                    mapping.emoji, mapping.spreadsheet_id
                ))
            }
            Err(StoreError::DuplicateMapping { emoji, .. }) => {
                Ok(format!(":{emoji}: is already registered in this channel."))
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn list(&self, invocation: &SlashCommandInvocation) -> Result<String> {
        let mappings = self
            .store
            .list_channel_mappings(&invocation.team_id, &invocation.channel_id)
            .await?;
        if mappings.is_empty() {
            return Ok("No emoji are registered in this channel.".to_string());
        }
        let mut lines = vec!["Registered emoji in this channel:".to_string()];
        lines.extend(
            mappings
                .iter()
                .map(|mapping| format!("- :{}: -> `{}`", mapping.emoji, mapping.spreadsheet_id)),
        );
        Ok(lines.join("\n"))
    }
}
