//! Socket Mode envelopes and the per-connection session loop.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

use crate::slack_helpers::non_empty;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SocketEnvelope {
    /// Absent on `hello` and `disconnect` control frames.
    #[serde(default)]
    pub envelope_id: Option<String>,
    #[serde(rename = "type")]
    pub envelope_type: String,
    #[serde(default)]
    pub payload: Value,
}

/// A reaction placed on a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionAdded {
    pub team_id: String,
    pub event_id: String,
    pub channel_id: String,
    pub message_ts: String,
    /// Reaction name as Slack reports it, without colons.
    pub emoji: String,
    pub reacting_user: String,
    pub item_user: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlashCommandInvocation {
    pub team_id: String,
    pub channel_id: String,
    pub user_id: String,
    pub command: String,
    pub text: String,
    pub response_url: Option<String>,
}

/// Events the runtime acts on; everything else is acknowledged and dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundEvent {
    ReactionAdded(ReactionAdded),
    SlashCommand(SlashCommandInvocation),
}

impl InboundEvent {
    pub fn team_id(&self) -> &str {
        match self {
            Self::ReactionAdded(event) => &event.team_id,
            Self::SlashCommand(invocation) => &invocation.team_id,
        }
    }
}

/// Why a socket session returned without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketSessionEnd {
    Closed,
    DisconnectRequested,
}

#[derive(Debug, Deserialize)]
struct EventCallback {
    #[serde(rename = "type")]
    callback_type: String,
    #[serde(default)]
    team_id: Option<String>,
    #[serde(default)]
    event_id: Option<String>,
    event: ReactionEventPayload,
}

#[derive(Debug, Deserialize)]
struct ReactionEventPayload {
    #[serde(rename = "type")]
    event_type: String,
    #[serde(default)]
    user: Option<String>,
    #[serde(default)]
    reaction: Option<String>,
    #[serde(default)]
    item_user: Option<String>,
    #[serde(default)]
    item: Option<ReactionItem>,
}

#[derive(Debug, Deserialize)]
struct ReactionItem {
    #[serde(rename = "type")]
    item_type: String,
    #[serde(default)]
    channel: Option<String>,
    #[serde(default)]
    ts: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SlashCommandPayload {
    #[serde(default)]
    team_id: Option<String>,
    #[serde(default)]
    channel_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    response_url: Option<String>,
}

pub fn parse_socket_envelope(message: WsMessage) -> Result<Option<SocketEnvelope>> {
    let text = match message {
        WsMessage::Text(text) => text.as_str().to_owned(),
        WsMessage::Binary(bytes) => {
            String::from_utf8(bytes.to_vec()).context("invalid utf-8 slack socket payload")?
        }
        WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Close(_) | WsMessage::Frame(_) => {
            return Ok(None)
        }
    };
    let envelope = serde_json::from_str::<SocketEnvelope>(&text)
        .context("failed to parse slack socket envelope")?;
    Ok(Some(envelope))
}

/// Maps an envelope onto an [`InboundEvent`], returning `None` for kinds the
/// runtime does not handle.
pub fn normalize_socket_envelope(envelope: &SocketEnvelope) -> Result<Option<InboundEvent>> {
    match envelope.envelope_type.as_str() {
        "events_api" => normalize_event_callback(&envelope.payload),
        "slash_commands" => normalize_slash_command(&envelope.payload),
        _ => Ok(None),
    }
}

fn normalize_event_callback(payload: &Value) -> Result<Option<InboundEvent>> {
    if payload.pointer("/event/type").and_then(Value::as_str) != Some("reaction_added") {
        return Ok(None);
    }
    let callback = serde_json::from_value::<EventCallback>(payload.clone())
        .context("failed to decode slack reaction_added callback")?;
    if callback.callback_type != "event_callback" || callback.event.event_type != "reaction_added"
    {
        return Ok(None);
    }

    let event = callback.event;
    let Some(item) = event.item.filter(|item| item.item_type == "message") else {
        return Ok(None);
    };
    let (Some(team_id), Some(channel_id), Some(message_ts), Some(emoji), Some(reacting_user)) = (
        non_empty(callback.team_id),
        non_empty(item.channel),
        non_empty(item.ts),
        non_empty(event.reaction),
        non_empty(event.user),
    ) else {
        return Ok(None);
    };

    Ok(Some(InboundEvent::ReactionAdded(ReactionAdded {
        team_id,
        event_id: callback.event_id.unwrap_or_default(),
        channel_id,
        message_ts,
        emoji,
        reacting_user,
        item_user: non_empty(event.item_user),
    })))
}

fn normalize_slash_command(payload: &Value) -> Result<Option<InboundEvent>> {
    let command = serde_json::from_value::<SlashCommandPayload>(payload.clone())
        .context("failed to decode slack slash command payload")?;
    let (Some(team_id), Some(channel_id), Some(user_id), Some(name)) = (
        non_empty(command.team_id),
        non_empty(command.channel_id),
        non_empty(command.user_id),
        non_empty(command.command),
    ) else {
        return Ok(None);
    };

    Ok(Some(InboundEvent::SlashCommand(SlashCommandInvocation {
        team_id,
        channel_id,
        user_id,
        command: name,
        text: command.text.unwrap_or_default(),
        response_url: non_empty(command.response_url),
    })))
}

async fn ack_envelope<S>(sink: &mut S, envelope_id: &str) -> Result<()>
where
    S: futures_util::Sink<WsMessage> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let ack = json!({ "envelope_id": envelope_id }).to_string();
    sink.send(WsMessage::Text(ack.into()))
        .await
        .context("failed to send slack socket ack")
}

/// Runs one websocket connection until Slack closes it or asks for a reconnect.
///
/// Every envelope carrying an id is acknowledged before `on_event` sees it, so
/// slow handlers never cause redelivery. Undecodable envelopes are logged and
/// skipped.
pub async fn run_socket_session<F>(socket_url: &str, mut on_event: F) -> Result<SocketSessionEnd>
where
    F: FnMut(InboundEvent) + Send,
{
    let (stream, _response) = connect_async(socket_url)
        .await
        .context("failed to connect slack socket mode websocket")?;
    let (mut sink, mut source) = stream.split();

    while let Some(message_result) = source.next().await {
        let message = message_result.context("failed reading slack websocket message")?;
        if matches!(message, WsMessage::Close(_)) {
            return Ok(SocketSessionEnd::Closed);
        }
        let envelope = match parse_socket_envelope(message) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => continue,
            Err(error) => {
                tracing::warn!(error = %error, "dropping undecodable slack socket frame");
                continue;
            }
        };

        if let Some(envelope_id) = envelope.envelope_id.as_deref() {
            ack_envelope(&mut sink, envelope_id).await?;
        }
        if envelope.envelope_type == "disconnect" {
            tracing::debug!(payload = %envelope.payload, "slack requested socket reconnect");
            return Ok(SocketSessionEnd::DisconnectRequested);
        }

        match normalize_socket_envelope(&envelope) {
            Ok(Some(event)) => on_event(event),
            Ok(None) => {}
            Err(error) => {
                tracing::warn!(
                    envelope_type = %envelope.envelope_type,
                    error = %error,
                    "dropping malformed slack envelope"
                );
            }
        }
    }
    Ok(SocketSessionEnd::Closed)
}
