use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Client;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::mpsc;

use super::Channel;
use crate::bus::{ChatKind, InboundMessage, OutboundMessage, Sender};
use crate::commands::BOT_COMMANDS;
use crate::config::TelegramConfig;

const RETRY_DELAY: Duration = Duration::from_secs(5);

/// Telegram Bot API over long polling.
pub struct TelegramChannel {
    api: BotApi,
    poll_timeout: u64,
    bus_tx: mpsc::Sender<InboundMessage>,
}

#[derive(Clone)]
struct BotApi {
    client: Client,
    base_url: String,
}

#[derive(Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    result: Option<T>,
}

#[derive(Debug, Deserialize)]
struct Update {
    update_id: i64,
    #[serde(default)]
    message: Option<TgMessage>,
}

#[derive(Debug, Deserialize)]
struct TgMessage {
    message_id: i64,
    #[serde(default)]
    from: Option<TgUser>,
    chat: TgChat,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgUser {
    id: i64,
    #[serde(default)]
    is_bot: bool,
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    first_name: String,
    #[serde(default)]
    last_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgChat {
    id: i64,
    #[serde(rename = "type")]
    kind: String,
}

impl Update {
    /// Text messages from humans; everything else is ignored.
    fn into_inbound(self) -> Option<InboundMessage> {
        let message = self.message?;
        let text = message.text?;
        let from = message.from.filter(|u| !u.is_bot)?;
        Some(InboundMessage {
            chat_id: message.chat.id,
            chat_kind: if message.chat.kind == "private" {
                ChatKind::Private
            } else {
                ChatKind::Group
            },
            sender: Sender {
                id: from.id,
                username: from.username.unwrap_or_default(),
                first_name: from.first_name,
                last_name: from.last_name.unwrap_or_default(),
            },
            message_id: Some(message.message_id),
            text,
        })
    }
}

impl BotApi {
    async fn call<T: DeserializeOwned>(&self, method: &str, body: &Value, timeout: Duration) -> Result<T> {
        let response = self
            .client
            .post(format!("{}/{method}", self.base_url))
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .with_context(|| format!("Failed to call Telegram {method}"))?;

        let status = response.status();
        let parsed: ApiResponse<T> = response
            .json()
            .await
            .with_context(|| format!("Failed to parse Telegram {method} response ({status})"))?;
        if !parsed.ok {
            anyhow::bail!(
                "Telegram {method} error ({status}): {}",
                parsed.description.unwrap_or_default()
            );
        }
        parsed
            .result
            .with_context(|| format!("Telegram {method} returned no result"))
    }
}

impl TelegramChannel {
    pub fn new(config: &TelegramConfig, bot_token: &str, bus_tx: mpsc::Sender<InboundMessage>) -> Self {
        Self {
            api: BotApi {
                client: Client::new(),
                base_url: format!("{}/bot{bot_token}", config.api_base.trim_end_matches('/')),
            },
            poll_timeout: config.poll_timeout_secs,
            bus_tx,
        }
    }

    async fn register_commands(&self) -> Result<()> {
        let commands: Vec<Value> = BOT_COMMANDS
            .iter()
            .map(|(command, description)| json!({ "command": command, "description": description }))
            .collect();
        let _: bool = self
            .api
            .call("setMyCommands", &json!({ "commands": commands }), Duration::from_secs(10))
            .await?;
        Ok(())
    }
}

/// Acknowledge everything queued while the bot was offline and return the
/// first offset to poll from.
async fn skip_pending(api: &BotApi) -> Result<i64> {
    let updates: Vec<Update> = api
        .call("getUpdates", &json!({ "offset": -1, "timeout": 0 }), Duration::from_secs(10))
        .await?;
    Ok(updates.last().map_or(0, |u| u.update_id + 1))
}

async fn poll_loop(api: BotApi, poll_timeout: u64, tx: mpsc::Sender<InboundMessage>) {
    let mut offset = match skip_pending(&api).await {
        Ok(offset) => offset,
        Err(e) => {
            tracing::warn!("Could not drop pending updates: {e}");
            0
        }
    };
    // the HTTP timeout must outlast the server-side long poll
    let http_timeout = Duration::from_secs(poll_timeout + 10);

    loop {
        let body = json!({
            "offset": offset,
            "timeout": poll_timeout,
            "allowed_updates": ["message"],
        });
        let updates: Vec<Update> = match api.call("getUpdates", &body, http_timeout).await {
            Ok(updates) => updates,
            Err(e) => {
                tracing::warn!("Telegram polling failed: {e:#}");
                tokio::time::sleep(RETRY_DELAY).await;
                continue;
            }
        };
        for update in updates {
            offset = offset.max(update.update_id + 1);
            let Some(inbound) = update.into_inbound() else {
                continue;
            };
            if tx.send(inbound).await.is_err() {
                tracing::info!("Inbound bus closed, stopping Telegram polling");
                return;
            }
        }
    }
}

#[async_trait::async_trait]
impl Channel for TelegramChannel {
    fn name(&self) -> &str {
        "telegram"
    }

    async fn start(&self) -> Result<()> {
        if let Err(e) = self.register_commands().await {
            tracing::warn!("Failed to register bot commands: {e:#}");
        }
        tokio::spawn(poll_loop(self.api.clone(), self.poll_timeout, self.bus_tx.clone()));
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<()> {
        let mut body = json!({
            "chat_id": msg.chat_id,
            "text": msg.text,
            "parse_mode": "HTML",
        });
        if let Some(reply_to) = msg.reply_to {
            body["reply_to_message_id"] = json!(reply_to);
        }
        let _: Value = self
            .api
            .call("sendMessage", &body, Duration::from_secs(15))
            .await?;
        Ok(())
    }
}
