use anyhow::Result;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use super::Channel;
use crate::bus::{ChatKind, InboundMessage, OutboundMessage, Sender};

/// Chat id the console pretends to be typing into.
pub const CONSOLE_GROUP: i64 = -1;
/// User id of the person at the console.
pub const CONSOLE_USER: i64 = 1;

/// Console channel for running without Telegram: stdin lines arrive as
/// group messages from a single local user, outbound messages are printed.
pub struct CliChannel {
    bus_tx: mpsc::Sender<InboundMessage>,
}

impl CliChannel {
    pub fn new(bus_tx: mpsc::Sender<InboundMessage>) -> Self {
        Self { bus_tx }
    }
}

fn console_message(line: String) -> InboundMessage {
    InboundMessage {
        chat_id: CONSOLE_GROUP,
        chat_kind: ChatKind::Group,
        sender: Sender {
            id: CONSOLE_USER,
            username: "console".to_string(),
            first_name: "Console".to_string(),
            last_name: String::new(),
        },
        message_id: None,
        text: line,
    }
}

#[async_trait::async_trait]
impl Channel for CliChannel {
    fn name(&self) -> &str {
        "cli"
    }

    async fn start(&self) -> Result<()> {
        let tx = self.bus_tx.clone();
        tokio::spawn(async move {
            let stdin = BufReader::new(tokio::io::stdin());
            let mut lines = stdin.lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                if tx.send(console_message(line)).await.is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<()> {
        println!("\n[chat {}]\n{}\n", msg.chat_id, msg.text);
        Ok(())
    }
}
