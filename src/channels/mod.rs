pub mod cli;
pub mod telegram;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{broadcast, watch};

use crate::bus::{MessageBus, OutboundMessage};

/// A messaging transport: delivers outbound text to a chat and, once
/// started, feeds inbound messages onto the bus.
#[async_trait::async_trait]
pub trait Channel: Send + Sync {
    fn name(&self) -> &str;
    async fn start(&self) -> Result<()>;
    async fn send(&self, msg: &OutboundMessage) -> Result<()>;
}

/// Forward replies published on the bus to the channel until shutdown.
pub async fn dispatch_loop(
    bus: Arc<MessageBus>,
    channel: Arc<dyn Channel>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut rx = bus.outbound_subscriber();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = rx.recv() => match received {
                Ok(msg) => {
                    if let Err(e) = channel.send(&msg).await {
                        tracing::error!("Failed to send to {} chat {}: {e}", channel.name(), msg.chat_id);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!("Outbound bus lagged by {n} messages");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingChannel;
    use super::*;

    #[tokio::test]
    async fn test_dispatch_loop_forwards_until_shutdown() {
        let bus = Arc::new(MessageBus::new(8));
        let channel = Arc::new(RecordingChannel::default());
        channel.fail_for(-2);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(dispatch_loop(bus.clone(), channel.clone(), shutdown_rx));
        // messages published before the loop subscribes are dropped, so retry
        for _ in 0..100 {
            bus.send_outbound(OutboundMessage::to(-2, "lost"));
            bus.send_outbound(OutboundMessage::to(-1, "one"));
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            if !channel.sent_to().is_empty() {
                break;
            }
        }
        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        let sent = channel.sent_to();
        assert!(!sent.is_empty());
        assert!(sent.iter().all(|&id| id == -1));
    }
}
