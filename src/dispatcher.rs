use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;

use crate::bus::{OutboundMessage, escape_html};
use crate::channels::Channel;
use crate::store::{GroupId, SubjectId};

/// Per-recipient result of a reminder fan-out.
#[derive(Debug, Default)]
pub struct Delivery {
    pub delivered: Vec<SubjectId>,
    pub failed: Vec<SubjectId>,
}

impl Delivery {
    pub fn any_delivered(&self) -> bool {
        !self.delivered.is_empty()
    }
}

pub struct NotificationDispatcher {
    channel: Arc<dyn Channel>,
    send_delay: Duration,
}

impl NotificationDispatcher {
    pub fn new(channel: Arc<dyn Channel>, send_delay: Duration) -> Self {
        Self {
            channel,
            send_delay,
        }
    }

    /// Private notice to one member that `subject_name` has a birthday tomorrow.
    pub async fn send_reminder(
        &self,
        recipient: SubjectId,
        subject_name: &str,
        formatted_date: &str,
    ) -> Result<()> {
        self.channel
            .send(&OutboundMessage::to(
                recipient,
                reminder_text(subject_name, formatted_date),
            ))
            .await
    }

    pub async fn send_congratulation(
        &self,
        group: GroupId,
        subject_name: &str,
        age: Option<i32>,
    ) -> Result<()> {
        self.channel
            .send(&OutboundMessage::to(
                group,
                congratulation_text(subject_name, age),
            ))
            .await
    }

    /// Send the reminder to every recipient in turn, pausing between sends.
    /// A failed recipient is logged and skipped; the rest still get theirs.
    pub async fn fan_out_reminder(
        &self,
        recipients: &[SubjectId],
        subject_name: &str,
        formatted_date: &str,
    ) -> Delivery {
        let mut delivery = Delivery::default();
        for (i, &recipient) in recipients.iter().enumerate() {
            if i > 0 && !self.send_delay.is_zero() {
                tokio::time::sleep(self.send_delay).await;
            }
            match self
                .send_reminder(recipient, subject_name, formatted_date)
                .await
            {
                Ok(()) => delivery.delivered.push(recipient),
                Err(e) => {
                    tracing::warn!("Reminder about {subject_name} to {recipient} failed: {e:#}");
                    delivery.failed.push(recipient);
                }
            }
        }
        delivery
    }
}

pub fn reminder_text(subject_name: &str, formatted_date: &str) -> String {
    let subject_name = escape_html(subject_name);
    format!(
        "🎉 <b>Birthday reminder!</b> 🎉\n\n\
         Tomorrow, {formatted_date}, is the birthday of:\n\
         🎂 <b>{subject_name}</b>\n\n\
         Don't forget to congratulate them in the group! 🎊"
    )
}

pub fn congratulation_text(subject_name: &str, age: Option<i32>) -> String {
    let subject_name = escape_html(subject_name);
    let occasion = match age {
        Some(age) => format!("on turning {age}"),
        None => "on their birthday".to_string(),
    };
    format!(
        "🎂🎉 <b>HAPPY BIRTHDAY!</b> 🎉🎂\n\n\
         Congratulations to <b>{subject_name}</b> {occasion}! 🎊\n\n\
         💫 Wishing you happiness, health and success\n\
         ✨ and all the very best! 🎁\n\n\
         Join in with the congratulations! 🎈"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::testing::RecordingChannel;

    fn dispatcher(channel: &Arc<RecordingChannel>) -> NotificationDispatcher {
        NotificationDispatcher::new(channel.clone(), Duration::ZERO)
    }

    #[tokio::test]
    async fn test_fan_out_isolates_failures() {
        let channel = Arc::new(RecordingChannel::default());
        channel.fail_for(2);

        let delivery = dispatcher(&channel)
            .fan_out_reminder(&[1, 2, 3], "Anna K", "15.05.1990")
            .await;

        assert_eq!(delivery.delivered, vec![1, 3]);
        assert_eq!(delivery.failed, vec![2]);
        assert!(delivery.any_delivered());
        assert_eq!(channel.sent_to(), vec![1, 3]);
    }

    #[tokio::test]
    async fn test_fan_out_all_failed() {
        let channel = Arc::new(RecordingChannel::default());
        channel.fail_for(1);
        let delivery = dispatcher(&channel)
            .fan_out_reminder(&[1], "Anna", "15.05")
            .await;
        assert!(!delivery.any_delivered());
        assert_eq!(delivery.failed, vec![1]);
    }

    #[tokio::test]
    async fn test_fan_out_empty_audience() {
        let channel = Arc::new(RecordingChannel::default());
        let delivery = dispatcher(&channel).fan_out_reminder(&[], "Anna", "15.05").await;
        assert!(!delivery.any_delivered());
        assert!(channel.sent_to().is_empty());
    }

    #[tokio::test]
    async fn test_congratulation_goes_to_group() {
        let channel = Arc::new(RecordingChannel::default());
        dispatcher(&channel)
            .send_congratulation(-100, "Anna K", Some(34))
            .await
            .unwrap();
        assert_eq!(channel.sent_to(), vec![-100]);
        assert!(channel.texts()[0].contains("<b>Anna K</b> on turning 34"));
    }

    #[test]
    fn test_texts() {
        let reminder = reminder_text("Anna K", "15.05.1990");
        assert!(reminder.contains("Tomorrow, 15.05.1990"));
        assert!(reminder.contains("<b>Anna K</b>"));

        let no_age = congratulation_text("Gleb", None);
        assert!(no_age.contains("<b>Gleb</b> on their birthday"));

        let odd = congratulation_text("<Gleb>", Some(30));
        assert!(odd.contains("<b>&lt;Gleb&gt;</b> on turning 30"));
    }
}
