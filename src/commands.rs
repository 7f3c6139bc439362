use std::sync::Arc;

use anyhow::Result;

use crate::bus::{ChatKind, InboundMessage, OutboundMessage, escape_html};
use crate::clock::Clock;
use crate::dates::{DateEntryError, parse_entry};
use crate::session::{EntryEvent, EntrySessions, EntryState};
use crate::store::{BirthdayStore, GroupId};
use crate::tags::TagDirectory;

/// Registered with the messaging service so clients can autocomplete them.
pub const BOT_COMMANDS: &[(&str, &str)] = &[
    ("start", "Start the bot"),
    ("set_birthday", "Set your birthday"),
    ("my_birthday", "Show your birthday"),
    ("birthdays", "List birthdays in this group"),
    ("forget_birthday", "Remove your birthday"),
    ("groups", "Show tag groups"),
    ("tags", "Show available tags"),
    ("help", "Help"),
    ("cancel", "Cancel the current action"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    SetBirthday,
    Cancel,
    MyBirthday,
    Birthdays,
    ForgetBirthday,
    Groups,
    Tags,
}

impl Command {
    /// Parse the leading `/command` (optionally `/command@BotName`) of a
    /// message. `None` for plain text and unknown commands.
    pub fn parse(text: &str) -> Option<Self> {
        let word = text.split_whitespace().next()?.strip_prefix('/')?;
        let name = word.split_once('@').map_or(word, |(name, _)| name);
        let command = match name.to_lowercase().as_str() {
            "start" => Self::Start,
            "help" => Self::Help,
            "set_birthday" => Self::SetBirthday,
            "cancel" => Self::Cancel,
            "my_birthday" => Self::MyBirthday,
            "birthdays" => Self::Birthdays,
            "forget_birthday" => Self::ForgetBirthday,
            "groups" => Self::Groups,
            "tags" => Self::Tags,
            _ => return None,
        };
        Some(command)
    }
}

const HELP_TEXT: &str = "📋 <b>Commands:</b>\n\n\
    /set_birthday - set your birthday (in a group)\n\
    /my_birthday - show your birthday\n\
    /birthdays - list birthdays in this group\n\
    /forget_birthday - remove your birthday from this group\n\
    /groups - show tag groups\n\
    /tags - show available tags\n\
    /cancel - cancel the current action\n\
    /help - this help\n\n\
    🤖 <b>Automatic notifications:</b>\n\
    • The day before a birthday every other member gets a private reminder\n\
    • On the day itself the group gets a congratulation\n\n\
    ⚠️ Private reminders only reach members who have started a chat with me.";

const DATE_FORMATS: &str = "• DD.MM.YYYY (e.g. 15.05.1990)\n\
    • DD.MM.YY (e.g. 15.05.90)\n\
    • DD.MM (e.g. 15.05)";

/// Turns one inbound message into zero or more replies.
pub struct CommandHandler {
    store: Arc<dyn BirthdayStore>,
    sessions: EntrySessions,
    tags: TagDirectory,
    clock: Arc<dyn Clock>,
}

impl CommandHandler {
    pub fn new(store: Arc<dyn BirthdayStore>, tags: TagDirectory, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            sessions: EntrySessions::new(),
            tags,
            clock,
        }
    }

    pub fn handle(&self, msg: &InboundMessage) -> Result<Vec<OutboundMessage>> {
        let text = msg.text.trim();
        tracing::debug!("[{}] {}: {text}", msg.chat_id, msg.sender.id);

        if let Some(command) = Command::parse(text) {
            return self.run(command, msg);
        }
        if text.starts_with('/') {
            return Ok(vec![]);
        }
        if msg.chat_kind == ChatKind::Group
            && self.sessions.state(msg.sender.id, msg.chat_id) == Some(EntryState::AwaitingDate)
        {
            return Ok(vec![self.enter_date(msg)]);
        }
        Ok(self
            .tags
            .mentions_in(text)
            .map(|mentions| reply(msg, mentions).replying_to(msg.message_id))
            .into_iter()
            .collect())
    }

    fn run(&self, command: Command, msg: &InboundMessage) -> Result<Vec<OutboundMessage>> {
        let in_group = msg.chat_kind == ChatKind::Group;
        let (subject, group) = (msg.sender.id, msg.chat_id);

        let text = match command {
            Command::Start if in_group => "👋 Hi everyone! I keep track of birthdays in this group.\n\n\
                 Everyone can save theirs with /set_birthday.\n\
                 Send /help for the full list of commands."
                .to_string(),
            Command::Start => format!(
                "👋 Hi, {}!\n\n\
                 I remind group members about each other's birthdays.\n\
                 Add me to a group and use /set_birthday there.\n\n\
                 Keep this chat open: this is where your reminders arrive.",
                escape_html(&msg.sender.first_name)
            ),
            Command::Help => HELP_TEXT.to_string(),
            Command::SetBirthday if !in_group => {
                "❌ This command only works in group chats.".to_string()
            }
            Command::SetBirthday => {
                self.sessions.apply(subject, group, EntryEvent::Start);
                format!(
                    "📅 {}, send me your birth date in one of these formats:\n\n\
                     {DATE_FORMATS}\n\n\
                     Send /cancel to stop.",
                    escape_html(&msg.sender.first_name)
                )
            }
            Command::Cancel => match self.sessions.apply(subject, group, EntryEvent::Cancel) {
                Some(_) => "❌ Birthday entry cancelled.".to_string(),
                None => "Nothing to cancel.".to_string(),
            },
            Command::MyBirthday => match self.store.get(subject, group)? {
                Some(record) => format!("🎂 Your birthday: {}", record.date),
                None => "❌ You haven't set your birthday here yet.\n\
                         Use /set_birthday in the group."
                    .to_string(),
            },
            Command::Birthdays if !in_group => {
                "❌ This command only works in group chats.".to_string()
            }
            Command::Birthdays => self.birthday_list(group)?,
            Command::ForgetBirthday if !in_group => {
                "❌ This command only works in group chats.".to_string()
            }
            Command::ForgetBirthday => {
                if self.store.remove(subject, group)? {
                    "🗑️ Your birthday has been removed from this group.".to_string()
                } else {
                    "You have no birthday saved in this group.".to_string()
                }
            }
            Command::Groups => self.tags.groups_text(),
            Command::Tags => self.tags.tags_text(),
        };
        Ok(vec![reply(msg, text).replying_to(msg.message_id)])
    }

    fn enter_date(&self, msg: &InboundMessage) -> OutboundMessage {
        let (subject, group) = (msg.sender.id, msg.chat_id);
        let today = self.clock.now().date();
        self.sessions.apply(subject, group, EntryEvent::Submit);

        let text = match parse_entry(&msg.text, today) {
            Ok(date) => match self.store.upsert(subject, group, date, &msg.sender.display_name()) {
                Ok(()) => {
                    self.sessions.apply(subject, group, EntryEvent::Accept);
                    format!(
                        "✅ Saved! {}, your birthday is {date}.\n\n\
                         The group will be reminded the day before.",
                        escape_html(&msg.sender.first_name)
                    )
                }
                Err(e) => {
                    tracing::error!("Saving birthday of {subject} in {group} failed: {e:#}");
                    self.sessions.apply(subject, group, EntryEvent::Cancel);
                    "❌ Could not save your birthday. Please try /set_birthday again later."
                        .to_string()
                }
            },
            Err(e @ DateEntryError::InFuture(_)) => {
                tracing::debug!("Rejected date from {subject}: {e}");
                self.sessions.apply(subject, group, EntryEvent::Reject);
                "❌ A birth date can't be in the future. Try again or send /cancel.".to_string()
            }
            Err(e @ DateEntryError::NoFormatMatched(_)) => {
                tracing::debug!("Rejected date from {subject}: {e}");
                self.sessions.apply(subject, group, EntryEvent::Reject);
                format!(
                    "❌ I couldn't read that date. Use one of:\n\n{DATE_FORMATS}\n\n\
                     Try again or send /cancel."
                )
            }
        };
        reply(msg, text).replying_to(msg.message_id)
    }

    fn birthday_list(&self, group: GroupId) -> Result<String> {
        let records = self.store.list_by_group(group)?;
        if records.is_empty() {
            return Ok("📅 No birthdays saved in this group yet.\n\
                       Use /set_birthday to add yours."
                .to_string());
        }
        let mut text = String::from("🎂 <b>Birthdays in this group:</b>\n\n");
        for (i, record) in records.iter().enumerate() {
            let name = escape_html(&record.name.listing());
            text.push_str(&format!("{}. {name}: {}\n", i + 1, record.date));
        }
        text.push_str(&format!("\n📊 Total: {}", records.len()));
        Ok(text)
    }
}

fn reply(msg: &InboundMessage, text: impl Into<String>) -> OutboundMessage {
    OutboundMessage::to(msg.chat_id, text)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::bus::Sender;
    use crate::clock::fixed::FixedClock;
    use crate::dates::{BirthDate, MonthDay};
    use crate::store::{BirthdayRecord, Database, DisplayName, SubjectId};

    const GROUP: i64 = -100;

    struct Harness {
        db: Arc<Database>,
        handler: CommandHandler,
    }

    fn harness() -> Harness {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let tags = TagDirectory::new(BTreeMap::from([(
            "team".to_string(),
            vec!["alice".to_string(), "bob".to_string()],
        )]));
        let handler = CommandHandler::new(db.clone(), tags, Arc::new(FixedClock::at(2024, 6, 1, 12, 0)));
        Harness { db, handler }
    }

    fn message(chat_id: i64, sender: SubjectId, text: &str) -> InboundMessage {
        InboundMessage {
            chat_id,
            chat_kind: if chat_id < 0 {
                ChatKind::Group
            } else {
                ChatKind::Private
            },
            sender: Sender {
                id: sender,
                username: "anna_k".into(),
                first_name: "Anna".into(),
                last_name: String::new(),
            },
            message_id: Some(42),
            text: text.into(),
        }
    }

    fn say(h: &Harness, chat_id: i64, sender: SubjectId, text: &str) -> Vec<OutboundMessage> {
        h.handler.handle(&message(chat_id, sender, text)).unwrap()
    }

    fn only_text(replies: Vec<OutboundMessage>) -> String {
        assert_eq!(replies.len(), 1, "expected one reply, got {replies:?}");
        replies.into_iter().next().unwrap().text
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(Command::parse("/start"), Some(Command::Start));
        assert_eq!(Command::parse("/set_birthday@HeraldBot"), Some(Command::SetBirthday));
        assert_eq!(Command::parse("/BIRTHDAYS extra words"), Some(Command::Birthdays));
        assert_eq!(Command::parse("/unknown"), None);
        assert_eq!(Command::parse("start"), None);
        assert_eq!(Command::parse(""), None);
    }

    #[test]
    fn test_bot_commands_all_parse() {
        for (name, _) in BOT_COMMANDS {
            assert!(Command::parse(&format!("/{name}")).is_some(), "{name}");
        }
    }

    #[test]
    fn test_set_birthday_conversation() {
        let h = harness();
        let prompt = only_text(say(&h, GROUP, 1, "/set_birthday"));
        assert!(prompt.contains("DD.MM.YYYY"));

        let retry = only_text(say(&h, GROUP, 1, "someday"));
        assert!(retry.contains("couldn't read that date"));

        let future = only_text(say(&h, GROUP, 1, "15.07.2024"));
        assert!(future.contains("can't be in the future"));

        let saved = only_text(say(&h, GROUP, 1, "15/05/1990"));
        assert!(saved.contains("15.05.1990"));

        let record = h.db.get(1, GROUP).unwrap().unwrap();
        assert_eq!(record.date, BirthDate::new(Some(1990), 5, 15).unwrap());
        assert_eq!(record.name.username, "anna_k");

        // session is closed: further text is ignored
        assert!(say(&h, GROUP, 1, "16.05.1990").is_empty());
    }

    #[test]
    fn test_session_is_per_member() {
        let h = harness();
        say(&h, GROUP, 1, "/set_birthday");
        assert!(say(&h, GROUP, 2, "15.05.1990").is_empty());
        assert!(h.db.get(2, GROUP).unwrap().is_none());
    }

    #[test]
    fn test_set_birthday_refused_in_private() {
        let h = harness();
        let text = only_text(say(&h, 1, 1, "/set_birthday"));
        assert!(text.contains("only works in group chats"));
        assert!(say(&h, 1, 1, "15.05.1990").is_empty());
    }

    #[test]
    fn test_cancel() {
        let h = harness();
        assert_eq!(only_text(say(&h, GROUP, 1, "/cancel")), "Nothing to cancel.");

        say(&h, GROUP, 1, "/set_birthday");
        assert!(only_text(say(&h, GROUP, 1, "/cancel")).contains("cancelled"));
        assert!(say(&h, GROUP, 1, "15.05.1990").is_empty());
        assert!(h.db.get(1, GROUP).unwrap().is_none());
    }

    #[test]
    fn test_my_birthday_and_forget() {
        let h = harness();
        assert!(only_text(say(&h, GROUP, 1, "/my_birthday")).contains("haven't set"));

        h.db
            .upsert(1, GROUP, BirthDate::new(None, 3, 8).unwrap(), &DisplayName::default())
            .unwrap();
        assert_eq!(only_text(say(&h, GROUP, 1, "/my_birthday")), "🎂 Your birthday: 08.03");

        assert!(only_text(say(&h, GROUP, 1, "/forget_birthday")).contains("removed"));
        assert!(only_text(say(&h, GROUP, 1, "/forget_birthday")).contains("no birthday saved"));
        assert!(h.db.get(1, GROUP).unwrap().is_none());
    }

    #[test]
    fn test_birthday_list_sorted_with_total() {
        let h = harness();
        let named = |first: &str, last: &str, username: &str| DisplayName {
            username: username.into(),
            first_name: first.into(),
            last_name: last.into(),
        };
        h.db
            .upsert(1, GROUP, BirthDate::new(Some(1990), 5, 15).unwrap(), &named("Anna", "K", "anna_k"))
            .unwrap();
        h.db
            .upsert(2, GROUP, BirthDate::new(Some(1985), 12, 3).unwrap(), &named("Boris", "", "boris"))
            .unwrap();
        h.db
            .upsert(3, GROUP, BirthDate::new(Some(2000), 1, 25).unwrap(), &named("Vera", "", ""))
            .unwrap();
        h.db
            .upsert(4, -200, BirthDate::new(Some(1970), 2, 2).unwrap(), &named("Other", "", ""))
            .unwrap();

        let text = only_text(say(&h, GROUP, 1, "/birthdays"));
        assert!(text.contains(
            "1. Vera: 25.01.2000\n2. Anna K: 15.05.1990\n3. Boris (@boris): 03.12.1985\n"
        ));
        assert!(text.ends_with("Total: 3"));
        assert!(!text.contains("Other"));
    }

    #[test]
    fn test_birthday_list_empty_and_private() {
        let h = harness();
        assert!(only_text(say(&h, GROUP, 1, "/birthdays")).contains("No birthdays saved"));
        assert!(only_text(say(&h, 1, 1, "/birthdays")).contains("only works in group chats"));
    }

    #[test]
    fn test_tag_mentions_are_threaded() {
        let h = harness();
        let replies = say(&h, GROUP, 1, "@Team practice moved to 7pm");
        assert_eq!(
            replies,
            vec![OutboundMessage::to(GROUP, "@alice @bob").replying_to(Some(42))]
        );
        assert!(say(&h, GROUP, 1, "just chatting").is_empty());
        assert!(say(&h, GROUP, 1, "/unknown @team").is_empty());
    }

    #[test]
    fn test_start_differs_by_chat_kind() {
        let h = harness();
        assert!(only_text(say(&h, 1, 1, "/start")).contains("Hi, Anna!"));
        assert!(only_text(say(&h, GROUP, 1, "/start")).contains("Hi everyone!"));
        assert!(only_text(say(&h, GROUP, 1, "/help@HeraldBot")).contains("/set_birthday"));
    }

    struct ReadOnlyStore;

    impl BirthdayStore for ReadOnlyStore {
        fn upsert(&self, _: SubjectId, _: GroupId, _: BirthDate, _: &DisplayName) -> Result<()> {
            anyhow::bail!("attempt to write a readonly database")
        }
        fn get(&self, _: SubjectId, _: GroupId) -> Result<Option<BirthdayRecord>> {
            Ok(None)
        }
        fn list_by_group(&self, _: GroupId) -> Result<Vec<BirthdayRecord>> {
            Ok(vec![])
        }
        fn list_subjects_by_group(&self, _: GroupId) -> Result<Vec<SubjectId>> {
            Ok(vec![])
        }
        fn match_month_day(&self, _: MonthDay) -> Result<Vec<BirthdayRecord>> {
            Ok(vec![])
        }
        fn remove(&self, _: SubjectId, _: GroupId) -> Result<bool> {
            Ok(false)
        }
    }

    #[test]
    fn test_storage_failure_closes_session() {
        let handler = CommandHandler::new(
            Arc::new(ReadOnlyStore),
            TagDirectory::new(BTreeMap::new()),
            Arc::new(FixedClock::at(2024, 6, 1, 12, 0)),
        );
        handler.handle(&message(GROUP, 1, "/set_birthday")).unwrap();
        let replies = handler.handle(&message(GROUP, 1, "15.05.1990")).unwrap();
        assert!(replies[0].text.contains("Could not save"));
        assert!(handler.handle(&message(GROUP, 1, "15.05.1990")).unwrap().is_empty());
    }
}
