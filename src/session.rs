use std::collections::HashMap;
use std::sync::Mutex;

use crate::store::{GroupId, SubjectId};

/// Progress of one member typing their birth date in one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    AwaitingDate,
    Validating,
    Committed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryEvent {
    /// `/set_birthday`; restarts an open session.
    Start,
    /// A line of text arrived while awaiting a date.
    Submit,
    /// The text was not an acceptable date.
    Reject,
    /// The date was stored.
    Accept,
    Cancel,
}

impl EntryState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Committed | Self::Cancelled)
    }

    /// `None` when the event makes no sense in the current state.
    pub fn next(current: Option<Self>, event: EntryEvent) -> Option<Self> {
        use EntryEvent::*;
        use EntryState::*;
        match (current, event) {
            (_, Start) => Some(AwaitingDate),
            (Some(AwaitingDate), Submit) => Some(Validating),
            (Some(Validating), Reject) => Some(AwaitingDate),
            (Some(Validating), Accept) => Some(Committed),
            (Some(AwaitingDate | Validating), Cancel) => Some(Cancelled),
            _ => None,
        }
    }
}

/// Open date-entry sessions keyed by (subject, group). Terminal states are
/// reported to the caller and then forgotten.
#[derive(Default)]
pub struct EntrySessions {
    sessions: Mutex<HashMap<(SubjectId, GroupId), EntryState>>,
}

impl EntrySessions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, subject: SubjectId, group: GroupId) -> Option<EntryState> {
        self.sessions
            .lock()
            .expect("session lock poisoned")
            .get(&(subject, group))
            .copied()
    }

    /// Apply `event`, returning the new state, or `None` (and no change)
    /// when the transition is not allowed.
    pub fn apply(&self, subject: SubjectId, group: GroupId, event: EntryEvent) -> Option<EntryState> {
        let mut sessions = self.sessions.lock().expect("session lock poisoned");
        let key = (subject, group);
        let next = EntryState::next(sessions.get(&key).copied(), event)?;
        if next.is_terminal() {
            sessions.remove(&key);
        } else {
            sessions.insert(key, next);
        }
        tracing::debug!("Date entry {subject}@{group}: {event:?} -> {next:?}");
        Some(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use EntryEvent::*;
        use EntryState::*;

        assert_eq!(EntryState::next(None, Start), Some(AwaitingDate));
        assert_eq!(EntryState::next(Some(Validating), Start), Some(AwaitingDate));
        assert_eq!(EntryState::next(Some(AwaitingDate), Submit), Some(Validating));
        assert_eq!(EntryState::next(Some(Validating), Reject), Some(AwaitingDate));
        assert_eq!(EntryState::next(Some(Validating), Accept), Some(Committed));
        assert_eq!(EntryState::next(Some(AwaitingDate), Cancel), Some(Cancelled));

        assert_eq!(EntryState::next(None, Submit), None);
        assert_eq!(EntryState::next(None, Cancel), None);
        assert_eq!(EntryState::next(Some(AwaitingDate), Accept), None);
        assert_eq!(EntryState::next(Some(AwaitingDate), Reject), None);
    }

    #[test]
    fn test_sessions_forget_terminal_states() {
        let sessions = EntrySessions::new();
        assert_eq!(sessions.state(1, -100), None);

        assert_eq!(sessions.apply(1, -100, EntryEvent::Start), Some(EntryState::AwaitingDate));
        assert_eq!(sessions.apply(1, -100, EntryEvent::Submit), Some(EntryState::Validating));
        assert_eq!(sessions.apply(1, -100, EntryEvent::Accept), Some(EntryState::Committed));
        assert_eq!(sessions.state(1, -100), None);

        assert_eq!(sessions.apply(1, -100, EntryEvent::Cancel), None);
    }

    #[test]
    fn test_sessions_are_per_subject_and_group() {
        let sessions = EntrySessions::new();
        sessions.apply(1, -100, EntryEvent::Start);

        assert_eq!(sessions.state(1, -100), Some(EntryState::AwaitingDate));
        assert_eq!(sessions.state(1, -200), None);
        assert_eq!(sessions.state(2, -100), None);

        assert_eq!(sessions.apply(1, -100, EntryEvent::Cancel), Some(EntryState::Cancelled));
        assert_eq!(sessions.state(1, -100), None);
    }
}
