use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use crate::Message;

use super::credentials::redact_key;

/// Which conversation a call belongs to.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SessionId {
    /// The single first-party caller.
    Local,
    Key(String),
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionId::Local => f.write_str("local"),
            SessionId::Key(key) => write!(f, "key:{}", redact_key(key)),
        }
    }
}

/// One bounded conversation.
///
/// `turn` serializes whole exchanges on the session: it is held from the user append until
/// the reply (or the rollback) lands, so rollback always sees its own user turn at the tail.
/// `history` guards the entries themselves and is only ever held briefly. An exchange keeps
/// working on its slot even if the store evicts it meanwhile.
pub(crate) struct SessionSlot {
    pub(crate) turn: tokio::sync::Mutex<()>,
    history: Mutex<VecDeque<Message>>,
}

impl SessionSlot {
    fn new() -> Self {
        Self {
            turn: tokio::sync::Mutex::new(()),
            history: Mutex::new(VecDeque::new()),
        }
    }

    fn history(&self) -> std::sync::MutexGuard<'_, VecDeque<Message>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push(&self, message: Message, cap: usize) {
        let mut history = self.history();
        history.push_back(message);
        while history.len() > cap {
            history.pop_front();
        }
    }

    pub(crate) fn entries(&self) -> Vec<Message> {
        self.history().iter().cloned().collect()
    }

    pub(crate) fn pop_user(&self) -> bool {
        let mut history = self.history();
        if history.back().is_some_and(Message::is_user) {
            history.pop_back();
            return true;
        }
        false
    }
}

pub struct SessionStore {
    max_history: usize,
    local: Arc<SessionSlot>,
    keyed: Mutex<HashMap<String, Arc<SessionSlot>>>,
}

impl SessionStore {
    pub fn new(max_history: usize) -> Self {
        Self {
            max_history: max_history.max(1),
            local: Arc::new(SessionSlot::new()),
            keyed: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    /// Returns the slot for `id`, creating a keyed one on first use.
    pub(crate) fn slot(&self, id: &SessionId) -> Arc<SessionSlot> {
        match id {
            SessionId::Local => Arc::clone(&self.local),
            SessionId::Key(key) => {
                let mut keyed = self.keyed.lock().unwrap_or_else(PoisonError::into_inner);
                Arc::clone(
                    keyed
                        .entry(key.clone())
                        .or_insert_with(|| Arc::new(SessionSlot::new())),
                )
            }
        }
    }

    fn existing(&self, id: &SessionId) -> Option<Arc<SessionSlot>> {
        match id {
            SessionId::Local => Some(Arc::clone(&self.local)),
            SessionId::Key(key) => self
                .keyed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(key)
                .cloned(),
        }
    }

    pub fn append(&self, id: &SessionId, message: Message) {
        self.slot(id).push(message, self.max_history);
    }

    /// Owned copy of the session, oldest first. An unknown session is empty.
    pub fn snapshot(&self, id: &SessionId) -> Vec<Message> {
        match self.existing(id) {
            Some(slot) => slot.entries(),
            None => Vec::new(),
        }
    }

    /// Removes the tail entry when it is a user turn. Returns whether one was removed.
    pub fn rollback_last_if_user(&self, id: &SessionId) -> bool {
        self.existing(id).is_some_and(|slot| slot.pop_user())
    }

    /// Drops a keyed session outright; the local session is cleared instead.
    pub fn evict(&self, id: &SessionId) -> bool {
        match id {
            SessionId::Local => {
                let mut history = self.local.history();
                let had_entries = !history.is_empty();
                history.clear();
                had_entries
            }
            SessionId::Key(key) => self
                .keyed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(key)
                .is_some(),
        }
    }

    /// Drops every keyed session and clears the local one.
    pub fn evict_all(&self) -> usize {
        let removed = {
            let mut keyed = self.keyed.lock().unwrap_or_else(PoisonError::into_inner);
            let removed = keyed.len();
            keyed.clear();
            removed
        };
        self.local.history().clear();
        removed
    }

    /// Keeps only the most recent `keep_last` entries.
    pub fn truncate(&self, id: &SessionId, keep_last: usize) -> usize {
        let Some(slot) = self.existing(id) else {
            return 0;
        };
        let mut history = slot.history();
        let excess = history.len().saturating_sub(keep_last);
        history.drain(..excess);
        excess
    }

    pub fn len(&self, id: &SessionId) -> usize {
        self.existing(id).map_or(0, |slot| slot.history().len())
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        match id {
            SessionId::Local => true,
            SessionId::Key(key) => self
                .keyed
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .contains_key(key),
        }
    }

    pub fn keyed_ids(&self) -> Vec<String> {
        self.keyed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Role;

    fn key(name: &str) -> SessionId {
        SessionId::Key(name.to_string())
    }

    #[test]
    fn cap_keeps_most_recent_entries_in_order() {
        let store = SessionStore::new(4);
        let id = key("k");
        for i in 0..7 {
            store.append(&id, Message::user(format!("m{i}")));
        }
        let contents: Vec<String> = store.snapshot(&id).into_iter().map(|m| m.content).collect();
        assert_eq!(contents, vec!["m3", "m4", "m5", "m6"]);
    }

    #[test]
    fn rollback_only_removes_a_trailing_user_turn() {
        let store = SessionStore::new(10);
        let id = key("k");
        store.append(&id, Message::user("hi"));
        store.append(&id, Message::assistant("hello"));
        assert!(!store.rollback_last_if_user(&id));
        assert_eq!(store.len(&id), 2);

        store.append(&id, Message::user("again"));
        assert!(store.rollback_last_if_user(&id));
        assert_eq!(store.snapshot(&id).last().map(|m| m.role), Some(Role::Assistant));
    }

    #[test]
    fn snapshot_is_detached_from_later_appends() {
        let store = SessionStore::new(10);
        let id = key("k");
        store.append(&id, Message::user("one"));
        let snapshot = store.snapshot(&id);
        store.append(&id, Message::assistant("two"));
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn evicting_local_clears_it_but_keeps_it_addressable() {
        let store = SessionStore::new(10);
        store.append(&SessionId::Local, Message::user("x"));
        store.append(&key("a"), Message::user("y"));

        assert!(store.evict(&SessionId::Local));
        assert!(store.contains(&SessionId::Local));
        assert_eq!(store.len(&SessionId::Local), 0);

        assert_eq!(store.evict_all(), 1);
        assert!(!store.contains(&key("a")));
    }

    #[test]
    fn truncate_keeps_the_tail() {
        let store = SessionStore::new(20);
        for i in 0..8 {
            store.append(&SessionId::Local, Message::user(format!("m{i}")));
        }
        assert_eq!(store.truncate(&SessionId::Local, 5), 3);
        assert_eq!(store.snapshot(&SessionId::Local)[0].content, "m3");
        assert_eq!(store.truncate(&key("missing"), 5), 0);
    }
}
