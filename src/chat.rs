use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, PoisonError};

use crate::llm::Message;

/// How many messages (user and assistant combined) are kept per user.
pub const HISTORY_CAPACITY: usize = 10;

#[derive(Debug, Default)]
struct ConversationHistory {
    messages: VecDeque<Message>,
}

impl ConversationHistory {
    fn push(&mut self, message: Message) {
        self.messages.push_back(message);
        while self.messages.len() > HISTORY_CAPACITY {
            self.messages.pop_front();
        }
    }
}

/// Per-user chat memory shared by the text chat command and the voice
/// assistant. Histories are independent across users and bounded, so an
/// old exchange falls out once the cap is reached.
pub struct ChatStore {
    system_prompt: String,
    histories: Mutex<HashMap<u64, ConversationHistory>>,
}

impl ChatStore {
    pub fn new(system_prompt: String) -> Self {
        Self {
            system_prompt,
            histories: Mutex::new(HashMap::new()),
        }
    }

    /// The message list to send to the model: system prompt first, then the
    /// user's recorded history. The caller pushes the new user turn before
    /// calling this.
    pub fn messages_for(&self, user_id: u64) -> Vec<Message> {
        let histories = self.lock();
        let mut messages = vec![Message::system(&self.system_prompt)];
        if let Some(history) = histories.get(&user_id) {
            messages.extend(history.messages.iter().cloned());
        }
        messages
    }

    pub fn push_user(&self, user_id: u64, content: &str) {
        self.lock()
            .entry(user_id)
            .or_default()
            .push(Message::user(content));
    }

    pub fn push_assistant(&self, user_id: u64, content: &str) {
        self.lock()
            .entry(user_id)
            .or_default()
            .push(Message::assistant(content));
    }

    /// Forgets a user's history. Returns `false` when there was nothing to
    /// forget.
    pub fn clear_user(&self, user_id: u64) -> bool {
        self.lock().remove(&user_id).is_some()
    }

    pub fn history_len(&self, user_id: u64) -> usize {
        self.lock()
            .get(&user_id)
            .map_or(0, |history| history.messages.len())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u64, ConversationHistory>> {
        self.histories.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histories_are_independent_per_user() {
        let store = ChatStore::new("be brief".to_string());
        store.push_user(1, "hello from one");
        store.push_assistant(1, "hi one");
        store.push_user(2, "hello from two");

        assert_eq!(store.history_len(1), 2);
        assert_eq!(store.history_len(2), 1);

        let first = store.messages_for(1);
        assert_eq!(first[0].role, "system");
        assert_eq!(first[0].content, "be brief");
        assert_eq!(first[1].content, "hello from one");
        assert_eq!(first[2].content, "hi one");

        let second = store.messages_for(2);
        assert_eq!(second.len(), 2);
        assert_eq!(second[1].content, "hello from two");
    }

    #[test]
    fn history_is_bounded_and_drops_the_oldest() {
        let store = ChatStore::new(String::new());
        for i in 0..HISTORY_CAPACITY + 4 {
            store.push_user(7, &format!("message {i}"));
        }

        assert_eq!(store.history_len(7), HISTORY_CAPACITY);
        let messages = store.messages_for(7);
        // index 0 is the system prompt
        assert_eq!(messages[1].content, "message 4");
        assert_eq!(messages.last().map(|m| m.content.as_str()), Some("message 13"));
    }

    #[test]
    fn clearing_reports_whether_anything_existed() {
        let store = ChatStore::new(String::new());
        assert!(!store.clear_user(9));
        store.push_user(9, "hello");
        assert!(store.clear_user(9));
        assert_eq!(store.history_len(9), 0);
    }
}
