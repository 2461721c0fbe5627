use std::collections::HashSet;
use crate::models::chat::Message;

/// Visible message list for one conversation, deduplicated on server-assigned id.
///
/// Messages without an id are always kept; only id-carrying messages are checked against
/// what has been seen.
#[derive(Debug, Default, Clone)]
pub struct History {
    messages: Vec<Message>,
    seen: HashSet<String>,
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole list with the server's authoritative copy.
    pub fn replace(&mut self, messages: Vec<Message>) {
        self.seen = messages
            .iter()
            .filter_map(|message| message.id.clone())
            .collect();
        self.messages = messages;
    }

    /// Appends `message` unless its id is already present. Returns whether it was appended.
    pub fn merge(&mut self, message: Message) -> bool {
        if let Some(id) = &message.id {
            if !self.seen.insert(id.clone()) {
                return false;
            }
        }
        self.messages.push(message);
        true
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(id: Option<&str>, text: &str) -> Message {
        Message {
            id: id.map(str::to_string),
            room: None,
            sender: "alice".to_string(),
            text: text.to_string(),
            created_at: None,
        }
    }

    #[test]
    fn merge_skips_known_ids() {
        let mut history = History::new();
        assert!(history.merge(message(Some("1"), "hi")));
        assert!(!history.merge(message(Some("1"), "hi again")));
        assert_eq!(history.messages().len(), 1);
        assert_eq!(history.messages()[0].text, "hi");
    }

    #[test]
    fn messages_without_id_are_never_deduplicated() {
        let mut history = History::new();
        assert!(history.merge(message(None, "same")));
        assert!(history.merge(message(None, "same")));
        assert_eq!(history.messages().len(), 2);
    }

    #[test]
    fn replace_resets_seen_ids() {
        let mut history = History::new();
        history.merge(message(Some("1"), "old"));
        history.merge(message(None, "local"));

        history.replace(vec![message(Some("2"), "new")]);
        assert_eq!(history.messages().len(), 1);

        assert!(history.merge(message(Some("1"), "old")));
        assert!(!history.merge(message(Some("2"), "new")));
    }
}
