//! Ordered, id-keyed message store for a single thread.

use std::collections::HashMap;

use crate::model::{AgentState, Message, MessageId, MessagePatch};

/// Result of a single store mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreChange {
    Inserted { index: usize },
    Merged,
    Unchanged,
}

impl StoreChange {
    #[must_use]
    pub fn is_change(self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

/// Messages in display order with an id index.
///
/// Order is the sequence number when a message carries one, otherwise arrival order.
#[derive(Debug, Default, Clone)]
pub struct MessageStore {
    messages: Vec<Message>,
    index: HashMap<MessageId, usize>,
}

impl MessageStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    #[must_use]
    pub fn contains(&self, id: &MessageId) -> bool {
        self.index.contains_key(id)
    }

    #[must_use]
    pub fn get(&self, id: &MessageId) -> Option<&Message> {
        self.index
            .get(id)
            .and_then(|position| self.messages.get(*position))
    }

    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    /// True when the last message asks the user for input.
    #[must_use]
    pub fn awaiting_input(&self) -> bool {
        self.messages
            .last()
            .is_some_and(|message| message.agent_state == Some(AgentState::AwaitInput))
    }

    /// Insert a full message. Duplicate ids are a no-op.
    pub fn insert(&mut self, message: Message) -> StoreChange {
        if self.index.contains_key(&message.id) {
            return StoreChange::Unchanged;
        }

        let position = message
            .sequence_number
            .and_then(|sequence| {
                self.messages.iter().position(|existing| {
                    existing
                        .sequence_number
                        .is_some_and(|existing_sequence| existing_sequence > sequence)
                })
            })
            .unwrap_or(self.messages.len());

        self.messages.insert(position, message);
        self.reindex_from(position);
        StoreChange::Inserted { index: position }
    }

    /// Merge a patch into an existing message. Returns `None` when the id is unknown.
    pub fn merge(&mut self, id: &MessageId, patch: &MessagePatch) -> Option<StoreChange> {
        let position = *self.index.get(id)?;
        let message = self.messages.get_mut(position)?;
        let sequence_before = message.sequence_number;
        if !message.merge(patch) {
            return Some(StoreChange::Unchanged);
        }
        if message.sequence_number != sequence_before {
            self.resort();
        }
        Some(StoreChange::Merged)
    }

    /// Replace the contents wholesale. Snapshot order is kept; duplicate ids keep the first row.
    pub fn replace(&mut self, messages: Vec<Message>) {
        self.messages.clear();
        self.index.clear();
        for message in messages {
            if self.index.contains_key(&message.id) {
                continue;
            }
            self.index.insert(message.id.clone(), self.messages.len());
            self.messages.push(message);
        }
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.index.clear();
    }

    fn resort(&mut self) {
        // Stable sort keeps arrival order among unsequenced rows.
        let mut sequenced: Vec<(usize, u64)> = self
            .messages
            .iter()
            .enumerate()
            .filter_map(|(position, message)| message.sequence_number.map(|seq| (position, seq)))
            .collect();
        sequenced.sort_by_key(|(_, sequence)| *sequence);

        let slots: Vec<usize> = {
            let mut slots: Vec<usize> = sequenced.iter().map(|(position, _)| *position).collect();
            slots.sort_unstable();
            slots
        };
        let mut reordered = self.messages.clone();
        for (slot, (source, _)) in slots.iter().zip(sequenced.iter()) {
            if let (Some(target), Some(message)) = (reordered.get_mut(*slot), self.messages.get(*source)) {
                *target = message.clone();
            }
        }
        self.messages = reordered;
        self.reindex_from(0);
    }

    fn reindex_from(&mut self, start: usize) {
        for (position, message) in self.messages.iter().enumerate().skip(start) {
            self.index.insert(message.id.clone(), position);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{MessageStore, StoreChange};
    use crate::model::{AgentState, Message, MessageId, MessagePatch, MessageRole};

    fn ids(store: &MessageStore) -> Vec<&str> {
        store.iter().map(|message| message.id.as_str()).collect()
    }

    #[test]
    fn duplicate_insert_is_a_no_op() {
        let mut store = MessageStore::new();
        let message = Message::new("1", MessageRole::User).with_text("hi");

        assert_eq!(store.insert(message.clone()), StoreChange::Inserted { index: 0 });
        assert_eq!(store.insert(message.with_text("changed")), StoreChange::Unchanged);
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.get(&MessageId::from("1")).and_then(Message::text),
            Some("hi")
        );
    }

    #[test]
    fn out_of_sequence_inserts_are_ordered_by_sequence_number() {
        let mut store = MessageStore::new();
        store.insert(Message::new("c", MessageRole::Assistant).with_sequence(3));
        store.insert(Message::new("a", MessageRole::User).with_sequence(1));
        store.insert(Message::new("b", MessageRole::Tool).with_sequence(2));

        assert_eq!(ids(&store), vec!["a", "b", "c"]);
    }

    #[test]
    fn unsequenced_messages_append_in_arrival_order() {
        let mut store = MessageStore::new();
        store.insert(Message::new("x", MessageRole::User));
        store.insert(Message::new("a", MessageRole::User).with_sequence(1));
        store.insert(Message::new("y", MessageRole::Assistant));

        assert_eq!(ids(&store), vec!["x", "a", "y"]);
    }

    #[test]
    fn merge_reports_unknown_ids_and_no_op_patches() {
        let mut store = MessageStore::new();
        store.insert(Message::new("1", MessageRole::Tool));

        let mut patch = MessagePatch::new("1");
        patch.tool_name = Some("search".to_string());

        assert_eq!(store.merge(&MessageId::from("2"), &patch), None);
        assert_eq!(store.merge(&MessageId::from("1"), &patch), Some(StoreChange::Merged));
        assert_eq!(store.merge(&MessageId::from("1"), &patch), Some(StoreChange::Unchanged));
    }

    #[test]
    fn merge_that_assigns_a_sequence_reorders_the_row() {
        let mut store = MessageStore::new();
        store.insert(Message::new("late", MessageRole::Assistant));
        store.insert(Message::new("a", MessageRole::User).with_sequence(1));
        store.insert(Message::new("b", MessageRole::User).with_sequence(5));

        let mut patch = MessagePatch::new("late");
        patch.sequence_number = Some(7);
        store.merge(&MessageId::from("late"), &patch);

        assert_eq!(ids(&store), vec!["a", "b", "late"]);
        assert_eq!(
            store.get(&MessageId::from("late")).and_then(|m| m.sequence_number),
            Some(7)
        );
    }

    #[test]
    fn replace_keeps_snapshot_order_and_drops_duplicate_rows() {
        let mut store = MessageStore::new();
        store.insert(Message::new("stale", MessageRole::User));

        store.replace(vec![
            Message::new("2", MessageRole::Assistant).with_sequence(2),
            Message::new("1", MessageRole::User).with_sequence(1),
            Message::new("2", MessageRole::Assistant).with_text("dup"),
        ]);

        assert_eq!(ids(&store), vec!["2", "1"]);
        assert!(!store.contains(&MessageId::from("stale")));
        assert_eq!(store.get(&MessageId::from("2")).and_then(Message::text), None);
    }

    #[test]
    fn awaiting_input_follows_the_last_message() {
        let mut store = MessageStore::new();
        let mut asking = Message::new("1", MessageRole::Assistant);
        asking.agent_state = Some(AgentState::AwaitInput);
        store.insert(asking);
        assert!(store.awaiting_input());

        store.insert(Message::new("2", MessageRole::User));
        assert!(!store.awaiting_input());

        store.clear();
        assert!(store.is_empty());
        assert!(!store.awaiting_input());
    }
}
