//! In-memory conversation cache shared by the synchronizer and the push listener.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use shared::domain::{Conversation, ConversationId, Message, MessageId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Appended,
    /// Held until the conversation's history is seeded.
    Buffered,
    Duplicate,
}

#[derive(Debug, Default)]
struct History {
    seeded: bool,
    messages: Vec<Message>,
    ids: HashSet<MessageId>,
}

impl History {
    fn push(&mut self, message: Message) -> bool {
        if !self.ids.insert(message.id.clone()) {
            return false;
        }
        self.messages.push(message);
        true
    }
}

#[derive(Debug, Default)]
pub struct ConversationStore {
    conversations: Vec<Conversation>,
    histories: HashMap<ConversationId, History>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the list. Messages buffered for conversations the list does not
    /// contain are dropped; seeded histories are kept.
    pub fn set_conversations(&mut self, conversations: Vec<Conversation>) {
        let known: HashSet<&ConversationId> = conversations.iter().map(|c| &c.id).collect();
        self.histories
            .retain(|id, history| history.seeded || known.contains(id));
        self.conversations = conversations;
        self.sort();
    }

    /// Insert or replace one conversation (e.g. the result of opening a chat).
    pub fn upsert_conversation(&mut self, conversation: Conversation) {
        match self
            .conversations
            .iter_mut()
            .find(|existing| existing.id == conversation.id)
        {
            Some(existing) => *existing = conversation,
            None => self.conversations.push(conversation),
        }
        self.sort();
    }

    /// Seed history the first time a conversation is opened.
    ///
    /// Returns false on a cache hit. Messages appended before seeding are kept
    /// after the fetched batch unless the batch already contains them.
    pub fn set_history(&mut self, conversation_id: &ConversationId, messages: Vec<Message>) -> bool {
        let history = self.histories.entry(conversation_id.clone()).or_default();
        if history.seeded {
            return false;
        }

        let early = std::mem::take(&mut history.messages);
        history.ids.clear();
        history.seeded = true;
        for message in messages.into_iter().chain(early) {
            history.push(message);
        }
        true
    }

    /// Add `message` unless its id is already cached for the conversation.
    pub fn append_message(
        &mut self,
        conversation_id: &ConversationId,
        message: Message,
    ) -> AppendOutcome {
        let history = self.histories.entry(conversation_id.clone()).or_default();
        if !history.push(message) {
            return AppendOutcome::Duplicate;
        }
        if history.seeded {
            AppendOutcome::Appended
        } else {
            AppendOutcome::Buffered
        }
    }

    /// Record activity on a conversation and restore recency order.
    ///
    /// Activity never moves backwards, so an older echo cannot demote a
    /// conversation. Returns false for unknown conversations.
    pub fn touch_conversation(
        &mut self,
        conversation_id: &ConversationId,
        last_message_text: &str,
        at: DateTime<Utc>,
    ) -> bool {
        let Some(conversation) = self
            .conversations
            .iter_mut()
            .find(|c| &c.id == conversation_id)
        else {
            return false;
        };
        if at >= conversation.last_activity_at {
            conversation.last_activity_at = at;
            conversation.last_message_text = last_message_text.to_string();
        }
        self.sort();
        true
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn conversation(&self, conversation_id: &ConversationId) -> Option<&Conversation> {
        self.conversations.iter().find(|c| &c.id == conversation_id)
    }

    pub fn contains(&self, conversation_id: &ConversationId) -> bool {
        self.conversation(conversation_id).is_some()
    }

    pub fn has_history(&self, conversation_id: &ConversationId) -> bool {
        self.histories
            .get(conversation_id)
            .is_some_and(|history| history.seeded)
    }

    /// Seeded messages in arrival order; empty until history is seeded.
    pub fn messages(&self, conversation_id: &ConversationId) -> &[Message] {
        match self.histories.get(conversation_id) {
            Some(history) if history.seeded => &history.messages,
            _ => &[],
        }
    }

    pub fn clear(&mut self) {
        self.conversations.clear();
        self.histories.clear();
    }

    fn sort(&mut self) {
        self.conversations
            .sort_by(|a, b| b.last_activity_at.cmp(&a.last_activity_at));
    }
}

#[cfg(test)]
#[path = "tests/store_tests.rs"]
mod tests;
