use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{
    deserialize_roles, Conversation, ConversationId, Identity, ItemId, Message, MessageId,
    Participant, UserId,
};

/// A reference to another document: either its bare id or the embedded document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DocRef {
    Id(String),
    Embedded {
        #[serde(rename = "_id")]
        id: String,
    },
}

impl DocRef {
    pub fn embedded(id: impl Into<String>) -> Self {
        Self::Embedded { id: id.into() }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Id(id) => id,
            Self::Embedded { id } => id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPayload {
    #[serde(rename = "_id", alias = "id")]
    pub id: UserId,
    #[serde(default)]
    pub email: String,
    #[serde(default, alias = "displayName")]
    pub name: String,
    #[serde(default, alias = "role", deserialize_with = "deserialize_roles")]
    pub roles: Vec<String>,
}

impl From<UserPayload> for Identity {
    fn from(value: UserPayload) -> Self {
        Self {
            id: value.id,
            email: value.email,
            display_name: value.name,
            roles: value.roles,
        }
    }
}

impl From<&Identity> for UserPayload {
    fn from(value: &Identity) -> Self {
        Self {
            id: value.id.clone(),
            email: value.email.clone(),
            name: value.display_name.clone(),
            roles: value.roles.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub access_token: String,
    pub refresh_token: String,
    pub user: UserPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefreshRequest {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub access_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenChatRequest {
    pub user_id: UserId,
    pub item_id: ItemId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub chat_id: ConversationId,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParticipantPayload {
    #[serde(rename = "_id", alias = "id")]
    pub id: UserId,
    #[serde(default, alias = "displayName")]
    pub name: String,
    #[serde(default, alias = "avatarUrl")]
    pub avatar: Option<String>,
}

/// `latestMessage` is populated by the backend on listings and left as an id elsewhere.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LatestMessageRef {
    Embedded {
        #[serde(default)]
        content: String,
    },
    Id(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationPayload {
    #[serde(rename = "_id", alias = "id")]
    pub id: ConversationId,
    #[serde(default, alias = "users")]
    pub participants: Vec<ParticipantPayload>,
    #[serde(default)]
    pub item: Option<DocRef>,
    #[serde(default, rename = "latestMessage")]
    pub latest_message: Option<LatestMessageRef>,
    #[serde(rename = "updatedAt", alias = "lastActivityAt")]
    pub updated_at: DateTime<Utc>,
}

impl From<ConversationPayload> for Conversation {
    fn from(value: ConversationPayload) -> Self {
        let last_message_text = match value.latest_message {
            Some(LatestMessageRef::Embedded { content }) => content,
            _ => String::new(),
        };
        Self {
            id: value.id,
            participants: value
                .participants
                .into_iter()
                .map(|p| Participant {
                    id: p.id,
                    display_name: p.name,
                    avatar_ref: p.avatar,
                })
                .collect(),
            item_id: value.item.map(|item| ItemId::new(item.id())),
            last_message_text,
            last_activity_at: value.updated_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessagePayload {
    #[serde(rename = "_id", alias = "id")]
    pub id: MessageId,
    pub chat: DocRef,
    pub sender: DocRef,
    pub content: String,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
}

impl From<MessagePayload> for Message {
    fn from(value: MessagePayload) -> Self {
        Self {
            id: value.id,
            conversation_id: ConversationId::new(value.chat.id()),
            sender_id: UserId::new(value.sender.id()),
            text: value.content,
            created_at: value.created_at,
        }
    }
}

impl From<&Message> for MessagePayload {
    fn from(value: &Message) -> Self {
        Self {
            id: value.id.clone(),
            chat: DocRef::embedded(value.conversation_id.as_str()),
            sender: DocRef::Id(value.sender_id.0.clone()),
            content: value.text.clone(),
            created_at: value.created_at,
        }
    }
}

/// Frames the client writes to the realtime socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientFrame {
    #[serde(rename = "setup")]
    Setup(UserPayload),
    #[serde(rename = "join chat")]
    JoinChat(ConversationId),
    #[serde(rename = "new message")]
    NewMessage(MessagePayload),
}

/// Frames the backend pushes over the realtime socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerFrame {
    #[serde(rename = "connected")]
    Connected,
    #[serde(rename = "message received")]
    MessageReceived(MessagePayload),
    #[serde(rename = "new message")]
    NewMessage(MessagePayload),
}

impl ServerFrame {
    pub fn into_message(self) -> Option<MessagePayload> {
        match self {
            Self::MessageReceived(message) | Self::NewMessage(message) => Some(message),
            Self::Connected => None,
        }
    }
}

#[cfg(test)]
#[path = "tests/protocol_tests.rs"]
mod tests;
