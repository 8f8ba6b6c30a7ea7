//! JSON envelope exchanged with live clients.
//!
//! Wire format (one text frame):
//! ```text
//! {"data": [ {"type": 3, "data": {"text": "hi"}}, ... ]}
//! ```
//!
//! `type` selects how `data` is interpreted:
//!
//! | type | meaning                 | direction        |
//! |------|-------------------------|------------------|
//! | 0    | all proposals           | server → client  |
//! | 1    | chat history            | server → client  |
//! | 2    | add a proposal          | both             |
//! | 3    | add a chat message      | both             |
//! | 4    | update a proposal       | server → client  |

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    AllProposals = 0,
    ChatHistory = 1,
    AddProposal = 2,
    AddChat = 3,
    UpdateProposal = 4,
}

impl TryFrom<u8> for MessageKind {
    type Error = u8;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(MessageKind::AllProposals),
            1 => Ok(MessageKind::ChatHistory),
            2 => Ok(MessageKind::AddProposal),
            3 => Ok(MessageKind::AddChat),
            4 => Ok(MessageKind::UpdateProposal),
            other => Err(other),
        }
    }
}

/// A chat line. `authorid` and `time` are stamped by the server.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    #[serde(rename = "authorid", default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
    pub text: String,
    /// Unix timestamp in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<i64>,
}

impl ChatMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            author_id: None,
            text: text.into(),
            time: None,
        }
    }
}

/// One typed message inside a frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: u8,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Message {
    pub fn new<T: Serialize>(kind: MessageKind, data: &T) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: kind as u8,
            data: serde_json::to_value(data)?,
        })
    }

    /// Decode the type code; unknown codes are returned as-is.
    pub fn kind(&self) -> Result<MessageKind, u8> {
        MessageKind::try_from(self.kind)
    }

    pub fn decode_data<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.data)
    }
}

/// A frame: several messages delivered together.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct WsData {
    #[serde(default)]
    pub data: Vec<Message>,
}

impl WsData {
    pub fn single(message: Message) -> Self {
        Self {
            data: vec![message],
        }
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

/// A frame received from subscriber `id`.
#[derive(Debug, Clone, PartialEq)]
pub struct WsEvent {
    pub id: Uuid,
    pub data: WsData,
}
