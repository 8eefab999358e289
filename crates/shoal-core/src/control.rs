//! Control protocol catalog: between a local client and its core.
//!
//! Same framing as the peer protocol, different type identifiers. The core
//! stamps its own identity in the header `sender_id`, which is how a client
//! learns it.

use serde::{Deserialize, Serialize};

use crate::wire::{decode_json, encode_json, PeerId, WireError, WireMessage};

/// Type identifiers of the control catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ControlMessageType {
    State = 0x01,
    EventChatMessage = 0x11,
    CoreSettings = 0x21,
    Browse = 0x41,
    Tag = 0x42,
    BrowseResult = 0x43,
    ChatMessage = 0x81,
}

impl TryFrom<u32> for ControlMessageType {
    type Error = WireError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::State),
            0x11 => Ok(Self::EventChatMessage),
            0x21 => Ok(Self::CoreSettings),
            0x41 => Ok(Self::Browse),
            0x42 => Ok(Self::Tag),
            0x43 => Ok(Self::BrowseResult),
            0x81 => Ok(Self::ChatMessage),
            other => Err(WireError::UnknownMessageType(other)),
        }
    }
}

/// A peer as reported in a state snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerState {
    pub peer_id: PeerId,
    pub addr: String,
    /// Last observed download speed from this peer, bytes/s.
    pub speed: u64,
}

/// Periodic snapshot pushed by the core.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct State {
    pub peers: Vec<PeerState>,
    pub stored_chunks: u64,
    pub stored_bytes: u64,
    pub active_uploads: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventChatMessage {
    pub peer_id: PeerId,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreSettings {
    pub nick: String,
    pub shared_dirs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Browse {
    pub peer_id: PeerId,
    /// Directory to list. `None` lists the peer's roots.
    #[serde(default)]
    pub dir: Option<String>,
}

/// Tag the core assigns to the oldest browse request still waiting for one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub tag: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub name: String,
    pub size: u64,
    pub is_dir: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BrowseResult {
    pub tag: u64,
    pub entries: Vec<Entry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub message: String,
}

/// Every message of the control catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    State(State),
    EventChatMessage(EventChatMessage),
    CoreSettings(CoreSettings),
    Browse(Browse),
    Tag(Tag),
    BrowseResult(BrowseResult),
    ChatMessage(ChatMessage),
}

impl ControlMessage {
    /// True for messages a core sends, false for messages a client sends.
    pub fn is_from_core(&self) -> bool {
        matches!(
            self,
            ControlMessage::State(_)
                | ControlMessage::EventChatMessage(_)
                | ControlMessage::Tag(_)
                | ControlMessage::BrowseResult(_)
        )
    }

    pub fn kind(&self) -> ControlMessageType {
        match self {
            ControlMessage::State(_) => ControlMessageType::State,
            ControlMessage::EventChatMessage(_) => ControlMessageType::EventChatMessage,
            ControlMessage::CoreSettings(_) => ControlMessageType::CoreSettings,
            ControlMessage::Browse(_) => ControlMessageType::Browse,
            ControlMessage::Tag(_) => ControlMessageType::Tag,
            ControlMessage::BrowseResult(_) => ControlMessageType::BrowseResult,
            ControlMessage::ChatMessage(_) => ControlMessageType::ChatMessage,
        }
    }
}

impl WireMessage for ControlMessage {
    fn msg_type(&self) -> u32 {
        self.kind() as u32
    }

    fn encode_payload(&self) -> Result<Vec<u8>, WireError> {
        match self {
            ControlMessage::State(m) => encode_json(m),
            ControlMessage::EventChatMessage(m) => encode_json(m),
            ControlMessage::CoreSettings(m) => encode_json(m),
            ControlMessage::Browse(m) => encode_json(m),
            ControlMessage::Tag(m) => encode_json(m),
            ControlMessage::BrowseResult(m) => encode_json(m),
            ControlMessage::ChatMessage(m) => encode_json(m),
        }
    }

    fn decode(msg_type: u32, payload: &[u8]) -> Result<Self, WireError> {
        let message = match ControlMessageType::try_from(msg_type)? {
            ControlMessageType::State => ControlMessage::State(decode_json(msg_type, payload)?),
            ControlMessageType::EventChatMessage => {
                ControlMessage::EventChatMessage(decode_json(msg_type, payload)?)
            }
            ControlMessageType::CoreSettings => {
                ControlMessage::CoreSettings(decode_json(msg_type, payload)?)
            }
            ControlMessageType::Browse => ControlMessage::Browse(decode_json(msg_type, payload)?),
            ControlMessageType::Tag => ControlMessage::Tag(decode_json(msg_type, payload)?),
            ControlMessageType::BrowseResult => {
                ControlMessage::BrowseResult(decode_json(msg_type, payload)?)
            }
            ControlMessageType::ChatMessage => {
                ControlMessage::ChatMessage(decode_json(msg_type, payload)?)
            }
        };
        Ok(message)
    }
}
