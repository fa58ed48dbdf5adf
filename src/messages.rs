//! # Wire Protocol Messages
//!
//! Every overlay frame carries one [`Envelope`]: a per-request nonce plus a body
//! from the closed [`OverlayMessage`] enum. The frame type byte is the body's
//! [`WireMessage::message_type`] tag.
//!
//! | Family | Request | Response |
//! |--------|---------|----------|
//! | Handshake | `Handshake` | `HandshakeAck` |
//! | Sync | `Hello`, `ReqDelta`, `ReqKey` | `Hello`, `PushDelta`, `KeyResult` |
//! | Proof-of-possession | `ChunkRequest` | `ChunkResponse` |
//! | Search | `MeshSearchRequest` | `MeshSearchResponse` |
//! | Gossip | `Gossip` | `GossipAck` |
//! | DHT | `Dht(DhtRequest)` | `DhtResponse(..)` |
//!
//! Any request may instead be answered with `Error`.
//!
//! All decoding goes through [`deserialize_bounded`].

use bincode::Options;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::descriptor::PeerDescriptor;
use crate::frame::WireMessage;
use crate::gossip::GossipMessage;
use crate::identity::PeerId;
use crate::search::MediaKind;
use crate::sync::MeshHashEntry;

/// Upper bound for any single decoded message.
pub const MAX_DESERIALIZE_SIZE: u64 = crate::frame::DEFAULT_MAX_FRAME_LEN as u64;

/// Descriptors returned by one `FindNode`/`FindValue` reply are truncated to this.
pub const MAX_NODES_PER_REPLY: usize = 32;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// 128 random bits, hex. Fresh for every request envelope.
pub fn new_nonce() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub nonce: String,
    pub body: OverlayMessage,
}

impl Envelope {
    pub fn new(body: OverlayMessage) -> Self {
        Self {
            nonce: new_nonce(),
            body,
        }
    }

    /// Replies echo the request nonce; they are never replay-checked.
    pub fn reply_to(request_nonce: &str, body: OverlayMessage) -> Self {
        Self {
            nonce: request_nonce.to_string(),
            body,
        }
    }
}

impl WireMessage for Envelope {
    fn message_type(&self) -> u8 {
        self.body.message_type()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum OverlayMessage {
    Handshake(HandshakeRequest),
    HandshakeAck(HandshakeAck),
    Hello(Hello),
    ReqDelta(ReqDelta),
    PushDelta(PushDelta),
    ReqKey(ReqKey),
    KeyResult(KeyResult),
    ChunkRequest(ChunkRequest),
    ChunkResponse(ChunkResponse),
    MeshSearchRequest(MeshSearchRequest),
    MeshSearchResponse(MeshSearchResponse),
    Gossip(GossipMessage),
    GossipAck,
    Dht(DhtRequest),
    DhtResponse(DhtResponse),
    Error(ErrorReply),
}

impl OverlayMessage {
    pub fn message_type(&self) -> u8 {
        match self {
            OverlayMessage::Handshake(_) => 0x01,
            OverlayMessage::HandshakeAck(_) => 0x02,
            OverlayMessage::Hello(_) => 0x10,
            OverlayMessage::ReqDelta(_) => 0x11,
            OverlayMessage::PushDelta(_) => 0x12,
            OverlayMessage::ReqKey(_) => 0x13,
            OverlayMessage::KeyResult(_) => 0x14,
            OverlayMessage::ChunkRequest(_) => 0x15,
            OverlayMessage::ChunkResponse(_) => 0x16,
            OverlayMessage::MeshSearchRequest(_) => 0x20,
            OverlayMessage::MeshSearchResponse(_) => 0x21,
            OverlayMessage::Gossip(_) => 0x30,
            OverlayMessage::GossipAck => 0x31,
            OverlayMessage::Dht(_) => 0x40,
            OverlayMessage::DhtResponse(_) => 0x41,
            OverlayMessage::Error(_) => 0xFF,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            OverlayMessage::Handshake(_) => "handshake",
            OverlayMessage::HandshakeAck(_) => "handshake-ack",
            OverlayMessage::Hello(_) => "hello",
            OverlayMessage::ReqDelta(_) => "req-delta",
            OverlayMessage::PushDelta(_) => "push-delta",
            OverlayMessage::ReqKey(_) => "req-key",
            OverlayMessage::KeyResult(_) => "key-result",
            OverlayMessage::ChunkRequest(_) => "chunk-request",
            OverlayMessage::ChunkResponse(_) => "chunk-response",
            OverlayMessage::MeshSearchRequest(_) => "search-request",
            OverlayMessage::MeshSearchResponse(_) => "search-response",
            OverlayMessage::Gossip(_) => "gossip",
            OverlayMessage::GossipAck => "gossip-ack",
            OverlayMessage::Dht(_) => "dht",
            OverlayMessage::DhtResponse(_) => "dht-response",
            OverlayMessage::Error(_) => "error",
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        OverlayMessage::Error(ErrorReply {
            message: message.into(),
        })
    }
}

// ============================================================================
// Handshake
// ============================================================================

/// Sent by the initiator on the first stream of a connection.
///
/// The signature covers the claimed peer id, the responder's certificate
/// fingerprint and a timestamp, so it only verifies on the channel it was made for.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    pub peer_id: PeerId,
    pub public_key: [u8; 32],
    pub timestamp: u64,
    pub descriptor: Option<PeerDescriptor>,
    pub signature: Vec<u8>,
}

impl HandshakeRequest {
    pub fn signed_payload(peer_id: &PeerId, responder_fingerprint: &str, timestamp: u64) -> Vec<u8> {
        let fp = responder_fingerprint.as_bytes();
        let mut data = Vec::with_capacity(32 + 4 + fp.len() + 8);
        data.extend_from_slice(peer_id.as_bytes());
        data.extend_from_slice(&(fp.len() as u32).to_be_bytes());
        data.extend_from_slice(fp);
        data.extend_from_slice(&timestamp.to_be_bytes());
        data
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HandshakeAck {
    pub peer_id: PeerId,
    pub accepted: bool,
    pub reason: Option<String>,
    pub descriptor: Option<PeerDescriptor>,
}

// ============================================================================
// Sync
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub peer_id: PeerId,
    pub latest_sequence: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqDelta {
    pub since_seq: u64,
    pub max_entries: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushDelta {
    pub entries: Vec<MeshHashEntry>,
    /// Responder's latest sequence at the time of the reply.
    pub latest_sequence: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReqKey {
    pub key: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyResult {
    pub entry: Option<MeshHashEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRequest {
    pub key: String,
    pub offset: u64,
    pub length: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkResponse {
    /// `None` when the responder does not hold the content.
    pub data: Option<Vec<u8>>,
}

// ============================================================================
// Search
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshSearchRequest {
    pub request_id: String,
    pub search_text: String,
    pub max_results: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshSearchFile {
    pub filename: String,
    pub size: u64,
    pub media_kind: MediaKind,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeshSearchResponse {
    pub request_id: String,
    pub files: Vec<MeshSearchFile>,
    pub error: Option<String>,
}

impl MeshSearchResponse {
    pub fn rejected(request_id: &str, error: impl Into<String>) -> Self {
        Self {
            request_id: request_id.to_string(),
            files: Vec::new(),
            error: Some(error.into()),
        }
    }
}

// ============================================================================
// DHT
// ============================================================================

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DhtRequest {
    Ping,
    FindNode { target: PeerId },
    FindValue { peer_id: PeerId },
    Store { descriptor: PeerDescriptor },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum DhtResponse {
    Pong { peer_id: PeerId },
    Nodes(Vec<PeerDescriptor>),
    Value {
        descriptor: Option<PeerDescriptor>,
        closer: Vec<PeerDescriptor>,
    },
    Stored { accepted: bool },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReply {
    pub message: String,
}
