use serde::{Deserialize, Serialize};

use crate::error::TrafficSimError;
use crate::probe::AgentId;

/// Upper bound for a single datagram. Messages are a few hundred bytes.
pub const MAX_DATAGRAM: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    Hello,
    Ack,
    Data,
}

/// Millisecond wall-clock timestamps plus the packet sequence. HELLO and its
/// ACK carry no sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WireData {
    #[serde(default)]
    pub sent: i64,
    #[serde(default)]
    pub received: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u32>,
}

/// One UDP datagram: a JSON object `{type, data, src, dst}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub data: WireData,
    pub src: AgentId,
    pub dst: AgentId,
}

impl WireMessage {
    #[must_use]
    pub fn hello(src: &AgentId, dst: &AgentId, sent_ms: i64) -> Self {
        Self {
            kind: MessageKind::Hello,
            data: WireData {
                sent: sent_ms,
                ..WireData::default()
            },
            src: src.clone(),
            dst: dst.clone(),
        }
    }

    #[must_use]
    pub fn data(src: &AgentId, dst: &AgentId, seq: u32, sent_ms: i64) -> Self {
        Self {
            kind: MessageKind::Data,
            data: WireData {
                sent: sent_ms,
                received: 0,
                seq: Some(seq),
            },
            src: src.clone(),
            dst: dst.clone(),
        }
    }

    #[must_use]
    pub fn hello_ack(src: &AgentId, dst: &AgentId, now_ms: i64) -> Self {
        Self {
            kind: MessageKind::Ack,
            data: WireData {
                sent: now_ms,
                ..WireData::default()
            },
            src: src.clone(),
            dst: dst.clone(),
        }
    }

    /// Echoes the original send time and sequence of `request`.
    #[must_use]
    pub fn data_ack(src: &AgentId, dst: &AgentId, request: &WireData, now_ms: i64) -> Self {
        Self {
            kind: MessageKind::Ack,
            data: WireData {
                sent: request.sent,
                received: now_ms,
                seq: request.seq,
            },
            src: src.clone(),
            dst: dst.clone(),
        }
    }

    /// # Errors
    ///
    /// Returns an error when the message cannot be serialized.
    pub fn encode(&self) -> Result<Vec<u8>, TrafficSimError> {
        serde_json::to_vec(self).map_err(|source| TrafficSimError::Serialize {
            context: "wire message",
            source,
        })
    }

    /// # Errors
    ///
    /// Returns an error when `bytes` is not a valid message.
    pub fn decode(bytes: &[u8]) -> Result<Self, TrafficSimError> {
        serde_json::from_slice(bytes).map_err(|source| TrafficSimError::Decode { source })
    }
}

#[must_use]
pub fn wall_clock_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
