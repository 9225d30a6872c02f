//! Binary wire format for pixel updates.
//!
//! Every update is a fixed 5-byte record: `x` (u16 LE), `y` (u16 LE), `color` (u8).
//! There is no header or length prefix; one encoded buffer is one transport message.
//! Coordinates are sector-local, the sector is implied by the channel carrying the message.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::addressing::{Color, LocalCoord, ValidationError};

pub const RECORD_LEN: usize = 5;

/// Default cap on updates per encoded message.
pub const DEFAULT_MAX_BATCH: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireUpdate {
    pub x: u16,
    pub y: u16,
    pub color: Color,
}

impl WireUpdate {
    pub const fn new(x: u16, y: u16, color: Color) -> Self {
        Self { x, y, color }
    }

    pub fn from_local(local: LocalCoord, color: Color) -> Self {
        Self {
            x: local.x(),
            y: local.y(),
            color,
        }
    }

    /// Resolve the wire coordinate to a sector-local position, rejecting anything past the grid.
    pub fn local(&self) -> Result<LocalCoord, ValidationError> {
        LocalCoord::new(self.x as u32, self.y as u32)
    }

    pub const fn packed_key(&self) -> u32 {
        ((self.x as u32) << 16) | self.y as u32
    }
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed text payload: {0}")]
    Json(#[from] serde_json::Error),
    #[error("empty payload")]
    Empty,
}

/// Serialize updates back-to-back into one buffer.
pub fn encode(updates: &[WireUpdate]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(updates.len() * RECORD_LEN);
    for update in updates {
        buf.extend_from_slice(&update.x.to_le_bytes());
        buf.extend_from_slice(&update.y.to_le_bytes());
        buf.push(update.color);
    }
    buf
}

/// Split updates into messages of at most `max_batch` records each.
pub fn encode_batches(updates: &[WireUpdate], max_batch: usize) -> Vec<Vec<u8>> {
    updates.chunks(max_batch.max(1)).map(encode).collect()
}

/// Decode every complete record. A trailing partial record is dropped, never an error.
pub fn decode(buf: &[u8]) -> Vec<WireUpdate> {
    buf.chunks_exact(RECORD_LEN)
        .map(|record| WireUpdate {
            x: u16::from_le_bytes([record[0], record[1]]),
            y: u16::from_le_bytes([record[2], record[3]]),
            color: record[4],
        })
        .collect()
}

/// Legacy text message for transports that cannot carry binary frames.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum TextMessage {
    #[serde(rename = "pixel_update")]
    PixelUpdate {
        x: u16,
        y: u16,
        color: Color,
        #[serde(
            default,
            rename = "userId",
            skip_serializing_if = "Option::is_none"
        )]
        user_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timestamp: Option<i64>,
    },
}

/// A raw frame as delivered by the realtime transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Binary(Vec<u8>),
    Text(String),
}

/// One decoded inbound update with whatever provenance the message carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundUpdate {
    pub update: WireUpdate,
    pub user_id: Option<String>,
    pub timestamp: Option<i64>,
}

impl From<WireUpdate> for InboundUpdate {
    fn from(update: WireUpdate) -> Self {
        Self {
            update,
            user_id: None,
            timestamp: None,
        }
    }
}

pub fn decode_message(message: &InboundMessage) -> Result<Vec<InboundUpdate>, DecodeError> {
    match message {
        InboundMessage::Binary(buf) => Ok(decode(buf).into_iter().map(Into::into).collect()),
        InboundMessage::Text(text) => {
            if text.trim().is_empty() {
                return Err(DecodeError::Empty);
            }
            let TextMessage::PixelUpdate {
                x,
                y,
                color,
                user_id,
                timestamp,
            } = serde_json::from_str::<TextMessage>(text)?;
            Ok(vec![InboundUpdate {
                update: WireUpdate { x, y, color },
                user_id,
                timestamp,
            }])
        }
    }
}
