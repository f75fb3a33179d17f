//! Wire codec for receipt transport.
//!
//! Length-prefixed frames with a type byte:
//!
//! ```text
//! [u32 LE length] [u8 type] [payload: length-1 bytes]
//! ```
//!
//! Frame types:
//! - `0x01` `Receipt`  — JSON-encoded [`Receipt`], used point-to-point
//!   between an [`crate::transport::client::AsyncClient`] and a directly
//!   addressed worker, or between a façade client and the broker frontend.
//! - `0x02` `Register` — JSON `{identity}`, sent once by a worker dialing
//!   into the broker's backend to announce its service name.
//! - `0x03` `Routed`   — JSON-encoded [`RoutedReceipt`], used between the
//!   broker and a worker connected through its backend; carries the
//!   client identity the broker must echo the reply back to.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::receipt::Receipt;

/// Maximum frame payload size (16 MB).
const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Frame type byte constants.
pub mod frame_type {
    /// JSON-encoded [`super::Receipt`], point-to-point.
    pub const RECEIPT: u8 = 0x01;
    /// Worker registration announcing a service identity.
    pub const REGISTER: u8 = 0x02;
    /// JSON-encoded [`super::RoutedReceipt`], broker \<-\> worker.
    pub const ROUTED: u8 = 0x03;
}

/// A receipt tagged with the client identity the broker must route the
/// reply back to. Only used on the broker-backend leg of the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutedReceipt {
    /// Opaque identity assigned by the broker to the originating client
    /// connection (identity-preserving routing, spec §4.1).
    pub identity: String,
    /// The receipt itself.
    pub receipt: Receipt,
}

/// A decoded frame from the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A plain, unaddressed receipt.
    Receipt(Receipt),
    /// A worker announcing its service identity.
    Register {
        /// Service name, e.g. `device_backend`.
        identity: String,
    },
    /// A receipt tagged with its originating client identity.
    Routed(RoutedReceipt),
}

impl Frame {
    /// Encodes this frame into a wire-format byte vector.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Receipt(receipt) => {
                let payload = serde_json::to_vec(receipt).expect("receipt serialization cannot fail");
                encode_raw(frame_type::RECEIPT, &payload)
            }
            Frame::Register { identity } => {
                let payload = serde_json::to_vec(&serde_json::json!({ "identity": identity }))
                    .expect("identity serialization cannot fail");
                encode_raw(frame_type::REGISTER, &payload)
            }
            Frame::Routed(routed) => {
                let payload = serde_json::to_vec(routed).expect("routed receipt serialization cannot fail");
                encode_raw(frame_type::ROUTED, &payload)
            }
        }
    }
}

fn encode_raw(frame_type: u8, payload: &[u8]) -> Vec<u8> {
    let length = (payload.len() + 1) as u32;
    let mut buf = Vec::with_capacity(4 + 1 + payload.len());
    buf.extend_from_slice(&length.to_le_bytes());
    buf.push(frame_type);
    buf.extend_from_slice(payload);
    buf
}

fn decode_frame(frame_type: u8, payload: &[u8]) -> Result<Frame> {
    match frame_type {
        frame_type::RECEIPT => {
            let receipt: Receipt = serde_json::from_slice(payload)?;
            Ok(Frame::Receipt(receipt))
        }
        frame_type::REGISTER => {
            let value: serde_json::Value = serde_json::from_slice(payload)?;
            let identity = value
                .get("identity")
                .and_then(|v| v.as_str())
                .ok_or_else(|| anyhow::anyhow!("Register frame missing identity"))?
                .to_string();
            Ok(Frame::Register { identity })
        }
        frame_type::ROUTED => {
            let routed: RoutedReceipt = serde_json::from_slice(payload)?;
            Ok(Frame::Routed(routed))
        }
        _ => bail!("Unknown frame type: 0x{frame_type:02x}"),
    }
}

/// Incremental frame decoder — feed bytes as they arrive off the socket,
/// get back zero or more complete frames. Handles TCP-style partial reads.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Creates a decoder with an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds bytes into the decoder and extracts all complete frames.
    ///
    /// # Errors
    ///
    /// Returns an error if a frame is malformed or exceeds the size limit.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<Frame>> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();

        loop {
            if self.buf.len() < 4 {
                break;
            }
            let length = u32::from_le_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
            if length == 0 {
                bail!("Invalid frame: zero length");
            }
            if length > MAX_FRAME_SIZE {
                bail!("Frame too large: {length} bytes (max {MAX_FRAME_SIZE})");
            }

            let total = 4 + length as usize;
            if self.buf.len() < total {
                break;
            }

            let frame_type = self.buf[4];
            let payload = &self.buf[5..total];
            frames.push(decode_frame(frame_type, payload)?);
            self.buf.drain(..total);
        }

        Ok(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receipt_round_trip() {
        let receipt = Receipt::new("a", "b", "status", serde_json::json!({}));
        let frame = Frame::Receipt(receipt.clone());
        let encoded = frame.encode();
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&encoded).unwrap();
        assert_eq!(frames, vec![Frame::Receipt(receipt)]);
    }

    #[test]
    fn routed_receipt_round_trip() {
        let routed = RoutedReceipt {
            identity: "client:42".into(),
            receipt: Receipt::new("a", "devback", "down", serde_json::json!({})),
        };
        let frame = Frame::Routed(routed.clone());
        let encoded = frame.encode();
        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&encoded).unwrap();
        assert_eq!(frames, vec![Frame::Routed(routed)]);
    }

    #[test]
    fn partial_reads_are_buffered() {
        let receipt = Receipt::new("a", "b", "status", serde_json::json!({}));
        let encoded = Frame::Receipt(receipt.clone()).encode();
        let mut decoder = FrameDecoder::new();
        let (head, tail) = encoded.split_at(encoded.len() / 2);

        assert!(decoder.feed(head).unwrap().is_empty());
        let frames = decoder.feed(tail).unwrap();
        assert_eq!(frames, vec![Frame::Receipt(receipt)]);
    }

    #[test]
    fn two_frames_in_one_feed() {
        let a = Receipt::new("a", "b", "status", serde_json::json!({}));
        let b = Receipt::new("c", "d", "params", serde_json::json!({}));
        let mut combined = Frame::Receipt(a.clone()).encode();
        combined.extend(Frame::Receipt(b.clone()).encode());

        let mut decoder = FrameDecoder::new();
        let frames = decoder.feed(&combined).unwrap();
        assert_eq!(frames, vec![Frame::Receipt(a), Frame::Receipt(b)]);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&(MAX_FRAME_SIZE + 1).to_le_bytes());
        buf.push(frame_type::RECEIPT);
        let mut decoder = FrameDecoder::new();
        assert!(decoder.feed(&buf).is_err());
    }
}
