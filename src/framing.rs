//! Length-prefixed message framing for the bridge socket.
//!
//! Unix domain sockets are reliable, ordered byte streams with no message
//! boundaries, so every JSON-RPC message travels as one frame:
//!
//! ```text
//! [4 bytes: payload length (big-endian u32)] [payload: UTF-8 JSON]
//! ```
//!
//! No compression, no checksum; integrity is delegated to the socket.
//! Encoding lives in [`frame_message`]. Decoding is exclusively the job of
//! [`StreamReassembler`], which turns an arbitrarily fragmented byte stream
//! back into whole messages.

use bytes::{Buf, BytesMut};
use thiserror::Error;

use crate::protocol::Message;

/// Hard ceiling on a single frame's payload (50 MiB).
///
/// Guards against a corrupted length prefix turning into an unbounded
/// allocation. A prefix above this limit means the stream is desynchronized
/// and the connection should be closed.
pub const MAX_FRAME_SIZE: u32 = 50 * 1024 * 1024;

/// Framing-layer errors.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The length prefix exceeds [`MAX_FRAME_SIZE`]. Unrecoverable for the
    /// connection: the reassembler buffer has been reset and the caller
    /// should close and reconnect.
    #[error("frame of {size} bytes exceeds the {MAX_FRAME_SIZE} byte limit")]
    Oversized { size: u64 },

    /// The message could not be serialized.
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),

    /// A complete frame's payload was not valid JSON-RPC. Recoverable: the
    /// reassembler continues with the next frame.
    #[error("failed to decode frame payload: {0}")]
    Decode(#[source] serde_json::Error),
}

impl FrameError {
    /// True when the stream can no longer be trusted and the connection
    /// should be torn down.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FrameError::Oversized { .. })
    }
}

/// Encode one message as a length-prefixed frame.
///
/// Succeeds for any serializable [`Message`]; fails only if serialization
/// itself fails or the payload cannot fit a 32-bit length prefix.
pub fn frame_message(message: &Message) -> Result<Vec<u8>, FrameError> {
    let payload = serde_json::to_vec(message).map_err(FrameError::Encode)?;
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::Oversized {
        size: payload.len() as u64,
    })?;

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Reassembles complete messages from an unbounded, possibly-fragmented
/// byte stream.
///
/// Bytes accumulate in an internal buffer; [`feed`](Self::feed) drains every
/// complete frame currently buffered and leaves partial data for the next
/// call. A frame split byte-by-byte, several frames concatenated in a single
/// read, and a read ending mid-header are all handled; no message is ever
/// emitted until it is fully present.
#[derive(Debug, Default)]
pub struct StreamReassembler {
    buffer: BytesMut,
}

impl StreamReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append incoming bytes and drain complete frames, in receipt order.
    ///
    /// Each element is either a decoded message or a [`FrameError`]:
    /// a `Decode` error covers one malformed payload and processing
    /// continues with the remaining buffer, while an `Oversized` error
    /// resets the buffer and ends the drain (the stream is desynchronized).
    pub fn feed(&mut self, data: &[u8]) -> Vec<Result<Message, FrameError>> {
        self.buffer.extend_from_slice(data);

        let mut drained = Vec::new();
        while self.buffer.len() >= 4 {
            let len = u32::from_be_bytes([
                self.buffer[0],
                self.buffer[1],
                self.buffer[2],
                self.buffer[3],
            ]);

            if len > MAX_FRAME_SIZE {
                drained.push(Err(FrameError::Oversized { size: len as u64 }));
                self.buffer.clear();
                break;
            }

            let frame_end = 4 + len as usize;
            if self.buffer.len() < frame_end {
                // Message incomplete; wait for more data.
                break;
            }

            self.buffer.advance(4);
            let payload = self.buffer.split_to(len as usize);
            drained.push(serde_json::from_slice(&payload).map_err(FrameError::Decode));
        }
        drained
    }

    /// Discard any partially buffered frame (used after a size violation or
    /// on reconnect).
    pub fn reset(&mut self) {
        self.buffer.clear();
    }

    /// Bytes currently buffered awaiting a complete frame.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Notification, Request, RequestId};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn sample_message(marker: u64) -> Message {
        Message::Request(Request::new(
            RequestId::Number(marker),
            "editor/getText",
            Some(json!({"marker": marker})),
        ))
    }

    #[test]
    fn test_frame_layout() {
        let frame = frame_message(&sample_message(1)).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        assert_eq!(len as usize, frame.len() - 4);
        assert!(serde_json::from_slice::<Message>(&frame[4..]).is_ok());
    }

    #[test]
    fn test_roundtrip_whole_frame() {
        let message = sample_message(42);
        let frame = frame_message(&message).unwrap();

        let mut reassembler = StreamReassembler::new();
        let drained = reassembler.feed(&frame);
        assert_eq!(drained.len(), 1);
        assert_eq!(drained.into_iter().next().unwrap().unwrap(), message);
        assert_eq!(reassembler.buffered(), 0);
    }

    #[test]
    fn test_split_at_every_byte_boundary() {
        let message = sample_message(7);
        let frame = frame_message(&message).unwrap();

        for split in 0..=frame.len() {
            let mut reassembler = StreamReassembler::new();
            let mut drained = reassembler.feed(&frame[..split]);
            drained.extend(reassembler.feed(&frame[split..]));

            assert_eq!(drained.len(), 1, "split at {split}");
            assert_eq!(
                drained.into_iter().next().unwrap().unwrap(),
                message,
                "split at {split}"
            );
        }
    }

    #[test]
    fn test_byte_by_byte_delivery() {
        let message = sample_message(9);
        let frame = frame_message(&message).unwrap();

        let mut reassembler = StreamReassembler::new();
        let mut drained = Vec::new();
        for byte in &frame {
            drained.extend(reassembler.feed(std::slice::from_ref(byte)));
        }
        assert_eq!(drained.len(), 1);
        assert_eq!(drained.into_iter().next().unwrap().unwrap(), message);
    }

    #[test]
    fn test_two_frames_in_one_feed() {
        let first = sample_message(1);
        let second = Message::Notification(Notification::new("editor/onSave", None));

        let mut combined = frame_message(&first).unwrap();
        combined.extend(frame_message(&second).unwrap());

        let mut reassembler = StreamReassembler::new();
        let drained: Vec<Message> = reassembler
            .feed(&combined)
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(drained, vec![first, second]);
    }

    #[test]
    fn test_feed_ending_mid_header() {
        let mut reassembler = StreamReassembler::new();
        assert!(reassembler.feed(&[0, 0]).is_empty());
        assert_eq!(reassembler.buffered(), 2);
    }

    #[test]
    fn test_oversized_prefix_rejected_and_buffer_reset() {
        let mut prefix = (MAX_FRAME_SIZE + 1).to_be_bytes().to_vec();
        prefix.extend_from_slice(&[0u8; 64]); // partial payload

        let mut reassembler = StreamReassembler::new();
        let drained = reassembler.feed(&prefix);
        assert_eq!(drained.len(), 1);
        let err = drained.into_iter().next().unwrap().unwrap_err();
        assert!(matches!(err, FrameError::Oversized { .. }));
        assert!(err.is_fatal());
        assert_eq!(reassembler.buffered(), 0);
    }

    #[test]
    fn test_malformed_payload_does_not_poison_next_frame() {
        let garbage = b"this is not json";
        let mut stream = (garbage.len() as u32).to_be_bytes().to_vec();
        stream.extend_from_slice(garbage);
        let message = sample_message(3);
        stream.extend(frame_message(&message).unwrap());

        let mut reassembler = StreamReassembler::new();
        let mut drained = reassembler.feed(&stream).into_iter();

        let err = drained.next().unwrap().unwrap_err();
        assert!(matches!(err, FrameError::Decode(_)));
        assert!(!err.is_fatal());
        assert_eq!(drained.next().unwrap().unwrap(), message);
    }

    #[test]
    fn test_reset_discards_partial_frame() {
        let frame = frame_message(&sample_message(5)).unwrap();

        let mut reassembler = StreamReassembler::new();
        assert!(reassembler.feed(&frame[..frame.len() - 1]).is_empty());
        reassembler.reset();
        assert_eq!(reassembler.buffered(), 0);

        // The tail of the old frame must not resurrect the message.
        assert!(reassembler.feed(&frame[frame.len() - 1..]).is_empty());
        assert_eq!(reassembler.buffered(), 1);
    }
}
