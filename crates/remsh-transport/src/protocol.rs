//! Length-prefixed framing for the remsh wire protocol.
//!
//! Each frame on a stream is a 4-byte big-endian length followed by exactly
//! that many bytes holding one encoded [`Message`].

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::FrameError;
use crate::message::Message;

/// Size of the frame length prefix in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Default upper bound for a single frame body (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Encodes `message` as a complete frame, prefix included.
pub fn encode_frame(message: &Message, max_frame_size: usize) -> Result<Bytes, FrameError> {
    let mut buf = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + 64);
    buf.put_u32(0);
    message.encode(&mut buf);
    let size = buf.len() - LENGTH_PREFIX_SIZE;
    check_frame_size(size, max_frame_size)?;
    buf[..LENGTH_PREFIX_SIZE].copy_from_slice(&(size as u32).to_be_bytes());
    Ok(buf.freeze())
}

/// Decodes the body of one frame (prefix already stripped).
pub fn decode_frame(body: Bytes) -> Result<Message, FrameError> {
    Message::from_bytes(body)
}

/// Validates a frame length read from the prefix.
pub fn check_frame_size(size: usize, max_frame_size: usize) -> Result<(), FrameError> {
    if size > max_frame_size {
        return Err(FrameError::TooLarge {
            size,
            max_size: max_frame_size,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_prefix_matches_body() {
        let message = Message::request("ping", None);
        let frame = encode_frame(&message, DEFAULT_MAX_FRAME_SIZE).unwrap();
        let length = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(length, frame.len() - LENGTH_PREFIX_SIZE);

        let decoded = decode_frame(frame.slice(LENGTH_PREFIX_SIZE..)).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let message = Message::request("echo", Some(Bytes::from(vec![0u8; 128])));
        let err = encode_frame(&message, 64).unwrap_err();
        assert!(matches!(err, FrameError::TooLarge { max_size: 64, .. }));
    }

    #[test]
    fn test_check_frame_size_boundary() {
        assert!(check_frame_size(10, 10).is_ok());
        assert_eq!(
            check_frame_size(11, 10),
            Err(FrameError::TooLarge {
                size: 11,
                max_size: 10
            })
        );
    }
}
