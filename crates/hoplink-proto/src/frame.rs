//! Tunnel frames

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Frame types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// A connection was accepted for this sequence
    Open = 0,
    Data = 1,
    /// The sender is done with this sequence
    Close = 2,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Open),
            1 => Ok(FrameType::Data),
            2 => Ok(FrameType::Close),
            _ => Err(FrameError::InvalidFrameType(value)),
        }
    }
}

/// Frame errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Incomplete frame")]
    IncompleteFrame,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunnel frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u64,
    pub frame_type: FrameType,
    pub payload: Bytes,
}

impl Frame {
    /// Frame header size: seq (8) + frame_type (1) + length (4) = 13 bytes
    pub const HEADER_SIZE: usize = 13;

    pub fn new(seq: u64, frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            seq,
            frame_type,
            payload,
        }
    }

    pub fn open(seq: u64) -> Self {
        Self::new(seq, FrameType::Open, Bytes::new())
    }

    pub fn data(seq: u64, payload: impl Into<Bytes>) -> Self {
        Self::new(seq, FrameType::Data, payload.into())
    }

    pub fn close(seq: u64) -> Self {
        Self::new(seq, FrameType::Close, Bytes::new())
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + self.payload.len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Append the encoded frame to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), FrameError> {
        let payload_len = self.payload.len();
        if payload_len > crate::MAX_FRAME_SIZE as usize {
            return Err(FrameError::FrameTooLarge(payload_len));
        }

        buf.reserve(Self::HEADER_SIZE + payload_len);
        buf.put_u64(self.seq);
        buf.put_u8(self.frame_type as u8);
        buf.put_u32(payload_len as u32);
        buf.put_slice(&self.payload);

        Ok(())
    }

    /// Decode frame from bytes
    pub fn decode(mut buf: Bytes) -> Result<Self, FrameError> {
        if buf.len() < Self::HEADER_SIZE {
            return Err(FrameError::IncompleteFrame);
        }

        let seq = buf.get_u64();
        let frame_type = FrameType::try_from(buf.get_u8())?;
        let length = buf.get_u32();

        if length > crate::MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(length as usize));
        }

        if buf.remaining() < length as usize {
            return Err(FrameError::IncompleteFrame);
        }

        let payload = buf.split_to(length as usize);

        Ok(Self {
            seq,
            frame_type,
            payload,
        })
    }

    /// Total encoded length announced by a header, if `buf` holds a full header
    pub(crate) fn encoded_len(buf: &[u8]) -> Option<Result<usize, FrameError>> {
        if buf.len() < Self::HEADER_SIZE {
            return None;
        }

        let mut header = &buf[8..Self::HEADER_SIZE];
        let _frame_type = header.get_u8();
        let length = header.get_u32();

        if length > crate::MAX_FRAME_SIZE {
            return Some(Err(FrameError::FrameTooLarge(length as usize)));
        }

        Some(Ok(Self::HEADER_SIZE + length as usize))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encode_decode() {
        let payload = Bytes::from("hello world");
        let frame = Frame::data(42, payload.clone());

        let encoded = frame.encode().unwrap();
        assert_eq!(encoded.len(), Frame::HEADER_SIZE + payload.len());

        let decoded = Frame::decode(encoded).unwrap();
        assert_eq!(decoded.seq, 42);
        assert_eq!(decoded.frame_type, FrameType::Data);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_control_frames_have_empty_payload() {
        let decoded = Frame::decode(Frame::close(u64::MAX).encode().unwrap()).unwrap();

        assert_eq!(decoded.seq, u64::MAX);
        assert_eq!(decoded.frame_type, FrameType::Close);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_decode_invalid_type() {
        let mut buf = BytesMut::new();
        buf.put_u64(1);
        buf.put_u8(9);
        buf.put_u32(0);

        assert!(matches!(
            Frame::decode(buf.freeze()),
            Err(FrameError::InvalidFrameType(9))
        ));
    }

    #[test]
    fn test_decode_truncated() {
        let encoded = Frame::data(1, Bytes::from("abc")).encode().unwrap();

        assert!(matches!(
            Frame::decode(encoded.slice(..5)),
            Err(FrameError::IncompleteFrame)
        ));
        assert!(matches!(
            Frame::decode(encoded.slice(..encoded.len() - 1)),
            Err(FrameError::IncompleteFrame)
        ));
    }

    #[test]
    fn test_decode_oversized_length() {
        let mut buf = BytesMut::new();
        buf.put_u64(1);
        buf.put_u8(FrameType::Data as u8);
        buf.put_u32(crate::MAX_FRAME_SIZE + 1);

        assert!(matches!(
            Frame::decode(buf.freeze()),
            Err(FrameError::FrameTooLarge(_))
        ));
    }
}
