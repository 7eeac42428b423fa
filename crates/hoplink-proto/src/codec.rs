//! Framing of the tunnel byte stream

use crate::frame::{Frame, FrameError};
use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

/// Length-prefixed [`Frame`] codec for `FramedRead` / `FramedWrite`
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        let total = match Frame::encoded_len(&src[..]) {
            None => return Ok(None),
            Some(len) => len?,
        };

        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        Frame::decode(src.split_to(total).freeze()).map(Some)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        frame.encode_into(dst)
    }
}
