//! Framed codecs for the host-child socket.
//!
//! Both shapes are little-endian:
//! - header: `u32 length` + JSON
//! - tagged data: `u32 tag` + `u32 length` + payload
//!
//! Works over any AsyncRead/AsyncWrite through `FramedRead`/`FramedWrite`.
//! A stream that closes between frames yields `None`; one that closes inside
//! a frame is an error.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use super::protocol::{Header, TaggedFrame};

/// Size of the `tag` + `length` prefix of a tagged-data frame.
const TAG_PREFIX_LEN: usize = 8;

/// Upper bound on buffer growth requested ahead of a partial frame.
const MAX_RESERVE: usize = 1 << 20;

/// Codec for the one-time header message.
///
/// Decodes to the raw JSON bytes so the handshake can report JSON errors
/// separately from framing errors.
pub struct HeaderCodec {
    inner: LengthDelimitedCodec,
}

impl Default for HeaderCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl HeaderCodec {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .little_endian()
                .length_field_length(4)
                .max_frame_length(u32::MAX as usize)
                .new_codec(),
        }
    }
}

impl Decoder for HeaderCodec {
    type Item = Bytes;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.inner.decode(src)?.map(BytesMut::freeze))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream closed inside header ({} bytes buffered)", src.len()),
            )),
        }
    }
}

impl Encoder<Header> for HeaderCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Header, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        tracing::trace!(json_size_bytes = json.len(), "Encoding header");
        self.inner.encode(Bytes::from(json), dst)
    }
}

/// Codec for tagged-data frames.
#[derive(Debug, Default, Clone, Copy)]
pub struct TagDataCodec;

impl TagDataCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for TagDataCodec {
    type Item = TaggedFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < TAG_PREFIX_LEN {
            return Ok(None);
        }

        let mut prefix = &src[..TAG_PREFIX_LEN];
        let tag = prefix.get_u32_le();
        let len = prefix.get_u32_le() as usize;

        let frame_len = TAG_PREFIX_LEN + len;
        if src.len() < frame_len {
            src.reserve((frame_len - src.len()).min(MAX_RESERVE));
            return Ok(None);
        }

        src.advance(TAG_PREFIX_LEN);
        let payload = src.split_to(len).freeze();
        tracing::trace!(tag, payload_len = len, "Decoded frame");
        Ok(Some(TaggedFrame { tag, payload }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("stream closed inside frame ({} bytes buffered)", src.len()),
            )),
        }
    }
}

impl Encoder<TaggedFrame> for TagDataCodec {
    type Error = io::Error;

    fn encode(&mut self, item: TaggedFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let len = u32::try_from(item.payload.len()).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("payload of {} bytes exceeds u32 length field", item.payload.len()),
            )
        })?;
        tracing::trace!(tag = item.tag, payload_len = len, "Encoding frame");

        dst.reserve(TAG_PREFIX_LEN + item.payload.len());
        dst.put_u32_le(item.tag);
        dst.put_u32_le(len);
        dst.extend_from_slice(&item.payload);
        Ok(())
    }
}
