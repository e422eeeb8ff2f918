use bytes::{Buf, BufMut, BytesMut};
use rms_crypto::{SigningKey, VerifyingKey};
use rms_sync::Message;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use crate::envelope::SignedEnvelope;
use crate::error::{ProtocolError, ProtocolResult};

/// Default upper bound on a frame's tag and payload.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame tag for a [`SignedEnvelope`] wrapping an inner message frame.
pub const ENVELOPE_TAG: u8 = 0xE0;

const LEN_PREFIX: usize = 4;
const HEADER_LEN: usize = LEN_PREFIX + 1;

/// One decoded frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame<R, C> {
    Message(Message<R, C>),
    Sealed(SignedEnvelope),
}

/// Codec for sync messages.
///
/// Frames are `[4 bytes big-endian len][1 byte tag][bincode payload]`, where
/// `len` counts the tag and payload. The tag repeats the message variant so
/// a receiver can reject unknown messages before deserializing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncCodec {
    max_frame: usize,
}

impl Default for SyncCodec {
    fn default() -> Self {
        Self {
            max_frame: MAX_FRAME_SIZE,
        }
    }
}

impl SyncCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_frame(max_frame: usize) -> Self {
        Self { max_frame }
    }

    pub fn max_frame(&self) -> usize {
        self.max_frame
    }

    /// Encode a message as one frame.
    pub fn encode<R: Serialize, C: Serialize>(&self, msg: &Message<R, C>) -> ProtocolResult<Vec<u8>> {
        let mut buf = BytesMut::new();
        self.encode_into(msg, &mut buf)?;
        Ok(buf.to_vec())
    }

    /// Append one message frame to `dst`.
    pub fn encode_into<R: Serialize, C: Serialize>(
        &self,
        msg: &Message<R, C>,
        dst: &mut BytesMut,
    ) -> ProtocolResult<()> {
        let payload =
            bincode::serialize(msg).map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        self.put_frame(msg.type_tag(), &payload, dst)
    }

    /// Encode a message, sign the frame with `key`, and frame the envelope.
    pub fn encode_sealed<R: Serialize, C: Serialize>(
        &self,
        msg: &Message<R, C>,
        key: &SigningKey,
    ) -> ProtocolResult<Vec<u8>> {
        let envelope = SignedEnvelope::seal(self.encode(msg)?, key);
        let mut buf = BytesMut::new();
        self.put_frame(ENVELOPE_TAG, &envelope.to_bytes()?, &mut buf)?;
        Ok(buf.to_vec())
    }

    /// Decode exactly one message frame from the front of `data`. Returns
    /// the message and the number of bytes consumed.
    pub fn decode<R: DeserializeOwned, C: DeserializeOwned>(
        &self,
        data: &[u8],
    ) -> ProtocolResult<(Message<R, C>, usize)> {
        let Some((len, tag)) = self.header(data)? else {
            return Err(ProtocolError::FramingError("too short".into()));
        };
        let total = LEN_PREFIX + len;
        if data.len() < total {
            return Err(ProtocolError::FramingError(format!(
                "incomplete: have {}, need {}",
                data.len(),
                total
            )));
        }
        match self.parse(tag, &data[HEADER_LEN..total])? {
            Frame::Message(msg) => Ok((msg, total)),
            Frame::Sealed(_) => Err(ProtocolError::FramingError(
                "expected a message, found an envelope".into(),
            )),
        }
    }

    /// Decode the next complete frame from a streaming buffer, advancing it.
    /// Returns `Ok(None)` until a whole frame has arrived.
    pub fn decode_from<R: DeserializeOwned, C: DeserializeOwned>(
        &self,
        src: &mut BytesMut,
    ) -> ProtocolResult<Option<Frame<R, C>>> {
        let Some((len, tag)) = self.header(src)? else {
            return Ok(None);
        };
        let total = LEN_PREFIX + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        let mut frame = src.split_to(total);
        frame.advance(HEADER_LEN);
        self.parse(tag, &frame).map(Some)
    }

    /// Verify a sealed frame and decode the message inside it. With
    /// `expected`, the envelope must also be signed by that key.
    pub fn open<R: DeserializeOwned, C: DeserializeOwned>(
        &self,
        envelope: &SignedEnvelope,
        expected: Option<&VerifyingKey>,
    ) -> ProtocolResult<Message<R, C>> {
        let inner = match expected {
            Some(key) => envelope.open_from(key)?,
            None => envelope.open()?,
        };
        let (msg, used) = self.decode(inner)?;
        if used != inner.len() {
            return Err(ProtocolError::FramingError(format!(
                "{} trailing bytes after sealed message",
                inner.len() - used
            )));
        }
        Ok(msg)
    }

    fn put_frame(&self, tag: u8, payload: &[u8], dst: &mut BytesMut) -> ProtocolResult<()> {
        let len = payload.len() + 1;
        if len > self.max_frame {
            return Err(ProtocolError::MessageTooLarge {
                size: len,
                max: self.max_frame,
            });
        }
        let len = u32::try_from(len).map_err(|_| ProtocolError::MessageTooLarge {
            size: len,
            max: u32::MAX as usize,
        })?;
        dst.reserve(LEN_PREFIX + len as usize);
        dst.put_u32(len);
        dst.put_u8(tag);
        dst.put_slice(payload);
        Ok(())
    }

    /// Read the length prefix and tag, or `None` if fewer than five bytes
    /// are available.
    fn header(&self, data: &[u8]) -> ProtocolResult<Option<(usize, u8)>> {
        if data.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if len == 0 {
            return Err(ProtocolError::FramingError("zero-length frame".into()));
        }
        if len > self.max_frame {
            return Err(ProtocolError::MessageTooLarge {
                size: len,
                max: self.max_frame,
            });
        }
        Ok(Some((len, data[LEN_PREFIX])))
    }

    fn parse<R: DeserializeOwned, C: DeserializeOwned>(
        &self,
        tag: u8,
        payload: &[u8],
    ) -> ProtocolResult<Frame<R, C>> {
        if tag == ENVELOPE_TAG {
            return SignedEnvelope::from_bytes(payload).map(Frame::Sealed);
        }
        if !Message::<R, C>::is_known_tag(tag) {
            return Err(ProtocolError::InvalidMessageType(tag));
        }
        let msg: Message<R, C> = bincode::deserialize(payload)
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        if msg.type_tag() != tag {
            return Err(ProtocolError::TagMismatch {
                header: tag,
                payload: msg.type_tag(),
            });
        }
        trace!(kind = msg.type_name(), bytes = payload.len(), "decoded frame");
        Ok(Frame::Message(msg))
    }
}
