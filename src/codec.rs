//! Wire codec: length-prefixed frames carrying big-endian binary messages.
//!
//! Each frame is a 4-byte big-endian length `L` followed by `L` bytes of
//! message body. The body starts with a fixed 57-byte header (type tag,
//! sender id, message id, timestamp) and continues with a type-specific
//! payload. [`MessageCodec`] plugs this format into
//! [`tokio_util::codec::FramedRead`]/[`FramedWrite`].

use bytes::Buf;
use bytes::BufMut;
use bytes::BytesMut;
use tokio_util::codec::Decoder;
use tokio_util::codec::Encoder;

use crate::models::message::Message;
use crate::models::message::MessageBody;
use crate::models::message::MessageType;
use crate::models::peer::ConnectionStatus;
use crate::models::peer::MessageId;
use crate::models::peer::PeerId;
use crate::models::peer::MESSAGE_ID_LENGTH;
use crate::models::peer::PEER_ID_LENGTH;

/// Size of the length prefix in front of every message body.
pub const FRAME_PREFIX_LENGTH: usize = 4;

/// Fixed message header: tag (1) + sender (32) + message id (16) + timestamp (8).
pub const MESSAGE_HEADER_LENGTH: usize = 1 + PEER_ID_LENGTH + MESSAGE_ID_LENGTH + 8;

/// Upper bound on a single frame body. Bigger length prefixes are treated as
/// a decode error instead of a buffer allocation.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("buffer too short for message header")]
    ShortBuffer,
    #[error("unknown message type tag {0}")]
    UnknownType(u8),
    #[error("declared payload length exceeds remaining buffer")]
    LengthMismatch,
    #[error("frame of {0} bytes exceeds maximum frame length")]
    FrameTooLarge(usize),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl CodecError {
    /// Body decode errors are recoverable: the offending frame is consumed
    /// before parsing, so the stream stays aligned and the session can keep
    /// reading. I/o errors are terminal, and so is an oversized length
    /// prefix, whose frame cannot be skipped without reading it.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CodecError::Io(_) | CodecError::FrameTooLarge(_))
    }
}

/// Serialize a message body (everything after the 4-byte frame prefix).
///
/// Pure and side-effect free; the output length always equals
/// [`MESSAGE_HEADER_LENGTH`] plus the payload size of the variant.
pub fn encode_message(message: &Message) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MESSAGE_HEADER_LENGTH + payload_length(&message.body));
    buf.put_u8(message.body.message_type() as u8);
    buf.put_slice(message.sender.as_bytes());
    buf.put_slice(message.id.as_bytes());
    buf.put_u64(message.timestamp);

    match &message.body {
        MessageBody::Chat { content } => {
            buf.put_u32(content.len() as u32);
            buf.put_slice(content.as_bytes());
        }
        MessageBody::FileRequest {
            filename,
            file_size,
        } => {
            buf.put_u64(*file_size);
            buf.put_u32(filename.len() as u32);
            buf.put_slice(filename.as_bytes());
        }
        MessageBody::FileChunk {
            file_id,
            chunk_index,
            data,
        } => {
            buf.put_u32(file_id.len() as u32);
            buf.put_slice(file_id.as_bytes());
            buf.put_u32(*chunk_index);
            buf.put_u32(data.len() as u32);
            buf.put_slice(data);
        }
        MessageBody::FileComplete {
            file_id,
            success,
            error,
        } => {
            buf.put_u32(file_id.len() as u32);
            buf.put_slice(file_id.as_bytes());
            buf.put_u8(u8::from(*success));
            buf.put_u32(error.len() as u32);
            buf.put_slice(error.as_bytes());
        }
        MessageBody::Ping | MessageBody::Pong => {}
        MessageBody::ConnectionNotification { peer_id, status } => {
            buf.put_slice(peer_id.as_bytes());
            buf.put_u8(*status as u8);
        }
    }

    buf
}

/// Parse one message body whose length equals the framed length prefix.
pub fn decode_message(buf: &[u8]) -> Result<Message, CodecError> {
    let mut reader = PayloadReader::new(buf);

    let tag = reader.read_u8()?;
    let message_type = MessageType::from_u8(tag).ok_or(CodecError::UnknownType(tag))?;
    let sender = PeerId(reader.read_array::<PEER_ID_LENGTH>()?);
    let id = MessageId(reader.read_array::<MESSAGE_ID_LENGTH>()?);
    let timestamp = reader.read_u64()?;

    let body = match message_type {
        MessageType::Chat => {
            let content = reader.read_string()?;
            MessageBody::Chat { content }
        }
        MessageType::FileRequest => {
            let file_size = reader.read_u64()?;
            let filename = reader.read_string()?;
            MessageBody::FileRequest {
                filename,
                file_size,
            }
        }
        MessageType::FileChunk => {
            let file_id = reader.read_string()?;
            let chunk_index = reader.read_u32()?;
            let len = reader.read_u32()? as usize;
            let data = reader.read_bytes(len)?.to_vec();
            MessageBody::FileChunk {
                file_id,
                chunk_index,
                data,
            }
        }
        MessageType::FileComplete => {
            let file_id = reader.read_string()?;
            let success = reader.read_u8()? != 0;
            let error = reader.read_string()?;
            MessageBody::FileComplete {
                file_id,
                success,
                error,
            }
        }
        MessageType::Ping => MessageBody::Ping,
        MessageType::Pong => MessageBody::Pong,
        MessageType::ConnectionNotification => {
            let peer_id = PeerId(reader.read_array::<PEER_ID_LENGTH>()?);
            let status = ConnectionStatus::from_u8(reader.read_u8()?);
            MessageBody::ConnectionNotification { peer_id, status }
        }
    };

    Ok(Message {
        sender,
        id,
        timestamp,
        body,
    })
}

/// Payload size of a body, per the wire tables.
fn payload_length(body: &MessageBody) -> usize {
    match body {
        MessageBody::Chat { content } => 4 + content.len(),
        MessageBody::FileRequest { filename, .. } => 8 + 4 + filename.len(),
        MessageBody::FileChunk { file_id, data, .. } => 4 + file_id.len() + 4 + 4 + data.len(),
        MessageBody::FileComplete { file_id, error, .. } => 4 + file_id.len() + 1 + 4 + error.len(),
        MessageBody::Ping | MessageBody::Pong => 0,
        MessageBody::ConnectionNotification { .. } => PEER_ID_LENGTH + 1,
    }
}

/// Cursor over one message body.
///
/// Fixed-width reads that run out of input are `ShortBuffer`; variable-length
/// reads whose declared length overruns the buffer are `LengthMismatch`.
struct PayloadReader<'a> {
    buf: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        let bytes = self.take(1, CodecError::ShortBuffer)?;
        Ok(bytes[0])
    }

    fn read_u32(&mut self) -> Result<u32, CodecError> {
        let bytes = self.take(4, CodecError::ShortBuffer)?;
        Ok(u32::from_be_bytes(bytes.try_into().unwrap()))
    }

    fn read_u64(&mut self) -> Result<u64, CodecError> {
        let bytes = self.take(8, CodecError::ShortBuffer)?;
        Ok(u64::from_be_bytes(bytes.try_into().unwrap()))
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], CodecError> {
        let bytes = self.take(N, CodecError::ShortBuffer)?;
        Ok(bytes.try_into().unwrap())
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        self.take(len, CodecError::LengthMismatch)
    }

    /// Length-prefixed string. The original protocol never validated UTF-8,
    /// so invalid bytes are replaced rather than rejected.
    fn read_string(&mut self) -> Result<String, CodecError> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    fn take(&mut self, n: usize, on_underrun: CodecError) -> Result<&'a [u8], CodecError> {
        if self.buf.len() < n {
            return Err(on_underrun);
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }
}

/// Frame codec for use with `FramedRead`/`FramedWrite`.
#[derive(Clone, Copy, Debug, Default)]
pub struct MessageCodec;

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Message>, CodecError> {
        if src.len() < FRAME_PREFIX_LENGTH {
            return Ok(None);
        }

        let mut prefix = [0u8; FRAME_PREFIX_LENGTH];
        prefix.copy_from_slice(&src[..FRAME_PREFIX_LENGTH]);
        let body_length = u32::from_be_bytes(prefix) as usize;
        if body_length > MAX_FRAME_LENGTH {
            return Err(CodecError::FrameTooLarge(body_length));
        }

        if src.len() < FRAME_PREFIX_LENGTH + body_length {
            src.reserve(FRAME_PREFIX_LENGTH + body_length - src.len());
            return Ok(None);
        }

        // Consume the whole frame before parsing so a bad body never leaves
        // the stream misaligned.
        src.advance(FRAME_PREFIX_LENGTH);
        let body = src.split_to(body_length);
        decode_message(&body).map(Some)
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, message: Message, dst: &mut BytesMut) -> Result<(), CodecError> {
        let body = encode_message(&message);
        if body.len() > MAX_FRAME_LENGTH {
            return Err(CodecError::FrameTooLarge(body.len()));
        }
        dst.reserve(FRAME_PREFIX_LENGTH + body.len());
        dst.put_u32(body.len() as u32);
        dst.put_slice(&body);
        Ok(())
    }
}
