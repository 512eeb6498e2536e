//! Streaming MessagePack framing codec.
//!
//! Forward connections carry a stream of top-level MessagePack values with
//! no outer length prefix. The decoder consumes whole values from the read
//! buffer and leaves a partial tail in place until more bytes arrive; an
//! incomplete value that outgrows [`MAX_FRAME_SIZE`](crate::core::MAX_FRAME_SIZE)
//! aborts the connection before further buffering.

use std::io::{self, Cursor};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use rmpv::Value;
use tokio_util::codec::{Decoder, Encoder};

use crate::core::error::ProtocolError;
use crate::core::MAX_FRAME_SIZE;

/// Codec turning a byte stream into whole top-level MessagePack values.
#[derive(Debug, Clone)]
pub struct ForwardCodec {
    max_frame_size: usize,
}

impl Default for ForwardCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl ForwardCodec {
    /// Create a codec with the default frame-size cap.
    pub fn new() -> Self {
        Self {
            max_frame_size: MAX_FRAME_SIZE,
        }
    }

    /// Create a codec with a custom frame-size cap.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }
}

impl Decoder for ForwardCodec {
    type Item = Value;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, ProtocolError> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut cursor = Cursor::new(&src[..]);
        match rmpv::decode::read_value(&mut cursor) {
            Ok(value) => {
                let consumed = cursor.position() as usize;
                src.advance(consumed);
                Ok(Some(value))
            }
            Err(err) if is_incomplete(&err) => {
                if src.len() > self.max_frame_size {
                    return Err(ProtocolError::FrameTooLarge {
                        size: src.len(),
                        limit: self.max_frame_size,
                    });
                }
                Ok(None)
            }
            Err(err) => Err(ProtocolError::Malformed(format!("undecodable frame: {err}"))),
        }
    }
}

impl Encoder<Value> for ForwardCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Value, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        rmpv::encode::write_value(&mut dst.writer(), &item)
            .map_err(|e| ProtocolError::Malformed(format!("encode failed: {e}")))
    }
}

impl Encoder<Bytes> for ForwardCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

/// Whether the decode failure means "wait for more bytes".
fn is_incomplete(err: &rmpv::decode::Error) -> bool {
    use rmpv::decode::Error;
    match err {
        Error::InvalidMarkerRead(e) | Error::InvalidDataRead(e) => {
            e.kind() == io::ErrorKind::UnexpectedEof
        }
        _ => false,
    }
}
