//! Chunk framing for the four Forward event modes.
//!
//! Client-to-server frames are MessagePack arrays:
//!
//! ```text
//! Message:                  [tag, time, record, option?]
//! Forward:                  [tag, [[time, record], ...], option?]
//! PackedForward:            [tag, raw, option]      raw = concatenated [time, record]
//! CompressedPackedForward:  [tag, gzip(raw), option]   option.compressed = "gzip"
//! ```
//!
//! The option map carries `chunk` (base64 id requesting an ack) and `size`
//! (entry count, packed modes). Server-to-client acks are a single map
//! `{"ack": chunk_id}`.

use std::io::{Cursor, Read, Write};

use bytes::Bytes;
use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rmpv::Value;

use crate::core::error::{ConfigError, ProtocolError};
use crate::core::{COMPRESSED_GZIP, MAX_DECOMPRESSED_SIZE};
use crate::protocol::time::EventTime;

/// How the client frames entries on the wire. Static configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EventMode {
    /// One entry per frame.
    Message,
    /// All entries of a tag in one array frame.
    #[default]
    Forward,
    /// Entries pre-encoded into a single binary payload.
    PackedForward,
    /// Packed payload, gzip-compressed.
    CompressedPackedForward,
}

impl EventMode {
    /// Parse the configuration string form of the mode.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "Message" => Ok(Self::Message),
            "Forward" => Ok(Self::Forward),
            "PackedForward" => Ok(Self::PackedForward),
            "CompressedPackedForward" => Ok(Self::CompressedPackedForward),
            other => Err(ConfigError::UnknownEventMode(other.to_string())),
        }
    }

    /// Whether this mode ships entries as a pre-encoded binary payload.
    pub fn is_packed(self) -> bool {
        matches!(self, Self::PackedForward | Self::CompressedPackedForward)
    }
}

/// A single event: its time and its record map.
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    /// Event timestamp.
    pub time: EventTime,
    /// Record payload; always a MessagePack map.
    pub record: Value,
}

impl Entry {
    /// Create an entry.
    pub fn new(time: EventTime, record: Value) -> Self {
        Self { time, record }
    }

    fn to_value(&self) -> Value {
        Value::Array(vec![self.time.to_value(), self.record.clone()])
    }

    fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let pair = value
            .as_array()
            .filter(|a| a.len() >= 2)
            .ok_or_else(|| ProtocolError::Malformed("entry is not a [time, record] pair".into()))?;
        Ok(Self {
            time: EventTime::from_value(&pair[0])?,
            record: pair[1].clone(),
        })
    }
}

/// The option map attached to a chunk frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChunkOption {
    /// Base64 chunk id; presence requests an acknowledgement.
    pub chunk: Option<String>,
    /// Number of entries in a packed payload.
    pub size: Option<usize>,
    /// Compression codec name; only `"gzip"` is defined.
    pub compressed: Option<String>,
}

impl ChunkOption {
    fn is_empty(&self) -> bool {
        self.chunk.is_none() && self.size.is_none() && self.compressed.is_none()
    }

    fn to_value(&self) -> Value {
        let mut pairs = Vec::new();
        if let Some(chunk) = &self.chunk {
            pairs.push((Value::from("chunk"), Value::from(chunk.as_str())));
        }
        if let Some(size) = self.size {
            pairs.push((Value::from("size"), Value::from(size as u64)));
        }
        if let Some(compressed) = &self.compressed {
            pairs.push((Value::from("compressed"), Value::from(compressed.as_str())));
        }
        Value::Map(pairs)
    }

    fn from_value(value: &Value) -> Result<Self, ProtocolError> {
        let pairs = value
            .as_map()
            .ok_or_else(|| ProtocolError::Malformed("chunk option is not a map".into()))?;
        let mut option = Self::default();
        for (key, val) in pairs {
            match key.as_str() {
                Some("chunk") => {
                    option.chunk = Some(
                        val.as_str()
                            .ok_or_else(|| {
                                ProtocolError::Malformed("chunk id is not a string".into())
                            })?
                            .to_string(),
                    );
                }
                Some("size") => {
                    option.size = val.as_u64().map(|v| v as usize);
                }
                Some("compressed") => {
                    option.compressed = val.as_str().map(str::to_string);
                }
                // Unknown option keys are ignored for forward compatibility.
                _ => {}
            }
        }
        Ok(option)
    }
}

/// A parsed inbound chunk frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedChunk {
    /// Routing tag.
    pub tag: String,
    /// Entries in wire order.
    pub entries: Vec<Entry>,
    /// Chunk id when the sender requested an ack.
    pub chunk_id: Option<String>,
}

/// Build the frame value for a chunk of entries.
///
/// `Message` mode frames exactly one entry; callers pop one entry per chunk
/// in that mode.
pub fn build_chunk(
    mode: EventMode,
    tag: &str,
    entries: &[Entry],
    chunk_id: Option<&str>,
) -> Result<Value, ProtocolError> {
    if entries.is_empty() {
        return Err(ProtocolError::Malformed("chunk has no entries".into()));
    }

    let mut option = ChunkOption {
        chunk: chunk_id.map(str::to_string),
        ..ChunkOption::default()
    };

    let frame = match mode {
        EventMode::Message => {
            let entry = &entries[0];
            let mut frame = vec![
                Value::from(tag),
                entry.time.to_value(),
                entry.record.clone(),
            ];
            if !option.is_empty() {
                frame.push(option.to_value());
            }
            frame
        }
        EventMode::Forward => {
            let list = Value::Array(entries.iter().map(Entry::to_value).collect());
            let mut frame = vec![Value::from(tag), list];
            if !option.is_empty() {
                frame.push(option.to_value());
            }
            frame
        }
        EventMode::PackedForward | EventMode::CompressedPackedForward => {
            let mut raw = Vec::new();
            for entry in entries {
                write_value(&mut raw, &entry.to_value())?;
            }
            option.size = Some(entries.len());
            let payload = if mode == EventMode::CompressedPackedForward {
                option.compressed = Some(COMPRESSED_GZIP.to_string());
                gzip_compress(&raw)?
            } else {
                raw
            };
            vec![Value::from(tag), Value::Binary(payload), option.to_value()]
        }
    };

    Ok(Value::Array(frame))
}

/// Encode a frame value to its wire bytes.
pub fn encode_frame(value: &Value) -> Result<Bytes, ProtocolError> {
    let mut buf = Vec::new();
    write_value(&mut buf, value)?;
    Ok(Bytes::from(buf))
}

/// Parse an inbound top-level frame into a chunk.
///
/// Accepts all four event modes; entry times may be the event-time
/// extension or plain integers, and packed payloads may arrive as binary
/// or string values.
pub fn parse_chunk(value: &Value) -> Result<DecodedChunk, ProtocolError> {
    let frame = value
        .as_array()
        .filter(|a| a.len() >= 2)
        .ok_or_else(|| frame_shape_error(value))?;

    let tag = frame[0]
        .as_str()
        .ok_or_else(|| frame_shape_error(value))?
        .to_string();

    match &frame[1] {
        // Message mode: [tag, time, record, option?]
        Value::Ext(..) | Value::Integer(_) => {
            if frame.len() < 3 {
                return Err(ProtocolError::Malformed(
                    "message frame is missing its record".into(),
                ));
            }
            let entry = Entry {
                time: EventTime::from_value(&frame[1])?,
                record: frame[2].clone(),
            };
            let option = parse_option(frame.get(3))?;
            Ok(DecodedChunk {
                tag,
                entries: vec![entry],
                chunk_id: option.chunk,
            })
        }
        // Forward mode: [tag, [[time, record], ...], option?]
        Value::Array(list) => {
            let entries = list
                .iter()
                .map(Entry::from_value)
                .collect::<Result<Vec<_>, _>>()?;
            let option = parse_option(frame.get(2))?;
            Ok(DecodedChunk {
                tag,
                entries,
                chunk_id: option.chunk,
            })
        }
        // Packed modes: [tag, raw, option?]
        Value::Binary(raw) => parse_packed(tag, raw, frame.get(2)),
        Value::String(raw) => parse_packed(tag, raw.as_bytes(), frame.get(2)),
        _ => Err(frame_shape_error(value)),
    }
}

fn parse_packed(
    tag: String,
    raw: &[u8],
    option: Option<&Value>,
) -> Result<DecodedChunk, ProtocolError> {
    let option = parse_option(option)?;
    let decompressed;
    let payload = if option.compressed.as_deref() == Some(COMPRESSED_GZIP) {
        decompressed = gzip_decompress(raw, MAX_DECOMPRESSED_SIZE)?;
        &decompressed[..]
    } else if let Some(other) = &option.compressed {
        return Err(ProtocolError::Malformed(format!(
            "unknown compression codec: {other:?}"
        )));
    } else {
        raw
    };

    let mut entries = Vec::new();
    let mut cursor = Cursor::new(payload);
    while (cursor.position() as usize) < payload.len() {
        let value = rmpv::decode::read_value(&mut cursor)
            .map_err(|e| ProtocolError::Malformed(format!("bad packed entry: {e}")))?;
        entries.push(Entry::from_value(&value)?);
    }

    Ok(DecodedChunk {
        tag,
        entries,
        chunk_id: option.chunk,
    })
}

fn parse_option(value: Option<&Value>) -> Result<ChunkOption, ProtocolError> {
    match value {
        None | Some(Value::Nil) => Ok(ChunkOption::default()),
        Some(v) => ChunkOption::from_value(v),
    }
}

fn frame_shape_error(value: &Value) -> ProtocolError {
    ProtocolError::UnexpectedMessage(format!("frame has unknown shape: {value}"))
}

/// Build the ack frame for a chunk id.
pub fn build_ack(chunk_id: &str) -> Value {
    Value::Map(vec![(Value::from("ack"), Value::from(chunk_id))])
}

/// Extract the chunk id from an ack frame, if the value is one.
pub fn parse_ack(value: &Value) -> Option<String> {
    let pairs = value.as_map()?;
    pairs
        .iter()
        .find(|(key, _)| key.as_str() == Some("ack"))
        .and_then(|(_, val)| val.as_str())
        .map(str::to_string)
}

pub(crate) fn write_value(buf: &mut Vec<u8>, value: &Value) -> Result<(), ProtocolError> {
    rmpv::encode::write_value(buf, value)
        .map_err(|e| ProtocolError::Malformed(format!("encode failed: {e}")))
}

fn gzip_compress(data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .and_then(|()| encoder.finish())
        .map_err(|e| ProtocolError::Compression(e.to_string()))
}

fn gzip_decompress(data: &[u8], limit: usize) -> Result<Vec<u8>, ProtocolError> {
    // MultiGzDecoder: senders may concatenate gzip members into one payload.
    let decoder = MultiGzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| ProtocolError::Compression(e.to_string()))?;
    if out.len() > limit {
        return Err(ProtocolError::FrameTooLarge {
            size: out.len(),
            limit,
        });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(key: &str, val: &str) -> Value {
        Value::Map(vec![(Value::from(key), Value::from(val))])
    }

    fn sample_entries(n: usize) -> Vec<Entry> {
        (0..n)
            .map(|i| {
                Entry::new(
                    EventTime::from_epoch(1_700_000_000 + i as u32, 0),
                    record("event", &format!("payload-{i}")),
                )
            })
            .collect()
    }

    #[test]
    fn test_event_mode_parse() {
        assert_eq!(EventMode::parse("Message").unwrap(), EventMode::Message);
        assert_eq!(
            EventMode::parse("CompressedPackedForward").unwrap(),
            EventMode::CompressedPackedForward
        );
        assert!(matches!(
            EventMode::parse("Bogus"),
            Err(ConfigError::UnknownEventMode(_))
        ));
    }

    #[test]
    fn test_message_roundtrip() {
        let entries = sample_entries(1);
        let frame = build_chunk(EventMode::Message, "app.log", &entries, None).unwrap();
        let chunk = parse_chunk(&frame).unwrap();
        assert_eq!(chunk.tag, "app.log");
        assert_eq!(chunk.entries, entries);
        assert_eq!(chunk.chunk_id, None);
    }

    #[test]
    fn test_forward_roundtrip_with_chunk_id() {
        let entries = sample_entries(3);
        let frame = build_chunk(EventMode::Forward, "app.log", &entries, Some("YWJj")).unwrap();
        let chunk = parse_chunk(&frame).unwrap();
        assert_eq!(chunk.entries, entries);
        assert_eq!(chunk.chunk_id.as_deref(), Some("YWJj"));
    }

    #[test]
    fn test_packed_forward_roundtrip() {
        let entries = sample_entries(5);
        let frame = build_chunk(EventMode::PackedForward, "app.log", &entries, None).unwrap();
        // Packed frames always carry the entry count.
        let option = ChunkOption::from_value(&frame.as_array().unwrap()[2]).unwrap();
        assert_eq!(option.size, Some(5));

        let chunk = parse_chunk(&frame).unwrap();
        assert_eq!(chunk.entries, entries);
    }

    #[test]
    fn test_compressed_packed_forward_roundtrip() {
        let entries = sample_entries(50);
        let frame =
            build_chunk(EventMode::CompressedPackedForward, "app.log", &entries, None).unwrap();
        let option = ChunkOption::from_value(&frame.as_array().unwrap()[2]).unwrap();
        assert_eq!(option.compressed.as_deref(), Some(COMPRESSED_GZIP));

        let chunk = parse_chunk(&frame).unwrap();
        assert_eq!(chunk.entries, entries);
    }

    #[test]
    fn test_empty_chunk_rejected() {
        assert!(build_chunk(EventMode::Forward, "t", &[], None).is_err());
    }

    #[test]
    fn test_unknown_shape_rejected() {
        let err = parse_chunk(&Value::from(42u64)).unwrap_err();
        assert!(matches!(err, ProtocolError::UnexpectedMessage(_)));
    }

    #[test]
    fn test_unknown_compression_rejected() {
        let frame = Value::Array(vec![
            Value::from("t"),
            Value::Binary(vec![1, 2, 3]),
            Value::Map(vec![(Value::from("compressed"), Value::from("lz4"))]),
        ]);
        assert!(parse_chunk(&frame).is_err());
    }

    #[test]
    fn test_integer_time_accepted_in_forward() {
        let frame = Value::Array(vec![
            Value::from("t"),
            Value::Array(vec![Value::Array(vec![
                Value::from(1_700_000_000u64),
                record("k", "v"),
            ])]),
        ]);
        let chunk = parse_chunk(&frame).unwrap();
        assert_eq!(chunk.entries[0].time.seconds, 1_700_000_000);
    }

    #[test]
    fn test_ack_roundtrip() {
        let frame = build_ack("Y2h1bms=");
        assert_eq!(parse_ack(&frame).as_deref(), Some("Y2h1bms="));
        assert_eq!(parse_ack(&Value::from("not a map")), None);
    }
}
