//! Wire protocol: event time, chunk framing, handshake frames and the
//! streaming codec.

pub mod codec;
pub mod handshake;
pub mod message;
pub mod time;

pub use codec::ForwardCodec;
pub use handshake::{Helo, Ping, Pong};
pub use message::{
    build_ack, build_chunk, encode_frame, parse_ack, parse_chunk, ChunkOption, DecodedChunk, Entry,
    EventMode,
};
pub use time::EventTime;
