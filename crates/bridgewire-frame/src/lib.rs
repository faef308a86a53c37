//! Binary framing for the bridge channel.
//!
//! Every frame on the wire is:
//! - a 4-byte big-endian length covering everything after it
//! - a 1-byte protocol version
//! - a 1-byte frame type
//! - type-specific fields (strings and bodies as `u32` length + bytes)
//!
//! Header names are sent as a `u16` token into a fixed table of common
//! names, or as `0xFFFF` followed by the literal name.

pub mod codec;
pub mod error;
pub mod framed;
pub mod header;
pub mod reader;
pub mod writer;

pub use codec::{
    decode_chunk, decode_marker, decode_request, decode_request_start, decode_response,
    decode_response_start, encode_chunk, encode_marker, encode_request, encode_request_start,
    encode_response, encode_response_prefix, encode_response_start, peek_frame_type,
    split_chunks, Frame, FrameConfig, FrameType, RequestFrame, RequestHead, ResponseFrame,
    ResponseHead, BODY_CHUNK_BYTES, DEFAULT_COALESCE_THRESHOLD, DEFAULT_MAX_BODY_BYTES,
    DEFAULT_MAX_FRAME_BYTES, LENGTH_PREFIX_SIZE, PROTOCOL_VERSION, PROTOCOL_VERSION_LEGACY,
};
pub use error::{FrameError, Result};
pub use framed::BridgeCodec;
pub use header::{header_value, is_websocket_upgrade, Headers, HEADER_NAME_TOKENS};
pub use reader::FrameReader;
pub use writer::{write_all_vectored, FrameWriter};
