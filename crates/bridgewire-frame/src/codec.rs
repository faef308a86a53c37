use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{FrameError, Result};
use crate::header::{name_for, token_for, Headers, LITERAL_HEADER_NAME};

/// Version byte written on every frame.
pub const PROTOCOL_VERSION: u8 = 1;

/// Older version byte still accepted on decode.
pub const PROTOCOL_VERSION_LEGACY: u8 = 1;

/// Size of the big-endian `u32` length prefix in front of every frame.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Version byte + frame type byte.
pub const FRAME_HEADER_SIZE: usize = 2;

/// Default maximum frame size: 64 MiB.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Default maximum body accumulated across one exchange: 32 MiB.
pub const DEFAULT_MAX_BODY_BYTES: usize = 32 * 1024 * 1024;

/// Frames at or below this size are written with a single copy and write.
pub const DEFAULT_COALESCE_THRESHOLD: usize = 4 * 1024;

/// Largest body slice carried by one chunk frame.
pub const BODY_CHUNK_BYTES: usize = 64 * 1024;

/// Frame type byte.
///
/// Requests, request-starts, responses and response-starts exist in a legacy
/// form (literal header names) and a tokenized form. Encoders only emit the
/// tokenized form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameType {
    LegacyRequest = 1,
    LegacyResponse = 2,
    LegacyRequestStart = 3,
    RequestChunk = 4,
    RequestEnd = 5,
    LegacyResponseStart = 6,
    ResponseChunk = 7,
    ResponseEnd = 8,
    TunnelChunk = 9,
    TunnelClose = 10,
    Request = 11,
    Response = 12,
    RequestStart = 13,
    ResponseStart = 14,
}

impl FrameType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => Self::LegacyRequest,
            2 => Self::LegacyResponse,
            3 => Self::LegacyRequestStart,
            4 => Self::RequestChunk,
            5 => Self::RequestEnd,
            6 => Self::LegacyResponseStart,
            7 => Self::ResponseChunk,
            8 => Self::ResponseEnd,
            9 => Self::TunnelChunk,
            10 => Self::TunnelClose,
            11 => Self::Request,
            12 => Self::Response,
            13 => Self::RequestStart,
            14 => Self::ResponseStart,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Whether header names in this frame are always literal strings.
    pub fn is_legacy(self) -> bool {
        matches!(
            self,
            Self::LegacyRequest
                | Self::LegacyResponse
                | Self::LegacyRequestStart
                | Self::LegacyResponseStart
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::LegacyRequest | Self::Request => "request",
            Self::LegacyResponse | Self::Response => "response",
            Self::LegacyRequestStart | Self::RequestStart => "request start",
            Self::LegacyResponseStart | Self::ResponseStart => "response start",
            Self::RequestChunk => "request chunk",
            Self::RequestEnd => "request end",
            Self::ResponseChunk => "response chunk",
            Self::ResponseEnd => "response end",
            Self::TunnelChunk => "tunnel chunk",
            Self::TunnelClose => "tunnel close",
        }
    }
}

/// Size limits and timeouts for frame I/O.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum frame length (everything after the length prefix). Default: 64 MiB.
    pub max_frame_bytes: usize,
    /// Maximum body accumulated across one exchange. Default: 32 MiB.
    pub max_body_bytes: usize,
    /// Frames up to this many bytes are coalesced into one write. Default: 4 KiB.
    pub coalesce_threshold: usize,
    /// How long to wait for the first byte of the next frame.
    pub idle_timeout: Option<Duration>,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            coalesce_threshold: DEFAULT_COALESCE_THRESHOLD,
            idle_timeout: None,
        }
    }
}

impl FrameConfig {
    pub fn check_frame_len(&self, size: usize) -> Result<()> {
        if size > self.max_frame_bytes {
            return Err(FrameError::FrameTooLarge {
                size,
                max: self.max_frame_bytes,
            });
        }
        Ok(())
    }

    pub fn check_body_len(&self, size: usize) -> Result<()> {
        if size > self.max_body_bytes {
            return Err(FrameError::BodyTooLarge {
                size,
                max: self.max_body_bytes,
            });
        }
        Ok(())
    }
}

/// Everything about a request except its body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub scheme: String,
    pub authority: String,
    pub path: String,
    pub query: String,
    /// HTTP version without the `HTTP/` prefix, e.g. `1.1`.
    pub protocol: String,
    pub headers: Headers,
}

impl Default for RequestHead {
    fn default() -> Self {
        Self {
            method: "GET".into(),
            scheme: "http".into(),
            authority: "127.0.0.1".into(),
            path: "/".into(),
            query: String::new(),
            protocol: "1.1".into(),
            headers: Vec::new(),
        }
    }
}

impl RequestHead {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub head: RequestHead,
    pub body: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    pub headers: Headers,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    pub status: u16,
    pub headers: Headers,
    pub body: Bytes,
}

/// A decoded frame, without its length prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Request(RequestFrame),
    RequestStart(RequestHead),
    RequestChunk(Bytes),
    RequestEnd,
    Response(ResponseFrame),
    ResponseStart(ResponseHead),
    ResponseChunk(Bytes),
    ResponseEnd,
    TunnelChunk(Bytes),
    TunnelClose,
}

impl Frame {
    /// The type this frame encodes to.
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Request(_) => FrameType::Request,
            Frame::RequestStart(_) => FrameType::RequestStart,
            Frame::RequestChunk(_) => FrameType::RequestChunk,
            Frame::RequestEnd => FrameType::RequestEnd,
            Frame::Response(_) => FrameType::Response,
            Frame::ResponseStart(_) => FrameType::ResponseStart,
            Frame::ResponseChunk(_) => FrameType::ResponseChunk,
            Frame::ResponseEnd => FrameType::ResponseEnd,
            Frame::TunnelChunk(_) => FrameType::TunnelChunk,
            Frame::TunnelClose => FrameType::TunnelClose,
        }
    }

    /// Decode one frame payload, legacy or current.
    ///
    /// Body and chunk bytes are slices of `payload`, not copies.
    pub fn decode(payload: &Bytes) -> Result<Frame> {
        let frame_type = peek_frame_type(payload)?;
        Ok(match frame_type {
            FrameType::LegacyRequest | FrameType::Request => {
                Frame::Request(decode_request(payload)?)
            }
            FrameType::LegacyRequestStart | FrameType::RequestStart => {
                Frame::RequestStart(decode_request_start(payload)?)
            }
            FrameType::LegacyResponse | FrameType::Response => {
                Frame::Response(decode_response(payload)?)
            }
            FrameType::LegacyResponseStart | FrameType::ResponseStart => {
                Frame::ResponseStart(decode_response_start(payload)?)
            }
            FrameType::RequestChunk => {
                Frame::RequestChunk(decode_chunk(payload, FrameType::RequestChunk)?)
            }
            FrameType::ResponseChunk => {
                Frame::ResponseChunk(decode_chunk(payload, FrameType::ResponseChunk)?)
            }
            FrameType::TunnelChunk => {
                Frame::TunnelChunk(decode_chunk(payload, FrameType::TunnelChunk)?)
            }
            FrameType::RequestEnd => {
                decode_marker(payload, FrameType::RequestEnd)?;
                Frame::RequestEnd
            }
            FrameType::ResponseEnd => {
                decode_marker(payload, FrameType::ResponseEnd)?;
                Frame::ResponseEnd
            }
            FrameType::TunnelClose => {
                decode_marker(payload, FrameType::TunnelClose)?;
                Frame::TunnelClose
            }
        })
    }

    /// Append this frame's payload (no length prefix) to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<()> {
        match self {
            Frame::Request(request) => encode_request(&request.head, &request.body, dst),
            Frame::RequestStart(head) => encode_request_start(head, dst),
            Frame::Response(response) => {
                encode_response(response.status, &response.headers, &response.body, dst)
            }
            Frame::ResponseStart(head) => encode_response_start(head.status, &head.headers, dst),
            Frame::RequestChunk(chunk) => encode_chunk(FrameType::RequestChunk, chunk, dst),
            Frame::ResponseChunk(chunk) => encode_chunk(FrameType::ResponseChunk, chunk, dst),
            Frame::TunnelChunk(chunk) => encode_chunk(FrameType::TunnelChunk, chunk, dst),
            Frame::RequestEnd => encode_marker(FrameType::RequestEnd, dst),
            Frame::ResponseEnd => encode_marker(FrameType::ResponseEnd, dst),
            Frame::TunnelClose => encode_marker(FrameType::TunnelClose, dst),
        }
    }

    /// Encode into a fresh buffer.
    pub fn to_bytes(&self) -> Result<Bytes> {
        let mut dst = BytesMut::new();
        self.encode(&mut dst)?;
        Ok(dst.freeze())
    }
}

pub fn is_supported_version(version: u8) -> bool {
    version == PROTOCOL_VERSION || version == PROTOCOL_VERSION_LEGACY
}

/// Validate the version byte and return the frame type.
pub fn peek_frame_type(payload: &[u8]) -> Result<FrameType> {
    if payload.len() < FRAME_HEADER_SIZE {
        return Err(FrameError::Truncated);
    }
    if !is_supported_version(payload[0]) {
        return Err(FrameError::UnsupportedVersion(payload[0]));
    }
    FrameType::from_u8(payload[1]).ok_or(FrameError::UnknownFrameType(payload[1]))
}

/// Split a body into slices of at most `max` bytes. An empty body yields nothing.
pub fn split_chunks(body: Bytes, max: usize) -> impl Iterator<Item = Bytes> {
    let max = max.max(1);
    let mut rest = body;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let take = rest.len().min(max);
        Some(rest.split_to(take))
    })
}

// -- Encoding ---------------------------------------------------------------

pub fn encode_request(head: &RequestHead, body: &[u8], dst: &mut BytesMut) -> Result<()> {
    dst.reserve(256 + head.headers.len() * 32 + body.len());
    let mut writer = ByteWriter::new(dst);
    writer.put_header(FrameType::Request);
    write_request_head(&mut writer, head)?;
    writer.put_bytes("body", body)
}

pub fn encode_request_start(head: &RequestHead, dst: &mut BytesMut) -> Result<()> {
    dst.reserve(256 + head.headers.len() * 32);
    let mut writer = ByteWriter::new(dst);
    writer.put_header(FrameType::RequestStart);
    write_request_head(&mut writer, head)
}

pub fn encode_response(
    status: u16,
    headers: &[(String, String)],
    body: &[u8],
    dst: &mut BytesMut,
) -> Result<()> {
    encode_response_prefix(status, headers, body.len(), dst)?;
    dst.put_slice(body);
    Ok(())
}

/// Everything of a response frame up to and including the body length.
///
/// The body itself is left to the caller so it can be written without
/// copying it into the frame buffer.
pub fn encode_response_prefix(
    status: u16,
    headers: &[(String, String)],
    body_len: usize,
    dst: &mut BytesMut,
) -> Result<()> {
    dst.reserve(64 + headers.len() * 32);
    let mut writer = ByteWriter::new(dst);
    writer.put_header(FrameType::Response);
    writer.put_u16(status);
    write_headers(&mut writer, headers)?;
    writer.put_len("body", body_len)
}

pub fn encode_response_start(
    status: u16,
    headers: &[(String, String)],
    dst: &mut BytesMut,
) -> Result<()> {
    dst.reserve(64 + headers.len() * 32);
    let mut writer = ByteWriter::new(dst);
    writer.put_header(FrameType::ResponseStart);
    writer.put_u16(status);
    write_headers(&mut writer, headers)
}

/// Encode a request, response or tunnel chunk.
pub fn encode_chunk(kind: FrameType, chunk: &[u8], dst: &mut BytesMut) -> Result<()> {
    if !matches!(
        kind,
        FrameType::RequestChunk | FrameType::ResponseChunk | FrameType::TunnelChunk
    ) {
        return Err(FrameError::UnexpectedFrameType {
            expected: "chunk",
            found: kind.as_u8(),
        });
    }
    dst.reserve(FRAME_HEADER_SIZE + 4 + chunk.len());
    let mut writer = ByteWriter::new(dst);
    writer.put_header(kind);
    writer.put_bytes("chunk", chunk)
}

/// Encode a request-end, response-end or tunnel-close marker.
pub fn encode_marker(kind: FrameType, dst: &mut BytesMut) -> Result<()> {
    if !matches!(
        kind,
        FrameType::RequestEnd | FrameType::ResponseEnd | FrameType::TunnelClose
    ) {
        return Err(FrameError::UnexpectedFrameType {
            expected: "marker",
            found: kind.as_u8(),
        });
    }
    ByteWriter::new(dst).put_header(kind);
    Ok(())
}

fn write_request_head(writer: &mut ByteWriter<'_>, head: &RequestHead) -> Result<()> {
    writer.put_str("method", &head.method)?;
    writer.put_str("scheme", &head.scheme)?;
    writer.put_str("authority", &head.authority)?;
    writer.put_str("path", &head.path)?;
    writer.put_str("query", &head.query)?;
    writer.put_str("protocol", &head.protocol)?;
    write_headers(writer, &head.headers)
}

fn write_headers(writer: &mut ByteWriter<'_>, headers: &[(String, String)]) -> Result<()> {
    if headers.is_empty() {
        writer.put_u32(0);
        return Ok(());
    }

    let count_pos = writer.reserve_u32();
    let mut count: u32 = 0;
    for (name, value) in headers {
        count = count.checked_add(1).ok_or(FrameError::FieldTooLong {
            field: "header count",
        })?;
        match token_for(name) {
            Some(token) => writer.put_u16(token),
            None => {
                writer.put_u16(LITERAL_HEADER_NAME);
                writer.put_str("header name", name)?;
            }
        }
        writer.put_str("header value", value)?;
    }
    writer.patch_u32(count_pos, count);
    Ok(())
}

// -- Decoding ---------------------------------------------------------------

pub fn decode_request(payload: &Bytes) -> Result<RequestFrame> {
    let mut reader = ByteReader::new(payload);
    let frame_type = reader.expect_type("request", |t| {
        matches!(t, FrameType::Request | FrameType::LegacyRequest)
    })?;
    let head = read_request_head(&mut reader, frame_type)?;
    let body = reader.get_shared()?;
    reader.ensure_done()?;
    Ok(RequestFrame { head, body })
}

pub fn decode_request_start(payload: &Bytes) -> Result<RequestHead> {
    let mut reader = ByteReader::new(payload);
    let frame_type = reader.expect_type("request start", |t| {
        matches!(t, FrameType::RequestStart | FrameType::LegacyRequestStart)
    })?;
    let head = read_request_head(&mut reader, frame_type)?;
    reader.ensure_done()?;
    Ok(head)
}

pub fn decode_response(payload: &Bytes) -> Result<ResponseFrame> {
    let mut reader = ByteReader::new(payload);
    let frame_type = reader.expect_type("response", |t| {
        matches!(t, FrameType::Response | FrameType::LegacyResponse)
    })?;
    let status = reader.get_u16()?;
    let headers = read_headers(&mut reader, frame_type)?;
    let body = reader.get_shared()?;
    reader.ensure_done()?;
    Ok(ResponseFrame {
        status,
        headers,
        body,
    })
}

pub fn decode_response_start(payload: &Bytes) -> Result<ResponseHead> {
    let mut reader = ByteReader::new(payload);
    let frame_type = reader.expect_type("response start", |t| {
        matches!(t, FrameType::ResponseStart | FrameType::LegacyResponseStart)
    })?;
    let status = reader.get_u16()?;
    let headers = read_headers(&mut reader, frame_type)?;
    reader.ensure_done()?;
    Ok(ResponseHead { status, headers })
}

/// Decode a chunk frame of exactly `kind`.
pub fn decode_chunk(payload: &Bytes, kind: FrameType) -> Result<Bytes> {
    let mut reader = ByteReader::new(payload);
    reader.expect_type(kind.name(), |t| t == kind)?;
    let chunk = reader.get_shared()?;
    reader.ensure_done()?;
    Ok(chunk)
}

/// Decode a field-less marker frame of exactly `kind`.
pub fn decode_marker(payload: &Bytes, kind: FrameType) -> Result<()> {
    let mut reader = ByteReader::new(payload);
    reader.expect_type(kind.name(), |t| t == kind)?;
    reader.ensure_done()
}

fn read_request_head(reader: &mut ByteReader<'_>, frame_type: FrameType) -> Result<RequestHead> {
    let method = normalize_method(reader.get_string("method")?);
    let scheme = or_default(reader.get_string("scheme")?, "http");
    let authority = or_default(reader.get_string("authority")?, "127.0.0.1");
    let path = or_default(reader.get_string("path")?, "/");
    let query = reader.get_string("query")?;
    let protocol = or_default(reader.get_string("protocol")?, "1.1");
    let headers = read_headers(reader, frame_type)?;
    Ok(RequestHead {
        method,
        scheme,
        authority,
        path,
        query,
        protocol,
        headers,
    })
}

fn read_headers(reader: &mut ByteReader<'_>, frame_type: FrameType) -> Result<Headers> {
    let count = reader.get_u32()? as usize;
    // Smallest entry: u16 token + u32 value length.
    let mut headers = Vec::with_capacity(count.min(reader.remaining() / 6));
    for _ in 0..count {
        let name = if frame_type.is_legacy() {
            reader.get_string("header name")?
        } else {
            match reader.get_u16()? {
                LITERAL_HEADER_NAME => reader.get_string("header name")?,
                token => name_for(token)
                    .ok_or(FrameError::InvalidHeaderToken(token))?
                    .to_string(),
            }
        };
        let value = reader.get_string("header value")?;
        headers.push((name, value));
    }
    Ok(headers)
}

fn normalize_method(method: String) -> String {
    if method.is_empty() {
        return "GET".to_string();
    }
    if method.bytes().any(|b| b.is_ascii_lowercase()) {
        return method.to_ascii_uppercase();
    }
    method
}

fn or_default(value: String, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value
    }
}

fn decode_text(bytes: &[u8], field: &'static str) -> Result<String> {
    if bytes.is_ascii() {
        return Ok(bytes.iter().map(|&b| char::from(b)).collect());
    }
    std::str::from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| FrameError::InvalidUtf8 { field })
}

/// Big-endian field writer over a frame buffer.
pub(crate) struct ByteWriter<'a> {
    dst: &'a mut BytesMut,
}

impl<'a> ByteWriter<'a> {
    pub(crate) fn new(dst: &'a mut BytesMut) -> Self {
        Self { dst }
    }

    pub(crate) fn put_header(&mut self, kind: FrameType) {
        self.dst.put_u8(PROTOCOL_VERSION);
        self.dst.put_u8(kind.as_u8());
    }

    pub(crate) fn put_u16(&mut self, value: u16) {
        self.dst.put_u16(value);
    }

    pub(crate) fn put_u32(&mut self, value: u32) {
        self.dst.put_u32(value);
    }

    pub(crate) fn reserve_u32(&mut self) -> usize {
        let pos = self.dst.len();
        self.dst.put_u32(0);
        pos
    }

    pub(crate) fn patch_u32(&mut self, pos: usize, value: u32) {
        self.dst[pos..pos + 4].copy_from_slice(&value.to_be_bytes());
    }

    pub(crate) fn put_len(&mut self, field: &'static str, len: usize) -> Result<()> {
        let len = u32::try_from(len).map_err(|_| FrameError::FieldTooLong { field })?;
        self.dst.put_u32(len);
        Ok(())
    }

    pub(crate) fn put_bytes(&mut self, field: &'static str, bytes: &[u8]) -> Result<()> {
        self.put_len(field, bytes.len())?;
        self.dst.put_slice(bytes);
        Ok(())
    }

    pub(crate) fn put_str(&mut self, field: &'static str, value: &str) -> Result<()> {
        self.put_bytes(field, value.as_bytes())
    }
}

/// Big-endian field reader over one frame payload.
pub(crate) struct ByteReader<'a> {
    bytes: &'a Bytes,
    offset: usize,
}

impl<'a> ByteReader<'a> {
    pub(crate) fn new(bytes: &'a Bytes) -> Self {
        Self { bytes, offset: 0 }
    }

    fn remaining(&self) -> usize {
        self.bytes.len() - self.offset
    }

    fn expect_type(
        &mut self,
        expected: &'static str,
        accept: impl Fn(FrameType) -> bool,
    ) -> Result<FrameType> {
        let version = self.get_u8()?;
        if !is_supported_version(version) {
            return Err(FrameError::UnsupportedVersion(version));
        }
        let raw = self.get_u8()?;
        match FrameType::from_u8(raw) {
            Some(frame_type) if accept(frame_type) => Ok(frame_type),
            _ => Err(FrameError::UnexpectedFrameType {
                expected,
                found: raw,
            }),
        }
    }

    fn get_exact(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(FrameError::Truncated);
        }
        let start = self.offset;
        self.offset += len;
        let bytes: &'a [u8] = self.bytes.as_ref();
        Ok(&bytes[start..start + len])
    }

    fn get_u8(&mut self) -> Result<u8> {
        Ok(self.get_exact(1)?[0])
    }

    fn get_u16(&mut self) -> Result<u16> {
        let bytes = self.get_exact(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn get_u32(&mut self) -> Result<u32> {
        let bytes = self.get_exact(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn get_range(&mut self) -> Result<(usize, usize)> {
        let len = self.get_u32()? as usize;
        if self.remaining() < len {
            return Err(FrameError::Truncated);
        }
        let start = self.offset;
        self.offset += len;
        Ok((start, start + len))
    }

    fn get_shared(&mut self) -> Result<Bytes> {
        let (start, end) = self.get_range()?;
        Ok(self.bytes.slice(start..end))
    }

    fn get_string(&mut self, field: &'static str) -> Result<String> {
        let (start, end) = self.get_range()?;
        decode_text(&self.bytes[start..end], field)
    }

    fn ensure_done(&self) -> Result<()> {
        match self.remaining() {
            0 => Ok(()),
            remaining => Err(FrameError::TrailingBytes { remaining }),
        }
    }
}
