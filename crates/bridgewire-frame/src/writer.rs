use std::io::{self, IoSlice};

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::trace;

use crate::codec::{
    encode_response_prefix, Frame, FrameConfig, FrameType, FRAME_HEADER_SIZE, LENGTH_PREFIX_SIZE,
    PROTOCOL_VERSION,
};
use crate::error::{FrameError, Result};

const INITIAL_BUFFER_CAPACITY: usize = 8 * 1024;

/// Writes length-prefixed frames to any `AsyncWrite` stream.
///
/// Frames up to the coalescing threshold are assembled in one buffer and
/// written with a single call. Larger frames go out as a vectored write of
/// the length prefix, the fixed fields and the body, so body bytes are never
/// copied.
pub struct FrameWriter<W> {
    inner: W,
    scratch: BytesMut,
    config: FrameConfig,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Create a new frame writer with default configuration.
    pub fn new(inner: W) -> Self {
        Self::with_config(inner, FrameConfig::default())
    }

    /// Create a new frame writer with explicit configuration.
    pub fn with_config(inner: W, config: FrameConfig) -> Self {
        Self {
            inner,
            scratch: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
            config,
        }
    }

    /// Write an already-encoded frame payload.
    pub async fn write_payload(&mut self, payload: &[u8]) -> Result<()> {
        self.config.check_frame_len(payload.len())?;
        let prefix = length_prefix(payload.len())?;

        if payload.len() <= self.config.coalesce_threshold {
            self.scratch.clear();
            self.scratch.put_slice(&prefix);
            self.scratch.put_slice(payload);
            self.inner.write_all(&self.scratch).await?;
        } else {
            write_all_vectored(&mut self.inner, &[&prefix, payload]).await?;
        }
        trace!(bytes = payload.len(), "wrote bridge frame");
        self.flush().await
    }

    /// Encode and write one frame.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        match frame {
            Frame::Response(response) => {
                self.write_response(response.status, &response.headers, &response.body)
                    .await
            }
            Frame::RequestChunk(chunk) => self.write_chunk(FrameType::RequestChunk, chunk).await,
            Frame::ResponseChunk(chunk) => {
                self.write_chunk(FrameType::ResponseChunk, chunk).await
            }
            Frame::TunnelChunk(chunk) => self.write_chunk(FrameType::TunnelChunk, chunk).await,
            other => {
                self.scratch.clear();
                self.scratch.put_u32(0);
                other.encode(&mut self.scratch)?;
                self.finish_scratch().await
            }
        }
    }

    /// Write a request, response or tunnel chunk frame.
    pub async fn write_chunk(&mut self, kind: FrameType, chunk: &[u8]) -> Result<()> {
        if !matches!(
            kind,
            FrameType::RequestChunk | FrameType::ResponseChunk | FrameType::TunnelChunk
        ) {
            return Err(FrameError::UnexpectedFrameType {
                expected: "chunk",
                found: kind.as_u8(),
            });
        }
        let chunk_len =
            u32::try_from(chunk.len()).map_err(|_| FrameError::FieldTooLong { field: "chunk" })?;
        let frame_len = FRAME_HEADER_SIZE + 4 + chunk.len();
        self.config.check_frame_len(frame_len)?;

        let mut head = [0u8; LENGTH_PREFIX_SIZE + FRAME_HEADER_SIZE + 4];
        head[..4].copy_from_slice(&length_prefix(frame_len)?);
        head[4] = PROTOCOL_VERSION;
        head[5] = kind.as_u8();
        head[6..].copy_from_slice(&chunk_len.to_be_bytes());

        if frame_len <= self.config.coalesce_threshold {
            self.scratch.clear();
            self.scratch.put_slice(&head);
            self.scratch.put_slice(chunk);
            self.inner.write_all(&self.scratch).await?;
        } else {
            write_all_vectored(&mut self.inner, &[&head[..4], &head[4..], chunk]).await?;
        }
        trace!(frame_type = kind.name(), bytes = chunk.len(), "wrote bridge chunk");
        self.flush().await
    }

    /// Write a complete response frame without copying a large body.
    pub async fn write_response(
        &mut self,
        status: u16,
        headers: &[(String, String)],
        body: &[u8],
    ) -> Result<()> {
        self.scratch.clear();
        self.scratch.put_u32(0);
        encode_response_prefix(status, headers, body.len(), &mut self.scratch)?;
        let prefix_len = self.scratch.len() - LENGTH_PREFIX_SIZE;
        let frame_len = prefix_len + body.len();
        self.config.check_frame_len(frame_len)?;
        self.scratch[..LENGTH_PREFIX_SIZE].copy_from_slice(&length_prefix(frame_len)?);

        if frame_len <= self.config.coalesce_threshold {
            self.scratch.put_slice(body);
            self.inner.write_all(&self.scratch).await?;
        } else {
            let (prefix, fields) = self.scratch.split_at(LENGTH_PREFIX_SIZE);
            write_all_vectored(&mut self.inner, &[prefix, fields, body]).await?;
        }
        trace!(status, bytes = body.len(), "wrote bridge response");
        self.flush().await
    }

    /// Write a request-end, response-end or tunnel-close marker.
    pub async fn write_marker(&mut self, kind: FrameType) -> Result<()> {
        self.scratch.clear();
        self.scratch.put_u32(0);
        crate::codec::encode_marker(kind, &mut self.scratch)?;
        self.finish_scratch().await
    }

    /// Patch the length of a frame encoded in `scratch` and write it.
    async fn finish_scratch(&mut self) -> Result<()> {
        let frame_len = self.scratch.len() - LENGTH_PREFIX_SIZE;
        self.config.check_frame_len(frame_len)?;
        self.scratch[..LENGTH_PREFIX_SIZE].copy_from_slice(&length_prefix(frame_len)?);
        self.inner.write_all(&self.scratch).await?;
        trace!(bytes = frame_len, "wrote bridge frame");
        self.flush().await
    }

    /// Flush the underlying stream.
    pub async fn flush(&mut self) -> Result<()> {
        self.inner.flush().await.map_err(FrameError::Io)
    }

    /// Shut down the write half of the underlying stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await.map_err(FrameError::Io)
    }

    /// Borrow the underlying stream.
    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Mutably borrow the underlying stream.
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Consume the writer and return the inner stream.
    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Current frame writer configuration.
    pub fn config(&self) -> &FrameConfig {
        &self.config
    }
}

fn length_prefix(len: usize) -> Result<[u8; LENGTH_PREFIX_SIZE]> {
    let len = u32::try_from(len).map_err(|_| FrameError::FieldTooLong { field: "frame" })?;
    Ok(len.to_be_bytes())
}

/// Write every buffer in order, using vectored writes and resuming after
/// partial writes.
pub async fn write_all_vectored<W: AsyncWrite + Unpin + ?Sized>(
    writer: &mut W,
    buffers: &[&[u8]],
) -> io::Result<()> {
    let mut index = 0usize;
    let mut offset = 0usize;
    loop {
        while index < buffers.len() && offset == buffers[index].len() {
            index += 1;
            offset = 0;
        }
        if index >= buffers.len() {
            return Ok(());
        }

        let mut slices = Vec::with_capacity(buffers.len() - index);
        slices.push(IoSlice::new(&buffers[index][offset..]));
        slices.extend(buffers[index + 1..].iter().map(|b| IoSlice::new(b)));

        let written = writer.write_vectored(&slices).await?;
        if written == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "failed to write bridge frame bytes",
            ));
        }

        let mut remaining = written;
        while remaining > 0 && index < buffers.len() {
            let available = buffers[index].len() - offset;
            if remaining < available {
                offset += remaining;
                remaining = 0;
            } else {
                remaining -= available;
                index += 1;
                offset = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use bytes::Bytes;

    use super::*;
    use crate::codec::{ResponseFrame, DEFAULT_COALESCE_THRESHOLD};
    use crate::reader::FrameReader;

    /// Records each write call and accepts at most `max_per_call` bytes.
    #[derive(Default)]
    struct RecordingWriter {
        bytes: Vec<u8>,
        calls: Vec<usize>,
        vectored_slices: Vec<usize>,
        max_per_call: Option<usize>,
    }

    impl RecordingWriter {
        fn limited(max_per_call: usize) -> Self {
            Self {
                max_per_call: Some(max_per_call),
                ..Self::default()
            }
        }

        fn accept(&mut self, data: &[u8]) -> usize {
            let n = self.max_per_call.map_or(data.len(), |max| data.len().min(max));
            self.bytes.extend_from_slice(&data[..n]);
            self.calls.push(n);
            n
        }
    }

    impl AsyncWrite for RecordingWriter {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(self.accept(buf)))
        }

        fn poll_write_vectored(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            bufs: &[IoSlice<'_>],
        ) -> Poll<io::Result<usize>> {
            self.vectored_slices.push(bufs.len());
            let joined: Vec<u8> = bufs.iter().flat_map(|b| b.iter().copied()).collect();
            Poll::Ready(Ok(self.accept(&joined)))
        }

        fn is_write_vectored(&self) -> bool {
            true
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    async fn decode_all(bytes: Vec<u8>) -> Vec<Frame> {
        let mut reader = FrameReader::new(&bytes[..]);
        let mut frames = Vec::new();
        while let Some(frame) = reader.read_frame().await.unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[tokio::test]
    async fn small_chunk_is_one_write() {
        let mut writer = FrameWriter::new(RecordingWriter::default());
        writer
            .write_chunk(FrameType::ResponseChunk, b"tiny")
            .await
            .unwrap();

        let sink = writer.into_inner();
        assert_eq!(sink.calls.len(), 1);
        assert!(sink.vectored_slices.is_empty());
        assert_eq!(
            decode_all(sink.bytes).await,
            vec![Frame::ResponseChunk(Bytes::from_static(b"tiny"))]
        );
    }

    #[tokio::test]
    async fn large_chunk_is_vectored() {
        let body = vec![0xAB; DEFAULT_COALESCE_THRESHOLD * 2];
        let mut writer = FrameWriter::new(RecordingWriter::default());
        writer
            .write_chunk(FrameType::TunnelChunk, &body)
            .await
            .unwrap();

        let sink = writer.into_inner();
        assert_eq!(sink.vectored_slices, vec![3]);
        assert_eq!(
            decode_all(sink.bytes).await,
            vec![Frame::TunnelChunk(Bytes::from(body))]
        );
    }

    #[tokio::test]
    async fn large_response_splits_prefix_from_body() {
        let body = vec![b'x'; DEFAULT_COALESCE_THRESHOLD + 1];
        let headers = vec![("content-type".to_string(), "text/plain".to_string())];
        let mut writer = FrameWriter::new(RecordingWriter::default());
        writer.write_response(200, &headers, &body).await.unwrap();

        let sink = writer.into_inner();
        assert_eq!(sink.vectored_slices, vec![3]);
        assert_eq!(
            decode_all(sink.bytes).await,
            vec![Frame::Response(ResponseFrame {
                status: 200,
                headers,
                body: Bytes::from(body),
            })]
        );
    }

    #[tokio::test]
    async fn small_response_is_coalesced() {
        let mut writer = FrameWriter::new(RecordingWriter::default());
        writer.write_response(204, &[], b"").await.unwrap();
        let sink = writer.into_inner();
        assert_eq!(sink.calls.len(), 1);
        assert!(sink.vectored_slices.is_empty());
    }

    #[tokio::test]
    async fn partial_writes_resume_in_order() {
        let body: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let mut writer = FrameWriter::new(RecordingWriter::limited(7));
        writer
            .write_chunk(FrameType::RequestChunk, &body)
            .await
            .unwrap();
        writer.write_marker(FrameType::RequestEnd).await.unwrap();

        let sink = writer.into_inner();
        assert!(sink.calls.iter().all(|&n| n <= 7));
        assert_eq!(
            decode_all(sink.bytes).await,
            vec![Frame::RequestChunk(Bytes::from(body)), Frame::RequestEnd]
        );
    }

    #[tokio::test]
    async fn oversized_frame_is_not_written() {
        let config = FrameConfig {
            max_frame_bytes: 32,
            ..FrameConfig::default()
        };
        let mut writer = FrameWriter::with_config(RecordingWriter::default(), config);
        let err = writer
            .write_chunk(FrameType::ResponseChunk, &[0u8; 64])
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge { size: 70, max: 32 }));

        let err = writer.write_payload(&[0u8; 33]).await.unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge { .. }));
        assert!(writer.get_ref().bytes.is_empty());
    }

    #[tokio::test]
    async fn marker_kind_is_checked() {
        let mut writer = FrameWriter::new(RecordingWriter::default());
        assert!(writer.write_marker(FrameType::Request).await.is_err());
        assert!(writer
            .write_chunk(FrameType::ResponseEnd, b"x")
            .await
            .is_err());
        assert!(writer.get_ref().bytes.is_empty());
    }

    #[tokio::test]
    async fn frames_cross_a_duplex_stream() {
        let (client, server) = tokio::io::duplex(1024);
        let frames = vec![
            Frame::ResponseStart(crate::codec::ResponseHead {
                status: 201,
                headers: vec![("location".into(), "/upload/1".into())],
            }),
            Frame::ResponseChunk(Bytes::from(vec![5u8; 20_000])),
            Frame::ResponseEnd,
        ];

        let expected = frames.clone();
        let send = tokio::spawn(async move {
            let mut writer = FrameWriter::new(client);
            for frame in &frames {
                writer.write_frame(frame).await.unwrap();
            }
            writer.shutdown().await.unwrap();
        });

        let mut reader = FrameReader::new(server);
        let mut received = Vec::new();
        while let Some(frame) = reader.read_frame().await.unwrap() {
            received.push(frame);
        }
        send.await.unwrap();
        assert_eq!(received, expected);
    }

    #[tokio::test]
    async fn raw_payload_round_trips() {
        let payload = Frame::TunnelClose.to_bytes().unwrap();
        let mut writer = FrameWriter::new(RecordingWriter::default());
        writer.write_payload(&payload).await.unwrap();
        assert_eq!(
            decode_all(writer.into_inner().bytes).await,
            vec![Frame::TunnelClose]
        );
    }
}
