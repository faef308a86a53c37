//! The native side of one exchange, for `send` and `probe`.

use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use tokio::io::{split, AsyncRead, AsyncWrite};
use tracing::debug;

use bridgewire_frame::{split_chunks, Frame, FrameReader, FrameWriter, RequestFrame, RequestHead};
use bridgewire_transport::BridgeEndpoint;

use crate::exit::{
    frame_error, transport_error, CliError, CliResult, DATA_INVALID, FAILURE, TIMEOUT, USAGE,
};
use crate::output::ResponseSummary;

/// How the request body goes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    Single,
    Streamed { chunk_size: usize },
}

/// Connect, send one request, and collect the response.
pub async fn exchange(
    endpoint: &BridgeEndpoint,
    head: RequestHead,
    body: Bytes,
    mode: BodyMode,
    timeout: Duration,
) -> CliResult<ResponseSummary> {
    let attempt = async {
        let stream = endpoint
            .connect()
            .await
            .map_err(|err| transport_error("connect failed", err))?;
        debug!(%endpoint, "connected");
        exchange_on(stream, head, body, mode).await
    };
    tokio::time::timeout(timeout, attempt).await.map_err(|_| {
        CliError::new(
            TIMEOUT,
            format!("no response from {endpoint} within {timeout:?}"),
        )
    })?
}

/// Run one exchange over an already connected stream.
pub async fn exchange_on<S>(
    stream: S,
    head: RequestHead,
    body: Bytes,
    mode: BodyMode,
) -> CliResult<ResponseSummary>
where
    S: AsyncRead + AsyncWrite,
{
    let (read_half, write_half) = split(stream);
    let mut reader = FrameReader::new(read_half);
    let mut writer = FrameWriter::new(write_half);
    let started = Instant::now();

    let send = |err| frame_error("send failed", err);
    match mode {
        BodyMode::Single => {
            writer
                .write_frame(&Frame::Request(RequestFrame { head, body }))
                .await
                .map_err(send)?;
        }
        BodyMode::Streamed { chunk_size } => {
            writer
                .write_frame(&Frame::RequestStart(head))
                .await
                .map_err(send)?;
            for chunk in split_chunks(body, chunk_size) {
                writer
                    .write_frame(&Frame::RequestChunk(chunk))
                    .await
                    .map_err(send)?;
            }
            writer
                .write_frame(&Frame::RequestEnd)
                .await
                .map_err(send)?;
        }
    }

    let mut frames = 1usize;
    let first = next_frame(&mut reader).await?;
    let summary = match first {
        Frame::Response(response) => ResponseSummary {
            status: response.status,
            headers: response.headers,
            body: response.body,
            frames,
            streamed: false,
            elapsed: started.elapsed(),
        },
        Frame::ResponseStart(start) => {
            let mut collected = BytesMut::new();
            loop {
                let frame = next_frame(&mut reader).await?;
                frames += 1;
                match frame {
                    Frame::ResponseChunk(chunk) => collected.extend_from_slice(&chunk),
                    Frame::ResponseEnd => break,
                    other => return Err(unexpected(&other)),
                }
            }
            ResponseSummary {
                status: start.status,
                headers: start.headers,
                body: collected.freeze(),
                frames,
                streamed: true,
                elapsed: started.elapsed(),
            }
        }
        other => return Err(unexpected(&other)),
    };
    Ok(summary)
}

async fn next_frame<R: AsyncRead + Unpin>(reader: &mut FrameReader<R>) -> CliResult<Frame> {
    reader
        .read_frame()
        .await
        .map_err(|err| frame_error("receive failed", err))?
        .ok_or_else(|| CliError::new(FAILURE, "bridge closed before the response ended"))
}

fn unexpected(frame: &Frame) -> CliError {
    CliError::new(
        DATA_INVALID,
        format!("unexpected {} frame in response", frame.frame_type().name()),
    )
}

/// Parse `name: value` (or `name=value`).
pub fn parse_header(input: &str) -> CliResult<(String, String)> {
    let (name, value) = input
        .split_once(':')
        .or_else(|| input.split_once('='))
        .ok_or_else(|| {
            CliError::new(
                USAGE,
                format!("header must look like `name: value`: {input}"),
            )
        })?;
    let name = name.trim();
    if name.is_empty() {
        return Err(CliError::new(
            USAGE,
            format!("header name must not be empty: {input}"),
        ));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use bridgewire_frame::ResponseHead;

    use super::*;

    #[test]
    fn headers_parse_with_colon_or_equals() {
        assert_eq!(
            parse_header("Content-Type: text/plain").unwrap(),
            ("Content-Type".to_string(), "text/plain".to_string())
        );
        assert_eq!(
            parse_header("x-id=7").unwrap(),
            ("x-id".to_string(), "7".to_string())
        );
        assert!(parse_header("novalue").is_err());
        assert!(parse_header(": empty").is_err());
    }

    #[tokio::test]
    async fn streamed_exchange_collects_chunks() {
        let (client, server) = tokio::io::duplex(4096);
        let native = tokio::spawn(async move {
            let (read_half, write_half) = split(server);
            let mut reader = FrameReader::new(read_half);
            let mut writer = FrameWriter::new(write_half);
            let mut seen = Vec::new();
            loop {
                let frame = reader.read_frame().await.unwrap().unwrap();
                let done = frame == Frame::RequestEnd;
                seen.push(frame);
                if done {
                    break;
                }
            }
            writer
                .write_frame(&Frame::ResponseStart(ResponseHead {
                    status: 202,
                    headers: Vec::new(),
                }))
                .await
                .unwrap();
            writer
                .write_frame(&Frame::ResponseChunk(Bytes::from_static(b"ok")))
                .await
                .unwrap();
            writer.write_frame(&Frame::ResponseEnd).await.unwrap();
            seen
        });

        let summary = exchange_on(
            client,
            RequestHead::new("POST", "/up"),
            Bytes::from_static(b"abcde"),
            BodyMode::Streamed { chunk_size: 2 },
        )
        .await
        .unwrap();

        assert_eq!(summary.status, 202);
        assert_eq!(summary.body, Bytes::from_static(b"ok"));
        assert_eq!(summary.frames, 3);
        assert!(summary.streamed);

        let seen = native.await.unwrap();
        assert_eq!(seen.len(), 5);
        assert_eq!(seen[1], Frame::RequestChunk(Bytes::from_static(b"ab")));
        assert_eq!(seen[3], Frame::RequestChunk(Bytes::from_static(b"e")));
    }

    #[tokio::test]
    async fn early_close_is_a_failure() {
        let (client, server) = tokio::io::duplex(4096);
        drop(server);
        let err = exchange_on(
            client,
            RequestHead::new("GET", "/"),
            Bytes::new(),
            BodyMode::Single,
        )
        .await
        .unwrap_err();
        assert_ne!(err.code, 0);
    }
}
