use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::codec::{Frame, FrameConfig, LENGTH_PREFIX_SIZE};
use crate::error::{FrameError, Result};

/// `tokio_util` codec for bridge frames, for callers that prefer `Framed`.
///
/// Unlike [`FrameWriter`](crate::FrameWriter) this always copies the frame
/// into the output buffer, so it suits clients and tools rather than the
/// serving hot path.
#[derive(Debug, Clone, Default)]
pub struct BridgeCodec {
    config: FrameConfig,
}

impl BridgeCodec {
    pub fn new(config: FrameConfig) -> Self {
        Self { config }
    }
}

impl Decoder for BridgeCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        self.config.check_frame_len(len)?;

        let total = LENGTH_PREFIX_SIZE + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        let payload = src.split_to(len).freeze();
        Frame::decode(&payload).map(Some)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(FrameError::ConnectionClosed),
        }
    }
}

impl Encoder<Frame> for BridgeCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let start = dst.len();
        dst.put_u32(0);
        frame.encode(dst)?;
        let len = dst.len() - start - LENGTH_PREFIX_SIZE;
        if let Err(err) = self.config.check_frame_len(len) {
            dst.truncate(start);
            return Err(err);
        }
        dst[start..start + LENGTH_PREFIX_SIZE].copy_from_slice(&(len as u32).to_be_bytes());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use futures_util::{SinkExt, StreamExt};
    use tokio_util::codec::Framed;

    use super::*;
    use crate::codec::{RequestFrame, RequestHead};
    use crate::reader::FrameReader;

    #[tokio::test]
    async fn framed_sink_is_readable_by_frame_reader() {
        let (client, server) = tokio::io::duplex(4096);
        let request = Frame::Request(RequestFrame {
            head: RequestHead::new("GET", "/x").with_header("accept", "*/*"),
            body: Bytes::new(),
        });

        let mut framed = Framed::new(client, BridgeCodec::default());
        framed.send(request.clone()).await.unwrap();
        framed.send(Frame::RequestEnd).await.unwrap();
        drop(framed);

        let mut reader = FrameReader::new(server);
        assert_eq!(reader.read_frame().await.unwrap(), Some(request));
        assert_eq!(reader.read_frame().await.unwrap(), Some(Frame::RequestEnd));
        assert_eq!(reader.read_frame().await.unwrap(), None);
    }

    #[tokio::test]
    async fn framed_stream_decodes_frames() {
        let (client, server) = tokio::io::duplex(4096);
        let mut tx = Framed::new(client, BridgeCodec::default());
        let mut rx = Framed::new(server, BridgeCodec::default());

        tx.send(Frame::ResponseChunk(Bytes::from_static(b"ab")))
            .await
            .unwrap();
        tx.send(Frame::ResponseEnd).await.unwrap();

        assert_eq!(
            rx.next().await.unwrap().unwrap(),
            Frame::ResponseChunk(Bytes::from_static(b"ab"))
        );
        assert_eq!(rx.next().await.unwrap().unwrap(), Frame::ResponseEnd);
    }

    #[test]
    fn partial_input_waits_for_more() {
        let mut codec = BridgeCodec::default();
        let mut wire = BytesMut::new();
        codec.encode(Frame::TunnelClose, &mut wire).unwrap();

        let mut partial = BytesMut::from(&wire[..3]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.extend_from_slice(&wire[3..]);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(Frame::TunnelClose));
        assert!(partial.is_empty());
    }

    #[test]
    fn eof_mid_frame_is_an_error() {
        let mut codec = BridgeCodec::default();
        let mut partial = BytesMut::from(&[0u8, 0, 0, 9, 1][..]);
        assert!(matches!(
            codec.decode_eof(&mut partial),
            Err(FrameError::ConnectionClosed)
        ));
    }

    #[test]
    fn encoder_enforces_frame_limit() {
        let mut codec = BridgeCodec::new(FrameConfig {
            max_frame_bytes: 8,
            ..FrameConfig::default()
        });
        let mut dst = BytesMut::new();
        let err = codec
            .encode(Frame::ResponseChunk(Bytes::from_static(b"too long")), &mut dst)
            .unwrap_err();
        assert!(matches!(err, FrameError::FrameTooLarge { .. }));
        assert!(dst.is_empty());
    }
}
