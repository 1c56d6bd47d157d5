//! Framed stream bus
//!
//! Carries topic-addressed frames over any byte stream, typically a socket
//! to a relay that fans frames out to the other processes. Each frame is a
//! length + CRC32 header followed by the body:
//!
//! ```text
//! | length: u32 LE | crc32: u32 LE | topic_len: u16 LE | topic | payload |
//! ```

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};

use super::{Bus, Subscribers, Subscription};
use crate::error::{Error, Result};

/// Largest accepted frame body
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Frame header for length-prefixed messages
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Body length
    pub length: u32,
    /// Body checksum
    pub checksum: u32,
}

impl FrameHeader {
    /// Header size in bytes
    pub const SIZE: usize = 8;

    /// Create a new frame header
    pub fn new(data: &[u8]) -> Self {
        Self {
            length: data.len() as u32,
            checksum: crc32fast::hash(data),
        }
    }

    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..4].copy_from_slice(&self.length.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.checksum.to_le_bytes());
        bytes
    }

    /// Deserialize header from bytes
    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        let [l0, l1, l2, l3, c0, c1, c2, c3] = *bytes;
        Self {
            length: u32::from_le_bytes([l0, l1, l2, l3]),
            checksum: u32::from_le_bytes([c0, c1, c2, c3]),
        }
    }
}

/// A topic-addressed payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub topic: String,
    pub payload: Bytes,
}

/// Codec for [`Frame`]s. Frames failing their checksum are skipped.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    /// Decode one frame body that has already passed length framing
    fn decode_body(header: FrameHeader, mut body: Bytes) -> Result<Frame> {
        if crc32fast::hash(&body) != header.checksum {
            return Err(Error::Codec("Frame checksum mismatch".into()));
        }
        if body.len() < 2 {
            return Err(Error::Codec("Frame too short for topic".into()));
        }
        let topic_len = body.get_u16_le() as usize;
        if body.len() < topic_len {
            return Err(Error::Codec("Frame topic overruns body".into()));
        }
        let topic = body.split_to(topic_len);
        let topic = String::from_utf8(topic.to_vec())
            .map_err(|_| Error::Codec("Frame topic is not UTF-8".into()))?;
        Ok(Frame {
            topic,
            payload: body,
        })
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            if src.len() < FrameHeader::SIZE {
                return Ok(None);
            }

            let mut header_bytes = [0u8; FrameHeader::SIZE];
            header_bytes.copy_from_slice(&src[..FrameHeader::SIZE]);
            let header = FrameHeader::from_bytes(&header_bytes);
            let length = header.length as usize;

            if length > MAX_FRAME_LEN {
                return Err(Error::Codec(format!("Frame of {} bytes exceeds limit", length)));
            }

            if src.len() < FrameHeader::SIZE + length {
                src.reserve(FrameHeader::SIZE + length - src.len());
                return Ok(None);
            }

            src.advance(FrameHeader::SIZE);
            let body = src.split_to(length).freeze();

            match Self::decode_body(header, body) {
                Ok(frame) => return Ok(Some(frame)),
                Err(e) => tracing::warn!("Dropping frame: {}", e),
            }
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<()> {
        let topic = frame.topic.as_bytes();
        if topic.len() > u16::MAX as usize {
            return Err(Error::Codec("Topic too long".into()));
        }

        let mut body = BytesMut::with_capacity(2 + topic.len() + frame.payload.len());
        body.put_u16_le(topic.len() as u16);
        body.put_slice(topic);
        body.put_slice(&frame.payload);

        if body.len() > MAX_FRAME_LEN {
            return Err(Error::Codec(format!("Frame of {} bytes exceeds limit", body.len())));
        }

        let header = FrameHeader::new(&body);
        dst.reserve(FrameHeader::SIZE + body.len());
        dst.put_slice(&header.to_bytes());
        dst.put_slice(&body);
        Ok(())
    }
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Bus over a single framed byte stream
pub struct StreamBus {
    writer: Mutex<FramedWrite<BoxedWriter, FrameCodec>>,
    subscribers: Arc<RwLock<Subscribers>>,
    reader: JoinHandle<()>,
}

impl StreamBus {
    /// Wrap `stream`, spawning the inbound dispatch task
    pub fn new<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let subscribers = Arc::new(RwLock::new(Subscribers::default()));

        let inbound = Arc::clone(&subscribers);
        let reader = tokio::spawn(async move {
            let mut frames = FramedRead::new(read_half, FrameCodec);
            while let Some(result) = frames.next().await {
                match result {
                    Ok(frame) => {
                        inbound.write().await.deliver(&frame.topic, &frame.payload);
                    }
                    Err(e) => {
                        tracing::warn!("Stream bus closed after read error: {}", e);
                        break;
                    }
                }
            }
            tracing::debug!("Stream bus reader finished");
        });

        let writer: BoxedWriter = Box::new(write_half);
        Self {
            writer: Mutex::new(FramedWrite::new(writer, FrameCodec)),
            subscribers,
            reader,
        }
    }
}

#[async_trait::async_trait]
impl Bus for StreamBus {
    async fn broadcast(&self, topic: &str, payload: Bytes) -> Result<()> {
        let frame = Frame {
            topic: topic.to_string(),
            payload,
        };
        self.writer
            .lock()
            .await
            .send(frame)
            .await
            .map_err(|e| Error::Transport(format!("Failed to write frame on {}: {}", topic, e)))
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription> {
        Ok(self.subscribers.write().await.add(topic))
    }
}

impl Drop for StreamBus {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl std::fmt::Debug for StreamBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBus").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(topic: &str, payload: &'static [u8]) -> Frame {
        Frame {
            topic: topic.into(),
            payload: Bytes::from_static(payload),
        }
    }

    #[test]
    fn test_frame_header() {
        let data = b"test message data";
        let header = FrameHeader::new(data);
        let bytes = header.to_bytes();
        let restored = FrameHeader::from_bytes(&bytes);

        assert_eq!(header, restored);
    }

    #[test]
    fn test_codec_handles_partial_input() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(frame("wolfcache:a", b"hello"), &mut buf).unwrap();

        let mut partial = buf.split_to(5);
        assert!(codec.decode(&mut partial).unwrap().is_none());
        partial.unsplit(buf);
        assert_eq!(codec.decode(&mut partial).unwrap(), Some(frame("wolfcache:a", b"hello")));
        assert!(partial.is_empty());
    }

    #[test]
    fn test_codec_skips_corrupt_frame() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::new();
        codec.encode(frame("t", b"bad"), &mut buf).unwrap();
        let last = buf.len() - 1;
        buf[last] ^= 0xff;
        codec.encode(frame("t", b"good"), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(frame("t", b"good")));
    }

    #[test]
    fn test_checksum_mismatch_is_codec_error() {
        let body = Bytes::from_static(b"\x01\x00tpayload");
        let mut header = FrameHeader::new(&body);
        header.checksum ^= 1;
        assert!(matches!(FrameCodec::decode_body(header, body), Err(Error::Codec(_))));
    }

    #[tokio::test]
    async fn test_stream_bus_both_directions() {
        let (local, remote) = tokio::io::duplex(4096);
        let bus = StreamBus::new(local);
        let mut sub = bus.subscribe("wolfcache:s").await.unwrap();

        let (remote_read, remote_write) = tokio::io::split(remote);
        let mut remote_in = FramedRead::new(remote_read, FrameCodec);
        let mut remote_out = FramedWrite::new(remote_write, FrameCodec);

        bus.broadcast("wolfcache:s", Bytes::from_static(b"out")).await.unwrap();
        let sent = remote_in.next().await.unwrap().unwrap();
        assert_eq!(sent, frame("wolfcache:s", b"out"));

        remote_out.send(frame("wolfcache:s", b"in")).await.unwrap();
        remote_out.send(frame("elsewhere", b"skip")).await.unwrap();
        assert_eq!(sub.recv().await.unwrap(), Bytes::from_static(b"in"));
    }
}
