//! The narrow transport boundary the driver consumes.
//!
//! The core hands frames down and receives frames up; discovery, connection
//! establishment, back-pressure and retry all live in the adapter behind
//! [`FrameTransport`]. Framing is a 4-byte big-endian length prefix with a
//! 1 MiB ceiling. Traffic padding is applied and stripped at this boundary
//! only: [`pad_payload`] rounds a payload up to a configured boundary before
//! framing, [`unpad_payload`] recovers the original bytes on the receiving
//! side. Both ends of a link must agree on whether padding is in use.

use crate::error::{HandshakeError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use skybridge_core::DeviceId;
use std::collections::HashMap;
use std::sync::Arc;

/// Maximum frame payload length.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Sends one framed payload to a peer.
#[async_trait]
pub trait FrameTransport: Send + Sync {
    /// Delivers `payload` to `peer`. The payload is the unframed message;
    /// the adapter applies length framing (and padding, when configured).
    async fn send(&self, peer: &DeviceId, payload: Vec<u8>) -> Result<()>;
}

/// Receives unframed payloads from the transport.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Called once per complete inbound frame.
    async fn on_frame(&self, from: &DeviceId, payload: Vec<u8>);
}

/// Applies the length prefix to a payload.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(HandshakeError::Transport(format!(
            "frame of {} bytes exceeds the {MAX_FRAME_LEN} byte limit",
            payload.len()
        )));
    }
    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Pads a payload up to the next multiple of `boundary`.
///
/// The padded form is `inner_len:u32be || payload || zero fill`, so message
/// sizes on the wire only reveal the boundary multiple. The result still
/// travels inside a normal length-prefixed frame.
pub fn pad_payload(payload: &[u8], boundary: usize) -> Result<Vec<u8>> {
    if boundary == 0 {
        return Err(HandshakeError::Transport(
            "padding boundary must be non-zero".into(),
        ));
    }
    let raw_len = payload.len() + 4;
    let padded_len = (raw_len + boundary - 1) / boundary * boundary;
    if padded_len > MAX_FRAME_LEN {
        return Err(HandshakeError::Transport(format!(
            "padded frame of {padded_len} bytes exceeds the {MAX_FRAME_LEN} byte limit"
        )));
    }
    let mut out = Vec::with_capacity(padded_len);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    out.resize(padded_len, 0);
    Ok(out)
}

/// Strips traffic padding applied by [`pad_payload`].
pub fn unpad_payload(padded: &[u8]) -> Result<Vec<u8>> {
    if padded.len() < 4 {
        return Err(HandshakeError::Transport(
            "padded payload shorter than its length prefix".into(),
        ));
    }
    let inner_len = u32::from_be_bytes([padded[0], padded[1], padded[2], padded[3]]) as usize;
    if padded.len() - 4 < inner_len {
        return Err(HandshakeError::Transport(format!(
            "padded payload of {} bytes claims {inner_len} inner bytes",
            padded.len()
        )));
    }
    Ok(padded[4..4 + inner_len].to_vec())
}

/// Incremental decoder for a length-prefixed byte stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Creates an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds raw bytes; returns every frame completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<Vec<u8>>> {
        self.buf.extend_from_slice(bytes);
        let mut frames = Vec::new();
        loop {
            if self.buf.len() < 4 {
                break;
            }
            let len =
                u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
            if len > MAX_FRAME_LEN {
                return Err(HandshakeError::Transport(format!(
                    "inbound frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit"
                )));
            }
            if self.buf.len() < 4 + len {
                break;
            }
            let frame = self.buf[4..4 + len].to_vec();
            self.buf.drain(..4 + len);
            frames.push(frame);
        }
        Ok(frames)
    }
}

/// In-memory transport that delivers frames inline to registered handlers.
///
/// Delivery happens synchronously inside `send`, which reproduces the
/// tightest possible timing on a real link: a peer's answer can arrive
/// before the sender's own continuation runs.
#[derive(Default)]
pub struct MemoryTransport {
    handlers: Mutex<HashMap<DeviceId, Arc<dyn InboundHandler>>>,
    padding_boundary: Option<usize>,
}

impl MemoryTransport {
    /// Creates an empty transport without traffic padding.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Creates a transport that pads every payload to a multiple of
    /// `boundary` before framing, the way a production adapter consumes
    /// `HandshakeConfig::padding_boundary`.
    pub fn with_padding(boundary: usize) -> Arc<Self> {
        Arc::new(Self {
            handlers: Mutex::new(HashMap::new()),
            padding_boundary: Some(boundary),
        })
    }

    /// Registers the handler receiving frames addressed to `device`.
    pub fn register(&self, device: DeviceId, handler: Arc<dyn InboundHandler>) {
        self.handlers.lock().insert(device, handler);
    }

    /// Removes a handler.
    pub fn unregister(&self, device: &DeviceId) {
        self.handlers.lock().remove(device);
    }
}

#[async_trait]
impl FrameTransport for MemoryTransport {
    async fn send(&self, peer: &DeviceId, payload: Vec<u8>) -> Result<()> {
        // Pad, frame and immediately unframe, unpad: the wire treatment is
        // exercised on every delivery.
        let wire_payload = match self.padding_boundary {
            Some(boundary) => pad_payload(&payload, boundary)?,
            None => payload,
        };
        let frame = encode_frame(&wire_payload)?;
        let mut decoder = FrameDecoder::new();
        let mut frames = decoder.push(&frame)?;
        let received = frames.pop().expect("one frame per send");
        let payload = match self.padding_boundary {
            Some(_) => unpad_payload(&received)?,
            None => received,
        };

        let handler = self.handlers.lock().get(peer).cloned();
        match handler {
            Some(handler) => {
                handler.on_frame(peer, payload).await;
                Ok(())
            }
            None => Err(HandshakeError::Transport(format!(
                "no handler registered for {peer}"
            ))),
        }
    }
}

/// Transport that accepts every frame and drops it.
///
/// Stands in for a peer that never answers; timeout paths are tested with
/// it.
#[derive(Debug, Default, Clone)]
pub struct BlackholeTransport;

#[async_trait]
impl FrameTransport for BlackholeTransport {
    async fn send(&self, _peer: &DeviceId, payload: Vec<u8>) -> Result<()> {
        encode_frame(&payload)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let frame = encode_frame(b"hello").unwrap();
        assert_eq!(&frame[..4], &5u32.to_be_bytes());

        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(&frame).unwrap();
        assert_eq!(frames, vec![b"hello".to_vec()]);
    }

    #[test]
    fn decoder_handles_partial_and_coalesced_input() {
        let mut stream = Vec::new();
        stream.extend_from_slice(&encode_frame(b"one").unwrap());
        stream.extend_from_slice(&encode_frame(b"two").unwrap());

        let mut decoder = FrameDecoder::new();
        let (head, tail) = stream.split_at(5);
        assert!(decoder.push(head).unwrap().is_empty());
        assert_eq!(
            decoder.push(tail).unwrap(),
            vec![b"one".to_vec(), b"two".to_vec()]
        );
    }

    #[test]
    fn padding_rounds_up_and_strips_cleanly() {
        let payload = b"MessageA bytes";
        let padded = pad_payload(payload, 64).unwrap();
        assert_eq!(padded.len(), 64);
        assert_eq!(unpad_payload(&padded).unwrap(), payload);

        // Already on the boundary: no extra block is added.
        let exact = vec![0xAB; 60];
        let padded = pad_payload(&exact, 64).unwrap();
        assert_eq!(padded.len(), 64);
        assert_eq!(unpad_payload(&padded).unwrap(), exact);

        // Crossing the boundary grows by one block.
        let long = vec![0xCD; 61];
        assert_eq!(pad_payload(&long, 64).unwrap().len(), 128);
    }

    #[test]
    fn padding_rejects_bad_inputs() {
        assert!(pad_payload(b"payload", 0).is_err());
        assert!(pad_payload(&vec![0u8; MAX_FRAME_LEN], 64).is_err());

        assert!(unpad_payload(&[0, 0]).is_err());
        // Claims more inner bytes than are present.
        let mut bogus = 100u32.to_be_bytes().to_vec();
        bogus.extend_from_slice(&[0u8; 8]);
        assert!(unpad_payload(&bogus).is_err());
    }

    #[test]
    fn oversized_frames_are_rejected_both_ways() {
        let huge = vec![0u8; MAX_FRAME_LEN + 1];
        assert!(encode_frame(&huge).is_err());

        let mut decoder = FrameDecoder::new();
        let bad_header = ((MAX_FRAME_LEN + 1) as u32).to_be_bytes();
        assert!(decoder.push(&bad_header).is_err());
    }

    struct Recorder {
        frames: Mutex<Vec<Vec<u8>>>,
    }

    #[async_trait]
    impl InboundHandler for Recorder {
        async fn on_frame(&self, _from: &DeviceId, payload: Vec<u8>) {
            self.frames.lock().push(payload);
        }
    }

    #[tokio::test]
    async fn memory_transport_delivers_inline() {
        let transport = MemoryTransport::new();
        let recorder = Arc::new(Recorder {
            frames: Mutex::new(Vec::new()),
        });
        let device = DeviceId::new("receiver");
        transport.register(device.clone(), recorder.clone());

        transport.send(&device, b"frame-1".to_vec()).await.unwrap();
        assert_eq!(*recorder.frames.lock(), vec![b"frame-1".to_vec()]);

        let unknown = DeviceId::new("nobody");
        assert!(transport.send(&unknown, b"lost".to_vec()).await.is_err());
    }

    #[tokio::test]
    async fn padded_transport_delivers_original_payload() {
        let transport = MemoryTransport::with_padding(256);
        let recorder = Arc::new(Recorder {
            frames: Mutex::new(Vec::new()),
        });
        let device = DeviceId::new("padded-receiver");
        transport.register(device.clone(), recorder.clone());

        transport
            .send(&device, b"short handshake frame".to_vec())
            .await
            .unwrap();
        assert_eq!(*recorder.frames.lock(), vec![b"short handshake frame".to_vec()]);
    }
}
