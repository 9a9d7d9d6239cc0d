/*!
Transport between the bridge and the control-plane server.

The core only sees the [`Transport`] trait: a one-shot registration send,
a non-blocking push per acquired data frame, and an error report channel.
[`TcpTransport`] implements it over a single TCP connection using a small
length-prefixed framing:

```text
[kind: u8][payload length: u32 little-endian][payload]
```

Inbound `Control` payloads are handed to the [`ControlInbox`] untouched.
*/

use crate::config::NetworkConfig;
use crate::control::ControlInbox;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Bytes of `[kind][length]` in front of every payload
pub const HEADER_LEN: usize = 5;

/// Kernel send buffer for the data stream
const SEND_BUFFER_BYTES: usize = 1024 * 1024;

/// Errors raised by a transport
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),

    #[error("transport closed")]
    Closed,

    #[error("send queue full, frame dropped")]
    QueueFull,

    #[error("message of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("unknown message kind {0:#04x}")]
    UnknownKind(u8),
}

/// What the core needs from the network side
pub trait Transport: Send + Sync {
    /// Send a blob once, e.g. the device descriptor at registration
    fn send_bytes(&self, blob: &[u8]) -> Result<(), TransportError>;

    /// Hand over one serialized data frame; must not block
    fn push_frame(&self, blob: Vec<u8>) -> Result<(), TransportError>;

    /// Surface a protocol-level failure to the operator
    fn report_error(&self, message: &str);
}

/// Message kinds on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Descriptor = 1,
    Data = 2,
    Error = 3,
    Control = 4,
}

impl MessageKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Descriptor),
            2 => Some(Self::Data),
            3 => Some(Self::Error),
            4 => Some(Self::Control),
            _ => None,
        }
    }
}

/// Prefix a payload with its kind and length
pub fn encode_message(kind: MessageKind, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(kind as u8);
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Splits a byte stream back into messages
#[derive(Debug, Clone, Copy)]
pub struct MessageDecoder {
    max_payload: usize,
}

impl MessageDecoder {
    pub fn new(max_payload: usize) -> Self {
        Self { max_payload }
    }

    /// Take one complete message off the front of `buf`, if there is one
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<(MessageKind, Bytes)>, TransportError> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let kind = buf[0];
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&buf[1..HEADER_LEN]);
        let len = u32::from_le_bytes(len_bytes) as usize;

        if len > self.max_payload {
            return Err(TransportError::FrameTooLarge { len, max: self.max_payload });
        }
        if buf.len() < HEADER_LEN + len {
            buf.reserve(HEADER_LEN + len - buf.len());
            return Ok(None);
        }

        buf.advance(HEADER_LEN);
        let payload = buf.split_to(len).freeze();
        let kind = MessageKind::from_u8(kind).ok_or(TransportError::UnknownKind(kind))?;
        Ok(Some((kind, payload)))
    }
}

/// Producer side of the outbound message queue.
///
/// Only registration waits for queue space. Data frames and error reports
/// come from the real-time threads and are dropped when the queue is full.
pub struct OutboundQueue {
    tx: mpsc::Sender<Bytes>,
    dropped_frames: AtomicU64,
    dropped_reports: AtomicU64,
}

impl OutboundQueue {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            tx,
            dropped_frames: AtomicU64::new(0),
            dropped_reports: AtomicU64::new(0),
        }
    }

    /// Queue a message, waiting for space; must not be called from the runtime
    fn send_blocking(&self, kind: MessageKind, payload: &[u8]) -> Result<(), TransportError> {
        self.tx
            .blocking_send(encode_message(kind, payload))
            .map_err(|_| TransportError::Closed)
    }

    /// Queue a message if there is room right now
    fn try_send(&self, kind: MessageKind, payload: &[u8]) -> Result<(), TransportError> {
        match self.tx.try_send(encode_message(kind, payload)) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => Err(TransportError::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(TransportError::Closed),
        }
    }

    pub fn push_frame(&self, blob: &[u8]) -> Result<(), TransportError> {
        let result = self.try_send(MessageKind::Data, blob);
        if matches!(result, Err(TransportError::QueueFull)) {
            self.dropped_frames.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    pub fn report_error(&self, message: &str) {
        if let Err(e) = self.try_send(MessageKind::Error, message.as_bytes()) {
            if matches!(e, TransportError::QueueFull) {
                self.dropped_reports.fetch_add(1, Ordering::Relaxed);
            }
            warn!("Could not report '{}': {}", message, e);
        }
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    pub fn dropped_reports(&self) -> u64 {
        self.dropped_reports.load(Ordering::Relaxed)
    }
}

/// TCP client transport running on its own tokio runtime
pub struct TcpTransport {
    outbound: OutboundQueue,
    connected: Arc<AtomicBool>,
    _runtime: Runtime,
}

impl TcpTransport {
    /// Connect to the server and start the reader and writer tasks
    pub fn connect(config: &NetworkConfig, inbox: ControlInbox) -> Result<Self, TransportError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("stimbridge-net")
            .enable_all()
            .build()?;

        let endpoint = config.endpoint();
        info!("🔌 Connecting to control-plane server at {}", endpoint);

        let connect = runtime.block_on(async {
            tokio::time::timeout(config.connect_timeout(), TcpStream::connect(&endpoint)).await
        });
        let stream = connect.map_err(|_| TransportError::ConnectTimeout(endpoint.clone()))??;

        stream.set_nodelay(true)?;
        let sock_ref = socket2::SockRef::from(&stream);
        sock_ref.set_send_buffer_size(SEND_BUFFER_BYTES)?;
        sock_ref.set_keepalive(true)?;
        info!("✅ Connected to {}", endpoint);

        let (reader, writer) = stream.into_split();
        let (outbound, outbound_rx) = mpsc::channel(config.send_queue_size.max(1));
        let connected = Arc::new(AtomicBool::new(true));

        runtime.spawn(write_loop(writer, outbound_rx, Arc::clone(&connected)));
        runtime.spawn(read_loop(
            reader,
            MessageDecoder::new(config.max_frame_bytes),
            inbox,
            Arc::clone(&connected),
        ));

        Ok(Self {
            outbound: OutboundQueue::new(outbound),
            connected,
            _runtime: runtime,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Data frames dropped because the send queue was full
    pub fn dropped_frames(&self) -> u64 {
        self.outbound.dropped_frames()
    }

    /// Error reports dropped because the send queue was full
    pub fn dropped_reports(&self) -> u64 {
        self.outbound.dropped_reports()
    }
}

impl Transport for TcpTransport {
    fn send_bytes(&self, blob: &[u8]) -> Result<(), TransportError> {
        self.outbound.send_blocking(MessageKind::Descriptor, blob)
    }

    fn push_frame(&self, blob: Vec<u8>) -> Result<(), TransportError> {
        self.outbound.push_frame(&blob)
    }

    fn report_error(&self, message: &str) {
        self.outbound.report_error(message);
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut outbound: mpsc::Receiver<Bytes>, connected: Arc<AtomicBool>) {
    while let Some(message) = outbound.recv().await {
        if let Err(e) = writer.write_all(&message).await {
            error!("❌ Send failed: {}", e);
            break;
        }
    }
    connected.store(false, Ordering::SeqCst);
    debug!("Writer task stopped");
}

async fn read_loop(mut reader: OwnedReadHalf, decoder: MessageDecoder, inbox: ControlInbox, connected: Arc<AtomicBool>) {
    let mut buf = BytesMut::with_capacity(8192);

    'read: loop {
        match reader.read_buf(&mut buf).await {
            Ok(0) => {
                info!("Server closed the connection");
                break;
            }
            Ok(_) => loop {
                match decoder.decode(&mut buf) {
                    Ok(Some((MessageKind::Control, payload))) => {
                        inbox.deliver(&payload, payload.len());
                    }
                    Ok(Some((kind, payload))) => {
                        warn!("Ignoring unexpected {:?} message ({} bytes)", kind, payload.len());
                    }
                    Ok(None) => break,
                    Err(TransportError::UnknownKind(kind)) => {
                        warn!("Skipping message of unknown kind {:#04x}", kind);
                    }
                    Err(e) => {
                        error!("❌ Inbound stream unusable: {}", e);
                        break 'read;
                    }
                }
            },
            Err(e) => {
                error!("❌ Receive failed: {}", e);
                break;
            }
        }
    }

    connected.store(false, Ordering::SeqCst);
}

/// In-memory transport for tests
#[cfg(test)]
pub mod testing {
    use super::{Transport, TransportError};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct RecordingTransport {
        pub sent: Mutex<Vec<Vec<u8>>>,
        pub frames: Mutex<Vec<Vec<u8>>>,
        pub errors: Mutex<Vec<String>>,
        pub reject_frames: AtomicBool,
    }

    impl RecordingTransport {
        pub fn frame_count(&self) -> usize {
            self.frames.lock().unwrap().len()
        }

        pub fn errors(&self) -> Vec<String> {
            self.errors.lock().unwrap().clone()
        }
    }

    impl Transport for RecordingTransport {
        fn send_bytes(&self, blob: &[u8]) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(blob.to_vec());
            Ok(())
        }

        fn push_frame(&self, blob: Vec<u8>) -> Result<(), TransportError> {
            if self.reject_frames.load(Ordering::SeqCst) {
                return Err(TransportError::QueueFull);
            }
            self.frames.lock().unwrap().push(blob);
            Ok(())
        }

        fn report_error(&self, message: &str) {
            self.errors.lock().unwrap().push(message.to_string());
        }
    }
}
