use std::fmt;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::str::FromStr;
use std::sync::Arc;
use std::thread;

use crossbeam_channel::{unbounded, Receiver};
use harmoniq_plugin_db::PluginFormat;
use thiserror::Error;
use tracing::{debug, warn};

/// Upper bound for a single frame. Anything larger means the stream is out of
/// sync (or the peer is not a scanner at all).
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Status reported by the worker through `state:` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Ready,
    Scanning,
    Finished,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Scanning => "scanning",
            Self::Finished => "finished",
        }
    }
}

impl FromStr for WorkerState {
    type Err = ProtocolError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "ready" => Ok(Self::Ready),
            "scanning" => Ok(Self::Scanning),
            "finished" => Ok(Self::Finished),
            other => Err(ProtocolError::UnknownState(other.to_string())),
        }
    }
}

/// Messages exchanged between the scan master and its worker. On the wire
/// each one is `type:payload` in UTF-8.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Master to worker: scan these formats, by wire name.
    Scan(Vec<String>),
    /// Master to worker: exit now.
    Quit,
    State(WorkerState),
    /// Identifier about to be probed.
    Name(String),
    Progress(f32),
}

impl Message {
    pub fn scan(formats: &[PluginFormat]) -> Self {
        Self::Scan(formats.iter().map(|format| format.as_str().to_owned()).collect())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Scan(_) => "scan",
            Self::Quit => "quit",
            Self::State(_) => "state",
            Self::Name(_) => "name",
            Self::Progress(_) => "progress",
        }
    }

    fn payload(&self) -> String {
        match self {
            Self::Scan(formats) => formats.join(","),
            Self::Quit => String::new(),
            Self::State(state) => state.as_str().to_owned(),
            Self::Name(identifier) => identifier.clone(),
            Self::Progress(fraction) => fraction.to_string(),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        format!("{}:{}", self.kind(), self.payload()).into_bytes()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(bytes).map_err(|_| ProtocolError::InvalidUtf8)?;
        let (kind, payload) = text.split_once(':').unwrap_or((text, ""));
        match kind {
            "scan" => Ok(Self::Scan(
                payload
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_owned)
                    .collect(),
            )),
            "quit" => Ok(Self::Quit),
            "state" => payload.trim().parse().map(Self::State),
            "name" => Ok(Self::Name(payload.to_owned())),
            "progress" => {
                let fraction: f32 = payload
                    .trim()
                    .parse()
                    .map_err(|_| ProtocolError::InvalidProgress(payload.to_owned()))?;
                if !fraction.is_finite() {
                    return Err(ProtocolError::InvalidProgress(payload.to_owned()));
                }
                Ok(Self::Progress(fraction.clamp(0.0, 1.0)))
            }
            other => Err(ProtocolError::UnknownType(other.to_owned())),
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.payload())
    }
}

/// A frame arrived intact but does not carry a message we understand. The
/// stream itself is still usable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("message is not valid UTF-8")]
    InvalidUtf8,
    #[error("unknown message type {0:?}")]
    UnknownType(String),
    #[error("unknown worker state {0:?}")]
    UnknownState(String),
    #[error("invalid progress value {0:?}")]
    InvalidProgress(String),
}

#[derive(Debug, Error)]
pub enum IpcError {
    #[error("connection closed by peer")]
    Disconnected,
    #[error("frame of {0} bytes exceeds the 1 MiB limit")]
    Oversized(usize),
    #[error("i/o error on scanner channel: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl IpcError {
    /// Whether the channel must be considered lost after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Protocol(_))
    }
}

/// Length framed message channel over a pair of byte streams (normally the
/// worker's stdin/stdout pipes). Each frame is a little endian `u32` byte
/// count followed by exactly that many bytes.
#[derive(Debug)]
pub struct IpcTransport<R, W>
where
    R: Read + 'static,
    W: Write + 'static,
{
    reader: Arc<parking_lot::Mutex<BufReader<R>>>,
    writer: Arc<parking_lot::Mutex<BufWriter<W>>>,
}

impl<R, W> Clone for IpcTransport<R, W>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    fn clone(&self) -> Self {
        Self {
            reader: Arc::clone(&self.reader),
            writer: Arc::clone(&self.writer),
        }
    }
}

impl<R, W> IpcTransport<R, W>
where
    R: Read + 'static,
    W: Write + 'static,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Arc::new(parking_lot::Mutex::new(BufReader::new(reader))),
            writer: Arc::new(parking_lot::Mutex::new(BufWriter::new(writer))),
        }
    }

    pub fn send(&self, message: &Message) -> Result<(), IpcError> {
        self.send_frame(&message.encode())
    }

    pub fn send_frame(&self, payload: &[u8]) -> Result<(), IpcError> {
        if payload.len() > MAX_FRAME_LEN {
            return Err(IpcError::Oversized(payload.len()));
        }
        let len = payload.len() as u32;
        let mut writer = self.writer.lock();
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(payload)?;
        writer.flush()?;
        Ok(())
    }

    pub fn recv_frame(&self) -> Result<Vec<u8>, IpcError> {
        let mut reader = self.reader.lock();
        let mut header = [0u8; 4];
        read_exact_or_disconnect(&mut *reader, &mut header)?;
        let len = u32::from_le_bytes(header) as usize;
        if len > MAX_FRAME_LEN {
            return Err(IpcError::Oversized(len));
        }
        let mut payload = vec![0u8; len];
        read_exact_or_disconnect(&mut *reader, &mut payload)?;
        Ok(payload)
    }

    pub fn recv(&self) -> Result<Message, IpcError> {
        let frame = self.recv_frame()?;
        Ok(Message::decode(&frame)?)
    }
}

fn read_exact_or_disconnect<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<(), IpcError> {
    reader.read_exact(buf).map_err(|err| match err.kind() {
        io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe => IpcError::Disconnected,
        _ => IpcError::Io(err),
    })
}

/// What the background reader hands to the thread that owns the session.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Message(Message),
    Lost,
}

/// Drains `transport` on a dedicated thread. Malformed frames are logged and
/// skipped; the receiver gets [`Inbound::Lost`] once the stream is gone.
pub fn spawn_reader<R, W>(transport: IpcTransport<R, W>, peer: &'static str) -> Receiver<Inbound>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    let (tx, rx) = unbounded();
    thread::spawn(move || loop {
        match transport.recv() {
            Ok(message) => {
                if tx.send(Inbound::Message(message)).is_err() {
                    break;
                }
            }
            Err(err) if !err.is_fatal() => {
                warn!(peer, %err, "ignoring malformed scanner message");
            }
            Err(err) => {
                debug!(peer, %err, "scanner channel closed");
                let _ = tx.send(Inbound::Lost);
                break;
            }
        }
    });
    rx
}
