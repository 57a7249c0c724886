/// Interactive shell channel abstraction and request/response synchronization.
///
/// A shell channel has no message framing: after a command is written the
/// only signal that the remote side is "done" is silence. The synchronizer
/// therefore waits a fixed settle duration and then takes whatever output is
/// buffered. A settle that is too short for a slow command yields truncated
/// text; this cannot be detected here and is a configuration concern.
use std::time::Duration;

/// Default cap on bytes read back after a single command.
pub const DEFAULT_MAX_READ_BYTES: usize = 65535;

/// Errors raised by a shell channel.
#[derive(Debug)]
pub enum ChannelError {
    /// TCP connection to the remote host failed.
    Connect { addr: String, source: std::io::Error },
    /// Protocol-level failure (handshake, auth, channel setup).
    Protocol { stage: &'static str, message: String },
    /// Read or write on an open channel failed.
    Io { source: std::io::Error },
    /// The channel was used after it was closed.
    Closed,
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::Connect { addr, source } => {
                write!(f, "failed to connect to {}: {}", addr, source)
            }
            ChannelError::Protocol { stage, message } => {
                write!(f, "ssh {} failed: {}", stage, message)
            }
            ChannelError::Io { source } => write!(f, "channel I/O error: {}", source),
            ChannelError::Closed => write!(f, "channel is closed"),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChannelError::Connect { source, .. } => Some(source),
            ChannelError::Io { source } => Some(source),
            ChannelError::Protocol { .. } | ChannelError::Closed => None,
        }
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(e: std::io::Error) -> Self {
        ChannelError::Io { source: e }
    }
}

/// One live interactive shell on a remote host.
///
/// Implementations are driven strictly sequentially: one command in flight
/// at a time. `close` must be idempotent.
pub trait ShellChannel {
    /// Write raw text into the shell's stdin.
    fn send(&mut self, text: &str) -> Result<(), ChannelError>;

    /// Read whatever output is currently buffered, up to `max_bytes`,
    /// without waiting for more. Fails with `Closed` once the remote end
    /// has hung up.
    fn read_available(&mut self, max_bytes: usize) -> Result<Vec<u8>, ChannelError>;

    /// Whether the channel is still usable.
    fn is_open(&self) -> bool;

    /// Close the channel and its underlying connection.
    fn close(&mut self) -> Result<(), ChannelError>;

    /// Send `text`, block for `settle`, then drain the buffered output.
    fn send_and_settle(
        &mut self,
        text: &str,
        settle: Duration,
        max_bytes: usize,
    ) -> Result<Vec<u8>, ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        self.send(text)?;
        if !settle.is_zero() {
            std::thread::sleep(settle);
        }
        self.read_available(max_bytes)
    }
}

/// Sends a command into a shell channel and returns its decoded response.
#[derive(Debug, Clone)]
pub struct ChannelSynchronizer {
    max_read_bytes: usize,
}

impl ChannelSynchronizer {
    pub fn new(max_read_bytes: usize) -> Self {
        Self { max_read_bytes }
    }

    /// Run `command` (newline-terminated) and return the text produced within `settle`.
    pub fn execute(
        &self,
        channel: &mut dyn ShellChannel,
        command: &str,
        settle: Duration,
    ) -> Result<String, ChannelError> {
        let line = format!("{command}\n");
        let raw = channel.send_and_settle(&line, settle, self.max_read_bytes)?;
        let text = decode_lossy(&raw);
        tracing::debug!(
            command,
            settle_ms = settle.as_millis() as u64,
            bytes = raw.len(),
            "command settled"
        );
        Ok(text)
    }
}

impl Default for ChannelSynchronizer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_READ_BYTES)
    }
}

/// Decode bytes as UTF-8, dropping any sequence that is not valid.
pub fn decode_lossy(bytes: &[u8]) -> String {
    bytes.utf8_chunks().map(|chunk| chunk.valid()).collect()
}
