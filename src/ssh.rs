/// SSH transport: opens an interactive shell on a remote host with `ssh2`.
///
/// Host-key verification is not performed; the remote key is accepted as
/// presented. Credentials come from the caller's `SshTarget`, never from
/// process-global state.
use crate::channel::{ChannelError, ShellChannel};
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

/// How to authenticate against the remote host.
#[derive(Clone)]
pub enum SshAuth {
    Password(String),
    KeyFile {
        path: PathBuf,
        passphrase: Option<String>,
    },
}

impl std::fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SshAuth::Password(_) => write!(f, "Password(<redacted>)"),
            SshAuth::KeyFile { path, .. } => f
                .debug_struct("KeyFile")
                .field("path", path)
                .finish_non_exhaustive(),
        }
    }
}

/// Everything needed to open a session to one host.
#[derive(Debug, Clone)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub auth: SshAuth,
    pub connect_timeout: Duration,
}

impl SshTarget {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// A live interactive shell (`pty` + `shell`) over SSH.
///
/// Closed exactly once: either explicitly via `close` or on drop.
pub struct SshSession {
    session: ssh2::Session,
    channel: ssh2::Channel,
    open: bool,
}

fn protocol(stage: &'static str) -> impl FnOnce(ssh2::Error) -> ChannelError {
    move |e| ChannelError::Protocol {
        stage,
        message: e.to_string(),
    }
}

impl SshSession {
    /// Connect, authenticate, and start an interactive shell.
    pub fn open(target: &SshTarget) -> Result<Self, ChannelError> {
        let addr = target.addr();
        let tcp = connect_tcp(&addr, target.connect_timeout)?;

        let mut session = ssh2::Session::new().map_err(protocol("session setup"))?;
        session.set_tcp_stream(tcp);
        // Also bounds every blocking write and the close handshake
        session.set_timeout(target.connect_timeout.as_millis() as u32);
        session.handshake().map_err(protocol("handshake"))?;

        match &target.auth {
            SshAuth::Password(password) => session
                .userauth_password(&target.username, password)
                .map_err(protocol("password authentication"))?,
            SshAuth::KeyFile { path, passphrase } => session
                .userauth_pubkey_file(&target.username, None, path, passphrase.as_deref())
                .map_err(protocol("public key authentication"))?,
        }
        if !session.authenticated() {
            return Err(ChannelError::Protocol {
                stage: "authentication",
                message: "server rejected credentials".to_string(),
            });
        }

        let mut channel = session
            .channel_session()
            .map_err(protocol("channel open"))?;
        channel
            .request_pty("xterm", None, None)
            .map_err(protocol("pty request"))?;
        channel.shell().map_err(protocol("shell start"))?;

        tracing::info!(addr = %addr, user = %target.username, "ssh shell opened");
        Ok(Self {
            session,
            channel,
            open: true,
        })
    }
}

fn connect_tcp(addr: &str, timeout: Duration) -> Result<TcpStream, ChannelError> {
    let candidates = addr
        .to_socket_addrs()
        .map_err(|e| ChannelError::Connect {
            addr: addr.to_string(),
            source: e,
        })?;

    let mut last_err = std::io::Error::new(
        std::io::ErrorKind::NotFound,
        "host resolved to no addresses",
    );
    for candidate in candidates {
        match TcpStream::connect_timeout(&candidate, timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                tracing::debug!(addr = %candidate, error = %e, "connect attempt failed");
                last_err = e;
            }
        }
    }
    Err(ChannelError::Connect {
        addr: addr.to_string(),
        source: last_err,
    })
}

/// Read from a non-blocking reader until it would block or `max_bytes` is reached.
///
/// End of stream means the remote shell has gone away and is reported as
/// `Closed`, discarding anything read before it.
fn drain<R: Read>(reader: &mut R, max_bytes: usize) -> Result<Vec<u8>, ChannelError> {
    let mut out = Vec::new();
    let mut buf = [0u8; 8192];
    while out.len() < max_bytes {
        let want = buf.len().min(max_bytes - out.len());
        match reader.read(&mut buf[..want]) {
            Ok(0) => return Err(ChannelError::Closed),
            Ok(n) => out.extend_from_slice(&buf[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ChannelError::Io { source: e }),
        }
    }
    Ok(out)
}

impl ShellChannel for SshSession {
    fn send(&mut self, text: &str) -> Result<(), ChannelError> {
        if !self.open {
            return Err(ChannelError::Closed);
        }
        self.channel.write_all(text.as_bytes())?;
        self.channel.flush()?;
        Ok(())
    }

    fn read_available(&mut self, max_bytes: usize) -> Result<Vec<u8>, ChannelError> {
        if !self.open {
            return Err(ChannelError::Closed);
        }
        self.session.set_blocking(false);
        let result = drain(&mut self.channel, max_bytes);
        self.session.set_blocking(true);
        if matches!(result, Err(ChannelError::Closed)) {
            tracing::warn!("remote shell closed the channel");
        }
        result
    }

    fn is_open(&self) -> bool {
        self.open && !self.channel.eof()
    }

    fn close(&mut self) -> Result<(), ChannelError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        let _ = self.channel.send_eof();
        self.channel.close().map_err(protocol("channel close"))?;
        let _ = self.channel.wait_close();
        self.session
            .disconnect(None, "collection finished", None)
            .map_err(protocol("disconnect"))?;
        tracing::debug!("ssh shell closed");
        Ok(())
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!(error = %e, "failed to close ssh session");
        }
    }
}
