//! Guest transport endpoints
//!
//! An [`Endpoint`] is parsed from a URL (`scheme://host[:port][/path][?query]`)
//! before any I/O happens; an unknown scheme fails fast with
//! [`VgateError::UnexpectedScheme`]. Dialing or listening yields a
//! [`Connection`], either a byte stream (qemu, hyperkit) or a connected
//! datagram socket (vfkit).

pub mod tunnel;

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream, UnixDatagram, UnixListener, UnixStream};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::constants::VFKIT_MAGIC;
use crate::error::{Result, VgateError};
use crate::retry;

/// Duplex I/O bound for transport streams, usable as a trait object.
pub trait DuplexIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> DuplexIo for T {}

/// Boxed duplex byte stream.
pub type ByteStream = Box<dyn DuplexIo>;

/// An established guest link.
pub enum Connection {
    /// Ordered byte stream; frames carry a length prefix.
    Stream(ByteStream),
    /// Connected datagram socket; one frame per datagram.
    Datagram(Arc<UnixDatagram>),
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Connection::Stream(_) => f.write_str("Connection::Stream"),
            Connection::Datagram(_) => f.write_str("Connection::Datagram"),
        }
    }
}

/// A parsed transport endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum Endpoint {
    /// AF_VSOCK rendezvous, carried over its host-side Unix socket.
    Vsock { cid: u32, port: u32 },
    /// Unix stream socket.
    Unix { path: PathBuf },
    /// Unix datagram socket (vfkit rendezvous).
    Unixgram { path: PathBuf },
    /// Subprocess pipe carrier; query parameters become child process flags.
    Stdio { command: String, args: Vec<String> },
    /// TCP socket.
    Tcp { host: String, port: u16 },
}

impl Endpoint {
    /// Parse an endpoint URL. Pure; no I/O happens here.
    pub fn parse(s: &str) -> Result<Self> {
        let url = Url::parse(s).map_err(|err| VgateError::InvalidEndpoint {
            endpoint: s.to_string(),
            reason: err.to_string(),
        })?;
        let invalid = |reason: &str| VgateError::InvalidEndpoint {
            endpoint: s.to_string(),
            reason: reason.to_string(),
        };

        match url.scheme() {
            "vsock" => {
                let cid = url
                    .host_str()
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| invalid("missing vsock CID"))?
                    .parse::<u32>()
                    .map_err(|_| invalid("vsock CID must be numeric"))?;
                let port = url
                    .port()
                    .ok_or_else(|| invalid("missing vsock port"))?;
                Ok(Self::Vsock {
                    cid,
                    port: port as u32,
                })
            }
            "unix" | "unixgram" => {
                let path = url.path();
                if path.is_empty() || path == "/" {
                    return Err(invalid("missing socket path"));
                }
                let path = PathBuf::from(path);
                if url.scheme() == "unix" {
                    Ok(Self::Unix { path })
                } else {
                    Ok(Self::Unixgram { path })
                }
            }
            "stdio" => {
                let command = url.path().to_string();
                if command.is_empty() {
                    return Err(invalid("missing command"));
                }
                let mut args = Vec::new();
                for (key, value) in url.query_pairs() {
                    args.push(key.into_owned());
                    if !value.is_empty() {
                        args.push(value.into_owned());
                    }
                }
                Ok(Self::Stdio { command, args })
            }
            "tcp" => {
                let host = url
                    .host_str()
                    .filter(|h| !h.is_empty())
                    .ok_or_else(|| invalid("missing host"))?
                    .to_string();
                let port = url.port().ok_or_else(|| invalid("missing port"))?;
                Ok(Self::Tcp { host, port })
            }
            other => Err(VgateError::UnexpectedScheme(other.to_string())),
        }
    }

    /// Dial the endpoint.
    pub async fn dial(&self) -> Result<Connection> {
        match self {
            Self::Tcp { host, port } => {
                let stream = TcpStream::connect((host.as_str(), *port)).await?;
                Ok(Connection::Stream(Box::new(stream)))
            }
            Self::Unix { path } => {
                let stream = UnixStream::connect(path).await?;
                Ok(Connection::Stream(Box::new(stream)))
            }
            Self::Vsock { cid, port } => {
                let stream = UnixStream::connect(vsock_rendezvous_path(*cid, *port)).await?;
                Ok(Connection::Stream(Box::new(stream)))
            }
            Self::Unixgram { path } => {
                let local = std::env::temp_dir()
                    .join(format!("vgate-gram-{:08x}.sock", rand::random::<u32>()));
                let _ = std::fs::remove_file(&local);
                let socket = UnixDatagram::bind(&local)?;
                socket.connect(path)?;
                socket.send(&VFKIT_MAGIC).await?;
                Ok(Connection::Datagram(Arc::new(socket)))
            }
            Self::Stdio { command, args } => {
                let mut child = Command::new(command)
                    .args(args)
                    .stdin(std::process::Stdio::piped())
                    .stdout(std::process::Stdio::piped())
                    .kill_on_drop(true)
                    .spawn()?;
                let stdin = child.stdin.take().ok_or_else(|| {
                    VgateError::Io(std::io::Error::other("child stdin unavailable"))
                })?;
                let stdout = child.stdout.take().ok_or_else(|| {
                    VgateError::Io(std::io::Error::other("child stdout unavailable"))
                })?;
                Ok(Connection::Stream(Box::new(StdioStream {
                    _child: child,
                    stdout,
                    stdin,
                })))
            }
        }
    }

    /// Dial with the bounded retry schedule.
    pub async fn dial_retrying(&self, token: &CancellationToken) -> Result<Connection> {
        retry::retry(token, || self.dial()).await
    }

    /// Bind a listener for the endpoint.
    pub async fn listen(&self) -> Result<Listener> {
        match self {
            Self::Tcp { host, port } => {
                let listener = TcpListener::bind((host.as_str(), *port)).await?;
                Ok(Listener::Tcp(listener))
            }
            Self::Unix { path } => {
                let _ = std::fs::remove_file(path);
                Ok(Listener::Unix(UnixListener::bind(path)?))
            }
            Self::Vsock { cid, port } => {
                let path = vsock_rendezvous_path(*cid, *port);
                let _ = std::fs::remove_file(&path);
                Ok(Listener::Unix(UnixListener::bind(&path)?))
            }
            Self::Unixgram { path } => {
                let _ = std::fs::remove_file(path);
                Ok(Listener::Unixgram(Arc::new(UnixDatagram::bind(path)?)))
            }
            Self::Stdio { .. } => Err(VgateError::InvalidEndpoint {
                endpoint: self.to_string(),
                reason: "stdio endpoints cannot listen".to_string(),
            }),
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Vsock { cid, port } => write!(f, "vsock://{cid}:{port}"),
            Self::Unix { path } => write!(f, "unix://{}", path.display()),
            Self::Unixgram { path } => write!(f, "unixgram://{}", path.display()),
            Self::Stdio { command, .. } => write!(f, "stdio:{command}"),
            Self::Tcp { host, port } => write!(f, "tcp://{host}:{port}"),
        }
    }
}

impl std::str::FromStr for Endpoint {
    type Err = VgateError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Host-side rendezvous socket for a vsock port.
///
/// macOS virtualization stacks expose guest vsock ports as Unix sockets at a
/// path derived from the port; both sides derive the same path.
pub fn vsock_rendezvous_path(cid: u32, port: u32) -> PathBuf {
    std::env::temp_dir().join(format!("vgate-vsock-{cid}-{port}.sock"))
}

/// A bound transport listener.
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
    Unixgram(Arc<UnixDatagram>),
}

impl Listener {
    /// Accept one guest link.
    ///
    /// For datagram listeners this consumes the peer's hello datagram and
    /// requires the `VFKT` magic; a mismatch rejects the accept with no
    /// retry, leaving the socket bound.
    pub async fn accept(&mut self) -> Result<Connection> {
        match self {
            Self::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                tracing::debug!(%peer, "accepted TCP guest link");
                Ok(Connection::Stream(Box::new(stream)))
            }
            Self::Unix(listener) => {
                let (stream, _) = listener.accept().await?;
                tracing::debug!("accepted Unix guest link");
                Ok(Connection::Stream(Box::new(stream)))
            }
            Self::Unixgram(socket) => {
                let mut buf = [0u8; 64];
                let (n, peer) = socket.recv_from(&mut buf).await?;
                if n < VFKIT_MAGIC.len() || buf[..VFKIT_MAGIC.len()] != VFKIT_MAGIC {
                    return Err(VgateError::DatagramHandshake(format!(
                        "expected {:?} magic, got {} bytes",
                        std::str::from_utf8(&VFKIT_MAGIC).unwrap_or("VFKT"),
                        n
                    )));
                }
                let path = peer.as_pathname().ok_or_else(|| {
                    VgateError::DatagramHandshake("peer socket has no path".to_string())
                })?;
                socket.connect(path)?;
                tracing::debug!(peer = %path.display(), "accepted datagram guest link");
                Ok(Connection::Datagram(socket.clone()))
            }
        }
    }
}

/// Byte stream over a child process's stdio; the child is killed on drop.
struct StdioStream {
    _child: Child,
    stdout: ChildStdout,
    stdin: ChildStdin,
}

impl AsyncRead for StdioStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for StdioStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stdin).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdin).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdin).poll_shutdown(cx)
    }
}
