//! Frame encapsulation on the guest link
//!
//! Each `Protocol` tags how Ethernet frames are carried: qemu streams carry
//! a 32-bit big-endian length prefix, hyperkit a 16-bit little-endian one,
//! and vfkit sends one frame per datagram with no prefix.

use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::UnixDatagram;

use crate::config::Protocol;
use crate::error::{Result, VgateError};
use crate::transport::{ByteStream, Connection};

/// Upper bound accepted for a single frame.
pub const MAX_FRAME_LEN: usize = 65535;

/// Length-prefix layout for stream-carried frames.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Prefix {
    U32Be,
    U16Le,
}

impl Prefix {
    fn len(self) -> usize {
        match self {
            Prefix::U32Be => 4,
            Prefix::U16Le => 2,
        }
    }
}

pub enum FrameReader {
    Stream {
        io: ReadHalf<ByteStream>,
        prefix: Prefix,
    },
    Datagram(Arc<UnixDatagram>),
}

pub enum FrameWriter {
    Stream {
        io: WriteHalf<ByteStream>,
        prefix: Prefix,
    },
    Datagram(Arc<UnixDatagram>),
}

/// Split a connection into framed halves according to the protocol tag.
///
/// The pairing is validated: vfkit requires a datagram link, the prefixed
/// protocols require a byte stream.
pub fn split(conn: Connection, protocol: Protocol) -> Result<(FrameReader, FrameWriter)> {
    match (protocol, conn) {
        (Protocol::Vfkit, Connection::Datagram(socket)) => Ok((
            FrameReader::Datagram(socket.clone()),
            FrameWriter::Datagram(socket),
        )),
        (Protocol::Vfkit, Connection::Stream(_)) => Err(VgateError::Config(
            "vfkit framing requires a datagram transport".to_string(),
        )),
        (protocol, Connection::Stream(stream)) => {
            let prefix = match protocol {
                Protocol::Qemu => Prefix::U32Be,
                Protocol::Hyperkit => Prefix::U16Le,
                Protocol::Vfkit => unreachable!(),
            };
            let (read, write) = tokio::io::split(stream);
            Ok((
                FrameReader::Stream { io: read, prefix },
                FrameWriter::Stream { io: write, prefix },
            ))
        }
        (_, Connection::Datagram(_)) => Err(VgateError::Config(
            "stream framing requires a byte-stream transport".to_string(),
        )),
    }
}

impl FrameReader {
    /// Read the next frame; `Ok(None)` on clean end-of-link.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>> {
        match self {
            Self::Stream { io, prefix } => {
                let mut head = [0u8; 4];
                let take = prefix.len();
                // A clean EOF is only legal on a frame boundary.
                let n = io.read(&mut head[..1]).await?;
                if n == 0 {
                    return Ok(None);
                }
                io.read_exact(&mut head[1..take]).await?;

                let len = match prefix {
                    Prefix::U32Be => u32::from_be_bytes(head) as usize,
                    Prefix::U16Le => u16::from_le_bytes([head[0], head[1]]) as usize,
                };
                if len == 0 || len > MAX_FRAME_LEN {
                    return Err(VgateError::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        format!("frame length {len} out of range"),
                    )));
                }
                let mut frame = vec![0u8; len];
                io.read_exact(&mut frame).await?;
                Ok(Some(frame))
            }
            Self::Datagram(socket) => {
                let mut frame = vec![0u8; MAX_FRAME_LEN];
                let n = socket.recv(&mut frame).await?;
                frame.truncate(n);
                Ok(Some(frame))
            }
        }
    }
}

impl FrameWriter {
    pub async fn write_frame(&mut self, frame: &[u8]) -> Result<()> {
        match self {
            Self::Stream { io, prefix } => {
                match prefix {
                    Prefix::U32Be => io.write_all(&(frame.len() as u32).to_be_bytes()).await?,
                    Prefix::U16Le => io.write_all(&(frame.len() as u16).to_le_bytes()).await?,
                }
                io.write_all(frame).await?;
                io.flush().await?;
                Ok(())
            }
            Self::Datagram(socket) => {
                socket.send(frame).await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_pair() -> (Connection, Connection) {
        let (a, b) = tokio::io::duplex(65536);
        (
            Connection::Stream(Box::new(a)),
            Connection::Stream(Box::new(b)),
        )
    }

    #[tokio::test]
    async fn test_qemu_prefix_is_u32_be() {
        let (a, b) = stream_pair();
        let (_, mut writer) = split(a, Protocol::Qemu).unwrap();
        let (mut reader, _) = split(b, Protocol::Qemu).unwrap();

        writer.write_frame(b"ab").await.unwrap();
        let frame = reader.read_frame().await.unwrap().unwrap();
        assert_eq!(frame, b"ab");
    }

    #[tokio::test]
    async fn test_hyperkit_prefix_is_u16_le() {
        let (a, mut raw) = tokio::io::duplex(256);
        let (_, mut writer) =
            split(Connection::Stream(Box::new(a)), Protocol::Hyperkit).unwrap();

        writer.write_frame(b"xyz").await.unwrap();
        let mut buf = [0u8; 5];
        raw.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [3, 0, b'x', b'y', b'z']);
    }

    #[tokio::test]
    async fn test_eof_on_frame_boundary_is_clean() {
        let (a, b) = stream_pair();
        let (_, mut writer) = split(a, Protocol::Qemu).unwrap();
        let (mut reader, _) = split(b, Protocol::Qemu).unwrap();

        writer.write_frame(b"last").await.unwrap();
        drop(writer);
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), b"last");
        assert!(reader.read_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_length_is_rejected() {
        let (mut raw, b) = tokio::io::duplex(256);
        let (mut reader, _) = split(Connection::Stream(Box::new(b)), Protocol::Qemu).unwrap();

        tokio::io::AsyncWriteExt::write_all(&mut raw, &u32::MAX.to_be_bytes())
            .await
            .unwrap();
        assert!(reader.read_frame().await.is_err());
    }

    #[tokio::test]
    async fn test_vfkit_round_trip_and_pairing() {
        let (a, b) = UnixDatagram::pair().unwrap();
        let (_, mut writer) =
            split(Connection::Datagram(Arc::new(a)), Protocol::Vfkit).unwrap();
        let (mut reader, _) =
            split(Connection::Datagram(Arc::new(b)), Protocol::Vfkit).unwrap();

        writer.write_frame(b"frame").await.unwrap();
        assert_eq!(reader.read_frame().await.unwrap().unwrap(), b"frame");

        let (stream, _) = stream_pair();
        assert!(split(stream, Protocol::Vfkit).is_err());
        let (c, _) = UnixDatagram::pair().unwrap();
        assert!(split(Connection::Datagram(Arc::new(c)), Protocol::Qemu).is_err());
    }
}
