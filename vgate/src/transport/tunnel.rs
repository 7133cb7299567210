//! Tunnel handshake
//!
//! Binds one transport connection to one logical guest flow. The initiator
//! writes a single HTTP-shaped request line and waits for exactly two bytes;
//! only `OK` is success. Anything else means the caller must close the
//! connection.

use std::net::Ipv4Addr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use url::Url;

use crate::error::{Result, VgateError};

const ACCEPTED: &[u8; 2] = b"OK";
const REJECTED: &[u8; 2] = b"NO";
const MAX_REQUEST_LEN: usize = 1024;

/// Initiate the handshake: request a tunnel to `ip:port` on the guest side.
pub async fn open<S>(stream: &mut S, ip: Ipv4Addr, port: u16) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = format!("POST /tunnel?ip={ip}&port={port} HTTP/1.1\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut answer = [0u8; 2];
    stream
        .read_exact(&mut answer)
        .await
        .map_err(|err| VgateError::TunnelHandshake(format!("short answer: {err}")))?;
    if &answer != ACCEPTED {
        return Err(VgateError::TunnelHandshake(format!(
            "peer answered '{}'",
            String::from_utf8_lossy(&answer)
        )));
    }
    Ok(())
}

/// Answer the handshake: parse the requested `(ip, port)` and confirm with
/// `OK`, or reject with `NO` and return the error.
pub async fn accept<S>(stream: &mut S) -> Result<(Ipv4Addr, u16)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match read_request(stream).await {
        Ok(target) => {
            stream.write_all(ACCEPTED).await?;
            Ok(target)
        }
        Err(err) => {
            let _ = stream.write_all(REJECTED).await;
            Err(err)
        }
    }
}

async fn read_request<S>(stream: &mut S) -> Result<(Ipv4Addr, u16)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = Vec::new();
    let mut byte = [0u8; 1];
    while !request.ends_with(b"\r\n\r\n") {
        if request.len() >= MAX_REQUEST_LEN {
            return Err(VgateError::TunnelHandshake("request too long".to_string()));
        }
        let n = stream.read(&mut byte).await?;
        if n == 0 {
            return Err(VgateError::TunnelHandshake(
                "connection closed mid-request".to_string(),
            ));
        }
        request.push(byte[0]);
    }

    let line = String::from_utf8_lossy(&request);
    let mut parts = line.split_whitespace();
    let (method, target) = (parts.next().unwrap_or(""), parts.next().unwrap_or(""));
    if method != "POST" {
        return Err(VgateError::TunnelHandshake(format!(
            "unexpected method '{method}'"
        )));
    }

    let url = Url::parse(&format!("http://vgate{target}"))
        .map_err(|err| VgateError::TunnelHandshake(format!("bad target: {err}")))?;
    if url.path() != "/tunnel" {
        return Err(VgateError::TunnelHandshake(format!(
            "unexpected path '{}'",
            url.path()
        )));
    }

    let mut ip = None;
    let mut port = None;
    for (key, value) in url.query_pairs() {
        match key.as_ref() {
            "ip" => ip = value.parse().ok(),
            "port" => port = value.parse().ok(),
            _ => {}
        }
    }
    match (ip, port) {
        (Some(ip), Some(port)) => Ok((ip, port)),
        _ => Err(VgateError::TunnelHandshake(
            "missing or invalid ip/port".to_string(),
        )),
    }
}
