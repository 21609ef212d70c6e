//! Chunked read reassembly shared by the TCP and UDP engines.
//!
//! A read that fills the whole [`CHUNK_SIZE`] buffer is taken to mean more
//! data is pending, so reading continues and the pieces are joined into one
//! message. A short read ends the message.
//!
//! A message whose length is an exact multiple of the chunk size, followed
//! by a pause, is held back until the next read completes.

use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::net::UdpSocket;

/// Size of a single read.
pub const CHUNK_SIZE: usize = 16384;

/// Read one message from a stream.
///
/// Returns `Ok(None)` at end-of-stream when nothing was buffered. If the
/// stream ends right after a full chunk, the buffered bytes are returned and
/// the next call yields `None`.
pub async fn read_message<R>(reader: &mut R, buf: &mut [u8]) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut message = Vec::new();
    loop {
        let n = reader.read(buf).await?;
        message.extend_from_slice(&buf[..n]);
        if n != buf.len() {
            break;
        }
    }
    Ok((!message.is_empty()).then_some(message))
}

/// Receive one message on an unconnected socket, with the sender's address.
///
/// The address of the last datagram read is reported.
pub async fn recv_message_from(
    socket: &UdpSocket,
    buf: &mut [u8],
) -> io::Result<(Vec<u8>, SocketAddr)> {
    let mut message = Vec::new();
    loop {
        let (n, from) = socket.recv_from(buf).await?;
        message.extend_from_slice(&buf[..n]);
        if n != buf.len() {
            return Ok((message, from));
        }
    }
}

/// Receive one message on a connected socket.
pub async fn recv_message(socket: &UdpSocket, buf: &mut [u8]) -> io::Result<Vec<u8>> {
    let mut message = Vec::new();
    loop {
        let n = socket.recv(buf).await?;
        message.extend_from_slice(&buf[..n]);
        if n != buf.len() {
            return Ok(message);
        }
    }
}
