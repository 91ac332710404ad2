//! Length-prefixed frame I/O.
//!
//! Every logical message on the wire is a 4-byte big-endian length followed
//! by exactly that many payload bytes. No newline or null terminator is
//! sent. Earlier revisions of this protocol used newline-delimited lines;
//! that framing is vestigial and intentionally not reproduced here.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::errors::Error;

/// Default cap on a declared frame length.
pub const DEFAULT_MAX_FRAME_LEN: u32 = 1024 * 1024;

/// Reads one frame from `stream`, or `Ok(None)` on a clean EOF before any
/// header byte was read.
pub async fn recv(stream: &mut TcpStream, max_len: u32) -> Result<Option<Vec<u8>>, Error> {
    let mut header = [0u8; 4];

    match read_exact_or_eof(stream, &mut header).await? {
        ReadOutcome::Eof => return Ok(None),
        ReadOutcome::Partial => {
            return Err(Error::Protocol("short frame header".into()));
        }
        ReadOutcome::Full => {}
    }

    let len = u32::from_be_bytes(header);
    if len > max_len {
        return Err(Error::TooLarge {
            declared: len,
            max: max_len,
        });
    }

    let mut payload = vec![0u8; len as usize];
    stream.read_exact(&mut payload).await.map_err(Error::Io)?;

    Ok(Some(payload))
}

/// Writes one frame: a 4-byte big-endian length followed by `payload`.
pub async fn send(stream: &mut TcpStream, payload: &[u8]) -> Result<(), Error> {
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::Internal("payload exceeds u32::MAX".into()))?;

    let mut framed = BytesMut::with_capacity(4 + payload.len());
    framed.put_u32(len);
    framed.put_slice(payload);

    stream.write_all(&framed).await?;
    stream.flush().await?;

    Ok(())
}

enum ReadOutcome {
    Full,
    /// EOF encountered before the first byte of the header was read.
    Eof,
    /// EOF encountered partway through the header — a protocol violation.
    Partial,
}

/// `read_exact` that distinguishes a clean zero-byte EOF (connection closed
/// between commands) from a short read that started a header but didn't
/// finish it.
async fn read_exact_or_eof(stream: &mut TcpStream, buf: &mut [u8]) -> Result<ReadOutcome, Error> {
    let mut filled = 0;

    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Ok(if filled == 0 {
                ReadOutcome::Eof
            } else {
                ReadOutcome::Partial
            });
        }
        filled += n;
    }

    Ok(ReadOutcome::Full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn round_trips_a_frame() {
        let (mut a, mut b) = pair().await;
        send(&mut a, b"hello world").await.unwrap();
        let got = recv(&mut b, DEFAULT_MAX_FRAME_LEN).await.unwrap().unwrap();
        assert_eq!(got, b"hello world");
    }

    #[tokio::test]
    async fn clean_close_before_header_is_eof() {
        let (a, mut b) = pair().await;
        drop(a);
        let got = recv(&mut b, DEFAULT_MAX_FRAME_LEN).await.unwrap();
        assert!(got.is_none());
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut a, mut b) = pair().await;
        a.write_all(&(DEFAULT_MAX_FRAME_LEN + 1).to_be_bytes())
            .await
            .unwrap();
        a.flush().await.unwrap();
        let err = recv(&mut b, DEFAULT_MAX_FRAME_LEN).await.unwrap_err();
        assert!(matches!(err, Error::TooLarge { .. }));
    }

    #[tokio::test]
    async fn empty_frame_round_trips() {
        let (mut a, mut b) = pair().await;
        send(&mut a, b"").await.unwrap();
        let got = recv(&mut b, DEFAULT_MAX_FRAME_LEN).await.unwrap().unwrap();
        assert!(got.is_empty());
    }
}
