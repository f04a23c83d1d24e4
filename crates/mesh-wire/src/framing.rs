//! Length-prefixed JSON framing
//!
//! One packet per frame: a 4-byte big-endian length followed by the JSON
//! body. The deployed codec delivers whole JSON objects per packet; the
//! length prefix is how that contract is realized here.

use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::packet::Packet;

/// Upper bound on a single frame's JSON body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Read one framed packet.
///
/// A clean EOF at the frame boundary maps to [`Error::Closed`]; EOF inside a
/// frame is reported as an I/O error.
pub async fn read_packet<R>(reader: &mut R) -> Result<Packet>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    if let Err(err) = reader.read_exact(&mut len_buf).await {
        return Err(if err.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::Closed
        } else {
            err.into()
        });
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}

/// Write one framed packet and flush.
pub async fn write_packet<W>(writer: &mut W, packet: &Packet) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let body = serde_json::to_vec(packet)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge(body.len()));
    }

    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_roundtrip_back_to_back() {
        smol::block_on(async {
            let first = Packet::ping("node-a");
            let second = Packet::pong("node-b", 1);

            let mut buf = Vec::new();
            write_packet(&mut buf, &first).await.unwrap();
            write_packet(&mut buf, &second).await.unwrap();

            let mut cursor = &buf[..];
            assert_eq!(read_packet(&mut cursor).await.unwrap(), first);
            assert_eq!(read_packet(&mut cursor).await.unwrap(), second);

            match read_packet(&mut cursor).await {
                Err(Error::Closed) => {}
                other => panic!("expected Closed, got {other:?}"),
            }
        });
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        smol::block_on(async {
            let mut buf = Vec::new();
            buf.extend_from_slice(&(MAX_FRAME_LEN as u32 + 1).to_be_bytes());
            buf.extend_from_slice(b"{}");

            let mut cursor = &buf[..];
            match read_packet(&mut cursor).await {
                Err(Error::FrameTooLarge(_)) => {}
                other => panic!("expected FrameTooLarge, got {other:?}"),
            }
        });
    }

    #[test]
    fn truncated_frame_is_an_io_error() {
        smol::block_on(async {
            let mut buf = Vec::new();
            buf.extend_from_slice(&8u32.to_be_bytes());
            buf.extend_from_slice(b"{\"a\"");

            let mut cursor = &buf[..];
            match read_packet(&mut cursor).await {
                Err(Error::Io(_)) => {}
                other => panic!("expected Io, got {other:?}"),
            }
        });
    }
}
