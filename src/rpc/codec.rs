//! src/rpc/codec.rs
//!
//! The RPC wire framing: a 4-byte big-endian length prefix followed by a
//! bincode-encoded envelope. Deliberately not HTTP or WebSocket framing —
//! this is a small bidirectional control protocol a CLI or sidecar process
//! speaks directly over TCP, closer to the distilled spec's own IPC design
//! than to a REST surface.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Frames this large are almost certainly a misbehaving or malicious
/// client; refuse to allocate for them.
const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestHeader {
    pub seq: u64,
    pub command: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ResponseHeader {
    pub seq: u64,
    /// Empty on success; the distilled spec's commands report failure via
    /// this string field rather than a separate error channel.
    pub error: String,
}

impl ResponseHeader {
    pub fn ok(seq: u64) -> Self {
        Self {
            seq,
            error: String::new(),
        }
    }

    pub fn err(seq: u64, message: impl Into<String>) -> Self {
        Self {
            seq,
            error: message.into(),
        }
    }
}

pub async fn write_frame<W: tokio::io::AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<()> {
    let len = u32::try_from(body.len()).map_err(|_| Error::Rpc("frame too large to encode".into()))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn read_frame<R: tokio::io::AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(Error::Rpc(format!("frame of {len} bytes exceeds the {MAX_FRAME_SIZE} byte limit")));
    }
    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

pub fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frame_round_trips_through_a_pipe() {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let header = RequestHeader {
            seq: 1,
            command: "members".into(),
        };
        let body = encode(&header).unwrap();
        write_frame(&mut client, &body).await.unwrap();

        let received = read_frame(&mut server).await.unwrap();
        let decoded: RequestHeader = decode(&received).unwrap();
        assert_eq!(decoded.seq, 1);
        assert_eq!(decoded.command, "members");
    }

    #[tokio::test]
    async fn oversized_frame_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&(MAX_FRAME_SIZE + 1).to_be_bytes()).await.unwrap();
        let err = read_frame(&mut server).await.unwrap_err();
        assert!(matches!(err, Error::Rpc(_)));
    }
}
