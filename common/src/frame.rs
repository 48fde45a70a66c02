// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: MIT-0

//! Length-prefixed JSON frames.
//!
//! Wire format: an 8-byte little-endian length header followed by a JSON
//! payload. Frames above [`MAX_FRAME_SIZE`] are rejected before allocation.

use byteorder::{ByteOrder, LittleEndian};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Error;

/// Upper bound on a single frame.
pub const MAX_FRAME_SIZE: u64 = 10 * 1024 * 1024;

pub async fn send_frame<W, T>(stream: &mut W, msg: &T) -> Result<(), Error>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = serde_json::to_vec(msg)
        .map_err(|err| Error::Frame(format!("failed to serialize frame: {err}")))?;

    if payload.len() as u64 > MAX_FRAME_SIZE {
        return Err(Error::Frame(format!(
            "frame of {} bytes exceeds the {MAX_FRAME_SIZE} byte limit",
            payload.len()
        )));
    }

    let mut header = [0u8; 8];
    LittleEndian::write_u64(&mut header, payload.len() as u64);

    stream.write_all(&header).await?;
    stream.write_all(&payload).await?;
    stream.flush().await?;

    Ok(())
}

pub async fn recv_frame<R, T>(stream: &mut R) -> Result<T, Error>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut header = [0u8; 8];
    stream.read_exact(&mut header).await?;

    let size = LittleEndian::read_u64(&header);
    if size > MAX_FRAME_SIZE {
        return Err(Error::Frame(format!(
            "frame of {size} bytes exceeds the {MAX_FRAME_SIZE} byte limit"
        )));
    }

    let mut payload = vec![0u8; size as usize];
    stream.read_exact(&mut payload).await?;

    serde_json::from_slice(&payload)
        .map_err(|err| Error::Frame(format!("failed to deserialize frame: {err}")))
}

#[cfg(test)]
mod tests {
    use byteorder::{ByteOrder, LittleEndian};
    use serde::{Deserialize, Serialize};
    use tokio::io::AsyncWriteExt;

    use super::{recv_frame, send_frame, MAX_FRAME_SIZE};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Probe {
        id: u32,
        note: String,
    }

    #[tokio::test]
    async fn frames_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        let sent = Probe {
            id: 7,
            note: "over the wall".to_string(),
        };
        send_frame(&mut a, &sent).await.unwrap();

        let received: Probe = recv_frame(&mut b).await.unwrap();
        assert_eq!(received, sent);
    }

    #[tokio::test]
    async fn oversized_header_is_rejected_without_allocation() {
        let (mut a, mut b) = tokio::io::duplex(64);

        let mut header = [0u8; 8];
        LittleEndian::write_u64(&mut header, MAX_FRAME_SIZE + 1);
        a.write_all(&header).await.unwrap();

        let err = recv_frame::<_, Probe>(&mut b).await.unwrap_err();
        assert!(err.to_string().contains("exceeds"));
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        let (mut a, mut b) = tokio::io::duplex(64);

        let mut header = [0u8; 8];
        LittleEndian::write_u64(&mut header, 32);
        a.write_all(&header).await.unwrap();
        a.write_all(b"{\"id\":1").await.unwrap();
        drop(a);

        assert!(recv_frame::<_, Probe>(&mut b).await.is_err());
    }
}
