// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Framing for peer and client connections: a 4-byte big-endian length
//! followed by a bincode body. Peer frames carry a [PeerMsg], whose variant
//! is its own type tag; client frames carry a bare [ClientRequest] or
//! [ClientResponse].

use crate::{Batch, BatchId, CommitVector, Epoch, Error, Query, ReplicaId};
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Largest frame body accepted from a connection.
pub const MAX_FRAME: usize = 64 * 1024 * 1024;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum PeerMsg {
    Batch(Batch),
    BatchAck {
        source: ReplicaId,
        batch: BatchId,
        from: ReplicaId,
    },
    Poa {
        source: ReplicaId,
        batch: BatchId,
    },
    BatchRequest {
        source: ReplicaId,
        batch: BatchId,
        from: ReplicaId,
    },
    CommitVector(CommitVector),
    EpochAnnounce {
        replica: ReplicaId,
        epoch: Epoch,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientRequest {
    pub seq: u64,
    pub query: Query,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClientResponse {
    pub seq: u64,
    pub executed: bool,
    pub result: String,
}

pub fn encode_frame<T: Serialize>(msg: &T) -> Result<Vec<u8>, Error> {
    let body = bincode::serde::encode_to_vec(msg, bincode::config::standard())?;
    if body.len() > MAX_FRAME {
        return Err(Error::Codec);
    }
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T, Error> {
    let (msg, used) = bincode::serde::decode_from_slice(body, bincode::config::standard())?;
    if used != body.len() {
        return Err(Error::Codec);
    }
    Ok(msg)
}

/// Reads one frame body. Returns `None` on a clean end of stream before the
/// length prefix.
pub async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<Option<Vec<u8>>, Error> {
    let mut len = [0u8; 4];
    let mut got = 0;
    while got < len.len() {
        let n = r.read(&mut len[got..]).await?;
        if n == 0 {
            return if got == 0 {
                Ok(None)
            } else {
                Err(Error::NetworkingError)
            };
        }
        got += n;
    }
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME {
        return Err(Error::Codec);
    }
    let mut body = vec![0u8; len];
    r.read_exact(&mut body).await?;
    Ok(Some(body))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &[u8]) -> Result<(), Error> {
    w.write_all(frame).await?;
    w.flush().await?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::KvCmd;
    use async_std::task;

    #[test]
    fn frames_carry_length_then_body() {
        let msg = PeerMsg::Poa {
            source: ReplicaId(1),
            batch: BatchId(9),
        };
        let frame = encode_frame(&msg).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);
        assert_eq!(decode::<PeerMsg>(&frame[4..]).unwrap(), msg);
    }

    #[test]
    fn read_frames_from_a_stream() {
        let req = ClientRequest {
            seq: 3,
            query: Query::Kv(vec![KvCmd::Get {
                shard: 1,
                key: "k".into(),
            }]),
        };
        let mut bytes = encode_frame(&req).unwrap();
        bytes.extend(encode_frame(&req).unwrap());
        let mut cursor = futures::io::Cursor::new(bytes);
        task::block_on(async {
            for _ in 0..2 {
                let body = read_frame(&mut cursor).await.unwrap().unwrap();
                assert_eq!(decode::<ClientRequest>(&body).unwrap(), req);
            }
            assert_eq!(read_frame(&mut cursor).await.unwrap(), None);
        });
    }

    #[test]
    fn truncated_and_oversized_frames_fail() {
        task::block_on(async {
            let mut short = futures::io::Cursor::new(vec![0u8, 0]);
            assert_eq!(read_frame(&mut short).await, Err(Error::NetworkingError));
            let mut huge = futures::io::Cursor::new(vec![0xffu8; 8]);
            assert_eq!(read_frame(&mut huge).await, Err(Error::Codec));
        });
        assert_eq!(decode::<PeerMsg>(&[0xff, 0xff]), Err(Error::Codec));
    }
}
