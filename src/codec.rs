//! Length-prefixed frame transport.
//!
//! A wire frame is a 4 byte big-endian length (excluding itself) followed
//! by one MessagePack-encoded value. The decoded payload must be a map;
//! anything else is a protocol error and the connection is failed.
//!
//! The write side is guarded by a mutex so concurrent senders cannot
//! interleave frames, and every write runs under the connection's write
//! deadline. The read side has exactly one owner (the per-connection
//! reader task) and blocks without a deadline, slow producers are
//! tolerated.

use std::time::Duration;

use bytes::BytesMut;
use rmpv::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::error::*;

pub const FRAME_HEAD_LEN: usize = 4;

/// Reading half of a framed connection.
pub struct MsgReader<R> {
    io: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> MsgReader<R> {
    pub fn new(io: R) -> Self {
        Self { io, buf: BytesMut::with_capacity(512) }
    }

    /// Read one frame and decode it. Returns [RpcIntErr::Closed] on a
    /// clean EOF at a frame boundary.
    pub async fn read_msg(&mut self) -> Result<Value, RpcError> {
        let mut head = [0u8; FRAME_HEAD_LEN];
        if let Err(e) = self.io.read_exact(&mut head).await {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                return Err(RpcIntErr::Closed.into());
            }
            return Err(RpcIntErr::IO.into());
        }
        let len = u32::from_be_bytes(head) as usize;
        self.buf.resize(len, 0);
        if let Err(e) = self.io.read_exact(&mut self.buf).await {
            debug!("frame body read failed: {:?}", e);
            return Err(RpcIntErr::IO.into());
        }
        let mut slice = &self.buf[..];
        let msg = match rmpv::decode::read_value(&mut slice) {
            Ok(msg) => msg,
            Err(e) => {
                warn!("frame payload undecodable: {:?}", e);
                return Err(RpcIntErr::Decode.into());
            }
        };
        if !matches!(msg, Value::Map(_)) {
            warn!("frame payload is not a map");
            return Err(RpcIntErr::Protocol.into());
        }
        Ok(msg)
    }
}

/// Writing half of a framed connection. Shared between tasks; the inner
/// mutex serialises whole frames.
pub struct MsgWriter<W> {
    io: Mutex<W>,
    write_timeout: Duration,
}

impl<W: AsyncWrite + Unpin + Send> MsgWriter<W> {
    pub fn new(io: W, write_timeout: Duration) -> Self {
        Self { io: Mutex::new(io), write_timeout }
    }

    /// Encode and write one frame under the write deadline. A deadline
    /// miss or io error means the connection is broken.
    pub async fn send(&self, msg: &Value) -> Result<(), RpcError> {
        let mut frame = Vec::with_capacity(256);
        frame.extend_from_slice(&[0u8; FRAME_HEAD_LEN]);
        if let Err(e) = rmpv::encode::write_value(&mut frame, msg) {
            warn!("frame encode failed: {:?}", e);
            return Err(RpcIntErr::Encode.into());
        }
        let body_len = (frame.len() - FRAME_HEAD_LEN) as u32;
        frame[..FRAME_HEAD_LEN].copy_from_slice(&body_len.to_be_bytes());

        let mut io = self.io.lock().await;
        match tokio::time::timeout(self.write_timeout, async {
            io.write_all(&frame).await?;
            io.flush().await
        })
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                debug!("frame write failed: {:?}", e);
                Err(RpcIntErr::IO.into())
            }
            Err(_) => {
                warn!("frame write missed the {:?} deadline", self.write_timeout);
                Err(RpcIntErr::IO.into())
            }
        }
    }

    /// Shut the stream down on the write side.
    pub async fn shutdown(&self) {
        let mut io = self.io.lock().await;
        let _ = io.shutdown().await;
    }
}
