// src/conn/client.rs

//! A minimal asynchronous Redis-compatible client used to talk to the
//! source and to every target as a peer, not a server. Mirrors the shape of
//! a small internal RESP client: one TCP connection, one codec, one
//! read/write buffer pair, and a handful of typed convenience methods built
//! on top of a generic `command`/`pipeline` primitive.

use crate::config::EndpointConfig;
use crate::errors::ReplError;
use crate::protocol::{RespFrame, RespFrameCodec};
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(5);

/// A single connection to a Redis-compatible endpoint.
pub struct RedisClient {
    stream: TcpStream,
    codec: RespFrameCodec,
    read_buf: BytesMut,
    write_buf: BytesMut,
    read_timeout: Duration,
}

impl RedisClient {
    /// Connects, authenticates, and selects the configured database.
    pub async fn connect(endpoint: &EndpointConfig) -> Result<Self, ReplError> {
        let addr = format!("{}:{}", endpoint.host, endpoint.port);
        let stream = tokio::time::timeout(DEFAULT_CONNECT_TIMEOUT, TcpStream::connect(&addr))
            .await
            .map_err(|_| ReplError::Timeout)??;
        stream.set_nodelay(true).ok();

        let mut client = Self {
            stream,
            codec: RespFrameCodec,
            read_buf: BytesMut::with_capacity(16 * 1024),
            write_buf: BytesMut::with_capacity(4 * 1024),
            read_timeout: DEFAULT_READ_TIMEOUT,
        };

        if let Some(password) = &endpoint.password {
            client.command(&[b"AUTH", password.as_bytes()]).await?;
        }
        if endpoint.db != 0 {
            client
                .command(&[b"SELECT", endpoint.db.to_string().as_bytes()])
                .await?;
        }
        Ok(client)
    }

    pub fn set_read_timeout(&mut self, timeout: Duration) {
        self.read_timeout = timeout;
    }

    /// Sends one command frame and waits for exactly one reply. This is the
    /// primitive every typed helper below is built on.
    pub async fn command(&mut self, argv: &[&[u8]]) -> Result<RespFrame, ReplError> {
        let frame = RespFrame::command(argv.iter().map(|a| Bytes::copy_from_slice(a)));
        self.send_frame(frame).await?;
        self.recv_frame().await
    }

    /// Sends every command in `cmds` back to back without waiting between
    /// them, then reads exactly `cmds.len()` replies in order. This is the
    /// non-transactional pipeline the bulk migrator and verifier rely on.
    pub async fn pipeline(&mut self, cmds: &[Vec<Bytes>]) -> Result<Vec<RespFrame>, ReplError> {
        self.write_buf.clear();
        for cmd in cmds {
            let frame = RespFrame::command(cmd.clone());
            self.codec.encode(frame, &mut self.write_buf)?;
        }
        self.stream.write_all(&self.write_buf).await?;

        let mut out = Vec::with_capacity(cmds.len());
        for _ in 0..cmds.len() {
            out.push(self.recv_frame().await?);
        }
        Ok(out)
    }

    pub async fn send_frame(&mut self, frame: RespFrame) -> Result<(), ReplError> {
        self.write_buf.clear();
        self.codec.encode(frame, &mut self.write_buf)?;
        self.stream.write_all(&self.write_buf).await?;
        Ok(())
    }

    pub async fn recv_frame(&mut self) -> Result<RespFrame, ReplError> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.read_buf)? {
                return Ok(frame);
            }
            let read_fut = self.stream.read_buf(&mut self.read_buf);
            let n = tokio::time::timeout(self.read_timeout, read_fut)
                .await
                .map_err(|_| ReplError::Timeout)??;
            if n == 0 {
                return Err(ReplError::Io(std::sync::Arc::new(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by peer",
                ))));
            }
        }
    }

    /// Gives up ownership of the underlying socket, used by the PSYNC/SYNC
    /// handler which needs to drop down to raw byte reads for the RDB body.
    pub fn into_parts(self) -> (TcpStream, BytesMut) {
        (self.stream, self.read_buf)
    }

    pub async fn ping(&mut self) -> Result<bool, ReplError> {
        match self.command(&[b"PING"]).await? {
            RespFrame::SimpleString(s) => Ok(s.eq_ignore_ascii_case("PONG")),
            _ => Ok(false),
        }
    }

    pub async fn dbsize(&mut self) -> Result<i64, ReplError> {
        match self.command(&[b"DBSIZE"]).await? {
            RespFrame::Integer(n) => Ok(n),
            other => Err(ReplError::Protocol(format!("unexpected DBSIZE reply: {other:?}"))),
        }
    }

    pub async fn flushdb(&mut self) -> Result<(), ReplError> {
        self.command(&[b"FLUSHDB"]).await?;
        Ok(())
    }

    /// One SCAN page. Returns the next cursor (0 means the sweep is done)
    /// and the keys returned in this page.
    pub async fn scan(
        &mut self,
        cursor: u64,
        pattern: &str,
        count: usize,
    ) -> Result<(u64, Vec<Bytes>), ReplError> {
        let reply = self
            .command(&[
                b"SCAN",
                cursor.to_string().as_bytes(),
                b"MATCH",
                pattern.as_bytes(),
                b"COUNT",
                count.to_string().as_bytes(),
            ])
            .await?;
        match reply {
            RespFrame::Array(mut items) if items.len() == 2 => {
                let keys_frame = items.pop().unwrap();
                let cursor_frame = items.pop().unwrap();
                let next_cursor = match cursor_frame {
                    RespFrame::BulkString(b) => std::str::from_utf8(&b)
                        .ok()
                        .and_then(|s| s.parse().ok())
                        .ok_or_else(|| ReplError::Protocol("bad SCAN cursor".into()))?,
                    _ => return Err(ReplError::Protocol("bad SCAN cursor frame".into())),
                };
                let keys = match keys_frame {
                    RespFrame::Array(items) => items
                        .into_iter()
                        .filter_map(|f| f.as_bulk_string().cloned())
                        .collect(),
                    _ => return Err(ReplError::Protocol("bad SCAN keys frame".into())),
                };
                Ok((next_cursor, keys))
            }
            other => Err(ReplError::Protocol(format!("unexpected SCAN reply: {other:?}"))),
        }
    }

    pub async fn type_of(&mut self, key: &[u8]) -> Result<String, ReplError> {
        match self.command(&[b"TYPE", key]).await? {
            RespFrame::SimpleString(s) => Ok(s),
            other => Err(ReplError::Protocol(format!("unexpected TYPE reply: {other:?}"))),
        }
    }

    pub async fn dump(&mut self, key: &[u8]) -> Result<Option<Bytes>, ReplError> {
        match self.command(&[b"DUMP", key]).await? {
            RespFrame::BulkString(b) => Ok(Some(b)),
            RespFrame::Null => Ok(None),
            other => Err(ReplError::Protocol(format!("unexpected DUMP reply: {other:?}"))),
        }
    }

    pub async fn pttl(&mut self, key: &[u8]) -> Result<i64, ReplError> {
        match self.command(&[b"PTTL", key]).await? {
            RespFrame::Integer(n) => Ok(n),
            other => Err(ReplError::Protocol(format!("unexpected PTTL reply: {other:?}"))),
        }
    }

    pub async fn restore_replace(
        &mut self,
        key: &[u8],
        ttl_ms: i64,
        payload: &[u8],
    ) -> Result<(), ReplError> {
        let ttl = ttl_ms.max(0).to_string();
        match self
            .command(&[b"RESTORE", key, ttl.as_bytes(), payload, b"REPLACE"])
            .await?
        {
            RespFrame::SimpleString(_) => Ok(()),
            RespFrame::Error(e) => Err(ReplError::TargetRejected(e)),
            other => Err(ReplError::Protocol(format!("unexpected RESTORE reply: {other:?}"))),
        }
    }

    pub async fn exists(&mut self, key: &[u8]) -> Result<bool, ReplError> {
        match self.command(&[b"EXISTS", key]).await? {
            RespFrame::Integer(n) => Ok(n > 0),
            other => Err(ReplError::Protocol(format!("unexpected EXISTS reply: {other:?}"))),
        }
    }

    pub async fn ttl(&mut self, key: &[u8]) -> Result<i64, ReplError> {
        match self.command(&[b"TTL", key]).await? {
            RespFrame::Integer(n) => Ok(n),
            other => Err(ReplError::Protocol(format!("unexpected TTL reply: {other:?}"))),
        }
    }

    pub async fn object_idletime(&mut self, key: &[u8]) -> Result<i64, ReplError> {
        match self.command(&[b"OBJECT", b"IDLETIME", key]).await? {
            RespFrame::Integer(n) => Ok(n),
            other => Err(ReplError::Protocol(format!(
                "unexpected OBJECT IDLETIME reply: {other:?}"
            ))),
        }
    }

    pub async fn get(&mut self, key: &[u8]) -> Result<Option<Bytes>, ReplError> {
        match self.command(&[b"GET", key]).await? {
            RespFrame::BulkString(b) => Ok(Some(b)),
            RespFrame::Null => Ok(None),
            other => Err(ReplError::Protocol(format!("unexpected GET reply: {other:?}"))),
        }
    }

    pub async fn lrange_all(&mut self, key: &[u8]) -> Result<Vec<Bytes>, ReplError> {
        match self.command(&[b"LRANGE", key, b"0", b"-1"]).await? {
            RespFrame::Array(items) => Ok(bulk_vec(items)),
            other => Err(ReplError::Protocol(format!("unexpected LRANGE reply: {other:?}"))),
        }
    }

    pub async fn smembers(&mut self, key: &[u8]) -> Result<Vec<Bytes>, ReplError> {
        match self.command(&[b"SMEMBERS", key]).await? {
            RespFrame::Array(items) => Ok(bulk_vec(items)),
            other => Err(ReplError::Protocol(format!("unexpected SMEMBERS reply: {other:?}"))),
        }
    }

    pub async fn zrange_withscores(&mut self, key: &[u8]) -> Result<Vec<(Bytes, f64)>, ReplError> {
        match self
            .command(&[b"ZRANGE", key, b"0", b"-1", b"WITHSCORES"])
            .await?
        {
            RespFrame::Array(items) => {
                let flat = bulk_vec(items);
                let mut out = Vec::with_capacity(flat.len() / 2);
                let mut it = flat.into_iter();
                while let (Some(member), Some(score)) = (it.next(), it.next()) {
                    let score: f64 = std::str::from_utf8(&score)
                        .ok()
                        .and_then(|s| s.parse().ok())
                        .unwrap_or(0.0);
                    out.push((member, score));
                }
                Ok(out)
            }
            other => Err(ReplError::Protocol(format!("unexpected ZRANGE reply: {other:?}"))),
        }
    }

    pub async fn hgetall(&mut self, key: &[u8]) -> Result<Vec<(Bytes, Bytes)>, ReplError> {
        match self.command(&[b"HGETALL", key]).await? {
            RespFrame::Array(items) => {
                let flat = bulk_vec(items);
                let mut out = Vec::with_capacity(flat.len() / 2);
                let mut it = flat.into_iter();
                while let (Some(field), Some(value)) = (it.next(), it.next()) {
                    out.push((field, value));
                }
                Ok(out)
            }
            other => Err(ReplError::Protocol(format!("unexpected HGETALL reply: {other:?}"))),
        }
    }

    /// Applies an already-decoded command (argv form) verbatim, used by the
    /// PSYNC/SYNC fan-out path to replay a source command on a target.
    pub async fn execute_argv(&mut self, argv: &[Bytes]) -> Result<RespFrame, ReplError> {
        let refs: Vec<&[u8]> = argv.iter().map(|b| b.as_ref()).collect();
        self.command(&refs).await
    }
}

fn bulk_vec(items: Vec<RespFrame>) -> Vec<Bytes> {
    items
        .into_iter()
        .filter_map(|f| f.as_bulk_string().cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_vec_drops_non_bulk_frames() {
        let items = vec![
            RespFrame::BulkString("a".into()),
            RespFrame::Integer(1),
            RespFrame::BulkString("b".into()),
        ];
        assert_eq!(bulk_vec(items), vec![Bytes::from("a"), Bytes::from("b")]);
    }
}
