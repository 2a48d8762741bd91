// src/incremental/psync.rs

//! The real-time PSYNC replica handshake, RDB-body skip, and command-stream
//! reader with ACK heartbeats. Grounded on the teacher's
//! `ReplicaWorker`: same handshake sequence, same offset accounting
//! (exact wire length per decoded command), same ACK-on-interval loop.

use crate::config::EndpointConfig;
use crate::errors::ReplError;
use crate::protocol::{RespFrame, RespFrameCodec};
use bytes::{Buf, Bytes, BytesMut};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder};
use tracing::info;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const RDB_SKIP_TIMEOUT: Duration = Duration::from_secs(300);
const STREAMING_READ_TIMEOUT: Duration = Duration::from_secs(1);
const ACK_INTERVAL: Duration = Duration::from_secs(1);

/// Commands that never get replicated onward to targets: replication
/// control-plane traffic and commands with no data-mutating effect here.
pub(crate) const FILTERED_COMMANDS: &[&str] = &[
    "PING",
    "REPLCONF",
    "SELECT",
    "INFO",
    "CONFIG",
    "MONITOR",
    "SUBSCRIBE",
    "PSUBSCRIBE",
    "UNSUBSCRIBE",
    "PUNSUBSCRIBE",
];

#[derive(Debug, Clone, Default)]
pub struct ReplicationCursor {
    pub replication_id: String,
    pub replication_offset: i64,
}

/// One decoded, filtered command ready for fan-out.
#[derive(Debug, Clone)]
pub struct ReplicatedCommand {
    pub db_index: i64,
    pub argv: Vec<Bytes>,
}

/// A bare RESP connection used only for the replica handshake and the raw
/// byte reads the RDB boundary requires; separate from [`RedisClient`]
/// because it must drop to non-RESP-framed reads mid-session.
pub(crate) struct RawConn {
    pub(crate) stream: TcpStream,
    pub(crate) buf: BytesMut,
    pub(crate) codec: RespFrameCodec,
    pub(crate) read_timeout: Duration,
}

impl RawConn {
    pub(crate) async fn connect(addr: &str, timeout: Duration) -> Result<Self, ReplError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ReplError::Timeout)??;
        stream.set_nodelay(true).ok();
        Ok(Self {
            stream,
            buf: BytesMut::with_capacity(64 * 1024),
            codec: RespFrameCodec,
            read_timeout: timeout,
        })
    }

    pub(crate) async fn command(&mut self, argv: &[&[u8]]) -> Result<RespFrame, ReplError> {
        let frame = RespFrame::command(argv.iter().map(|a| Bytes::copy_from_slice(a)));
        self.send_frame(frame).await?;
        self.recv_frame().await
    }

    pub(crate) async fn send_frame(&mut self, frame: RespFrame) -> Result<(), ReplError> {
        let mut out = BytesMut::new();
        self.codec.encode(frame, &mut out)?;
        self.stream.write_all(&out).await?;
        Ok(())
    }

    pub(crate) async fn recv_frame(&mut self) -> Result<RespFrame, ReplError> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buf)? {
                return Ok(frame);
            }
            let n = tokio::time::timeout(self.read_timeout, self.stream.read_buf(&mut self.buf))
                .await
                .map_err(|_| ReplError::Timeout)??;
            if n == 0 {
                return Err(closed_error());
            }
        }
    }

    /// Reads the `$<len>\r\n` RDB bulk header byte-by-byte (never
    /// over-reading past the CRLF), then discards exactly `len` bytes.
    pub(crate) async fn skip_rdb(&mut self) -> Result<(), ReplError> {
        let header = loop {
            if let Some(pos) = find_subslice(&self.buf, b"\r\n") {
                let line = self.buf[..pos].to_vec();
                self.buf.advance(pos + 2);
                break line;
            }
            let n = tokio::time::timeout(self.read_timeout, self.stream.read_buf(&mut self.buf))
                .await
                .map_err(|_| ReplError::Timeout)??;
            if n == 0 {
                return Err(closed_error());
            }
        };
        if header.first() != Some(&b'$') {
            return Err(ReplError::Protocol(format!(
                "expected RDB bulk header, got {:?}",
                String::from_utf8_lossy(&header)
            )));
        }
        let len: usize = std::str::from_utf8(&header[1..])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| ReplError::Protocol("malformed RDB length".into()))?;

        let mut remaining = len;
        while remaining > 0 {
            if !self.buf.is_empty() {
                let take = remaining.min(self.buf.len());
                self.buf.advance(take);
                remaining -= take;
                continue;
            }
            let n = tokio::time::timeout(self.read_timeout, self.stream.read_buf(&mut self.buf))
                .await
                .map_err(|_| ReplError::Timeout)??;
            if n == 0 {
                return Err(closed_error());
            }
        }
        Ok(())
    }
}

pub(crate) fn closed_error() -> ReplError {
    ReplError::Io(std::sync::Arc::new(std::io::Error::new(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed by peer",
    )))
}

pub(crate) fn find_subslice(buf: &[u8], pat: &[u8]) -> Option<usize> {
    buf.windows(pat.len()).position(|w| w == pat)
}

/// Drives one source connection through `HANDSHAKE -> PSYNC_SENT ->
/// RDB_SKIP -> STREAMING`, reconnecting callers go through [`Self::connect`]
/// again, which reuses the stored cursor to attempt `CONTINUE`.
pub struct PsyncHandler {
    endpoint: EndpointConfig,
    listening_port: u16,
    cursor: ReplicationCursor,
    db_index: i64,
    conn: Option<RawConn>,
    last_ack_sent: Instant,
}

impl PsyncHandler {
    pub fn new(endpoint: EndpointConfig, listening_port: u16) -> Self {
        Self {
            endpoint,
            listening_port,
            cursor: ReplicationCursor::default(),
            db_index: 0,
            conn: None,
            last_ack_sent: Instant::now(),
        }
    }

    pub fn cursor(&self) -> &ReplicationCursor {
        &self.cursor
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    /// Performs the handshake and, on `FULLRESYNC`, skips the RDB body.
    /// Idempotent: a no-op if already connected.
    pub async fn connect(&mut self) -> Result<(), ReplError> {
        if self.conn.is_some() {
            return Ok(());
        }

        let addr = format!("{}:{}", self.endpoint.host, self.endpoint.port);
        let mut conn = RawConn::connect(&addr, CONNECT_TIMEOUT).await?;
        conn.read_timeout = HANDSHAKE_TIMEOUT;

        if let Some(password) = &self.endpoint.password {
            conn.command(&[b"AUTH", password.as_bytes()]).await?;
        }
        conn.command(&[b"PING"]).await?;
        conn.command(&[
            b"REPLCONF",
            b"listening-port",
            self.listening_port.to_string().as_bytes(),
        ])
        .await?;
        conn.command(&[b"REPLCONF", b"capa", b"eof"]).await?;
        conn.command(&[b"REPLCONF", b"capa", b"psync2"]).await?;

        let (replid_arg, offset_arg) = if self.cursor.replication_id.is_empty() {
            ("?".to_string(), "-1".to_string())
        } else {
            (
                self.cursor.replication_id.clone(),
                self.cursor.replication_offset.to_string(),
            )
        };
        let reply = conn
            .command(&[b"PSYNC", replid_arg.as_bytes(), offset_arg.as_bytes()])
            .await?;

        let resumed = match reply {
            RespFrame::SimpleString(s) if s.to_uppercase().starts_with("CONTINUE") => true,
            RespFrame::SimpleString(s) if s.to_uppercase().starts_with("FULLRESYNC") => {
                let mut parts = s.split_whitespace();
                parts.next();
                let id = parts
                    .next()
                    .ok_or_else(|| ReplError::Protocol("malformed FULLRESYNC reply".into()))?;
                let offset: i64 = parts
                    .next()
                    .and_then(|o| o.parse().ok())
                    .ok_or_else(|| ReplError::Protocol("malformed FULLRESYNC offset".into()))?;
                self.cursor.replication_id = id.to_string();
                self.cursor.replication_offset = offset;
                false
            }
            other => {
                return Err(ReplError::Protocol(format!(
                    "unexpected PSYNC reply: {other:?}"
                )));
            }
        };

        if !resumed {
            conn.read_timeout = RDB_SKIP_TIMEOUT;
            conn.skip_rdb().await?;
        }

        conn.read_timeout = STREAMING_READ_TIMEOUT;
        info!(
            replid = %self.cursor.replication_id,
            offset = self.cursor.replication_offset,
            resumed,
            "psync stream ready"
        );
        self.conn = Some(conn);
        self.last_ack_sent = Instant::now();
        Ok(())
    }

    /// Blocks until the next non-filtered command arrives, sending
    /// `REPLCONF ACK` on the configured interval while waiting. Returns an
    /// error (dropping the connection) on any read or protocol failure, at
    /// which point the caller should reconnect via [`Self::connect`].
    pub async fn next_command(&mut self) -> Result<ReplicatedCommand, ReplError> {
        self.connect().await?;
        loop {
            let frame = {
                let conn = self.conn.as_mut().expect("connected above");
                conn.codec.decode(&mut conn.buf)
            };
            match frame {
                Ok(Some(frame)) => {
                    if let Some(cmd) = self.handle_frame(frame)? {
                        return Ok(cmd);
                    }
                    continue;
                }
                Ok(None) => {}
                Err(e) => {
                    self.conn = None;
                    return Err(e);
                }
            }

            let read_result = {
                let conn = self.conn.as_mut().expect("connected above");
                tokio::time::timeout(Duration::from_millis(250), conn.stream.read_buf(&mut conn.buf))
                    .await
            };
            match read_result {
                Ok(Ok(0)) => {
                    self.conn = None;
                    return Err(closed_error());
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    self.conn = None;
                    return Err(e.into());
                }
                Err(_) => {} // 250ms tick with no data: fall through to the ACK check
            }

            if self.last_ack_sent.elapsed() >= ACK_INTERVAL {
                if let Err(e) = self.send_ack().await {
                    self.conn = None;
                    return Err(e);
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: RespFrame) -> Result<Option<ReplicatedCommand>, ReplError> {
        let wire_len = frame.encode_to_vec()?.len() as i64;
        self.cursor.replication_offset += wire_len;

        let argv = frame
            .into_argv()
            .ok_or_else(|| ReplError::Protocol("expected command array in replication stream".into()))?;
        if argv.is_empty() {
            return Ok(None);
        }
        let name = String::from_utf8_lossy(&argv[0]).to_uppercase();

        if name == "SELECT" {
            if let Some(idx) = argv
                .get(1)
                .and_then(|b| std::str::from_utf8(b).ok())
                .and_then(|s| s.parse().ok())
            {
                self.db_index = idx;
            }
            return Ok(None);
        }
        if FILTERED_COMMANDS.contains(&name.as_str()) {
            return Ok(None);
        }

        Ok(Some(ReplicatedCommand {
            db_index: self.db_index,
            argv,
        }))
    }

    async fn send_ack(&mut self) -> Result<(), ReplError> {
        let offset = self.cursor.replication_offset.to_string();
        let conn = self.conn.as_mut().expect("connected above");
        conn.send_frame(RespFrame::command([
            Bytes::from_static(b"REPLCONF"),
            Bytes::from_static(b"ACK"),
            Bytes::from(offset),
        ]))
        .await?;
        self.last_ack_sent = Instant::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filtered_commands_include_replication_control_plane() {
        assert!(FILTERED_COMMANDS.contains(&"REPLCONF"));
        assert!(FILTERED_COMMANDS.contains(&"SELECT"));
        assert!(!FILTERED_COMMANDS.contains(&"SET"));
    }

    #[test]
    fn find_subslice_locates_crlf() {
        assert_eq!(find_subslice(b"$123\r\nrest", b"\r\n"), Some(4));
        assert_eq!(find_subslice(b"no-terminator", b"\r\n"), None);
    }
}
