// src/incremental/sync_mode.rs

//! The legacy `SYNC` incremental mode: a single bulk RDB reply followed by
//! the same command stream as PSYNC, but with no offset/ACK negotiation and
//! no `CONTINUE` resumption — every reconnect is a fresh full RDB transfer.

use crate::config::EndpointConfig;
use crate::errors::ReplError;
use crate::incremental::psync::{closed_error, RawConn, ReplicatedCommand, FILTERED_COMMANDS};
use crate::protocol::RespFrame;
use bytes::Bytes;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::codec::Decoder;
use tracing::info;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RDB_SKIP_TIMEOUT: Duration = Duration::from_secs(300);
// No ACK heartbeat exists in this mode, so there is no 1s tick requirement;
// a generous idle timeout just guards against a silently dead socket.
const STREAMING_READ_TIMEOUT: Duration = Duration::from_secs(300);

pub struct SyncHandler {
    endpoint: EndpointConfig,
    db_index: i64,
    conn: Option<RawConn>,
}

impl SyncHandler {
    pub fn new(endpoint: EndpointConfig) -> Self {
        Self {
            endpoint,
            db_index: 0,
            conn: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn.is_some()
    }

    pub async fn connect(&mut self) -> Result<(), ReplError> {
        if self.conn.is_some() {
            return Ok(());
        }
        let addr = format!("{}:{}", self.endpoint.host, self.endpoint.port);
        let mut conn = RawConn::connect(&addr, CONNECT_TIMEOUT).await?;

        if let Some(password) = &self.endpoint.password {
            conn.command(&[b"AUTH", password.as_bytes()]).await?;
        }
        conn.command(&[b"PING"]).await?;

        // SYNC replies with the RDB as a single bulk string, no preceding
        // status line the way PSYNC's FULLRESYNC/CONTINUE reply has.
        conn.send_frame(RespFrame::command([Bytes::from_static(b"SYNC")]))
            .await?;
        conn.read_timeout = RDB_SKIP_TIMEOUT;
        conn.skip_rdb().await?;

        conn.read_timeout = STREAMING_READ_TIMEOUT;
        info!("sync stream ready");
        self.conn = Some(conn);
        Ok(())
    }

    /// Blocks until the next non-filtered command arrives. No ACK heartbeat
    /// exists in this mode; the caller's only recourse on disconnect is a
    /// fresh `connect()`, which re-runs the whole RDB transfer.
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

            let conn = self.conn.as_mut().expect("connected above");
            let n = tokio::time::timeout(conn.read_timeout, conn.stream.read_buf(&mut conn.buf))
                .await
                .map_err(|_| ReplError::Timeout);
            match n {
                Ok(Ok(0)) => {
                    self.conn = None;
                    return Err(closed_error());
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    self.conn = None;
                    return Err(e.into());
                }
                Err(_) => {
                    self.conn = None;
                    return Err(ReplError::Timeout);
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: RespFrame) -> Result<Option<ReplicatedCommand>, ReplError> {
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
}
