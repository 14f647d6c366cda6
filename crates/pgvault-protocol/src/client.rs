//! Protocol client.
//!
//! Wraps any byte stream carrying the framed protocol: the stdio of a
//! spawned worker process, a tunnel to a remote host, or an in-memory pipe
//! in tests. Every round trip runs under the protocol timeout.

use crate::message::{Request, Response, CMD_EXIT, CMD_NOOP};
use pgvault_common::{Error, Result};
use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

/// Default keep-alive interval for idle connections.
pub const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

pub struct ProtocolClient {
    reader: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    protocol_timeout: Duration,
    last_activity: Instant,
    /// Owned child process, reaped when the client drops.
    child: Option<Child>,
    name: String,
}

impl ProtocolClient {
    /// Client over an arbitrary stream pair.
    pub fn new(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        protocol_timeout: Duration,
        name: impl Into<String>,
    ) -> Self {
        ProtocolClient {
            reader: BufReader::new(Box::new(reader)),
            writer: Box::new(writer),
            protocol_timeout,
            last_activity: Instant::now(),
            child: None,
            name: name.into(),
        }
    }

    /// Spawn a worker subprocess and speak the protocol over its stdio.
    pub fn spawn(
        program: &str,
        args: &[String],
        protocol_timeout: Duration,
        name: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| Error::HostConnect(format!("unable to spawn '{program}': {err}")))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::HostConnect(format!("no stdout from '{program}'")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::HostConnect(format!("no stdin for '{program}'")))?;

        debug!(name = %name, program = program, "spawned protocol worker");

        let mut client = Self::new(stdout, stdin, protocol_timeout, name);
        client.child = Some(child);
        Ok(client)
    }

    /// One request/response round trip.
    pub async fn call(&mut self, cmd: &str, param: Vec<Value>) -> Result<Vec<Value>> {
        let request = Request::new(cmd, param);
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');

        let round_trip = async {
            self.writer.write_all(line.as_bytes()).await?;
            self.writer.flush().await?;

            let mut response_line = String::new();
            let read = self.reader.read_line(&mut response_line).await?;
            if read == 0 {
                return Err(Error::Protocol(format!(
                    "connection to '{}' closed unexpectedly",
                    self.name
                )));
            }

            Ok(response_line)
        };

        let response_line = timeout(self.protocol_timeout, round_trip).await.map_err(|_| {
            Error::ProtocolTimeout(format!(
                "no response from '{}' for '{cmd}' within {:?}",
                self.name, self.protocol_timeout
            ))
        })??;

        self.last_activity = Instant::now();

        let response: Response = serde_json::from_str(response_line.trim_end())
            .map_err(|_| Error::Protocol(format!("malformed response from '{}'", self.name)))?;

        response.into_result()
    }

    /// Send a no-op when the connection has been idle for longer than the
    /// keep-alive interval. Called during long local-only phases so remote
    /// ends do not conclude the driver died.
    pub async fn keep_alive(&mut self) -> Result<()> {
        if self.last_activity.elapsed() >= KEEP_ALIVE_INTERVAL {
            self.call(CMD_NOOP, vec![]).await?;
        }
        Ok(())
    }

    /// Ask the remote end to exit cleanly. Errors are ignored: the remote
    /// may already be gone, and the process is reaped on drop regardless.
    pub async fn shutdown(&mut self) {
        let request = Request::new(CMD_EXIT, vec![]);
        if let Ok(mut line) = serde_json::to_string(&request) {
            line.push('\n');
            let exit = async {
                self.writer.write_all(line.as_bytes()).await?;
                self.writer.flush().await?;
                std::io::Result::Ok(())
            };
            if timeout(self.protocol_timeout, exit).await.is_err() {
                warn!(name = %self.name, "timeout sending exit");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_call_round_trip() {
        let (client_io, server_io) = duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, mut server_write) = tokio::io::split(server_io);

        let server = tokio::spawn(async move {
            let mut lines = BufReader::new(server_read).lines();
            let line = lines.next_line().await.unwrap().unwrap();
            assert_eq!(line, r#"{"cmd":"backupFile","param":["pg_data/PG_VERSION"]}"#);
            server_write.write_all(b"{\"out\":[\"copied\",3]}\n").await.unwrap();
        });

        let mut client =
            ProtocolClient::new(client_read, client_write, Duration::from_secs(5), "test");
        let out = client.call("backupFile", vec![json!("pg_data/PG_VERSION")]).await.unwrap();
        assert_eq!(out, vec![json!("copied"), json!(3)]);

        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_response_reconstructs_kind() {
        let (client_io, server_io) = duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, mut server_write) = tokio::io::split(server_io);

        tokio::spawn(async move {
            let mut lines = BufReader::new(server_read).lines();
            lines.next_line().await.unwrap();
            server_write
                .write_all(b"{\"err\":55,\"message\":\"file missing: pg_data/gone\"}\n")
                .await
                .unwrap();
        });

        let mut client =
            ProtocolClient::new(client_read, client_write, Duration::from_secs(5), "test");
        let err = client.call("backupFile", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::FileMissing(_)));
    }

    #[tokio::test]
    async fn test_timeout() {
        let (client_io, _server_io) = duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_io);

        let mut client =
            ProtocolClient::new(client_read, client_write, Duration::from_millis(50), "stalled");
        let err = client.call(CMD_NOOP, vec![]).await.unwrap_err();
        assert!(matches!(err, Error::ProtocolTimeout(_)));
    }

    #[tokio::test]
    async fn test_keep_alive_noop_when_recently_active() {
        let (client_io, _server_io) = duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_io);

        // Fresh connection: nothing is sent, so the dead peer is never
        // noticed.
        let mut client =
            ProtocolClient::new(client_read, client_write, Duration::from_millis(50), "idle");
        client.keep_alive().await.unwrap();
    }

    #[tokio::test]
    async fn test_closed_connection() {
        let (client_io, server_io) = duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_io);
        drop(server_io);

        let mut client =
            ProtocolClient::new(client_read, client_write, Duration::from_secs(5), "gone");
        let err = client.call(CMD_NOOP, vec![]).await.unwrap_err();
        assert!(matches!(err, Error::Protocol(_) | Error::Io(_)));
    }
}
