//! Protocol server loop.
//!
//! Reads one request per line, dispatches to a handler, writes one response
//! per line. Runs over stdio in a worker process and over in-memory pipes in
//! tests; the loop is transport-agnostic.

use crate::message::{Request, Response, CMD_EXIT, CMD_NOOP};
use async_trait::async_trait;
use pgvault_common::{Error, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

/// Dispatch target for one connection.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, cmd: &str, param: Vec<Value>) -> Result<Vec<Value>>;
}

/// Serve until the peer sends `exit` or closes the stream. Handler errors
/// are reported to the peer as error frames; only transport failures end the
/// loop early.
pub async fn serve(
    reader: impl AsyncRead + Unpin,
    mut writer: impl AsyncWrite + Unpin,
    handler: &dyn CommandHandler,
) -> Result<()> {
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                warn!("dropping malformed request: {err}");
                let response = Response::error(&Error::Protocol(format!("malformed request: {err}")));
                write_response(&mut writer, &response).await?;
                continue;
            }
        };

        debug!(cmd = %request.cmd, "request");

        match request.cmd.as_str() {
            CMD_EXIT => break,
            CMD_NOOP => write_response(&mut writer, &Response::ok(vec![])).await?,
            cmd => {
                let response = match handler.handle(cmd, request.param).await {
                    Ok(out) => Response::ok(out),
                    Err(err) => Response::error(&err),
                };
                write_response(&mut writer, &response).await?;
            }
        }
    }

    Ok(())
}

async fn write_response(writer: &mut (impl AsyncWrite + Unpin), response: &Response) -> Result<()> {
    let mut line = serde_json::to_string(response)?;
    line.push('\n');
    writer.write_all(line.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ProtocolClient;
    use serde_json::json;
    use std::time::Duration;
    use tokio::io::duplex;

    struct EchoHandler;

    #[async_trait]
    impl CommandHandler for EchoHandler {
        async fn handle(&self, cmd: &str, param: Vec<Value>) -> Result<Vec<Value>> {
            match cmd {
                "echo" => Ok(param),
                "boom" => Err(Error::Storage("disk on fire".into())),
                other => Err(Error::Assert(format!("unknown command '{other}'"))),
            }
        }
    }

    #[tokio::test]
    async fn test_serve_dispatch() {
        let (client_io, server_io) = duplex(4096);
        let (client_read, client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);

        let server = tokio::spawn(async move {
            serve(server_read, server_write, &EchoHandler).await.unwrap();
        });

        let mut client =
            ProtocolClient::new(client_read, client_write, Duration::from_secs(5), "test");

        let out = client.call("echo", vec![json!(1), json!("two")]).await.unwrap();
        assert_eq!(out, vec![json!(1), json!("two")]);

        // Handler errors come back as error frames, not dropped connections.
        let err = client.call("boom", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::Storage(_)));

        // Noop answers without touching the handler; exit ends the loop.
        client.call(CMD_NOOP, vec![]).await.unwrap();
        client.shutdown().await;
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_serve_survives_malformed_line() {
        let (client_io, server_io) = duplex(4096);
        let (mut client_read, mut client_write) = tokio::io::split(client_io);
        let (server_read, server_write) = tokio::io::split(server_io);

        let server = tokio::spawn(async move {
            serve(server_read, server_write, &EchoHandler).await.unwrap();
        });

        client_write.write_all(b"this is not json\n").await.unwrap();

        let mut response = String::new();
        let mut reader = BufReader::new(&mut client_read);
        reader.read_line(&mut response).await.unwrap();
        assert!(response.contains("\"err\""));

        client_write.shutdown().await.unwrap();
        drop(reader);
        server.await.unwrap();
    }
}
