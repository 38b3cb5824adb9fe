//! Worker side of the coordinator ↔ worker protocol.
//!
//! A worker announces `Ready`, then answers framed requests on its stdin
//! until `Shutdown` or EOF. Each `Execute` runs on a blocking thread in a
//! fresh restricted environment; the worker's own stdout carries nothing
//! but response frames.

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, instrument, warn};

use crate::sandbox;
use crate::transport::{recv_message, send_json, WorkerRequest, WorkerResponse};

/// Serve requests from `reader`, writing responses to `writer`.
pub async fn serve<R, W>(mut reader: R, mut writer: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    send_json(&mut writer, &WorkerResponse::Ready)
        .await
        .context("Failed to announce readiness")?;
    debug!("Worker ready");

    loop {
        let bytes = match recv_message(&mut reader).await {
            Ok(bytes) => bytes,
            Err(e) if is_eof(&e) => {
                debug!("Request stream closed, exiting");
                return Ok(());
            }
            Err(e) => return Err(e.context("Failed to read request")),
        };

        let req: WorkerRequest = match serde_json::from_slice(&bytes) {
            Ok(req) => req,
            Err(e) => {
                warn!(error = %e, "Malformed request");
                let resp = WorkerResponse::Error {
                    message: format!("Malformed request: {e}"),
                };
                send_json(&mut writer, &resp).await?;
                continue;
            }
        };

        let resp = match req {
            WorkerRequest::Execute {
                id,
                code,
                max_output_bytes,
            } => execute(id, code, max_output_bytes).await,
            WorkerRequest::Ping => WorkerResponse::Pong,
            WorkerRequest::Shutdown => {
                // Acknowledged with a Pong so the coordinator can stop waiting
                info!("Shutdown requested");
                send_json(&mut writer, &WorkerResponse::Pong).await?;
                return Ok(());
            }
        };

        send_json(&mut writer, &resp)
            .await
            .context("Failed to write response")?;
    }
}

#[instrument(skip(code), fields(code_len = code.len()))]
async fn execute(id: u64, code: String, max_output_bytes: usize) -> WorkerResponse {
    let run = tokio::task::spawn_blocking(move || sandbox::run_snippet(&code, max_output_bytes));

    match run.await {
        Ok(Ok(outcome)) => WorkerResponse::Result { id, outcome },
        Ok(Err(e)) => WorkerResponse::Error {
            message: format!("{e:#}"),
        },
        Err(join_err) => WorkerResponse::Error {
            message: format!("Execution thread failed: {join_err}"),
        },
    }
}

fn is_eof(err: &anyhow::Error) -> bool {
    err.downcast_ref::<std::io::Error>()
        .is_some_and(|e| e.kind() == std::io::ErrorKind::UnexpectedEof)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{send_message, RunOutcome};
    use tokio::io::{duplex, split};

    async fn read_response<R: AsyncRead + Unpin>(reader: &mut R) -> WorkerResponse {
        let bytes = recv_message(reader).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn announces_ready_and_answers_ping() {
        let (client, server) = duplex(64 * 1024);
        let (server_read, server_write) = split(server);
        let handle = tokio::spawn(serve(server_read, server_write));

        let (mut client_read, mut client_write) = split(client);
        assert!(matches!(read_response(&mut client_read).await, WorkerResponse::Ready));

        send_json(&mut client_write, &WorkerRequest::Ping).await.unwrap();
        assert!(matches!(read_response(&mut client_read).await, WorkerResponse::Pong));

        send_json(&mut client_write, &WorkerRequest::Shutdown).await.unwrap();
        assert!(matches!(read_response(&mut client_read).await, WorkerResponse::Pong));
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn executes_snippet() {
        let (client, server) = duplex(64 * 1024);
        let (server_read, server_write) = split(server);
        let handle = tokio::spawn(serve(server_read, server_write));

        let (mut client_read, mut client_write) = split(client);
        read_response(&mut client_read).await;

        let req = WorkerRequest::Execute {
            id: 7,
            code: "print('hi')".to_string(),
            max_output_bytes: 1024,
        };
        send_json(&mut client_write, &req).await.unwrap();

        match read_response(&mut client_read).await {
            WorkerResponse::Result { id, outcome } => {
                assert_eq!(id, 7);
                assert_eq!(
                    outcome,
                    RunOutcome::Completed {
                        stdout: "hi\n".to_string(),
                        stderr: String::new(),
                    }
                );
            }
            other => panic!("unexpected response: {other:?}"),
        }

        // Closing the request stream ends the loop cleanly
        drop(client_write);
        drop(client_read);
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn malformed_request_gets_error_and_loop_continues() {
        let (client, server) = duplex(64 * 1024);
        let (server_read, server_write) = split(server);
        let handle = tokio::spawn(serve(server_read, server_write));

        let (mut client_read, mut client_write) = split(client);
        read_response(&mut client_read).await;

        send_message(&mut client_write, b"{\"type\":\"bogus\"}").await.unwrap();
        assert!(matches!(
            read_response(&mut client_read).await,
            WorkerResponse::Error { .. }
        ));

        send_json(&mut client_write, &WorkerRequest::Ping).await.unwrap();
        assert!(matches!(read_response(&mut client_read).await, WorkerResponse::Pong));

        drop(client_write);
        drop(client_read);
        handle.await.unwrap().unwrap();
    }
}
