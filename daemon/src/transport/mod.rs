//! Transport layer for coordinator ↔ worker communication.
//!
//! Provides the `Transport` trait and length-prefixed JSON framing functions.
//! `StdioPipeTransport` talks to a worker process over its stdin/stdout; the
//! worker side of the same framing lives in `crate::worker`.

pub mod protocol;
pub mod stdio_pipe;

pub use protocol::{RunOutcome, WorkerRequest, WorkerResponse};
pub use stdio_pipe::StdioPipeTransport;

use anyhow::Result;
use async_trait::async_trait;

/// Largest frame either side accepts (64 MiB). Anything bigger is treated
/// as a corrupted stream rather than allocated.
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Abstraction over coordinator ↔ worker communication channels.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a request and wait for the response.
    ///
    /// Access is mutex-guarded internally, so concurrent callers serialize.
    /// Dropping the returned future mid-flight leaves the channel in an
    /// unknown state; callers must `kill` the transport afterwards.
    async fn request(&self, req: &WorkerRequest) -> Result<WorkerResponse>;

    /// Gracefully shut down the transport and the underlying worker process.
    async fn shutdown(&self) -> Result<()>;

    /// Forcibly terminate the worker process. Idempotent.
    async fn kill(&self);

    /// Check whether the underlying worker process is still alive.
    fn is_alive(&self) -> bool;

    /// OS process id of the worker, if known.
    fn pid(&self) -> Option<u32>;
}

/// Write one frame: a 4-byte big-endian length followed by `payload`.
///
/// Header and payload go out in a single write so a frame is never split
/// across two writes on the pipe.
pub async fn send_message<W: tokio::io::AsyncWriteExt + Unpin>(
    writer: &mut W,
    payload: &[u8],
) -> Result<()> {
    anyhow::ensure!(
        payload.len() <= MAX_FRAME_BYTES,
        "Frame exceeds max size: {} > {MAX_FRAME_BYTES}",
        payload.len()
    );
    let header = u32::try_from(payload.len())?.to_be_bytes();

    let mut frame = Vec::with_capacity(header.len() + payload.len());
    frame.extend_from_slice(&header);
    frame.extend_from_slice(payload);

    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one frame and return its payload.
///
/// A stream that ends before the header surfaces as an `io::Error` of kind
/// `UnexpectedEof`, which the worker treats as a clean hang-up.
pub async fn recv_message<R: tokio::io::AsyncReadExt + Unpin>(
    reader: &mut R,
) -> Result<Vec<u8>> {
    let announced = usize::try_from(reader.read_u32().await?)?;
    anyhow::ensure!(
        announced <= MAX_FRAME_BYTES,
        "Frame exceeds max size: {announced} > {MAX_FRAME_BYTES}"
    );

    let mut payload = vec![0u8; announced];
    reader.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Serialize and send one JSON message.
pub async fn send_json<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: tokio::io::AsyncWriteExt + Unpin,
    T: serde::Serialize + Sync,
{
    let bytes = serde_json::to_vec(msg)?;
    send_message(writer, &bytes).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_framing() {
        let payload = b"hello world";
        let mut buf = Vec::new();

        send_message(&mut buf, payload).await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let received = recv_message(&mut cursor).await.unwrap();
        assert_eq!(received, payload);
    }

    #[tokio::test]
    async fn empty_payload() {
        let mut buf = Vec::new();
        send_message(&mut buf, b"").await.unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let received = recv_message(&mut cursor).await.unwrap();
        assert!(received.is_empty());
    }

    #[tokio::test]
    async fn truncated_frame_is_an_error() {
        // Header announces 5 bytes, stream ends after 3
        let mut reader = tokio_test::io::Builder::new()
            .read(&[0, 0, 0, 5])
            .read(b"hel")
            .build();
        assert!(recv_message(&mut reader).await.is_err());
    }

    #[tokio::test]
    async fn oversized_header_is_rejected() {
        let mut reader = tokio_test::io::Builder::new()
            .read(&u32::MAX.to_be_bytes())
            .build();
        let err = recv_message(&mut reader).await.unwrap_err();
        assert!(err.to_string().contains("exceeds max size"));
    }

    #[tokio::test]
    async fn protocol_serialize_request() {
        let req = WorkerRequest::Execute {
            id: 1,
            code: "print(42)".to_string(),
            max_output_bytes: 1024,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"type\":\"execute\""));
        assert!(json.contains("\"code\":\"print(42)\""));
    }

    #[tokio::test]
    async fn protocol_serialize_outcome() {
        let resp = WorkerResponse::Result {
            id: 1,
            outcome: RunOutcome::Raised {
                stdout: "before\n".to_string(),
                message: "division by zero".to_string(),
            },
        };
        let json = serde_json::to_string(&resp).unwrap();
        assert!(json.contains("\"type\":\"result\""));
        assert!(json.contains("\"status\":\"raised\""));

        let back: WorkerResponse = serde_json::from_str(&json).unwrap();
        match back {
            WorkerResponse::Result { id, outcome } => {
                assert_eq!(id, 1);
                assert_eq!(outcome.stdout(), "before\n");
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn protocol_deserialize_ready() {
        let json = r#"{"type":"ready"}"#;
        let resp: WorkerResponse = serde_json::from_str(json).unwrap();
        assert!(matches!(resp, WorkerResponse::Ready));
    }
}
