//! `AsyncClient` — the request side of the receipt protocol (spec §4.2).
//!
//! Mirrors the original `caen_tools.connection.client.AsyncClient`: the
//! caller configures a map of logical service name -> TCP address, then
//! calls [`AsyncClient::query`] with a [`Receipt`] already addressed to
//! one of those names. A fresh connection is opened per query (no shared
//! mutable socket state across concurrent callers), matching the
//! original's SNDTIMEO/RCVTIMEO-per-call posture rather than pooling.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::receipt::{Receipt, ReceiptResponse};
use crate::transport::framing::{Frame, FrameDecoder};

/// Default time to wait for a reply before giving up (spec §4.2, §6).
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// A client that sends receipts to directly-addressed services over TCP.
#[derive(Debug, Clone)]
pub struct AsyncClient {
    endpoints: HashMap<String, String>,
    recv_timeout: Duration,
}

impl AsyncClient {
    /// Builds a client from a `{service name -> "host:port"}` map.
    pub fn new(endpoints: HashMap<String, String>) -> Self {
        Self {
            endpoints,
            recv_timeout: DEFAULT_RECV_TIMEOUT,
        }
    }

    /// Overrides the receive timeout (default [`DEFAULT_RECV_TIMEOUT`]).
    #[must_use]
    pub fn with_recv_timeout(mut self, recv_timeout: Duration) -> Self {
        self.recv_timeout = recv_timeout;
        self
    }

    /// Sends `receipt` to `receipt.executor` and waits for its answer.
    ///
    /// Returns a locally-synthesized `404` response (never an `Err`) when
    /// the executor is unknown, and a `503` when the peer doesn't answer
    /// within the receive timeout — connection-level failures (refused,
    /// reset, DNS) are also folded into `503` since, from the caller's
    /// perspective, an unreachable worker and a silent one are the same
    /// outcome: no answer arrived in time.
    pub async fn query(&self, receipt: Receipt) -> Result<Receipt> {
        let Some(addr) = self.endpoints.get(&receipt.executor) else {
            let response = ReceiptResponse::not_found(format!("unknown executor: {}", receipt.executor));
            return Ok(receipt.with_response(response));
        };

        match timeout(self.recv_timeout, self.send_and_recv(addr, &receipt)).await {
            Ok(Ok(answered)) => Ok(answered),
            Ok(Err(err)) => {
                tracing::warn!(executor = %receipt.executor, error = %err, "query failed, returning gateway timeout");
                Ok(receipt.with_response(ReceiptResponse::gateway_timeout()))
            }
            Err(_elapsed) => {
                tracing::warn!(executor = %receipt.executor, timeout_ms = %self.recv_timeout.as_millis(), "query timed out");
                Ok(receipt.with_response(ReceiptResponse::gateway_timeout()))
            }
        }
    }

    async fn send_and_recv(&self, addr: &str, receipt: &Receipt) -> Result<Receipt> {
        let mut stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to {addr}"))?;

        let encoded = Frame::Receipt(receipt.clone()).encode();
        stream.write_all(&encoded).await.context("writing receipt frame")?;
        stream.flush().await.context("flushing receipt frame")?;

        let mut decoder = FrameDecoder::new();
        let mut read_buf = [0u8; 4096];
        loop {
            let n = tokio::io::AsyncReadExt::read(&mut stream, &mut read_buf)
                .await
                .context("reading reply frame")?;
            if n == 0 {
                anyhow::bail!("peer closed connection before replying");
            }
            for frame in decoder.feed(&read_buf[..n])? {
                if let Frame::Receipt(reply) = frame {
                    return Ok(reply);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn unknown_executor_returns_404_without_connecting() {
        let client = AsyncClient::new(HashMap::new());
        let receipt = Receipt::new("test", "nope", "status", serde_json::json!({}));
        let answered = client.query(receipt).await.unwrap();
        assert_eq!(answered.response.unwrap().statuscode, 404);
    }

    #[tokio::test]
    async fn query_round_trips_with_a_fake_server() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut decoder = FrameDecoder::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = socket.read(&mut buf).await.unwrap();
                let frames = decoder.feed(&buf[..n]).unwrap();
                if let Some(Frame::Receipt(receipt)) = frames.into_iter().next() {
                    let answered = receipt.with_response(ReceiptResponse::ok(serde_json::json!({"ok": true})));
                    socket.write_all(&Frame::Receipt(answered).encode()).await.unwrap();
                    break;
                }
            }
        });

        let mut endpoints = HashMap::new();
        endpoints.insert("devback".to_string(), addr.to_string());
        let client = AsyncClient::new(endpoints);
        let receipt = Receipt::new("test", "devback", "status", serde_json::json!({}));
        let answered = client.query(receipt).await.unwrap();

        assert!(answered.response.unwrap().is_ok());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn connection_refused_becomes_gateway_timeout() {
        let mut endpoints = HashMap::new();
        endpoints.insert("devback".to_string(), "127.0.0.1:1".to_string());
        let client = AsyncClient::new(endpoints).with_recv_timeout(Duration::from_millis(200));
        let receipt = Receipt::new("test", "devback", "status", serde_json::json!({}));
        let answered = client.query(receipt).await.unwrap();
        assert_eq!(answered.response.unwrap().statuscode, 503);
    }
}
