//! `RouterServer` — the reply side of the receipt protocol (spec §4.2).
//!
//! A worker (device backend, monitor, or any supervisor-facing service)
//! either [`RouterServer::bind`]s its own listening socket and answers
//! directly-addressed clients, or [`RouterServer::connect`]s into a
//! [`crate::broker::Broker`]'s backend and answers receipts the broker
//! forwards to it. Either way the worker sees the same
//! `recv_receipt`/`send_receipt` pair, mirroring how the original
//! `RouterServer` class hid ZeroMQ ROUTER-socket identity framing behind
//! one API regardless of topology.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::receipt::Receipt;
use crate::transport::framing::{Frame, FrameDecoder, RoutedReceipt};

/// A worker's receipt-handling logic, decoupled from how it's wired to
/// the wire (direct bind vs. broker-backend connect). Implemented by
/// [`crate::services::device_backend::DeviceBackend`],
/// [`crate::services::monitor::Monitor`], and
/// [`crate::supervisor::api::SupervisorApi`].
#[async_trait]
pub trait ReceiptDispatch: Send + Sync {
    /// Answers one receipt.
    async fn dispatch(&self, receipt: Receipt) -> Receipt;
}

/// Runs a worker loop: pull receipts off `server`, answer them with
/// `dispatcher`, until the connection(s) feeding it close.
pub async fn serve(mut server: RouterServer, dispatcher: impl ReceiptDispatch) {
    while let Some(inbound) = server.recv_receipt().await {
        let answered = dispatcher.dispatch(inbound.receipt().clone()).await;
        server.send_receipt(&inbound, answered).await;
    }
}

/// How long `send_receipt` waits for the reply to be flushed before it
/// gives up and logs a drop (spec §4.2: "RCVHWM=1"-style backpressure).
pub const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// A receipt pulled off the wire, paired with however its answer must be
/// routed back.
#[derive(Debug)]
pub struct Inbound {
    /// The receipt to execute.
    pub receipt: Receipt,
    reply_to: ReplyRoute,
}

impl Inbound {
    /// The receipt to execute.
    pub fn receipt(&self) -> &Receipt {
        &self.receipt
    }
}

#[derive(Debug)]
enum ReplyRoute {
    Direct(mpsc::Sender<Frame>),
    Routed {
        identity: String,
        sink: mpsc::Sender<Frame>,
    },
}

/// Binds or dials into the receipt-exchange fabric and exposes a plain
/// receive/reply API regardless of which topology was chosen.
#[derive(Debug)]
pub struct RouterServer {
    inbound_rx: mpsc::Receiver<Inbound>,
    local_addr: Option<std::net::SocketAddr>,
}

impl RouterServer {
    /// Binds a `TcpListener` on `addr` and answers clients that connect
    /// directly (no broker in between) — used by standalone device
    /// backend / monitor processes.
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr).await.with_context(|| format!("binding {addr}"))?;
        let local_addr = listener.local_addr().ok();
        let (tx, rx) = mpsc::channel(64);

        tokio::spawn(async move {
            loop {
                let (socket, peer) = match listener.accept().await {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::warn!(error = %err, "accept failed");
                        continue;
                    }
                };
                tracing::debug!(%peer, "client connected");
                tokio::spawn(serve_direct_connection(socket, tx.clone()));
            }
        });

        Ok(Self { inbound_rx: rx, local_addr })
    }

    /// The address actually bound by [`RouterServer::bind`], useful in
    /// tests that bind to port `0`. `None` for a [`RouterServer::connect`]ed instance.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.local_addr
    }

    /// Dials a broker's backend at `addr`, registers as `identity`, and
    /// answers receipts the broker forwards with that identity.
    pub async fn connect(addr: &str, identity: &str) -> Result<Self> {
        let mut stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to broker backend {addr}"))?;

        let register = Frame::Register {
            identity: identity.to_string(),
        };
        stream.write_all(&register.encode()).await.context("sending registration")?;
        stream.flush().await.context("flushing registration")?;

        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let (outbound_tx, outbound_rx) = mpsc::channel(64);
        tokio::spawn(serve_routed_connection(stream, inbound_tx, outbound_tx, outbound_rx));

        Ok(Self { inbound_rx, local_addr: None })
    }

    /// Waits for the next receipt to execute.
    ///
    /// Returns `None` when every client connection has closed and no more
    /// receipts will arrive.
    pub async fn recv_receipt(&mut self) -> Option<Inbound> {
        self.inbound_rx.recv().await
    }

    /// Sends `answered` (a receipt with `.response` already filled in)
    /// back to whichever caller it came from.
    ///
    /// On a slow or gone client this logs a warning and drops the reply
    /// rather than blocking the worker loop.
    pub async fn send_receipt(&self, inbound_reply_route: &Inbound, answered: Receipt) {
        let frame = match &inbound_reply_route.reply_to {
            ReplyRoute::Direct(_) => Frame::Receipt(answered),
            ReplyRoute::Routed { identity, .. } => Frame::Routed(RoutedReceipt {
                identity: identity.clone(),
                receipt: answered,
            }),
        };
        let sink = match &inbound_reply_route.reply_to {
            ReplyRoute::Direct(sink) | ReplyRoute::Routed { sink, .. } => sink,
        };

        match tokio::time::timeout(SEND_TIMEOUT, sink.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => tracing::warn!("reply sink closed, dropping response"),
            Err(_) => tracing::warn!("reply send timed out, dropping response"),
        }
    }
}

async fn serve_direct_connection(mut socket: TcpStream, inbound_tx: mpsc::Sender<Inbound>) {
    let (reply_tx, mut reply_rx) = mpsc::channel::<Frame>(8);
    let (read_half, mut write_half) = socket.split();
    let mut read_half = read_half;

    let writer = async {
        while let Some(frame) = reply_rx.recv().await {
            if write_half.write_all(&frame.encode()).await.is_err() {
                break;
            }
            if write_half.flush().await.is_err() {
                break;
            }
        }
    };

    let reader = async {
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            let frames = match decoder.feed(&buf[..n]) {
                Ok(frames) => frames,
                Err(err) => {
                    tracing::warn!(error = %err, "malformed frame, closing connection");
                    return;
                }
            };
            for frame in frames {
                if let Frame::Receipt(receipt) = frame {
                    let inbound = Inbound {
                        receipt,
                        reply_to: ReplyRoute::Direct(reply_tx.clone()),
                    };
                    if inbound_tx.send(inbound).await.is_err() {
                        return;
                    }
                }
            }
        }
    };

    tokio::join!(writer, reader);
}

async fn serve_routed_connection(
    mut stream: TcpStream,
    inbound_tx: mpsc::Sender<Inbound>,
    outbound_tx: mpsc::Sender<Frame>,
    mut outbound_rx: mpsc::Receiver<Frame>,
) {
    let (read_half, mut write_half) = stream.split();
    let mut read_half = read_half;

    let writer = async {
        while let Some(frame) = outbound_rx.recv().await {
            if write_half.write_all(&frame.encode()).await.is_err() {
                break;
            }
            if write_half.flush().await.is_err() {
                break;
            }
        }
    };

    let reader = async {
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            let frames = match decoder.feed(&buf[..n]) {
                Ok(frames) => frames,
                Err(err) => {
                    tracing::warn!(error = %err, "malformed frame from broker, closing connection");
                    return;
                }
            };
            for frame in frames {
                if let Frame::Routed(routed) = frame {
                    let inbound = Inbound {
                        receipt: routed.receipt,
                        reply_to: ReplyRoute::Routed {
                            identity: routed.identity,
                            sink: outbound_tx.clone(),
                        },
                    };
                    if inbound_tx.send(inbound).await.is_err() {
                        return;
                    }
                }
            }
        }
    };

    tokio::join!(writer, reader);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::receipt::ReceiptResponse;
    use crate::transport::client::AsyncClient;
    use std::collections::HashMap;

    #[tokio::test]
    async fn bind_answers_a_direct_client() {
        let mut server = RouterServer::bind("127.0.0.1:0").await.unwrap();
        let listener_addr = server.local_addr().unwrap();

        let worker = tokio::spawn(async move {
            let inbound = server.recv_receipt().await.unwrap();
            let answered = inbound.receipt().clone().with_response(ReceiptResponse::ok(serde_json::json!({"status": "on"})));
            server.send_receipt(&inbound, answered).await;
        });

        let mut endpoints = HashMap::new();
        endpoints.insert("devback".to_string(), listener_addr.to_string());
        let client = AsyncClient::new(endpoints);
        let receipt = Receipt::new("test", "devback", "status", serde_json::json!({}));
        let answered = client.query(receipt).await.unwrap();

        assert!(answered.response.unwrap().is_ok());
        worker.await.unwrap();
    }
}
