//! The broker — a request multiplexer standing in for a ZeroMQ ROUTER
//! socket pair (spec §4.1).
//!
//! Clients dial the broker's frontend and send a [`Receipt`]; the broker
//! assigns that connection an opaque identity, forwards the receipt to
//! whichever worker registered as `receipt.executor` on the backend, and
//! routes the eventual answer back to the originating frontend
//! connection by that identity — mirroring how a ZeroMQ ROUTER socket
//! keys delivery on the leading identity frame rather than message
//! content. The broker never inspects receipt bodies beyond the
//! `executor` field needed to pick a worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use rand::Rng;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};

use crate::receipt::{Receipt, ReceiptResponse};
use crate::transport::framing::{Frame, FrameDecoder, RoutedReceipt};

/// Network addresses the broker listens on.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address clients connect to.
    pub frontend_addr: String,
    /// Address workers register on.
    pub backend_addr: String,
    /// Capacity of the passive-observer broadcast channel (spec §4.1:
    /// "monitor endpoint" fan-out for WS-style passive consumers).
    pub observer_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            frontend_addr: "127.0.0.1:5555".to_string(),
            backend_addr: "127.0.0.1:5556".to_string(),
            observer_capacity: 256,
        }
    }
}

struct WorkerHandle {
    outbound: mpsc::Sender<Frame>,
}

struct BrokerState {
    workers: Mutex<HashMap<String, WorkerHandle>>,
    pending: Mutex<HashMap<String, oneshot::Sender<Receipt>>>,
    observers: broadcast::Sender<Receipt>,
    next_client_seq: AtomicU64,
}

impl BrokerState {
    fn generate_client_id(&self) -> String {
        let seq = self.next_client_seq.fetch_add(1, Ordering::Relaxed);
        let suffix: u16 = rand::rng().random();
        format!("client:{seq:x}{suffix:04x}")
    }
}

/// The broker service: one frontend listener, one backend listener,
/// shared in-memory routing state.
#[derive(Debug)]
pub struct Broker {
    config: BrokerConfig,
    state: Arc<BrokerState>,
}

impl Broker {
    /// Builds a broker that isn't listening yet; call [`Broker::run`].
    pub fn new(config: BrokerConfig) -> Self {
        let (observers, _rx) = broadcast::channel(config.observer_capacity);
        let state = Arc::new(BrokerState {
            workers: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            observers,
            next_client_seq: AtomicU64::new(0),
        });
        Self { config, state }
    }

    /// Subscribes to every receipt the broker forwards, for passive
    /// observers (e.g. a websocket fan-out) that need a read-only feed
    /// without participating in request/reply.
    pub fn subscribe_observer(&self) -> broadcast::Receiver<Receipt> {
        self.state.observers.subscribe()
    }

    /// Runs the frontend and backend accept loops until the process is
    /// asked to shut down.
    pub async fn run(&self) -> Result<()> {
        let frontend = TcpListener::bind(&self.config.frontend_addr)
            .await
            .with_context(|| format!("binding frontend {}", self.config.frontend_addr))?;
        let backend = TcpListener::bind(&self.config.backend_addr)
            .await
            .with_context(|| format!("binding backend {}", self.config.backend_addr))?;

        tracing::info!(frontend = %self.config.frontend_addr, backend = %self.config.backend_addr, "broker listening");

        let frontend_state = self.state.clone();
        let frontend_task = tokio::spawn(async move {
            loop {
                match frontend.accept().await {
                    Ok((socket, peer)) => {
                        tracing::debug!(%peer, "frontend client connected");
                        tokio::spawn(serve_frontend(socket, frontend_state.clone()));
                    }
                    Err(err) => tracing::warn!(error = %err, "frontend accept failed"),
                }
            }
        });

        let backend_state = self.state.clone();
        let backend_task = tokio::spawn(async move {
            loop {
                match backend.accept().await {
                    Ok((socket, peer)) => {
                        tracing::debug!(%peer, "worker connected");
                        tokio::spawn(serve_backend(socket, backend_state.clone()));
                    }
                    Err(err) => tracing::warn!(error = %err, "backend accept failed"),
                }
            }
        });

        tokio::select! {
            res = frontend_task => res.context("frontend task panicked")?,
            res = backend_task => res.context("backend task panicked")?,
        }
        Ok(())
    }
}

async fn serve_frontend(mut socket: TcpStream, state: Arc<BrokerState>) {
    let client_id = state.generate_client_id();
    let (read_half, mut write_half) = socket.split();
    let mut read_half = read_half;
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
                tracing::warn!(error = %err, "malformed frame from client, closing");
                return;
            }
        };
        for frame in frames {
            let Frame::Receipt(receipt) = frame else { continue };
            let answered = dispatch_to_worker(&state, &client_id, receipt).await;
            let _ = state.observers.send(answered.clone());
            if write_half.write_all(&Frame::Receipt(answered).encode()).await.is_err() {
                return;
            }
            if write_half.flush().await.is_err() {
                return;
            }
        }
    }
}

async fn dispatch_to_worker(state: &Arc<BrokerState>, client_id: &str, receipt: Receipt) -> Receipt {
    let outbound = {
        let workers = state.workers.lock().await;
        workers.get(&receipt.executor).map(|w| w.outbound.clone())
    };

    let Some(outbound) = outbound else {
        let response = ReceiptResponse::not_found(format!("unknown executor: {}", receipt.executor));
        return receipt.with_response(response);
    };

    let (reply_tx, reply_rx) = oneshot::channel();
    {
        let mut pending = state.pending.lock().await;
        pending.insert(client_id.to_string(), reply_tx);
    }

    let routed = RoutedReceipt {
        identity: client_id.to_string(),
        receipt: receipt.clone(),
    };
    if outbound.send(Frame::Routed(routed)).await.is_err() {
        state.pending.lock().await.remove(client_id);
        return receipt.with_response(ReceiptResponse::gateway_timeout());
    }

    match tokio::time::timeout(crate::transport::server::SEND_TIMEOUT, reply_rx).await {
        Ok(Ok(answered)) => answered,
        _ => {
            state.pending.lock().await.remove(client_id);
            receipt.with_response(ReceiptResponse::gateway_timeout())
        }
    }
}

async fn serve_backend(mut socket: TcpStream, state: Arc<BrokerState>) {
    let (read_half, mut write_half) = socket.split();
    let mut read_half = read_half;
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 4096];

    // First frame off a worker connection must be its registration.
    let identity = loop {
        let n = match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        let frames = match decoder.feed(&buf[..n]) {
            Ok(frames) => frames,
            Err(err) => {
                tracing::warn!(error = %err, "malformed registration frame");
                return;
            }
        };
        if let Some(Frame::Register { identity }) = frames.into_iter().next() {
            break identity;
        }
    };

    tracing::info!(%identity, "worker registered");
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Frame>(64);
    state.workers.lock().await.insert(identity.clone(), WorkerHandle { outbound: outbound_tx });

    let writer_state = state.clone();
    let writer_identity = identity.clone();
    let writer = async move {
        while let Some(frame) = outbound_rx.recv().await {
            if write_half.write_all(&frame.encode()).await.is_err() {
                break;
            }
            if write_half.flush().await.is_err() {
                break;
            }
        }
        writer_state.workers.lock().await.remove(&writer_identity);
    };

    let reader = async {
        loop {
            let n = match read_half.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => n,
            };
            let frames = match decoder.feed(&buf[..n]) {
                Ok(frames) => frames,
                Err(err) => {
                    tracing::warn!(error = %err, "malformed frame from worker, closing");
                    return;
                }
            };
            for frame in frames {
                let Frame::Routed(routed) = frame else { continue };
                let reply_tx = state.pending.lock().await.remove(&routed.identity);
                if let Some(reply_tx) = reply_tx {
                    let _ = reply_tx.send(routed.receipt);
                } else {
                    tracing::warn!(identity = %routed.identity, "reply for unknown/expired client, dropping");
                }
            }
        }
    };

    tokio::join!(writer, reader);
    tracing::info!(%identity, "worker disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::client::AsyncClient;
    use crate::transport::server::RouterServer;
    use std::collections::HashMap;

    #[tokio::test]
    async fn routes_receipt_identity_preserving() {
        let config = BrokerConfig {
            frontend_addr: "127.0.0.1:0".to_string(),
            backend_addr: "127.0.0.1:0".to_string(),
            observer_capacity: 16,
        };
        // Bind both listeners up front so we know their ephemeral ports
        // before handing control to Broker::run.
        let frontend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let frontend_addr = frontend_listener.local_addr().unwrap();
        let backend_addr = backend_listener.local_addr().unwrap();
        drop(frontend_listener);
        drop(backend_listener);

        let config = BrokerConfig {
            frontend_addr: frontend_addr.to_string(),
            backend_addr: backend_addr.to_string(),
            ..config
        };
        let broker = Broker::new(config);
        let broker = Arc::new(broker);
        let run_broker = broker.clone();
        tokio::spawn(async move {
            let _ = run_broker.run().await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut worker = RouterServer::connect(&backend_addr.to_string(), "devback").await.unwrap();
        let worker_task = tokio::spawn(async move {
            let inbound = worker.recv_receipt().await.unwrap();
            let answered = inbound
                .receipt()
                .clone()
                .with_response(ReceiptResponse::ok(serde_json::json!({"status": "on"})));
            worker.send_receipt(&inbound, answered).await;
        });

        let mut endpoints = HashMap::new();
        endpoints.insert("devback".to_string(), frontend_addr.to_string());
        let client = AsyncClient::new(endpoints);
        let receipt = Receipt::new("test", "devback", "status", serde_json::json!({}));
        let answered = client.query(receipt).await.unwrap();

        assert!(answered.response.unwrap().is_ok());
        worker_task.await.unwrap();
    }

    #[tokio::test]
    async fn unknown_executor_is_404_without_a_worker() {
        let frontend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let frontend_addr = frontend_listener.local_addr().unwrap();
        let backend_addr = backend_listener.local_addr().unwrap();
        drop(frontend_listener);
        drop(backend_listener);

        let config = BrokerConfig {
            frontend_addr: frontend_addr.to_string(),
            backend_addr: backend_addr.to_string(),
            observer_capacity: 16,
        };
        let broker = Arc::new(Broker::new(config));
        let run_broker = broker.clone();
        tokio::spawn(async move {
            let _ = run_broker.run().await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut endpoints = HashMap::new();
        endpoints.insert("devback".to_string(), frontend_addr.to_string());
        let client = AsyncClient::new(endpoints);
        let receipt = Receipt::new("test", "devback", "status", serde_json::json!({}));
        let answered = client.query(receipt).await.unwrap();

        assert_eq!(answered.response.unwrap().statuscode, 404);
    }
}
