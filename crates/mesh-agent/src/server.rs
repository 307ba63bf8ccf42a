//! WebSocket server for inbound peer connections.
//!
//! Every agent listens on `<own IP>:<peer_port>` so other agents' outbound
//! links have something to connect to. An inbound connection is anonymous
//! until the peer sends `identify`; from then on its pings mark it alive in
//! the server's [`InboundLiveness`] table, and once every connection under
//! that name has failed it is marked dead.

use crate::transport;
use anyhow::Result;
use futures::stream::SplitSink;
use futures::StreamExt;
use mesh_core::{route, Dispatch, Envelope, Liveness, Role};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Capacity of each inbound connection's outbound queue.
pub const INBOUND_QUEUE_CAPACITY: usize = 10;

/// Liveness of inbound peers, keyed by the name they identified with.
///
/// A peer that redials can have two connections open under one name for a
/// while. The name stays alive until the last of them closes.
#[derive(Debug, Clone, Default)]
pub struct InboundLiveness(Arc<RwLock<HashMap<String, HashSet<u64>>>>);

impl InboundLiveness {
    /// Mark `peer` alive through connection `conn_id`.
    pub async fn mark_alive(&self, peer: &str, conn_id: u64) {
        self.0
            .write()
            .await
            .entry(peer.to_string())
            .or_default()
            .insert(conn_id);
    }

    /// Drop connection `conn_id` from `peer`. Returns true if that left the
    /// peer with no live connection.
    pub async fn release(&self, peer: &str, conn_id: u64) -> bool {
        let mut table = self.0.write().await;
        match table.get_mut(peer) {
            Some(connections) => {
                connections.remove(&conn_id);
                connections.is_empty()
            }
            None => false,
        }
    }

    /// `None` for a name never seen.
    pub async fn get(&self, peer: &str) -> Option<Liveness> {
        self.0.read().await.get(peer).map(|connections| {
            if connections.is_empty() {
                Liveness::Dead
            } else {
                Liveness::Alive
            }
        })
    }
}

/// Accepts inbound peer connections.
pub struct PeerServer {
    ws_path: String,
    liveness: InboundLiveness,
    next_conn_id: AtomicU64,
}

impl PeerServer {
    pub fn new(ws_path: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            ws_path: ws_path.into(),
            liveness: InboundLiveness::default(),
            next_conn_id: AtomicU64::new(1),
        })
    }

    pub fn liveness(&self) -> &InboundLiveness {
        &self.liveness
    }

    /// Bind to an address and return the TCP listener.
    pub async fn bind(listen_addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(listen_addr).await?;
        info!("Peer server listening on {}", listen_addr);
        Ok(listener)
    }

    /// Accept connections until `shutdown` is cancelled, one task per socket.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        tokio::spawn(self.clone().accept_connection(stream, addr));
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
            }
        }
        debug!("Peer server stopped");
    }

    /// Upgrade one TCP connection and serve it until it fails.
    pub async fn accept_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr) {
        let path = self.ws_path.clone();
        let check_path = move |request: &Request, response: Response| {
            if request.uri().path() == path {
                Ok(response)
            } else {
                let mut reject = ErrorResponse::new(Some(format!(
                    "No WebSocket endpoint at {}",
                    request.uri().path()
                )));
                *reject.status_mut() = StatusCode::NOT_FOUND;
                Err(reject)
            }
        };

        let ws = match accept_hdr_async(stream, check_path).await {
            Ok(ws) => ws,
            Err(e) => {
                // Reachability probes connect and close without a handshake
                let err_str = e.to_string();
                if err_str.contains("Handshake not finished")
                    || err_str.contains("Connection reset")
                    || err_str.contains("unexpected EOF")
                {
                    debug!("Connection closed before handshake from {}", addr);
                } else {
                    warn!("WebSocket upgrade failed for {}: {}", addr, e);
                }
                return;
            }
        };

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        debug!("Inbound connection {} from {}", conn_id, addr);
        self.serve_connection(ws, conn_id).await;
    }

    async fn serve_connection(&self, ws: WebSocketStream<TcpStream>, conn_id: u64) {
        let (sink, mut stream) = ws.split();
        let (queue, pending) = mpsc::channel(INBOUND_QUEUE_CAPACITY);
        let writer = tokio::spawn(write_loop(sink, pending, conn_id));

        let mut name: Option<String> = None;
        loop {
            let message = match transport::recv_envelope(&mut stream).await {
                Ok(message) => message,
                Err(e) => {
                    debug!("Inbound connection {} ended: {}", conn_id, e);
                    break;
                }
            };

            let reply = match route(Role::Peer { identified: name.as_deref() }, &message) {
                Dispatch::Identify(peer) => {
                    info!("Inbound connection {} identified as {}", conn_id, peer);
                    if let Some(previous) = name.take().filter(|previous| *previous != peer) {
                        self.liveness.release(&previous, conn_id).await;
                    }
                    self.liveness.mark_alive(&peer, conn_id).await;
                    name = Some(peer);
                    None
                }
                Dispatch::PeerAlive { peer, reply } => {
                    self.liveness.mark_alive(&peer, conn_id).await;
                    Some(reply)
                }
                Dispatch::Reply(reply) => Some(reply),
                _ => None,
            };

            if let Some(reply) = reply {
                if queue.send(reply).await.is_err() {
                    break;
                }
            }
        }

        if let Some(peer) = name {
            if self.liveness.release(&peer, conn_id).await {
                info!("Inbound peer {} disconnected", peer);
            } else {
                debug!("Inbound connection {} closed, {} still connected", conn_id, peer);
            }
        }
        writer.abort();
    }
}

async fn write_loop(
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut pending: mpsc::Receiver<Envelope>,
    conn_id: u64,
) {
    while let Some(envelope) = pending.recv().await {
        if let Err(e) = transport::send_envelope(&mut sink, &envelope).await {
            debug!("Failed to send to inbound connection {}: {}", conn_id, e);
            break;
        }
    }
}
