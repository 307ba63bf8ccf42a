//! Curator connection supervisor.
//!
//! Runs the reconnect loop for our single curator link:
//!
//! ```text
//! Disconnected -> Connecting -> AwaitingHandshake -> Registering -> Registered
//!      ^                                                                |
//!      +----------------------- any reader/writer failure --------------+
//! ```
//!
//! Each connection gets a [`Session`]. Its reader, writer, pinger and the
//! dependents started on registration all hang off the session's
//! cancellation token, so ending the session tears all of them down.
//!
//! The curator queue outlives sessions. Replies are tagged with the session
//! that produced them and the writer drops the ones a later session finds.

use crate::agent::{Agent, CuratorMessage};
use crate::transport::{self, ClientStream};
use futures::stream::SplitStream;
use futures::{Sink, StreamExt};
use mesh_core::{route, Envelope, Role};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Where the curator link currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Disconnected,
    Connecting,
    /// Socket open, waiting for reader and writer to come up
    AwaitingHandshake,
    /// Registration sent, waiting for `registrationOk`
    Registering,
    Registered,
}

/// One curator connection's lifetime.
#[derive(Debug)]
pub struct Session {
    id: u64,
    token: CancellationToken,
    dependents_started: AtomicBool,
}

impl Session {
    pub fn new(id: u64, token: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            id,
            token,
            dependents_started: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// End the session. Safe to call from any task, any number of times.
    pub fn end(&self) {
        self.token.cancel();
    }

    /// True for the first caller only.
    pub fn claim_dependents(&self) -> bool {
        !self.dependents_started.swap(true, Ordering::SeqCst)
    }
}

pub struct Supervisor {
    agent: Arc<Agent>,
    /// Process-wide curator queue, drained by whichever writer is current
    outbound: Arc<Mutex<mpsc::UnboundedReceiver<CuratorMessage>>>,
}

impl Supervisor {
    pub fn new(agent: Arc<Agent>, outbound: mpsc::UnboundedReceiver<CuratorMessage>) -> Self {
        Self {
            agent,
            outbound: Arc::new(Mutex::new(outbound)),
        }
    }

    /// Keep a curator session alive until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) {
        let config = self.agent.config();
        let addr = config.curator_addr.clone();
        let url = transport::ws_url(&addr, &config.ws_path);
        let probe_timeout = config.timing.probe_timeout();
        let retry = config.timing.retry_interval();
        let mut sessions = 0u64;

        while !shutdown.is_cancelled() {
            self.agent.set_state(SupervisorState::Disconnected);

            if transport::probe(&addr, probe_timeout).await.is_err() {
                if !sleep_or_cancel(retry, &shutdown).await {
                    break;
                }
                continue;
            }

            self.agent.set_state(SupervisorState::Connecting);
            let ws = match transport::connect(&url).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!("Failed to connect to curator at {}: {}", url, e);
                    if !sleep_or_cancel(retry, &shutdown).await {
                        break;
                    }
                    continue;
                }
            };
            info!("Connected to curator at {}", url);

            sessions += 1;
            let session = Session::new(sessions, shutdown.child_token());
            self.run_session(ws, &session).await;
            info!("Curator session ended");
        }

        self.agent.set_state(SupervisorState::Disconnected);
        debug!("Supervisor stopped");
    }

    /// Drive one connected session until it ends.
    async fn run_session(&self, ws: ClientStream, session: &Arc<Session>) {
        self.agent.set_state(SupervisorState::AwaitingHandshake);

        let (sink, stream) = ws.split();
        let (writer_ready_tx, writer_ready) = oneshot::channel();
        let (reader_ready_tx, reader_ready) = oneshot::channel();
        let (registration_tx, registration_rx) = oneshot::channel();

        let mut tasks: Vec<JoinHandle<()>> = vec![
            tokio::spawn(write_loop(
                sink,
                writer_ready_tx,
                registration_rx,
                self.outbound.clone(),
                session.clone(),
            )),
            tokio::spawn(read_loop(
                stream,
                reader_ready_tx,
                self.agent.clone(),
                session.clone(),
            )),
        ];

        let (writer, reader) = tokio::join!(writer_ready, reader_ready);
        if writer.is_ok() && reader.is_ok() {
            self.agent.set_state(SupervisorState::Registering);
            debug!("Reader and writer ready, registering");
            if registration_tx.send(self.agent.registration()).is_err() {
                session.end();
            }

            if let Some(interval) = self.agent.config().timing.curator_ping_interval() {
                tasks.push(tokio::spawn(ping_loop(
                    self.agent.clone(),
                    interval,
                    session.clone(),
                )));
            }
        } else {
            warn!("Curator connection tasks failed to start");
            session.end();
        }

        // Watchdog: wait for the falling edge, then tear everything down
        session.token().cancelled().await;
        for task in tasks {
            task.abort();
        }
        self.agent.set_state(SupervisorState::Disconnected);
    }
}

/// Sleep for `duration`; false if cancelled first.
async fn sleep_or_cancel(duration: Duration, token: &CancellationToken) -> bool {
    tokio::select! {
        _ = token.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

async fn write_loop<S>(
    mut sink: S,
    ready: oneshot::Sender<()>,
    registration: oneshot::Receiver<Envelope>,
    outbound: Arc<Mutex<mpsc::UnboundedReceiver<CuratorMessage>>>,
    session: Arc<Session>,
) where
    S: Sink<Message, Error = WsError> + Unpin,
{
    let _ = ready.send(());

    // Registration always goes out before anything queued
    let Ok(registration) = registration.await else {
        return;
    };
    if let Err(e) = transport::send_envelope(&mut sink, &registration).await {
        warn!("Failed to send registration to curator: {}", e);
        session.end();
        return;
    }

    let mut queue = outbound.lock().await;
    loop {
        let message = tokio::select! {
            _ = session.token().cancelled() => break,
            next = queue.recv() => match next {
                Some(message) => message,
                None => {
                    warn!("Curator queue closed");
                    session.end();
                    break;
                }
            },
        };

        if !message.belongs_to(session.id()) {
            debug!(
                "Dropping {} left over from curator session {:?}",
                message.envelope.action, message.session
            );
            continue;
        }

        let envelope = message.envelope;
        if let Err(e) = transport::send_envelope(&mut sink, &envelope).await {
            warn!("Failed to send {} to curator: {}", envelope.action, e);
            session.end();
            break;
        }
    }
}

async fn read_loop(
    mut stream: SplitStream<ClientStream>,
    ready: oneshot::Sender<()>,
    agent: Arc<Agent>,
    session: Arc<Session>,
) {
    let _ = ready.send(());

    loop {
        let received = tokio::select! {
            _ = session.token().cancelled() => return,
            received = transport::recv_envelope(&mut stream) => received,
        };

        match received {
            Ok(message) => {
                debug!("Curator -> {}", message.action);
                let dispatch = route(Role::Curator, &message);
                agent.dispatch_curator(dispatch, &session);
            }
            Err(e) => {
                warn!("Curator connection lost: {}", e);
                session.end();
                return;
            }
        }
    }
}

async fn ping_loop(agent: Arc<Agent>, interval: Duration, session: Arc<Session>) {
    while sleep_or_cancel(interval, session.token()).await {
        agent.reply_to_curator(Envelope::ping(), &session);
    }
}
