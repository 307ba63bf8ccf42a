//! End-to-end tests for mesh-agent.
//!
//! Runs the real supervisor, aggregator, alert pipeline and peer links
//! against a fake curator and fake peers over local WebSocket connections.

use std::sync::Arc;
use std::time::Duration;

use futures::{Sink, Stream};
use mesh_agent::transport::{recv_envelope, send_envelope};
use mesh_agent::{AlertPipeline, Agent, Config, NodeIdentity, PeerServer, Supervisor};
use mesh_core::protocol::{NOT_IDENTIFIED, NOT_RECOGNIZED};
use mesh_core::{
    Action, AlertRecord, Envelope, Liveness, MembershipSnapshot, NodeUpdate, Payload,
    Registration,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{accept_async, connect_async, WebSocketStream};
use tokio_util::sync::CancellationToken;

/// Upper bound for any single expected event.
const STEP: Duration = Duration::from_secs(5);

// ============================================================================
// Helpers
// ============================================================================

/// Receive the next envelope, failing the test on timeout or disconnect.
async fn recv<S>(ws: &mut S) -> Envelope
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
{
    timeout(STEP, recv_envelope(ws))
        .await
        .expect("Timeout waiting for message")
        .expect("Connection failed")
}

/// Receive until `matches` accepts an envelope, skipping the rest.
async fn recv_until<S, F>(ws: &mut S, mut matches: F) -> Envelope
where
    S: Stream<Item = Result<Message, WsError>> + Unpin,
    F: FnMut(&Envelope) -> bool,
{
    loop {
        let envelope = recv(ws).await;
        if matches(&envelope) {
            return envelope;
        }
    }
}

async fn send<S>(ws: &mut S, envelope: &Envelope)
where
    S: Sink<Message, Error = WsError> + Unpin,
{
    send_envelope(ws, envelope)
        .await
        .expect("Failed to send message");
}

/// Accept the next WebSocket, skipping bare TCP reachability probes.
async fn accept_ws(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    timeout(STEP, async {
        loop {
            let (stream, _) = listener.accept().await.expect("accept failed");
            if let Ok(ws) = accept_async(stream).await {
                return ws;
            }
        }
    })
    .await
    .expect("Timeout waiting for connection")
}

fn node_update(envelope: &Envelope) -> Option<NodeUpdate> {
    match envelope.action() {
        Ok(Action::NodeUpdate) => envelope.decode().ok(),
        _ => None,
    }
}

/// A running agent wired to a fake curator and one fake peer port.
struct Harness {
    agent: Arc<Agent>,
    curator: TcpListener,
    peer: TcpListener,
    shutdown: CancellationToken,
}

impl Harness {
    async fn start() -> Self {
        let curator = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let peer = TcpListener::bind("127.0.0.1:0").await.unwrap();

        let mut config = Config {
            curator_addr: curator.local_addr().unwrap().to_string(),
            peer_port: peer.local_addr().unwrap().port(),
            ..Default::default()
        };
        config.timing.probe_timeout_ms = 500;
        config.timing.retry_interval_ms = 100;
        config.timing.reconcile_interval_ms = 100;
        config.timing.publish_interval_ms = 60_000;

        let identity = NodeIdentity {
            name: "self-node".into(),
            ip: "127.0.0.1".into(),
        };

        let shutdown = CancellationToken::new();
        let (agent, queues) = Agent::new(config, identity);
        tokio::spawn(AlertPipeline::new(queues.alerts).run(agent.clone()));
        tokio::spawn(Supervisor::new(agent.clone(), queues.outbound).run(shutdown.clone()));

        Self {
            agent,
            curator,
            peer,
            shutdown,
        }
    }

    /// Accept the agent's curator connection and complete registration.
    async fn register(&self) -> WebSocketStream<TcpStream> {
        let mut ws = accept_ws(&self.curator).await;
        let registration = recv(&mut ws).await;
        assert_eq!(registration.action().unwrap(), Action::Registration);

        send(&mut ws, &Envelope::bare(Action::RegistrationOk)).await;
        let first = recv(&mut ws).await;
        assert!(node_update(&first).is_some(), "expected snapshot, got {:?}", first);
        ws
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ============================================================================
// Curator link
// ============================================================================

#[tokio::test]
async fn test_registration_is_first_message() {
    let harness = Harness::start().await;
    let mut ws = accept_ws(&harness.curator).await;

    let registration: Registration = recv(&mut ws).await.decode().unwrap();
    assert_eq!(registration.ip, "127.0.0.1");
    assert_eq!(registration.node_name, "self-node");
    assert!(!harness.agent.is_registered());

    send(&mut ws, &Envelope::bare(Action::RegistrationOk)).await;
    let snapshot = node_update(&recv(&mut ws).await).expect("snapshot after registration");
    assert_eq!(snapshot.ip, "127.0.0.1");
    assert_eq!(snapshot.node_name, "self-node");
    assert!(snapshot.liveness.is_empty());
    assert!(harness.agent.is_registered());
}

#[tokio::test]
async fn test_duplicate_registration_ok_publishes_once() {
    let harness = Harness::start().await;
    let mut ws = accept_ws(&harness.curator).await;
    recv(&mut ws).await;

    send(&mut ws, &Envelope::bare(Action::RegistrationOk)).await;
    send(&mut ws, &Envelope::bare(Action::RegistrationOk)).await;
    send(&mut ws, &Envelope::ping()).await;

    assert!(node_update(&recv(&mut ws).await).is_some());
    // The second acknowledgment starts nothing, so the pong comes next
    assert_eq!(recv(&mut ws).await, Envelope::pong());
}

#[tokio::test]
async fn test_curator_ping_and_unknown_action() {
    let harness = Harness::start().await;
    let mut ws = harness.register().await;

    send(&mut ws, &Envelope::ping()).await;
    assert_eq!(recv(&mut ws).await, Envelope::pong());

    let before = harness.agent.membership();
    send(
        &mut ws,
        &Envelope {
            action: "reboot".into(),
            content: "{}".into(),
        },
    )
    .await;
    assert_eq!(recv(&mut ws).await, Envelope::error(NOT_RECOGNIZED));
    assert_eq!(harness.agent.membership(), before);
}

#[tokio::test]
async fn test_malformed_nodes_info_keeps_membership() {
    let harness = Harness::start().await;
    let mut ws = harness.register().await;

    let members: MembershipSnapshot = [("n1", "10.255.0.1")].into_iter().collect();
    send(&mut ws, &members.to_envelope()).await;
    send(&mut ws, &Envelope::new(Action::NodesInfo, "[not a map]")).await;

    // Round-trip a ping so both messages have been handled
    send(&mut ws, &Envelope::ping()).await;
    recv_until(&mut ws, |e| *e == Envelope::pong()).await;
    assert_eq!(harness.agent.membership(), members);
}

#[tokio::test]
async fn test_reconnects_and_registers_again_after_curator_drop() {
    let harness = Harness::start().await;
    let ws = harness.register().await;
    drop(ws);

    let mut ws = accept_ws(&harness.curator).await;
    let registration = recv(&mut ws).await;
    assert_eq!(registration.action().unwrap(), Action::Registration);

    send(&mut ws, &Envelope::bare(Action::RegistrationOk)).await;
    assert!(node_update(&recv(&mut ws).await).is_some());
}

// ============================================================================
// Peer links
// ============================================================================

#[tokio::test]
async fn test_peer_lifecycle_alert_and_redial() {
    let harness = Harness::start().await;
    let mut curator = harness.register().await;

    let members: MembershipSnapshot = [("n1", "127.0.0.1")].into_iter().collect();
    send(&mut curator, &members.to_envelope()).await;

    // The reconciler dials n1, which identifies us
    let mut peer = accept_ws(&harness.peer).await;
    assert_eq!(recv(&mut peer).await, Envelope::identify("self-node"));

    let update = recv_until(&mut curator, |e| {
        node_update(e).is_some_and(|u| u.liveness.get("n1") == Some(&1))
    })
    .await;
    assert_eq!(node_update(&update).unwrap().liveness.len(), 1);
    assert_eq!(harness.agent.liveness().get("n1"), Liveness::Alive);

    // Peer answers nothing but pings back
    send(&mut peer, &Envelope::ping()).await;
    assert_eq!(recv(&mut peer).await, Envelope::pong());

    // Drop the peer: one alert and a snapshot without n1
    peer.close(None).await.unwrap();
    drop(peer);

    let mut alert: Option<AlertRecord> = None;
    let mut cleared = false;
    while alert.is_none() || !cleared {
        let envelope = recv(&mut curator).await;
        match envelope.action().unwrap() {
            Action::Alert => {
                assert!(alert.is_none(), "more than one alert for one drop");
                alert = Some(envelope.decode().unwrap());
            }
            Action::NodeUpdate => {
                if !node_update(&envelope).unwrap().liveness.contains_key("n1") {
                    cleared = true;
                }
            }
            _ => {}
        }
    }
    let alert = alert.unwrap();
    assert_eq!(alert.self_name, "self-node");
    assert_eq!(alert.disconnected_peer, "n1");

    // n1 is still a member, so it is dialed again
    let mut peer = accept_ws(&harness.peer).await;
    assert_eq!(recv(&mut peer).await, Envelope::identify("self-node"));
}

#[tokio::test]
async fn test_same_size_membership_is_not_dialed() {
    let harness = Harness::start().await;
    let mut curator = harness.register().await;

    let members: MembershipSnapshot = [("n1", "127.0.0.1")].into_iter().collect();
    send(&mut curator, &members.to_envelope()).await;
    let _peer = accept_ws(&harness.peer).await;
    recv_until(&mut curator, |e| {
        node_update(e).is_some_and(|u| u.liveness.contains_key("n1"))
    })
    .await;

    // Swap n1 for n2: sizes still match, so nothing is dialed
    let members: MembershipSnapshot = [("n2", "127.0.0.1")].into_iter().collect();
    send(&mut curator, &members.to_envelope()).await;

    let accepted = timeout(Duration::from_millis(600), harness.peer.accept()).await;
    assert!(accepted.is_err(), "no connection expected");
}

// ============================================================================
// Inbound peer server
// ============================================================================

async fn start_peer_server() -> (Arc<PeerServer>, std::net::SocketAddr, CancellationToken) {
    let listener = PeerServer::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = PeerServer::new("/ws");
    let shutdown = CancellationToken::new();
    tokio::spawn(server.clone().serve(listener, shutdown.clone()));
    (server, addr, shutdown)
}

#[tokio::test]
async fn test_peer_server_identify_and_ping() {
    let (server, addr, shutdown) = start_peer_server().await;
    let (mut ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();

    // Anonymous pings are refused
    send(&mut ws, &Envelope::ping()).await;
    assert_eq!(recv(&mut ws).await, Envelope::error(NOT_IDENTIFIED));

    send(&mut ws, &Envelope::identify("n7")).await;
    send(&mut ws, &Envelope::ping()).await;
    assert_eq!(recv(&mut ws).await, Envelope::pong());
    assert_eq!(server.liveness().get("n7").await, Some(Liveness::Alive));

    send(&mut ws, &Envelope::bare(Action::NodesInfo)).await;
    assert_eq!(recv(&mut ws).await, Envelope::error(NOT_RECOGNIZED));

    ws.close(None).await.unwrap();
    drop(ws);

    timeout(STEP, async {
        while server.liveness().get("n7").await != Some(Liveness::Dead) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("n7 should be marked dead");

    shutdown.cancel();
}

#[tokio::test]
async fn test_peer_server_rejects_other_paths() {
    let (_server, addr, shutdown) = start_peer_server().await;

    match connect_async(format!("ws://{}/elsewhere", addr)).await {
        Err(WsError::Http(response)) => assert_eq!(response.status(), 404),
        Err(e) => panic!("expected HTTP 404, got {}", e),
        Ok(_) => panic!("upgrade on wrong path should fail"),
    }

    shutdown.cancel();
}

#[tokio::test]
async fn test_peer_server_tolerates_probes() {
    let (_server, addr, shutdown) = start_peer_server().await;

    // Bare TCP connect-and-close, as the reachability probe does
    drop(TcpStream::connect(addr).await.unwrap());

    let (mut ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    send(&mut ws, &Envelope::identify("n8")).await;
    send(&mut ws, &Envelope::ping()).await;
    assert_eq!(recv(&mut ws).await, Envelope::pong());

    shutdown.cancel();
}

#[tokio::test]
async fn test_peer_server_redial_keeps_name_alive() {
    let (server, addr, shutdown) = start_peer_server().await;
    let url = format!("ws://{}/ws", addr);

    let (mut first, _) = connect_async(url.as_str()).await.unwrap();
    send(&mut first, &Envelope::identify("n1")).await;
    send(&mut first, &Envelope::ping()).await;
    assert_eq!(recv(&mut first).await, Envelope::pong());

    // The peer redials before its old connection has gone away
    let (mut second, _) = connect_async(url.as_str()).await.unwrap();
    send(&mut second, &Envelope::identify("n1")).await;
    send(&mut second, &Envelope::ping()).await;
    assert_eq!(recv(&mut second).await, Envelope::pong());

    first.close(None).await.unwrap();
    drop(first);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(server.liveness().get("n1").await, Some(Liveness::Alive));

    // Still answered on the surviving connection
    send(&mut second, &Envelope::ping()).await;
    assert_eq!(recv(&mut second).await, Envelope::pong());

    second.close(None).await.unwrap();
    drop(second);
    timeout(STEP, async {
        while server.liveness().get("n1").await != Some(Liveness::Dead) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("n1 should be dead once its last connection closes");

    shutdown.cancel();
}

// ============================================================================
// Two real agents
// ============================================================================

#[tokio::test]
async fn test_agent_links_to_real_peer_server() {
    let (server, addr, shutdown) = start_peer_server().await;
    let curator = TcpListener::bind("127.0.0.1:0").await.unwrap();

    let mut config = Config {
        curator_addr: curator.local_addr().unwrap().to_string(),
        peer_port: addr.port(),
        ..Default::default()
    };
    config.timing.retry_interval_ms = 100;
    config.timing.reconcile_interval_ms = 100;
    let identity = NodeIdentity {
        name: "agent-a".into(),
        ip: "127.0.0.1".into(),
    };
    let (agent, queues) = Agent::new(config, identity);
    tokio::spawn(AlertPipeline::new(queues.alerts).run(agent.clone()));
    tokio::spawn(Supervisor::new(agent.clone(), queues.outbound).run(shutdown.clone()));

    let mut ws = accept_ws(&curator).await;
    recv(&mut ws).await;
    send(&mut ws, &Envelope::bare(Action::RegistrationOk)).await;
    let members: MembershipSnapshot = [("agent-b", "127.0.0.1")].into_iter().collect();
    send(&mut ws, &members.to_envelope()).await;

    recv_until(&mut ws, |e| {
        node_update(e).is_some_and(|u| u.liveness.get("agent-b") == Some(&1))
    })
    .await;

    // The server side learned our name from identify
    timeout(STEP, async {
        while server.liveness().get("agent-a").await != Some(Liveness::Alive) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("agent-a should be alive on the server");

    shutdown.cancel();
}
