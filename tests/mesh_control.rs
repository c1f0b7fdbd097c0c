//! Mesh membership and broadcast against a fake signaling server and
//! in-memory peers.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

use futures_util::{SinkExt, StreamExt};

use clipcascade_sync::error::SyncError;
use clipcascade_sync::interface::{Transport, TransportEvent};
use clipcascade_sync::message::{
    IceCandidateJson, PayloadKind, SessionDescription, SignalMessage, SyncMessage,
};
use clipcascade_sync::transport::mesh::{MeshTransport, PeerConnector, PeerEvent, PeerHandle};
use clipcascade_sync::{SyncConfig, TransportMode};

#[derive(Default)]
struct PeerRecord {
    initiator: bool,
    events: Option<mpsc::Sender<PeerEvent>>,
    offered: bool,
    answered: bool,
    remote_candidates: Vec<IceCandidateJson>,
    sent: Vec<SyncMessage>,
    closed: bool,
}

#[derive(Default)]
struct MockConnector {
    peers: Mutex<HashMap<String, Arc<Mutex<PeerRecord>>>>,
}

impl MockConnector {
    async fn record(&self, peer_id: &str) -> Arc<Mutex<PeerRecord>> {
        self.peers
            .lock()
            .await
            .get(peer_id)
            .cloned()
            .unwrap_or_else(|| panic!("no connection was made to {}", peer_id))
    }

    async fn channel_open(&self, peer_id: &str) {
        let record = self.record(peer_id).await;
        let events = record.lock().await.events.clone().unwrap();
        events
            .send(PeerEvent::ChannelOpen {
                peer_id: peer_id.to_string(),
            })
            .await
            .unwrap();
    }

    async fn channel_closed(&self, peer_id: &str) {
        let record = self.record(peer_id).await;
        let events = record.lock().await.events.clone().unwrap();
        events
            .send(PeerEvent::ChannelClosed {
                peer_id: peer_id.to_string(),
            })
            .await
            .unwrap();
    }
}

struct MockPeer {
    record: Arc<Mutex<PeerRecord>>,
}

#[async_trait]
impl PeerConnector for MockConnector {
    async fn connect_peer(
        &self,
        peer_id: &str,
        initiator: bool,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerHandle>, SyncError> {
        let record = Arc::new(Mutex::new(PeerRecord {
            initiator,
            events: Some(events),
            ..Default::default()
        }));
        self.peers
            .lock()
            .await
            .insert(peer_id.to_string(), record.clone());
        Ok(Arc::new(MockPeer { record }))
    }
}

#[async_trait]
impl PeerHandle for MockPeer {
    async fn create_offer(&self) -> Result<SessionDescription, SyncError> {
        self.record.lock().await.offered = true;
        Ok(SessionDescription {
            sdp_type: "offer".into(),
            sdp: "v=0 mock-offer".into(),
        })
    }

    async fn accept_offer(
        &self,
        _offer: SessionDescription,
    ) -> Result<SessionDescription, SyncError> {
        Ok(SessionDescription {
            sdp_type: "answer".into(),
            sdp: "v=0 mock-answer".into(),
        })
    }

    async fn accept_answer(&self, _answer: SessionDescription) -> Result<(), SyncError> {
        self.record.lock().await.answered = true;
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidateJson) -> Result<(), SyncError> {
        self.record.lock().await.remote_candidates.push(candidate);
        Ok(())
    }

    async fn send(&self, message: &SyncMessage) -> Result<(), SyncError> {
        self.record.lock().await.sent.push(message.clone());
        Ok(())
    }

    async fn close(&self) {
        self.record.lock().await.closed = true;
    }
}

type Signaling = WebSocketStream<TcpStream>;

struct TestMesh {
    transport: MeshTransport,
    events: mpsc::Receiver<TransportEvent>,
    connector: Arc<MockConnector>,
    server: Signaling,
}

/// Boot a mesh transport against a fake signaling server and complete the
/// ASSIGNED_ID handshake as "bbb".
async fn mesh_with_id(my_id: &str) -> TestMesh {
    let _ = env_logger::builder().is_test(true).try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/", listener.local_addr().unwrap());
    let config = SyncConfig::new(TransportMode::Mesh, url);

    let connector = Arc::new(MockConnector::default());
    let (transport, mut events) =
        MeshTransport::with_connector(&config, connector.clone() as Arc<dyn PeerConnector>);
    transport.start().await.unwrap();

    let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("no signaling client")
        .unwrap();
    let mut server = accept_async(stream).await.unwrap();

    match next_event(&mut events).await {
        TransportEvent::Connected { restored } => assert!(!restored),
        other => panic!("unexpected event: {:?}", other),
    }

    send_signal(
        &mut server,
        &SignalMessage::AssignedId {
            peer_id: my_id.to_string(),
        },
    )
    .await;

    TestMesh {
        transport,
        events,
        connector,
        server,
    }
}

async fn send_signal(server: &mut Signaling, message: &SignalMessage) {
    server
        .send(Message::Text(serde_json::to_string(message).unwrap()))
        .await
        .unwrap();
}

async fn next_signal(server: &mut Signaling) -> SignalMessage {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), server.next())
            .await
            .expect("no signaling message")
            .expect("signaling closed")
            .unwrap();
        if let Message::Text(text) = msg {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn next_event(events: &mut mpsc::Receiver<TransportEvent>) -> TransportEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("no transport event")
        .expect("event channel closed")
}

/// Poll until the condition holds or a second passes.
async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

#[tokio::test]
async fn lower_id_offers_higher_id_waits() {
    let mut mesh = mesh_with_id("bbb").await;

    send_signal(
        &mut mesh.server,
        &SignalMessage::PeerList {
            peers: vec!["aaa".into(), "bbb".into(), "ccc".into()],
        },
    )
    .await;

    // bbb > aaa: wait for aaa's offer. bbb < ccc: offer to ccc.
    let connector = mesh.connector.clone();
    eventually(|| {
        let connector = connector.clone();
        async move { connector.peers.lock().await.len() == 2 }
    })
    .await;

    let aaa = mesh.connector.record("aaa").await;
    assert!(!aaa.lock().await.initiator);
    assert!(!aaa.lock().await.offered);

    let ccc = mesh.connector.record("ccc").await;
    assert!(ccc.lock().await.initiator);
    assert!(ccc.lock().await.offered);

    match next_signal(&mut mesh.server).await {
        SignalMessage::Offer {
            from_peer_id,
            to_peer_id,
            offer,
        } => {
            assert_eq!(from_peer_id, "bbb");
            assert_eq!(to_peer_id, "ccc");
            assert_eq!(offer.sdp_type, "offer");
        }
        other => panic!("unexpected signal: {:?}", other),
    }
}

#[tokio::test]
async fn inbound_offer_is_answered() {
    let mut mesh = mesh_with_id("bbb").await;

    send_signal(
        &mut mesh.server,
        &SignalMessage::PeerList {
            peers: vec!["aaa".into(), "bbb".into()],
        },
    )
    .await;
    send_signal(
        &mut mesh.server,
        &SignalMessage::Offer {
            from_peer_id: "aaa".into(),
            to_peer_id: "bbb".into(),
            offer: SessionDescription {
                sdp_type: "offer".into(),
                sdp: "v=0 from-aaa".into(),
            },
        },
    )
    .await;

    match next_signal(&mut mesh.server).await {
        SignalMessage::Answer {
            from_peer_id,
            to_peer_id,
            answer,
        } => {
            assert_eq!(from_peer_id, "bbb");
            assert_eq!(to_peer_id, "aaa");
            assert_eq!(answer.sdp_type, "answer");
        }
        other => panic!("unexpected signal: {:?}", other),
    }
}

#[tokio::test]
async fn broadcast_reaches_only_open_channels() {
    let mut mesh = mesh_with_id("bbb").await;

    send_signal(
        &mut mesh.server,
        &SignalMessage::PeerList {
            peers: vec!["aaa".into(), "bbb".into(), "ccc".into()],
        },
    )
    .await;
    let connector = mesh.connector.clone();
    eventually(|| {
        let connector = connector.clone();
        async move { connector.peers.lock().await.len() == 2 }
    })
    .await;

    mesh.connector.channel_open("ccc").await;
    match next_event(&mut mesh.events).await {
        TransportEvent::PeerCountChanged(1) => {}
        other => panic!("unexpected event: {:?}", other),
    }

    mesh.transport
        .send(SyncMessage::new("to the mesh".into(), PayloadKind::Text))
        .await
        .unwrap();

    let ccc = mesh.connector.record("ccc").await;
    let connector = mesh.connector.clone();
    eventually(|| {
        let ccc = ccc.clone();
        async move { !ccc.lock().await.sent.is_empty() }
    })
    .await;
    assert_eq!(ccc.lock().await.sent[0].payload, "to the mesh");
    let aaa = connector.record("aaa").await;
    assert!(aaa.lock().await.sent.is_empty(), "closed channel got a frame");
}

#[tokio::test]
async fn roster_snapshot_is_authoritative() {
    let mut mesh = mesh_with_id("bbb").await;

    send_signal(
        &mut mesh.server,
        &SignalMessage::PeerList {
            peers: vec!["bbb".into(), "ccc".into()],
        },
    )
    .await;
    let connector = mesh.connector.clone();
    eventually(|| {
        let connector = connector.clone();
        async move { connector.peers.lock().await.len() == 1 }
    })
    .await;
    mesh.connector.channel_open("ccc").await;
    match next_event(&mut mesh.events).await {
        TransportEvent::PeerCountChanged(1) => {}
        other => panic!("unexpected event: {:?}", other),
    }

    // ccc drops out of the snapshot: its connection must be closed.
    send_signal(
        &mut mesh.server,
        &SignalMessage::PeerList {
            peers: vec!["bbb".into()],
        },
    )
    .await;
    match next_event(&mut mesh.events).await {
        TransportEvent::PeerCountChanged(0) => {}
        other => panic!("unexpected event: {:?}", other),
    }
    let ccc = mesh.connector.record("ccc").await;
    assert!(ccc.lock().await.closed);
}

#[tokio::test]
async fn channel_close_removes_peer() {
    let mut mesh = mesh_with_id("bbb").await;

    send_signal(
        &mut mesh.server,
        &SignalMessage::PeerList {
            peers: vec!["bbb".into(), "ccc".into()],
        },
    )
    .await;
    let connector = mesh.connector.clone();
    eventually(|| {
        let connector = connector.clone();
        async move { connector.peers.lock().await.len() == 1 }
    })
    .await;
    mesh.connector.channel_open("ccc").await;
    next_event(&mut mesh.events).await; // PeerCountChanged(1)

    mesh.connector.channel_closed("ccc").await;
    match next_event(&mut mesh.events).await {
        TransportEvent::PeerCountChanged(0) => {}
        other => panic!("unexpected event: {:?}", other),
    }
}

#[tokio::test]
async fn remote_candidates_are_validated_before_applying() {
    let mut mesh = mesh_with_id("bbb").await;

    send_signal(
        &mut mesh.server,
        &SignalMessage::PeerList {
            peers: vec!["bbb".into(), "ccc".into()],
        },
    )
    .await;
    let connector = mesh.connector.clone();
    eventually(|| {
        let connector = connector.clone();
        async move { connector.peers.lock().await.len() == 1 }
    })
    .await;

    send_signal(
        &mut mesh.server,
        &SignalMessage::IceCandidate {
            from_peer_id: "ccc".into(),
            to_peer_id: "bbb".into(),
            candidate: IceCandidateJson {
                candidate: "candidate:1 1 udp 2113939711 192.168.1.10 5000 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            },
        },
    )
    .await;
    // Garbage candidate line: dropped, never applied.
    send_signal(
        &mut mesh.server,
        &SignalMessage::IceCandidate {
            from_peer_id: "ccc".into(),
            to_peer_id: "bbb".into(),
            candidate: IceCandidateJson {
                candidate: "not a candidate".into(),
                sdp_mid: None,
                sdp_mline_index: None,
            },
        },
    )
    .await;

    let ccc = mesh.connector.record("ccc").await;
    eventually(|| {
        let ccc = ccc.clone();
        async move { ccc.lock().await.remote_candidates.len() == 1 }
    })
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(ccc.lock().await.remote_candidates.len(), 1);
}

#[tokio::test]
async fn stop_during_signaling_outage_prevents_reconnect() {
    let _ = env_logger::builder().is_test(true).try_init();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/", listener.local_addr().unwrap());
    let mut config = SyncConfig::new(TransportMode::Mesh, url);
    config.reconnect_delay_secs = 1;

    let connector = Arc::new(MockConnector::default());
    let (transport, mut events) =
        MeshTransport::with_connector(&config, connector as Arc<dyn PeerConnector>);
    transport.start().await.unwrap();

    let (stream, _) = tokio::time::timeout(Duration::from_secs(5), listener.accept())
        .await
        .expect("no signaling client")
        .unwrap();
    let server = accept_async(stream).await.unwrap();
    match next_event(&mut events).await {
        TransportEvent::Connected { restored } => assert!(!restored),
        other => panic!("unexpected event: {:?}", other),
    }

    // Rendezvous server dies mid-session.
    drop(server);
    match next_event(&mut events).await {
        TransportEvent::ConnectionLost => {}
        other => panic!("unexpected event: {:?}", other),
    }

    // Stop lands inside the reconnect backoff; the link must stay down.
    transport.stop().await;
    assert!(
        tokio::time::timeout(Duration::from_millis(2500), listener.accept())
            .await
            .is_err(),
        "stopped transport reconnected"
    );
}

#[tokio::test]
async fn signals_addressed_to_others_are_ignored() {
    let mut mesh = mesh_with_id("bbb").await;

    send_signal(
        &mut mesh.server,
        &SignalMessage::PeerList {
            peers: vec!["bbb".into(), "ccc".into()],
        },
    )
    .await;
    let connector = mesh.connector.clone();
    eventually(|| {
        let connector = connector.clone();
        async move { connector.peers.lock().await.len() == 1 }
    })
    .await;

    send_signal(
        &mut mesh.server,
        &SignalMessage::Answer {
            from_peer_id: "ccc".into(),
            to_peer_id: "zzz".into(),
            answer: SessionDescription {
                sdp_type: "answer".into(),
                sdp: "v=0".into(),
            },
        },
    )
    .await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let ccc = mesh.connector.record("ccc").await;
    assert!(!ccc.lock().await.answered);
}
