//! Mesh (peer-to-peer) transport: a full mesh of data channels, brokered by
//! the signaling server.
//!
//! One control loop owns the whole peer table. Signaling traffic, peer
//! connection callbacks and outbound broadcasts all funnel into it over
//! channels, so membership decisions are serialized and never race.

use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use super::ice;
use super::peer::{PeerConnector, PeerEvent, PeerHandle};
use super::signaling::{SignalingClient, SignalingEvent};
use super::webrtc_peer::WebRtcConnector;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::interface::{Transport, TransportEvent};
use crate::message::{SignalMessage, SyncMessage};

enum MeshCommand {
    Broadcast(SyncMessage),
    Stop(oneshot::Sender<()>),
}

pub struct MeshTransport {
    signaling: Arc<SignalingClient>,
    commands: mpsc::Sender<MeshCommand>,
    fragment_size: usize,
}

impl MeshTransport {
    /// Production constructor, backed by WebRTC.
    pub fn new(config: &SyncConfig) -> Result<(Self, mpsc::Receiver<TransportEvent>), SyncError> {
        let connector = Arc::new(WebRtcConnector::new(config.stun_url.clone())?);
        Ok(Self::with_connector(config, connector))
    }

    /// Constructor with an injected connector, used by tests to run the
    /// control loop against in-memory peers.
    pub fn with_connector(
        config: &SyncConfig,
        connector: Arc<dyn PeerConnector>,
    ) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (signaling, signaling_rx) = SignalingClient::new(
            config.websocket_url.clone(),
            config.cookie.clone(),
            config.connect_timeout(),
            config.reconnect_delay(),
        );
        let signaling = Arc::new(signaling);

        let (events_tx, events_rx) = mpsc::channel(64);
        let (commands_tx, commands_rx) = mpsc::channel(16);

        let loop_state = ControlLoop {
            connector,
            signaling: signaling.clone(),
            events_tx,
            my_id: None,
            peers: HashMap::new(),
            open_count: 0,
        };
        tokio::spawn(loop_state.run(signaling_rx, commands_rx));

        let transport = Self {
            signaling,
            commands: commands_tx,
            fragment_size: config.fragment_size,
        };
        (transport, events_rx)
    }
}

#[async_trait]
impl Transport for MeshTransport {
    async fn start(&self) -> Result<(), SyncError> {
        self.signaling.start()
    }

    async fn send(&self, frame: SyncMessage) -> Result<(), SyncError> {
        self.commands
            .send(MeshCommand::Broadcast(frame))
            .await
            .map_err(|_| SyncError::transient("mesh control loop gone"))
    }

    fn max_frame_size(&self) -> Option<usize> {
        Some(self.fragment_size)
    }

    async fn reconnect(&self) {
        self.signaling.reconnect().await;
    }

    async fn stop(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(MeshCommand::Stop(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
        self.signaling.stop().await;
    }
}

struct PeerState {
    handle: Arc<dyn PeerHandle>,
    open: bool,
}

struct ControlLoop {
    connector: Arc<dyn PeerConnector>,
    signaling: Arc<SignalingClient>,
    events_tx: mpsc::Sender<TransportEvent>,
    my_id: Option<String>,
    peers: HashMap<String, PeerState>,
    open_count: usize,
}

impl ControlLoop {
    async fn run(
        mut self,
        mut signaling_rx: mpsc::Receiver<SignalingEvent>,
        mut commands_rx: mpsc::Receiver<MeshCommand>,
    ) {
        let (peer_tx, mut peer_rx) = mpsc::channel::<PeerEvent>(64);
        loop {
            tokio::select! {
                Some(event) = signaling_rx.recv() => self.on_signaling(event, &peer_tx).await,
                Some(event) = peer_rx.recv() => self.on_peer(event).await,
                command = commands_rx.recv() => match command {
                    Some(MeshCommand::Broadcast(frame)) => self.broadcast(frame).await,
                    Some(MeshCommand::Stop(ack)) => {
                        self.teardown_peers().await;
                        let _ = ack.send(());
                    }
                    None => {
                        self.teardown_peers().await;
                        return;
                    }
                },
            }
        }
    }

    async fn on_signaling(&mut self, event: SignalingEvent, peer_tx: &mpsc::Sender<PeerEvent>) {
        match event {
            SignalingEvent::Connected { restored } => {
                let _ = self
                    .events_tx
                    .send(TransportEvent::Connected { restored })
                    .await;
            }
            SignalingEvent::ConnectionLost => {
                // Established data channels survive a signaling outage; only
                // membership changes stall until the link is back.
                let _ = self.events_tx.send(TransportEvent::ConnectionLost).await;
            }
            SignalingEvent::Fatal(reason) => {
                let _ = self.events_tx.send(TransportEvent::Fatal(reason)).await;
            }
            SignalingEvent::Message(message) => self.on_signal(message, peer_tx).await,
        }
    }

    async fn on_signal(&mut self, message: SignalMessage, peer_tx: &mpsc::Sender<PeerEvent>) {
        match message {
            SignalMessage::AssignedId { peer_id } => {
                if let Some(previous) = &self.my_id {
                    if *previous != peer_id {
                        // New identity invalidates every connection negotiated
                        // under the old one.
                        info!("reassigned id {} -> {}", previous, peer_id);
                        self.teardown_peers().await;
                    }
                }
                self.my_id = Some(peer_id);
            }

            SignalMessage::PeerList { peers } => self.reconcile(peers, peer_tx).await,

            SignalMessage::Offer {
                from_peer_id,
                to_peer_id,
                offer,
            } => {
                if !self.is_for_me(&to_peer_id) {
                    return;
                }
                let Some(my_id) = self.my_id.clone() else { return };
                if let Some(existing) = self.peers.get(&from_peer_id) {
                    // Tie-break says the lower id offers; an offer from a peer
                    // we already initiated toward is out of order.
                    if my_id < from_peer_id {
                        warn!("ignoring out-of-order offer from {}", from_peer_id);
                        return;
                    }
                    existing.handle.close().await;
                    self.remove_peer(&from_peer_id).await;
                }
                let handle = match self
                    .connector
                    .connect_peer(&from_peer_id, false, peer_tx.clone())
                    .await
                {
                    Ok(handle) => handle,
                    Err(e) => {
                        warn!("could not create connection for {}: {}", from_peer_id, e);
                        return;
                    }
                };
                self.peers.insert(
                    from_peer_id.clone(),
                    PeerState {
                        handle: handle.clone(),
                        open: false,
                    },
                );
                match handle.accept_offer(offer).await {
                    Ok(answer) => {
                        let _ = self
                            .signaling
                            .send(&SignalMessage::Answer {
                                from_peer_id: my_id,
                                to_peer_id: from_peer_id,
                                answer,
                            })
                            .await;
                    }
                    Err(e) => {
                        warn!("answering {} failed: {}", from_peer_id, e);
                        self.remove_peer(&from_peer_id).await;
                    }
                }
            }

            SignalMessage::Answer {
                from_peer_id,
                to_peer_id,
                answer,
            } => {
                if !self.is_for_me(&to_peer_id) {
                    return;
                }
                let Some(peer) = self.peers.get(&from_peer_id) else {
                    debug!("answer from unknown peer {}", from_peer_id);
                    return;
                };
                if let Err(e) = peer.handle.accept_answer(answer).await {
                    warn!("applying answer from {} failed: {}", from_peer_id, e);
                }
            }

            SignalMessage::IceCandidate {
                from_peer_id,
                to_peer_id,
                candidate,
            } => {
                if !self.is_for_me(&to_peer_id) {
                    return;
                }
                if let Err(e) = ice::parse_candidate(&candidate.candidate) {
                    warn!("rejecting candidate from {}: {}", from_peer_id, e);
                    return;
                }
                let Some(peer) = self.peers.get(&from_peer_id) else {
                    debug!("candidate from unknown peer {}", from_peer_id);
                    return;
                };
                if let Err(e) = peer.handle.add_remote_candidate(candidate).await {
                    warn!("adding candidate from {} failed: {}", from_peer_id, e);
                }
            }
        }
    }

    /// Bring the peer table in line with the server's roster snapshot. The
    /// snapshot is authoritative: anything missing from it gets closed, and
    /// anyone new gets a connection, offered from the lexicographically lower
    /// id so exactly one side dials.
    async fn reconcile(&mut self, roster: Vec<String>, peer_tx: &mpsc::Sender<PeerEvent>) {
        let Some(my_id) = self.my_id.clone() else {
            warn!("peer list before id assignment, ignoring");
            return;
        };

        let stale: Vec<String> = self
            .peers
            .keys()
            .filter(|id| !roster.contains(id))
            .cloned()
            .collect();
        for peer_id in stale {
            debug!("peer {} left the room", peer_id);
            if let Some(peer) = self.peers.get(&peer_id) {
                peer.handle.close().await;
            }
            self.remove_peer(&peer_id).await;
        }

        for peer_id in roster {
            if peer_id == my_id || self.peers.contains_key(&peer_id) {
                continue;
            }
            let initiator = my_id < peer_id;
            let handle = match self
                .connector
                .connect_peer(&peer_id, initiator, peer_tx.clone())
                .await
            {
                Ok(handle) => handle,
                Err(e) => {
                    warn!("could not create connection for {}: {}", peer_id, e);
                    continue;
                }
            };
            self.peers.insert(
                peer_id.clone(),
                PeerState {
                    handle: handle.clone(),
                    open: false,
                },
            );
            if initiator {
                match handle.create_offer().await {
                    Ok(offer) => {
                        let _ = self
                            .signaling
                            .send(&SignalMessage::Offer {
                                from_peer_id: my_id.clone(),
                                to_peer_id: peer_id,
                                offer,
                            })
                            .await;
                    }
                    Err(e) => {
                        warn!("offering to {} failed: {}", peer_id, e);
                        self.remove_peer(&peer_id).await;
                    }
                }
            }
        }
    }

    async fn on_peer(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::ChannelOpen { peer_id } => {
                if let Some(peer) = self.peers.get_mut(&peer_id) {
                    if !peer.open {
                        peer.open = true;
                        info!("data channel to {} open", peer_id);
                        self.publish_peer_count().await;
                    }
                }
            }
            PeerEvent::ChannelClosed { peer_id } => {
                if let Some(peer) = self.peers.get(&peer_id) {
                    peer.handle.close().await;
                }
                self.remove_peer(&peer_id).await;
            }
            PeerEvent::Message { peer_id, message } => {
                debug!("frame from {}", peer_id);
                let _ = self.events_tx.send(TransportEvent::Frame(message)).await;
            }
            PeerEvent::LocalCandidate { peer_id, candidate } => {
                let Some(my_id) = self.my_id.clone() else {
                    return;
                };
                let _ = self
                    .signaling
                    .send(&SignalMessage::IceCandidate {
                        from_peer_id: my_id,
                        to_peer_id: peer_id,
                        candidate,
                    })
                    .await;
            }
        }
    }

    /// Best-effort fan-out to every open channel.
    async fn broadcast(&mut self, frame: SyncMessage) {
        let mut delivered = 0usize;
        for (peer_id, peer) in &self.peers {
            if !peer.open {
                continue;
            }
            match peer.handle.send(&frame).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!("broadcast to {} failed: {}", peer_id, e),
            }
        }
        if delivered == 0 {
            debug!("no open peers, frame dropped");
        }
    }

    fn is_for_me(&self, to_peer_id: &str) -> bool {
        match &self.my_id {
            Some(my_id) => my_id == to_peer_id,
            None => false,
        }
    }

    async fn remove_peer(&mut self, peer_id: &str) {
        if self.peers.remove(peer_id).is_some() {
            self.publish_peer_count().await;
        }
    }

    async fn publish_peer_count(&mut self) {
        let open = self.peers.values().filter(|p| p.open).count();
        if open != self.open_count {
            self.open_count = open;
            let _ = self
                .events_tx
                .send(TransportEvent::PeerCountChanged(open))
                .await;
        }
    }

    async fn teardown_peers(&mut self) {
        for (_, peer) in self.peers.drain() {
            peer.handle.close().await;
        }
        self.publish_peer_count().await;
    }
}
