//! WebRTC-backed implementation of the peer connection seam.

use async_trait::async_trait;
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use super::peer::{PeerConnector, PeerEvent, PeerHandle, DATA_CHANNEL_LABEL};
use crate::error::SyncError;
use crate::message::{IceCandidateJson, SessionDescription, SyncMessage};

pub struct WebRtcConnector {
    api: API,
    stun_url: Option<String>,
}

impl WebRtcConnector {
    pub fn new(stun_url: Option<String>) -> Result<Self, SyncError> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .map_err(|e| SyncError::fatal(format!("webrtc media engine: {}", e)))?;
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .map_err(|e| SyncError::fatal(format!("webrtc interceptors: {}", e)))?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api, stun_url })
    }

    fn rtc_config(&self) -> RTCConfiguration {
        let ice_servers = match &self.stun_url {
            Some(url) => vec![RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            }],
            None => Vec::new(),
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn connect_peer(
        &self,
        peer_id: &str,
        initiator: bool,
        events: mpsc::Sender<PeerEvent>,
    ) -> Result<Arc<dyn PeerHandle>, SyncError> {
        let pc = self
            .api
            .new_peer_connection(self.rtc_config())
            .await
            .map_err(|e| SyncError::transient(format!("peer connection setup: {}", e)))?;
        let pc = Arc::new(pc);

        let channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>> = Arc::new(RwLock::new(None));

        {
            let events = events.clone();
            let peer_id = peer_id.to_string();
            pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                let peer_id = peer_id.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    match candidate.to_json() {
                        Ok(init) => {
                            let _ = events
                                .send(PeerEvent::LocalCandidate {
                                    peer_id,
                                    candidate: IceCandidateJson {
                                        candidate: init.candidate,
                                        sdp_mid: init.sdp_mid,
                                        sdp_mline_index: init.sdp_mline_index,
                                    },
                                })
                                .await;
                        }
                        Err(e) => warn!("could not serialize local ICE candidate: {}", e),
                    }
                })
            }));
        }

        if initiator {
            let dc = pc
                .create_data_channel(DATA_CHANNEL_LABEL, None)
                .await
                .map_err(|e| SyncError::transient(format!("data channel setup: {}", e)))?;
            wire_channel(&dc, peer_id, events.clone());
            *channel.write().await = Some(dc);
        } else {
            let channel = channel.clone();
            let events = events.clone();
            let peer_id = peer_id.to_string();
            pc.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let channel = channel.clone();
                let events = events.clone();
                let peer_id = peer_id.clone();
                Box::pin(async move {
                    if dc.label() != DATA_CHANNEL_LABEL {
                        debug!("ignoring unexpected data channel {:?}", dc.label());
                        return;
                    }
                    wire_channel(&dc, &peer_id, events);
                    *channel.write().await = Some(dc);
                })
            }));
        }

        Ok(Arc::new(WebRtcPeer {
            peer_id: peer_id.to_string(),
            pc,
            channel,
        }))
    }
}

/// Attach open/close/message callbacks to a data channel.
fn wire_channel(dc: &Arc<RTCDataChannel>, peer_id: &str, events: mpsc::Sender<PeerEvent>) {
    {
        let events = events.clone();
        let peer_id = peer_id.to_string();
        dc.on_open(Box::new(move || {
            let events = events.clone();
            let peer_id = peer_id.clone();
            Box::pin(async move {
                let _ = events.send(PeerEvent::ChannelOpen { peer_id }).await;
            })
        }));
    }
    {
        let events = events.clone();
        let peer_id = peer_id.to_string();
        dc.on_close(Box::new(move || {
            let events = events.clone();
            let peer_id = peer_id.clone();
            Box::pin(async move {
                let _ = events.send(PeerEvent::ChannelClosed { peer_id }).await;
            })
        }));
    }
    {
        let peer_id = peer_id.to_string();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let events = events.clone();
            let peer_id = peer_id.clone();
            Box::pin(async move {
                match serde_json::from_slice::<SyncMessage>(&msg.data) {
                    Ok(message) => {
                        let _ = events.send(PeerEvent::Message { peer_id, message }).await;
                    }
                    Err(e) => warn!("discarding malformed frame from {}: {}", peer_id, e),
                }
            })
        }));
    }
}

struct WebRtcPeer {
    peer_id: String,
    pc: Arc<RTCPeerConnection>,
    channel: Arc<RwLock<Option<Arc<RTCDataChannel>>>>,
}

fn to_wire(desc: &RTCSessionDescription) -> SessionDescription {
    SessionDescription {
        sdp_type: desc.sdp_type.to_string(),
        sdp: desc.sdp.clone(),
    }
}

fn from_wire(desc: &SessionDescription) -> Result<RTCSessionDescription, SyncError> {
    let result = match desc.sdp_type.as_str() {
        "offer" => RTCSessionDescription::offer(desc.sdp.clone()),
        "answer" => RTCSessionDescription::answer(desc.sdp.clone()),
        other => {
            return Err(SyncError::ProtocolViolation(format!(
                "unexpected SDP type {:?}",
                other
            )))
        }
    };
    result.map_err(|e| SyncError::ProtocolViolation(format!("unparseable SDP: {}", e)))
}

#[async_trait]
impl PeerHandle for WebRtcPeer {
    async fn create_offer(&self) -> Result<SessionDescription, SyncError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| SyncError::transient(format!("create offer: {}", e)))?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| SyncError::transient(format!("set local offer: {}", e)))?;
        Ok(to_wire(&offer))
    }

    async fn accept_offer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, SyncError> {
        self.pc
            .set_remote_description(from_wire(&offer)?)
            .await
            .map_err(|e| SyncError::transient(format!("set remote offer: {}", e)))?;
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| SyncError::transient(format!("create answer: {}", e)))?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| SyncError::transient(format!("set local answer: {}", e)))?;
        Ok(to_wire(&answer))
    }

    async fn accept_answer(&self, answer: SessionDescription) -> Result<(), SyncError> {
        self.pc
            .set_remote_description(from_wire(&answer)?)
            .await
            .map_err(|e| SyncError::transient(format!("set remote answer: {}", e)))
    }

    async fn add_remote_candidate(&self, candidate: IceCandidateJson) -> Result<(), SyncError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };
        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| SyncError::transient(format!("add ICE candidate: {}", e)))
    }

    async fn send(&self, message: &SyncMessage) -> Result<(), SyncError> {
        let guard = self.channel.read().await;
        let Some(dc) = guard.as_ref() else {
            return Err(SyncError::transient(format!(
                "no data channel to {} yet",
                self.peer_id
            )));
        };
        let text = serde_json::to_string(message)
            .map_err(|e| SyncError::ProtocolViolation(format!("unserializable frame: {}", e)))?;
        dc.send_text(text)
            .await
            .map_err(|e| SyncError::transient(format!("send to {}: {}", self.peer_id, e)))?;
        Ok(())
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            debug!("closing connection to {}: {}", self.peer_id, e);
        }
    }
}
