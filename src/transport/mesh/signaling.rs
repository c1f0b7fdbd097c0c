//! WebSocket client for the mesh rendezvous (signaling) server.
//!
//! Carries JSON [`SignalMessage`]s both ways. Connection upkeep mirrors the
//! relay transport: fixed-delay reconnect, gated on the intended running
//! state so a deliberate stop never resurrects the link.

use log::{debug, error, info, warn};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use crate::error::SyncError;
use crate::message::SignalMessage;

/// What the signaling link reports to the mesh control loop.
#[derive(Debug)]
pub enum SignalingEvent {
    Connected { restored: bool },
    Message(SignalMessage),
    ConnectionLost,
    Fatal(String),
}

pub struct SignalingClient {
    inner: Arc<Inner>,
}

struct Inner {
    url: String,
    cookie: Option<String>,
    connect_timeout: Duration,
    reconnect_delay: Duration,
    running: watch::Sender<bool>,
    loop_active: AtomicBool,
    auto_reconnecting: AtomicBool,
    out_tx: Mutex<Option<mpsc::Sender<Message>>>,
    events_tx: mpsc::Sender<SignalingEvent>,
}

impl SignalingClient {
    pub fn new(
        url: String,
        cookie: Option<String>,
        connect_timeout: Duration,
        reconnect_delay: Duration,
    ) -> (Self, mpsc::Receiver<SignalingEvent>) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let (running, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            url,
            cookie,
            connect_timeout,
            reconnect_delay,
            running,
            loop_active: AtomicBool::new(false),
            auto_reconnecting: AtomicBool::new(false),
            out_tx: Mutex::new(None),
            events_tx,
        });
        (Self { inner }, events_rx)
    }

    pub fn start(&self) -> Result<(), SyncError> {
        self.inner.build_request()?;
        self.inner.running.send_replace(true);
        self.inner.ensure_loop();
        Ok(())
    }

    /// Send one signaling message, best effort. Dropped with a log line when
    /// the link is down; signaling state is rebuilt from the next PEER_LIST
    /// anyway.
    pub async fn send(&self, message: &SignalMessage) -> Result<(), SyncError> {
        let guard = self.inner.out_tx.lock().await;
        let Some(out_tx) = guard.as_ref() else {
            debug!("signaling link down, dropping outbound {:?}", message);
            return Ok(());
        };
        let text = serde_json::to_string(message)
            .map_err(|e| SyncError::ProtocolViolation(format!("unserializable signal: {}", e)))?;
        out_tx
            .send(Message::Text(text))
            .await
            .map_err(|_| SyncError::transient("signaling writer gone"))
    }

    pub async fn reconnect(&self) {
        if self.inner.auto_reconnecting.load(Ordering::SeqCst) {
            debug!("signaling reconnect already in flight, ignoring manual request");
            return;
        }
        self.inner.running.send_replace(true);
        self.inner.ensure_loop();
    }

    pub async fn stop(&self) {
        self.inner.running.send_replace(false);
        *self.inner.out_tx.lock().await = None;
    }
}

impl Inner {
    fn build_request(
        &self,
    ) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, SyncError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| SyncError::fatal(format!("invalid signaling URL {:?}: {}", self.url, e)))?;
        if let Some(cookie) = &self.cookie {
            let value = HeaderValue::from_str(cookie)
                .map_err(|e| SyncError::fatal(format!("invalid session cookie: {}", e)))?;
            request.headers_mut().insert("Cookie", value);
        }
        Ok(request)
    }

    fn ensure_loop(self: &Arc<Self>) {
        if self
            .loop_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            this.connection_loop().await;
            this.auto_reconnecting.store(false, Ordering::SeqCst);
            this.loop_active.store(false, Ordering::SeqCst);
        });
    }

    async fn connection_loop(&self) {
        let mut was_lost = false;
        let mut running_rx = self.running.subscribe();
        while *running_rx.borrow() {
            match self.run_one_connection(&mut running_rx, was_lost).await {
                Ok(()) => return, // deliberate stop
                Err(e) if !e.is_recoverable() => {
                    // No retry can fix a setup error; surface it and stop.
                    error!("signaling connection failed permanently: {}", e);
                    self.running.send_replace(false);
                    *self.out_tx.lock().await = None;
                    let _ = self.events_tx.send(SignalingEvent::Fatal(e.to_string())).await;
                    return;
                }
                Err(e) => debug!("signaling connection ended: {}", e),
            }
            *self.out_tx.lock().await = None;
            if !*running_rx.borrow() {
                break;
            }
            if !was_lost {
                let _ = self.events_tx.send(SignalingEvent::ConnectionLost).await;
                was_lost = true;
            }
            self.auto_reconnecting.store(true, Ordering::SeqCst);
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }

    async fn run_one_connection(
        &self,
        running_rx: &mut watch::Receiver<bool>,
        restored: bool,
    ) -> Result<(), SyncError> {
        let request = self.build_request()?;
        let (ws, _) = timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| SyncError::transient(format!("connection to {} timed out", self.url)))?
            .map_err(|e| SyncError::transient(format!("signaling connect failed: {}", e)))?;
        let (mut sink, mut stream) = ws.split();

        info!("signaling connected to {}", self.url);
        self.auto_reconnecting.store(false, Ordering::SeqCst);
        let _ = self
            .events_tx
            .send(SignalingEvent::Connected { restored })
            .await;

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(64);
        *self.out_tx.lock().await = Some(out_tx);

        loop {
            tokio::select! {
                msg = stream.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => self.handle_text(&text).await,
                        Some(Ok(Message::Close(_))) | None => {
                            return Err(SyncError::transient("signaling socket closed"));
                        }
                        Some(Ok(_)) => {} // pings keep the link alive
                        Some(Err(e)) => {
                            return Err(SyncError::transient(format!("signaling error: {}", e)));
                        }
                    }
                }
                Some(out) = out_rx.recv() => {
                    if let Err(e) = sink.send(out).await {
                        return Err(SyncError::transient(format!("signaling send failed: {}", e)));
                    }
                }
                _ = running_rx.changed() => {
                    if !*running_rx.borrow() {
                        let _ = sink.close().await;
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_text(&self, text: &str) {
        match serde_json::from_str::<SignalMessage>(text) {
            Ok(message) => {
                let _ = self.events_tx.send(SignalingEvent::Message(message)).await;
            }
            Err(e) => warn!("discarding malformed signaling message: {}", e),
        }
    }
}
