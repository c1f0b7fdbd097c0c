//! Relay (peer-to-server) transport: STOMP over a persistent WebSocket to the
//! message broker.
//!
//! State machine: Disconnected -> Connecting -> Connected(Subscribed) ->
//! Disconnected on error/close, with a fixed-delay automatic reconnect and an
//! inbound heartbeat watchdog.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::{timeout, Instant};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use super::frame::Frame;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::interface::{Transport, TransportEvent};
use crate::message::SyncMessage;

/// Outgoing STOMP heartbeat interval, also offered during negotiation.
const HEARTBEAT_MS: u64 = 10_000;

pub struct RelayTransport {
    inner: Arc<Inner>,
}

struct Inner {
    url: String,
    cookie: Option<String>,
    subscription_destination: String,
    send_destination: String,
    connect_timeout: Duration,
    reconnect_delay: Duration,
    heartbeat_timeout: Duration,

    /// Intended state: false once `stop` was requested. Checked before every
    /// reconnect so a deliberate stop never races into a zombie reconnect.
    running: watch::Sender<bool>,
    /// True while the connection loop itself is alive; prevents a second
    /// `start` or `reconnect` from spawning a duplicate loop.
    loop_active: AtomicBool,
    auto_reconnecting: AtomicBool,
    /// At-most-one-outstanding-send: set before publishing, cleared when the
    /// broker delivers the next inbound message. Deliberate backpressure
    /// against rapid repeated clipboard changes, not a queue.
    pending_send: AtomicBool,
    /// Writer half of the live connection, if any.
    out_tx: Mutex<Option<mpsc::Sender<Message>>>,
    events_tx: mpsc::Sender<TransportEvent>,
}

impl RelayTransport {
    pub fn new(config: &SyncConfig) -> (Self, mpsc::Receiver<TransportEvent>) {
        let (events_tx, events_rx) = mpsc::channel(64);
        let (running, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            url: config.websocket_url.clone(),
            cookie: config.cookie.clone(),
            subscription_destination: config.subscription_destination.clone(),
            send_destination: config.send_destination.clone(),
            connect_timeout: config.connect_timeout(),
            reconnect_delay: config.reconnect_delay(),
            heartbeat_timeout: config.heartbeat_timeout(),
            running,
            loop_active: AtomicBool::new(false),
            auto_reconnecting: AtomicBool::new(false),
            pending_send: AtomicBool::new(false),
            out_tx: Mutex::new(None),
            events_tx,
        });
        (Self { inner }, events_rx)
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
            .map_err(|e| SyncError::fatal(format!("invalid broker URL {:?}: {}", self.url, e)))?;
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
                    error!("relay connection failed permanently: {}", e);
                    self.running.send_replace(false);
                    self.pending_send.store(false, Ordering::SeqCst);
                    *self.out_tx.lock().await = None;
                    let _ = self.events_tx.send(TransportEvent::Fatal(e.to_string())).await;
                    return;
                }
                Err(e) => debug!("relay connection ended: {}", e),
            }
            self.pending_send.store(false, Ordering::SeqCst);
            *self.out_tx.lock().await = None;
            if !*running_rx.borrow() {
                break;
            }
            if !was_lost {
                let _ = self.events_tx.send(TransportEvent::ConnectionLost).await;
                was_lost = true;
            }
            self.auto_reconnecting.store(true, Ordering::SeqCst);
            tokio::time::sleep(self.reconnect_delay).await;
        }
    }

    /// One full connect/subscribe/read cycle. `Ok(())` means a deliberate
    /// stop; `Err` means the connection dropped and the caller may retry.
    async fn run_one_connection(
        &self,
        running_rx: &mut watch::Receiver<bool>,
        restored: bool,
    ) -> Result<(), SyncError> {
        let request = self.build_request()?;

        let (ws, _) = timeout(self.connect_timeout, connect_async(request))
            .await
            .map_err(|_| SyncError::transient(format!("connection to {} timed out", self.url)))?
            .map_err(|e| SyncError::transient(format!("websocket connect failed: {}", e)))?;
        let (mut sink, mut stream) = ws.split();

        sink.send(Message::Text(Frame::connect(&self.url, HEARTBEAT_MS).marshal()))
            .await
            .map_err(|e| SyncError::transient(format!("CONNECT send failed: {}", e)))?;

        // Await the broker's CONNECTED before subscribing.
        let connected = timeout(self.connect_timeout, async {
            while let Some(msg) = stream.next().await {
                let msg = msg.map_err(|e| SyncError::transient(e.to_string()))?;
                if let Some(frame) = parse_stomp(&msg)? {
                    match frame.command.as_str() {
                        "CONNECTED" => return Ok(true),
                        "ERROR" => {
                            return Err(SyncError::transient(format!(
                                "broker refused connection: {}",
                                frame.body
                            )))
                        }
                        other => debug!("ignoring pre-CONNECTED frame {}", other),
                    }
                }
            }
            Ok(false)
        })
        .await
        .map_err(|_| SyncError::transient("broker CONNECTED frame timed out"))??;
        if !connected {
            return Err(SyncError::transient("socket closed during STOMP handshake"));
        }

        sink.send(Message::Text(
            Frame::subscribe("sub-0", &self.subscription_destination).marshal(),
        ))
        .await
        .map_err(|e| SyncError::transient(format!("SUBSCRIBE send failed: {}", e)))?;

        info!(
            "relay connected and subscribed to {}",
            self.subscription_destination
        );
        self.auto_reconnecting.store(false, Ordering::SeqCst);
        self.pending_send.store(false, Ordering::SeqCst);
        let _ = self
            .events_tx
            .send(TransportEvent::Connected { restored })
            .await;

        let (out_tx, mut out_rx) = mpsc::channel::<Message>(16);
        *self.out_tx.lock().await = Some(out_tx);

        let mut heartbeat_out = tokio::time::interval(Duration::from_millis(HEARTBEAT_MS));
        heartbeat_out.tick().await; // first tick fires immediately
        let mut watchdog = tokio::time::interval(Duration::from_secs(1));
        let mut last_rx = Instant::now();

        loop {
            tokio::select! {
                msg = stream.next() => {
                    match msg {
                        Some(Ok(msg)) => {
                            last_rx = Instant::now();
                            self.handle_inbound(&msg).await;
                        }
                        Some(Err(e)) => {
                            return Err(SyncError::transient(format!("websocket error: {}", e)));
                        }
                        None => {
                            return Err(SyncError::transient("websocket closed by broker"));
                        }
                    }
                }
                Some(frame) = out_rx.recv() => {
                    if let Err(e) = sink.send(frame).await {
                        return Err(SyncError::transient(format!("send failed: {}", e)));
                    }
                }
                _ = heartbeat_out.tick() => {
                    if sink.send(Message::Text("\n".to_string())).await.is_err() {
                        return Err(SyncError::transient("heartbeat send failed"));
                    }
                }
                _ = watchdog.tick() => {
                    if last_rx.elapsed() > self.heartbeat_timeout {
                        warn!(
                            "no broker traffic for {:?}, treating as connection loss",
                            self.heartbeat_timeout
                        );
                        return Err(SyncError::transient("heartbeat timeout"));
                    }
                }
                _ = running_rx.changed() => {
                    if !*running_rx.borrow() {
                        let _ = sink.send(Message::Text(Frame::disconnect().marshal())).await;
                        let _ = sink.close().await;
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_inbound(&self, msg: &Message) {
        let frame = match parse_stomp(msg) {
            Ok(Some(frame)) => frame,
            Ok(None) => return, // heartbeat
            Err(e) => {
                warn!("discarding unparseable broker frame: {}", e);
                return;
            }
        };

        match frame.command.as_str() {
            "MESSAGE" => {
                // Any delivery proves the subscription is live and unblocks
                // the next outbound publish.
                self.pending_send.store(false, Ordering::SeqCst);
                let _ = self.events_tx.send(TransportEvent::Subscribed).await;
                match serde_json::from_str::<SyncMessage>(&frame.body) {
                    Ok(message) => {
                        let _ = self.events_tx.send(TransportEvent::Frame(message)).await;
                    }
                    Err(e) => warn!("discarding malformed broker message body: {}", e),
                }
            }
            "ERROR" => {
                error!(
                    "broker ERROR frame: {}",
                    frame.get_header("message").unwrap_or(&frame.body)
                );
            }
            "RECEIPT" | "CONNECTED" => {}
            other => debug!("unhandled broker frame {}", other),
        }
    }
}

fn parse_stomp(msg: &Message) -> Result<Option<Frame>, SyncError> {
    match msg {
        Message::Text(text) => Frame::unmarshal(text),
        Message::Binary(bytes) => {
            let text = std::str::from_utf8(bytes)
                .map_err(|_| SyncError::ProtocolViolation("non-UTF-8 STOMP frame".into()))?;
            Frame::unmarshal(text)
        }
        // Pings and pongs only count as liveness.
        _ => Ok(None),
    }
}

#[async_trait]
impl Transport for RelayTransport {
    async fn start(&self) -> Result<(), SyncError> {
        // Fail fast on configuration that can never connect.
        self.inner.build_request()?;
        self.inner.running.send_replace(true);
        self.inner.ensure_loop();
        Ok(())
    }

    async fn send(&self, frame: SyncMessage) -> Result<(), SyncError> {
        if self.inner.pending_send.swap(true, Ordering::SeqCst) {
            debug!("dropping outbound send, previous publish still outstanding");
            return Ok(());
        }

        let guard = self.inner.out_tx.lock().await;
        let Some(out_tx) = guard.as_ref() else {
            self.inner.pending_send.store(false, Ordering::SeqCst);
            debug!("not connected, dropping outbound message");
            return Ok(());
        };

        let body = serde_json::to_string(&frame)
            .map_err(|e| SyncError::ProtocolViolation(format!("unserializable frame: {}", e)))?;
        let wire = Frame::send(&self.inner.send_destination, body).marshal();
        if out_tx.send(Message::Text(wire)).await.is_err() {
            self.inner.pending_send.store(false, Ordering::SeqCst);
            return Err(SyncError::transient("connection writer gone"));
        }
        Ok(())
    }

    fn max_frame_size(&self) -> Option<usize> {
        None
    }

    async fn reconnect(&self) {
        if self.inner.auto_reconnecting.load(Ordering::SeqCst) {
            debug!("automatic reconnect already in flight, ignoring manual request");
            return;
        }
        self.inner.running.send_replace(true);
        self.inner.ensure_loop();
    }

    async fn stop(&self) {
        self.inner.running.send_replace(false);
        self.inner.pending_send.store(false, Ordering::SeqCst);
        *self.inner.out_tx.lock().await = None;
    }
}
