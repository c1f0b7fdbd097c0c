//! The sync engine orchestrator.
//!
//! One actor task owns all session state. Clipboard events, transport events
//! and control commands arrive over channels and are processed one at a time,
//! so the dedup guard, reassembly buffer and status snapshot never see
//! concurrent writers.

use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::core::cipher::{decrypt_payload, encrypt_to_payload, SessionKey};
use crate::core::content::{decode_files, decode_image, encode_files, encode_image};
use crate::core::fingerprint::Fingerprint;
use crate::core::fragment::{fragment, OutboundTransfer, ReassemblyOutcome};
use crate::core::session::{ConnectionPhase, SyncSessionState, SyncStatus};
use crate::core::size_policy::SizeCeilings;
use crate::error::{Direction, PolicyRejection, SyncError};
use crate::interface::{
    ClipboardEvent, ClipboardWriter, FileAccess, LogNotifier, Notifier, Transport, TransportEvent,
};
use crate::message::{PayloadKind, SyncMessage};
use crate::transport::build_transport;

enum EngineCommand {
    Start(oneshot::Sender<Result<(), SyncError>>),
    Clipboard(ClipboardEvent),
    Reconnect,
    SendProgress {
        transfer_id: Uuid,
        sent: usize,
        total: usize,
    },
    SendFailed {
        transfer_id: Uuid,
        error: String,
    },
    Stop(oneshot::Sender<()>),
}

/// Handle to a running sync session.
///
/// Cheap to clone; all methods forward to the actor task.
#[derive(Clone)]
pub struct SyncEngine {
    commands: mpsc::Sender<EngineCommand>,
    status_rx: watch::Receiver<SyncStatus>,
}

impl SyncEngine {
    pub fn builder() -> SyncEngineBuilder {
        SyncEngineBuilder::new()
    }

    /// Connect the transport. Returns once the initial attempt has concluded;
    /// later drops are recovered by the transport's own reconnect loop.
    pub async fn start(&self) -> Result<(), SyncError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(EngineCommand::Start(tx))
            .await
            .map_err(|_| SyncError::fatal("engine already stopped"))?;
        rx.await
            .map_err(|_| SyncError::fatal("engine already stopped"))?
    }

    /// Feed one observed clipboard change into the outbound pipeline.
    pub async fn clipboard_changed(&self, event: ClipboardEvent) -> Result<(), SyncError> {
        self.commands
            .send(EngineCommand::Clipboard(event))
            .await
            .map_err(|_| SyncError::fatal("engine already stopped"))
    }

    /// Manual reconnect request. A no-op while an automatic reconnect is
    /// already in flight.
    pub async fn reconnect(&self) {
        let _ = self.commands.send(EngineCommand::Reconnect).await;
    }

    /// Tear the session down. Resolves only after the transport has shut down
    /// and session state has been cleared.
    pub async fn stop(&self) {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(EngineCommand::Stop(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Watch channel carrying a status snapshot after every state change.
    pub fn status(&self) -> watch::Receiver<SyncStatus> {
        self.status_rx.clone()
    }
}

pub struct SyncEngineBuilder {
    config: Option<SyncConfig>,
    session_key: Option<SessionKey>,
    clipboard: Option<Arc<dyn ClipboardWriter>>,
    file_access: Option<Arc<dyn FileAccess>>,
    notifier: Option<Arc<dyn Notifier>>,
    transport: Option<(Arc<dyn Transport>, mpsc::Receiver<TransportEvent>)>,
}

impl Default for SyncEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncEngineBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            session_key: None,
            clipboard: None,
            file_access: None,
            notifier: None,
            transport: None,
        }
    }

    pub fn config(mut self, config: SyncConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Session key for payload encryption. Required when the configuration
    /// enables the cipher.
    pub fn session_key(mut self, key: SessionKey) -> Self {
        self.session_key = Some(key);
        self
    }

    pub fn clipboard(mut self, clipboard: Arc<dyn ClipboardWriter>) -> Self {
        self.clipboard = Some(clipboard);
        self
    }

    pub fn file_access(mut self, file_access: Arc<dyn FileAccess>) -> Self {
        self.file_access = Some(file_access);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Inject a transport instead of building one from the configuration.
    /// Used by tests.
    pub fn transport(
        mut self,
        transport: Arc<dyn Transport>,
        events: mpsc::Receiver<TransportEvent>,
    ) -> Self {
        self.transport = Some((transport, events));
        self
    }

    pub fn build(self) -> Result<SyncEngine, SyncError> {
        let config = self
            .config
            .ok_or_else(|| SyncError::fatal("configuration is required"))?;
        let clipboard = self
            .clipboard
            .ok_or_else(|| SyncError::fatal("clipboard writer is required"))?;
        if config.cipher_enabled && self.session_key.is_none() {
            return Err(SyncError::fatal(
                "cipher enabled but no session key provided",
            ));
        }

        let (transport, transport_rx) = match self.transport {
            Some(injected) => injected,
            None => build_transport(&config)?,
        };

        let ceilings = SizeCeilings::new(config.server_max_size, config.local_size_limit);
        let key = if config.cipher_enabled {
            self.session_key
        } else {
            None
        };

        let (commands_tx, commands_rx) = mpsc::channel(64);
        let (status_tx, status_rx) = watch::channel(SyncStatus::default());
        let (transfer_tx, _) = watch::channel(None);

        let actor = EngineActor {
            state: SyncSessionState::new(),
            ceilings,
            key,
            enable_image_sharing: config.enable_image_sharing,
            enable_file_sharing: config.enable_file_sharing,
            transport,
            clipboard,
            file_access: self.file_access,
            notifier: self.notifier.unwrap_or_else(|| Arc::new(LogNotifier)),
            status_tx,
            transfer_tx,
            commands_tx: commands_tx.clone(),
            loss_notified: false,
        };
        tokio::spawn(actor.run(commands_rx, transport_rx));

        Ok(SyncEngine {
            commands: commands_tx,
            status_rx,
        })
    }
}

struct EngineActor {
    state: SyncSessionState,
    ceilings: SizeCeilings,
    key: Option<SessionKey>,
    enable_image_sharing: bool,
    enable_file_sharing: bool,
    transport: Arc<dyn Transport>,
    clipboard: Arc<dyn ClipboardWriter>,
    file_access: Option<Arc<dyn FileAccess>>,
    notifier: Arc<dyn Notifier>,
    status_tx: watch::Sender<SyncStatus>,
    /// Id of the fragment train currently allowed to transmit. Sender tasks
    /// check it before every frame, so superseded trains stop mid-flight.
    transfer_tx: watch::Sender<Option<Uuid>>,
    commands_tx: mpsc::Sender<EngineCommand>,
    /// Latch so a flapping connection produces one loss notification, not one
    /// per failed retry.
    loss_notified: bool,
}

impl EngineActor {
    async fn run(
        mut self,
        mut commands_rx: mpsc::Receiver<EngineCommand>,
        mut transport_rx: mpsc::Receiver<TransportEvent>,
    ) {
        loop {
            tokio::select! {
                command = commands_rx.recv() => match command {
                    Some(EngineCommand::Start(reply)) => {
                        let result = self.transport.start().await;
                        if result.is_ok() {
                            self.state.status.phase = ConnectionPhase::Connecting;
                            self.publish();
                        }
                        let _ = reply.send(result);
                    }
                    Some(EngineCommand::Clipboard(event)) => self.on_clipboard(event).await,
                    Some(EngineCommand::Reconnect) => self.transport.reconnect().await,
                    Some(EngineCommand::SendProgress { transfer_id, sent, total }) => {
                        self.on_send_progress(transfer_id, sent, total);
                    }
                    Some(EngineCommand::SendFailed { transfer_id, error }) => {
                        if self.state.outbound_transfer == Some(transfer_id) {
                            warn!("fragment train {} failed: {}", transfer_id, error);
                            self.state.supersede_outbound();
                            self.state.status.last_error = Some(error);
                            self.publish();
                        }
                    }
                    Some(EngineCommand::Stop(ack)) => {
                        self.shutdown().await;
                        let _ = ack.send(());
                        return;
                    }
                    None => {
                        self.shutdown().await;
                        return;
                    }
                },
                Some(event) = transport_rx.recv() => self.on_transport(event).await,
            }
        }
    }

    fn publish(&self) {
        self.status_tx.send_replace(self.state.status.clone());
    }

    async fn shutdown(&mut self) {
        self.transport.stop().await;
        self.transfer_tx.send_replace(None);
        if self.state.files_staged {
            self.clipboard.clear_staged_files().await;
        }
        self.state.reset();
        self.publish();
        info!("sync session stopped");
    }

    // ---- outbound ----

    async fn on_clipboard(&mut self, event: ClipboardEvent) {
        match self.resolve_outbound(event).await {
            Ok(Some((payload, kind))) => self.send_payload(payload, kind).await,
            Ok(None) => {}
            Err(e) => self.record_rejection(e),
        }
    }

    /// Turn a clipboard event into the canonical payload string, or `None`
    /// when the event must be suppressed (echo, disabled kind, unreadable
    /// content).
    async fn resolve_outbound(
        &mut self,
        event: ClipboardEvent,
    ) -> Result<Option<(String, PayloadKind)>, SyncError> {
        match event {
            ClipboardEvent::Text(text) => Ok(Some((text, PayloadKind::Text))),

            ClipboardEvent::Image(bytes) => {
                if self.consume_image_echo() {
                    return Ok(None);
                }
                if !self.enable_image_sharing {
                    return Err(PolicyRejection::SharingDisabled {
                        kind: PayloadKind::Image,
                    }
                    .into());
                }
                Ok(Some((encode_image(&bytes), PayloadKind::Image)))
            }

            ClipboardEvent::ImageFile(uri) => {
                if self.consume_image_echo() {
                    return Ok(None);
                }
                if !self.enable_image_sharing {
                    return Err(PolicyRejection::SharingDisabled {
                        kind: PayloadKind::Image,
                    }
                    .into());
                }
                let Some(files) = &self.file_access else {
                    warn!("no file access collaborator, dropping image uri");
                    return Ok(None);
                };
                // Size-check from metadata before pulling the bytes in.
                match files.file_size(&uri).await {
                    Ok(size) => {
                        self.ceilings
                            .validate(size, PayloadKind::Image, Direction::Outbound)?
                    }
                    Err(e) => {
                        warn!("could not stat image {:?}: {}", uri, e);
                        return Ok(None);
                    }
                }
                match files.read_bytes(&uri).await {
                    Ok(bytes) => Ok(Some((encode_image(&bytes), PayloadKind::Image))),
                    Err(e) => {
                        warn!("could not read image {:?}: {}", uri, e);
                        Ok(None)
                    }
                }
            }

            ClipboardEvent::Files(uris) => {
                if !self.enable_file_sharing {
                    return Err(PolicyRejection::SharingDisabled {
                        kind: PayloadKind::Files,
                    }
                    .into());
                }
                let Some(files) = &self.file_access else {
                    warn!("no file access collaborator, dropping file set");
                    return Ok(None);
                };
                // Reject an oversized set from metadata alone, before any
                // file content is read.
                let mut combined = 0u64;
                for uri in &uris {
                    match files.file_size(uri).await {
                        Ok(size) => combined += size,
                        Err(e) => {
                            warn!("could not stat {:?}: {}", uri, e);
                            return Ok(None);
                        }
                    }
                }
                self.ceilings
                    .validate(combined, PayloadKind::Files, Direction::Outbound)?;
                let mut set = std::collections::BTreeMap::new();
                for uri in &uris {
                    let name = match files.display_name(uri).await {
                        Ok(name) => name,
                        Err(e) => {
                            warn!("could not resolve {:?}: {}", uri, e);
                            return Ok(None);
                        }
                    };
                    let bytes = match files.read_bytes(uri).await {
                        Ok(bytes) => bytes,
                        Err(e) => {
                            warn!("could not read {:?}: {}", uri, e);
                            return Ok(None);
                        }
                    };
                    set.insert(name, bytes);
                }
                if set.is_empty() {
                    return Ok(None);
                }
                Ok(Some((encode_files(&set), PayloadKind::Files)))
            }
        }
    }

    /// True when this image event is the OS echo of our own inbound write.
    fn consume_image_echo(&mut self) -> bool {
        if self.state.pending_image_echoes > 0 {
            self.state.pending_image_echoes -= 1;
            debug!(
                "suppressed image echo ({} outstanding)",
                self.state.pending_image_echoes
            );
            true
        } else {
            false
        }
    }

    async fn send_payload(&mut self, payload: String, kind: PayloadKind) {
        let raw_size = payload.len() as u64;
        if let Err(rejection) = self.ceilings.validate(raw_size, kind, Direction::Outbound) {
            self.record_rejection(rejection.into());
            return;
        }

        let fp = Fingerprint::of_str(&payload);
        if !self.state.dedup.check_and_mark(fp) {
            debug!("content already seen, not re-transmitting");
            return;
        }

        // Fresh local content makes any previously staged download stale.
        if self.state.files_staged {
            self.clipboard.clear_staged_files().await;
            self.state.files_staged = false;
        }

        // New content supersedes whatever train is still in flight.
        self.state.supersede_outbound();
        self.transfer_tx.send_replace(None);

        let wire_payload = match &self.key {
            Some(key) => match encrypt_to_payload(&payload, key) {
                Ok(sealed) => sealed,
                Err(e) => {
                    error!("encryption failed: {}", e);
                    self.state.status.last_error = Some(e.to_string());
                    self.publish();
                    return;
                }
            },
            None => payload,
        };

        match self.transport.max_frame_size() {
            Some(max) => {
                let transfer = fragment(wire_payload, kind, raw_size, max);
                let total = transfer.total_fragments();
                self.state.outbound_transfer = Some(transfer.id);
                self.state.status.sending = Some((0, total));
                self.state.status.last_error = None;
                self.transfer_tx.send_replace(Some(transfer.id));
                self.publish();
                self.spawn_fragment_sender(transfer);
            }
            None => {
                let message = SyncMessage::new(wire_payload, kind);
                if let Err(e) = self.transport.send(message).await {
                    warn!("send failed: {}", e);
                    self.state.status.last_error = Some(e.to_string());
                } else {
                    self.state.status.last_error = None;
                }
                self.publish();
            }
        }
    }

    fn spawn_fragment_sender(&self, transfer: OutboundTransfer) {
        let transport = self.transport.clone();
        let commands = self.commands_tx.clone();
        let current = self.transfer_tx.subscribe();
        tokio::spawn(async move {
            let id = transfer.id;
            let total = transfer.frames.len();
            for (index, frame) in transfer.frames.into_iter().enumerate() {
                if *current.borrow() != Some(id) {
                    debug!("train {} superseded after {} of {} frames", id, index, total);
                    return;
                }
                if let Err(e) = transport.send(frame).await {
                    let _ = commands
                        .send(EngineCommand::SendFailed {
                            transfer_id: id,
                            error: e.to_string(),
                        })
                        .await;
                    return;
                }
                let _ = commands
                    .send(EngineCommand::SendProgress {
                        transfer_id: id,
                        sent: index + 1,
                        total,
                    })
                    .await;
            }
        });
    }

    fn on_send_progress(&mut self, transfer_id: Uuid, sent: usize, total: usize) {
        if self.state.outbound_transfer != Some(transfer_id) {
            return; // superseded train, stale progress
        }
        if sent == total {
            info!("transfer {} sent ({} fragments)", transfer_id, total);
            self.state.outbound_transfer = None;
            self.state.status.sending = None;
            self.transfer_tx.send_replace(None);
        } else {
            self.state.status.sending = Some((sent, total));
        }
        self.publish();
    }

    // ---- inbound ----

    async fn on_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { restored } => {
                self.state.status.phase = ConnectionPhase::Connected;
                self.state.status.last_error = None;
                self.publish();
                if restored {
                    info!("connection restored");
                    self.notifier.notify("Clipboard sync", "Connection restored");
                }
                self.loss_notified = false;
            }
            TransportEvent::Subscribed => {
                if self.state.status.phase != ConnectionPhase::Subscribed {
                    self.state.status.phase = ConnectionPhase::Subscribed;
                    self.publish();
                }
            }
            TransportEvent::PeerCountChanged(count) => {
                self.state.status.live_peers = count;
                self.publish();
            }
            TransportEvent::ConnectionLost => {
                self.state.status.phase = ConnectionPhase::Reconnecting;
                self.publish();
                if !self.loss_notified {
                    self.loss_notified = true;
                    self.notifier
                        .notify("Clipboard sync", "Connection lost, reconnecting");
                }
            }
            TransportEvent::Fatal(reason) => {
                error!("transport failure: {}", reason);
                self.state.status.phase = ConnectionPhase::Stopped;
                self.state.status.last_error = Some(reason.clone());
                self.publish();
                self.notifier.notify("Clipboard sync", &reason);
            }
            TransportEvent::Frame(message) => self.on_frame(message).await,
        }
    }

    async fn on_frame(&mut self, message: SyncMessage) {
        let message = match self.state.reassembler.accept(message, &self.ceilings) {
            Ok(ReassemblyOutcome::Complete(message)) => {
                if self.state.status.receiving.take().is_some() {
                    self.publish();
                }
                message
            }
            Ok(ReassemblyOutcome::Buffered { received, total }) => {
                self.state.status.receiving = Some((received, total));
                self.publish();
                return;
            }
            Err(e) => {
                self.state.status.receiving = None;
                self.record_rejection(e);
                return;
            }
        };

        let payload = match &self.key {
            Some(key) => match decrypt_payload(&message.payload, key) {
                Ok(plain) => plain,
                Err(e) => {
                    self.record_rejection(e.into());
                    return;
                }
            },
            None => message.payload,
        };

        let fp = Fingerprint::of_str(&payload);
        if !self.state.dedup.check_and_mark(fp) {
            debug!("inbound content already seen, ignoring");
            return;
        }

        if let Err(rejection) =
            self.ceilings
                .validate(payload.len() as u64, message.kind, Direction::Inbound)
        {
            self.record_rejection(rejection.into());
            return;
        }

        self.deliver(payload, message.kind).await;
    }

    async fn deliver(&mut self, payload: String, kind: PayloadKind) {
        // Newer content in either direction obsoletes a staged download.
        if kind != PayloadKind::Files && self.state.files_staged {
            self.clipboard.clear_staged_files().await;
            self.state.files_staged = false;
        }

        match kind {
            PayloadKind::Text => {
                if let Err(e) = self.clipboard.write_text(&payload).await {
                    error!("clipboard text write failed: {}", e);
                    self.state.status.last_error = Some(e.to_string());
                    self.publish();
                }
            }
            PayloadKind::Image => {
                if !self.enable_image_sharing {
                    debug!("image sharing disabled, dropping inbound image");
                    return;
                }
                let bytes = match decode_image(&payload) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        self.record_rejection(e.into());
                        return;
                    }
                };
                // The OS will fire a change event for this write; expect and
                // swallow exactly one echo.
                self.state.pending_image_echoes += 1;
                if let Err(e) = self.clipboard.write_image(bytes).await {
                    self.state.pending_image_echoes -= 1;
                    error!("clipboard image write failed: {}", e);
                    self.state.status.last_error = Some(e.to_string());
                    self.publish();
                }
            }
            PayloadKind::Files => {
                if !self.enable_file_sharing {
                    debug!("file sharing disabled, dropping inbound file set");
                    return;
                }
                let files = match decode_files(&payload) {
                    Ok(files) => files,
                    Err(e) => {
                        self.record_rejection(e.into());
                        return;
                    }
                };
                info!("staging {} inbound file(s) for download", files.len());
                match self.clipboard.stage_files_for_download(files).await {
                    Ok(()) => self.state.files_staged = true,
                    Err(e) => {
                        error!("staging files failed: {}", e);
                        self.state.status.last_error = Some(e.to_string());
                        self.publish();
                    }
                }
            }
        }
    }

    /// Record an expected rejection or recoverable error as status text.
    fn record_rejection(&mut self, error: SyncError) {
        match &error {
            SyncError::PolicyRejection(rejection) => info!("{}", rejection),
            other => warn!("{}", other),
        }
        self.state.status.last_error = Some(error.to_string());
        self.publish();
    }
}
