//! Shared test collaborators: in-memory clipboard, file access and transport.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};

use clipcascade_sync::error::SyncError;
use clipcascade_sync::interface::{ClipboardWriter, FileAccess, Transport, TransportEvent};
use clipcascade_sync::message::SyncMessage;
use clipcascade_sync::SyncStatus;

/// Opt-in test logging via RUST_LOG.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[derive(Debug, Clone, PartialEq)]
pub enum ClipboardOp {
    Text(String),
    Image(Bytes),
    Staged(Vec<String>),
    Cleared,
}

pub struct MockClipboard {
    ops: mpsc::UnboundedSender<ClipboardOp>,
}

impl MockClipboard {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<ClipboardOp>) {
        let (ops, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { ops }), rx)
    }
}

#[async_trait]
impl ClipboardWriter for MockClipboard {
    async fn write_text(&self, text: &str) -> anyhow::Result<()> {
        let _ = self.ops.send(ClipboardOp::Text(text.to_string()));
        Ok(())
    }

    async fn write_image(&self, image: Bytes) -> anyhow::Result<()> {
        let _ = self.ops.send(ClipboardOp::Image(image));
        Ok(())
    }

    async fn stage_files_for_download(&self, files: BTreeMap<String, Bytes>) -> anyhow::Result<()> {
        let _ = self
            .ops
            .send(ClipboardOp::Staged(files.keys().cloned().collect()));
        Ok(())
    }

    async fn clear_staged_files(&self) {
        let _ = self.ops.send(ClipboardOp::Cleared);
    }
}

pub struct MockFileAccess {
    pub files: BTreeMap<String, (String, Bytes)>,
    pub reads: AtomicUsize,
}

impl MockFileAccess {
    pub fn new(files: BTreeMap<String, (String, Bytes)>) -> Self {
        Self {
            files,
            reads: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl FileAccess for MockFileAccess {
    async fn read_bytes(&self, uri: &str) -> anyhow::Result<Bytes> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        self.files
            .get(uri)
            .map(|(_, bytes)| bytes.clone())
            .ok_or_else(|| anyhow::anyhow!("no such file {:?}", uri))
    }

    async fn file_size(&self, uri: &str) -> anyhow::Result<u64> {
        self.files
            .get(uri)
            .map(|(_, bytes)| bytes.len() as u64)
            .ok_or_else(|| anyhow::anyhow!("no such file {:?}", uri))
    }

    async fn display_name(&self, uri: &str) -> anyhow::Result<String> {
        self.files
            .get(uri)
            .map(|(name, _)| name.clone())
            .ok_or_else(|| anyhow::anyhow!("no such file {:?}", uri))
    }
}

/// Transport double: every accepted frame lands on an unbounded channel. An
/// optional semaphore gate lets tests hold frames mid-train.
pub struct MockTransport {
    sent: mpsc::UnboundedSender<SyncMessage>,
    max_frame: Option<usize>,
    gate: Option<Arc<Semaphore>>,
}

impl MockTransport {
    pub fn new(max_frame: Option<usize>) -> (Arc<Self>, mpsc::UnboundedReceiver<SyncMessage>) {
        let (sent, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                sent,
                max_frame,
                gate: None,
            }),
            rx,
        )
    }

    pub fn gated(
        max_frame: Option<usize>,
        gate: Arc<Semaphore>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<SyncMessage>) {
        let (sent, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                sent,
                max_frame,
                gate: Some(gate),
            }),
            rx,
        )
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn start(&self) -> Result<(), SyncError> {
        Ok(())
    }

    async fn send(&self, frame: SyncMessage) -> Result<(), SyncError> {
        if let Some(gate) = &self.gate {
            gate.acquire().await.expect("gate closed").forget();
        }
        let _ = self.sent.send(frame);
        Ok(())
    }

    fn max_frame_size(&self) -> Option<usize> {
        self.max_frame
    }

    async fn reconnect(&self) {}

    async fn stop(&self) {}
}

/// Await the next frame, panicking after one second.
pub async fn next_sent(rx: &mut mpsc::UnboundedReceiver<SyncMessage>) -> SyncMessage {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("no frame within 1s")
        .expect("transport channel closed")
}

/// Assert nothing is sent for a little while.
pub async fn assert_no_send(rx: &mut mpsc::UnboundedReceiver<SyncMessage>) {
    assert!(
        tokio::time::timeout(Duration::from_millis(150), rx.recv())
            .await
            .is_err(),
        "unexpected frame was sent"
    );
}

pub async fn next_op(rx: &mut mpsc::UnboundedReceiver<ClipboardOp>) -> ClipboardOp {
    tokio::time::timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("no clipboard op within 1s")
        .expect("clipboard channel closed")
}

pub async fn assert_no_op(rx: &mut mpsc::UnboundedReceiver<ClipboardOp>) {
    assert!(
        tokio::time::timeout(Duration::from_millis(150), rx.recv())
            .await
            .is_err(),
        "unexpected clipboard write"
    );
}

/// Wait until the published status satisfies the predicate.
pub async fn wait_for_status<F>(rx: &mut watch::Receiver<SyncStatus>, mut pred: F) -> SyncStatus
where
    F: FnMut(&SyncStatus) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    loop {
        {
            let status = rx.borrow();
            if pred(&status) {
                return status.clone();
            }
        }
        let remaining = deadline
            .checked_duration_since(tokio::time::Instant::now())
            .expect("status predicate never satisfied");
        tokio::time::timeout(remaining, rx.changed())
            .await
            .expect("status predicate never satisfied")
            .expect("status channel closed");
    }
}
