//! External collaborator seams.
//!
//! The engine never touches the OS clipboard, the filesystem or the
//! notification system directly; the embedding application provides these
//! capabilities behind the traits here.

pub mod transport;

pub use transport::{Transport, TransportEvent};

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::BTreeMap;

/// A clipboard change observed by the platform-side monitor.
///
/// Images may arrive as raw bytes or as a URI; file sets always arrive as
/// URIs and are resolved through [`FileAccess`].
#[derive(Debug, Clone)]
pub enum ClipboardEvent {
    Text(String),
    Image(Bytes),
    ImageFile(String),
    Files(Vec<String>),
}

/// Writes inbound content back to the platform clipboard.
#[async_trait]
pub trait ClipboardWriter: Send + Sync {
    async fn write_text(&self, text: &str) -> Result<()>;

    async fn write_image(&self, image: Bytes) -> Result<()>;

    /// Inbound files are staged in memory for a user-initiated save, never
    /// written to the clipboard directly.
    async fn stage_files_for_download(&self, files: BTreeMap<String, Bytes>) -> Result<()>;

    /// Drop any previously staged files. Called whenever newer content
    /// (either direction) makes them stale.
    async fn clear_staged_files(&self);
}

/// Resolves content URIs handed over by the clipboard monitor.
#[async_trait]
pub trait FileAccess: Send + Sync {
    async fn read_bytes(&self, uri: &str) -> Result<Bytes>;

    async fn file_size(&self, uri: &str) -> Result<u64>;

    async fn display_name(&self, uri: &str) -> Result<String>;
}

/// User-visible notifications (connection lost/restored).
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, message: &str);
}

/// Default notifier that only logs.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, title: &str, message: &str) {
        log::info!("{}: {}", title, message);
    }
}
