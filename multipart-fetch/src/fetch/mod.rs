//! Parallel, range-driven fetching of a single remote resource.
//!
//! A fetch is started with [`multipart_fetch`] and driven by a `watch` channel
//! of desired byte ranges. Data comes back as [`FetchEvent`]s on an unbounded
//! channel; the returned [`FetchHandle`] cancels everything when dropped.
//!
//! # Architecture
//!
//! ```text
//!                         ┌─────────────────────────────┐
//!   watch<RangeSet> ────► │        FetchManager         │ ────► FetchEvent
//!                         │  (one task, owns all state) │
//!                         └──────┬──────────────▲───────┘
//!                        request │              │ ManagerEvent
//!                                ▼              │
//!                ┌──────────────────────────────┴─────┐
//!                │ FetchSource                        │
//!                │   Master ── get_file/get_web_file  │
//!                │   Cdn ───── get_cdn_file           │
//!                │     └ CdnHashSource ── hashes via  │
//!                │                        master      │
//!                └────────────────────────────────────┘
//! ```
//!
//! # Delivery rules
//!
//! - Parts never overlap and never contain bytes outside the resource.
//! - While the outstanding work is one contiguous range, parts are released in
//!   increasing offset order. A chunk waits while any needed byte below it is
//!   missing, including after a failed request for that byte.
//! - `ResourceSizeUpdated` is sent at most once and is the last event.
//! - Encrypted fetches begin with a `Reset` event and always fetch from
//!   offset 0 up to the end of the desired ranges.
//! - Dropping the event receiver cancels the fetch.

mod event;
mod hash_source;
mod manager;
mod source;
mod wrapper;

pub use event::PartHashes;
pub use source::MasterLocation;
pub use wrapper::DownloadWrapper;

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::FetchConfig;
use crate::crypto::SecretFileEncryptionKey;
use crate::ranges::RangeSet;
use crate::transport::DownloadProvider;

/// What to fetch.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Where the resource lives on its master datacenter.
    pub location: MasterLocation,
    /// Total size if known in advance. Enables parallel chunk requests.
    pub size: Option<u64>,
    /// Key for end-to-end encrypted payloads.
    pub encryption_key: Option<SecretFileEncryptionKey>,
    /// Plaintext size of an encrypted payload, reported instead of the
    /// transport size.
    pub decrypted_size: Option<u64>,
}

impl FetchRequest {
    /// Create a request of unknown size.
    pub fn new(location: MasterLocation) -> Self {
        Self {
            location,
            size: None,
            encryption_key: None,
            decrypted_size: None,
        }
    }

    /// Set the known total size.
    pub fn with_size(mut self, size: Option<u64>) -> Self {
        self.size = size;
        self
    }

    /// Decrypt released chunks with `key`.
    pub fn with_encryption(
        mut self,
        key: SecretFileEncryptionKey,
        decrypted_size: Option<u64>,
    ) -> Self {
        self.encryption_key = Some(key);
        self.decrypted_size = decrypted_size;
        self
    }
}

/// Output of a multipart fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchEvent {
    /// Discard anything received earlier.
    Reset,
    /// Bytes of the resource starting at `offset`.
    DataPart { offset: u64, data: Bytes },
    /// The final size of the resource.
    ResourceSizeUpdated(u64),
}

/// Handle to a running fetch. Dropping it cancels the fetch.
#[derive(Debug)]
pub struct FetchHandle {
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl FetchHandle {
    /// Stop the fetch. No events follow once the manager observes this.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns true once the manager task has exited.
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the manager task to exit.
    pub async fn finished(&mut self) {
        if let Some(task) = self.task.as_mut() {
            let _ = task.await;
        }
        self.task = None;
    }
}

impl Drop for FetchHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Start fetching `request`, driven by the desired ranges in `ranges`.
///
/// Must be called from within a Tokio runtime. The fetch stops after
/// reporting the final size, when the handle is cancelled or dropped, when the
/// event receiver is dropped, or once the range channel is closed and every
/// desired byte has been delivered.
pub fn multipart_fetch(
    request: FetchRequest,
    ranges: watch::Receiver<RangeSet>,
    provider: Arc<dyn DownloadProvider>,
    config: FetchConfig,
) -> (FetchHandle, mpsc::UnboundedReceiver<FetchEvent>) {
    let (output, events) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    let task = manager::spawn(request, ranges, provider, config, output, cancel.clone());
    (
        FetchHandle {
            cancel,
            task: Some(task),
        },
        events,
    )
}
