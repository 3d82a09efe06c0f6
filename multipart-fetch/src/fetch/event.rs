//! Events exchanged between a fetch manager and its spawned requests.

use std::collections::HashMap;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::error::FetchResult;
use crate::transport::FileHash;

/// Expected segment hashes keyed by hash-aligned offset.
pub type PartHashes = HashMap<u64, Bytes>;

/// Reply channel for a pending hash lookup.
pub(crate) type HashReply = oneshot::Sender<FetchResult<PartHashes>>;

/// Sender half of a manager's event queue.
pub(crate) type EventSender = mpsc::UnboundedSender<ManagerEvent>;

/// Results of asynchronous work, delivered back onto the manager task.
#[derive(Debug)]
pub(crate) enum ManagerEvent {
    /// A chunk request settled.
    ChunkCompleted {
        offset: u64,
        result: FetchResult<Bytes>,
    },

    /// A CDN hash fetch returned. Transport errors arrive as an empty batch.
    HashesFetched {
        request_offset: u64,
        hashes: Vec<FileHash>,
    },

    /// The master finished (or failed) re-uploading the file to the CDN.
    ReuploadCompleted,
}
