//! Segment hash cache for CDN downloads.
//!
//! CDN payloads are verified against SHA-256 hashes served by the master
//! datacenter, one per [`HASH_SEGMENT_LENGTH`] segment. Hashes arrive in
//! batches starting at a given offset, so the source tracks the contiguous
//! coverage it has (`known_upper_bound`) and the furthest coverage any waiting
//! chunk needs (`requested_upper_bound`), and keeps at most one batch request
//! in flight:
//!
//! ```text
//!   known_upper_bound        requested_upper_bound
//!          |                          |
//! [cached..)[ fetch @known ) [ next  )|
//!           '-- one in flight at a time, chained until the request is met
//! ```
//!
//! All methods run on the manager task. Batch results come back through the
//! manager's event queue as `HashesFetched`.

use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::event::{EventSender, HashReply, ManagerEvent, PartHashes};
use super::wrapper::DownloadWrapper;
use crate::config::HASH_SEGMENT_LENGTH;
use crate::transport::FileHash;

struct HashWaiter {
    offset: u64,
    limit: u64,
    reply: HashReply,
}

impl HashWaiter {
    fn end(&self) -> u64 {
        self.offset.saturating_add(self.limit)
    }
}

struct PendingHashFetch {
    offset: u64,
    cancel: CancellationToken,
}

/// Lazily populated hash cache shared by all chunks of one CDN download.
pub(crate) struct CdnHashSource {
    file_token: Bytes,
    master: Arc<DownloadWrapper>,
    events: EventSender,
    cancel: CancellationToken,
    hashes: PartHashes,
    known_upper_bound: u64,
    requested_upper_bound: Option<u64>,
    pending: Option<PendingHashFetch>,
    waiters: Vec<HashWaiter>,
}

impl CdnHashSource {
    /// Create a source seeded with the hashes carried by the redirect.
    pub fn new(
        file_token: Bytes,
        initial: &[FileHash],
        master: Arc<DownloadWrapper>,
        events: EventSender,
        cancel: CancellationToken,
    ) -> Self {
        let mut source = Self {
            file_token,
            master,
            events,
            cancel,
            hashes: PartHashes::new(),
            known_upper_bound: 0,
            requested_upper_bound: None,
            pending: None,
            waiters: Vec::new(),
        };

        let mut seeded: Vec<&FileHash> = initial.iter().collect();
        seeded.sort_by_key(|h| h.offset);
        for hash in seeded {
            let Some((offset, end)) = hash_span(hash) else {
                continue;
            };
            source.hashes.insert(offset, hash.hash.clone());
            // Only a run starting at zero counts as known coverage.
            if offset <= source.known_upper_bound {
                source.known_upper_bound = source.known_upper_bound.max(end);
            }
        }
        debug!(
            seeded = source.hashes.len(),
            known_upper_bound = source.known_upper_bound,
            "Hash source created"
        );
        source
    }

    /// Offset up to which hashes are known to be contiguous.
    pub fn known_upper_bound(&self) -> u64 {
        self.known_upper_bound
    }

    /// Returns true while a hash batch is being fetched.
    pub fn is_fetching(&self) -> bool {
        self.pending.is_some()
    }

    /// Deliver the hashes for `[offset, offset + limit)` through `reply`.
    ///
    /// Answers immediately from the cache when possible, otherwise waits for
    /// batch fetches to cover the range.
    pub fn get(&mut self, offset: u64, limit: u64, reply: HashReply) {
        if let Some(found) = self.lookup(offset, limit) {
            trace!(offset, limit, "Hash cache hit");
            let _ = reply.send(Ok(found));
            return;
        }

        let waiter = HashWaiter {
            offset,
            limit,
            reply,
        };
        if waiter.end() <= self.known_upper_bound {
            // Covered but with holes; more fetching will not fill them.
            let partial = self.collect(offset, limit);
            let _ = waiter.reply.send(Ok(partial));
            return;
        }

        let end = waiter.end();
        self.waiters.push(waiter);
        self.requested_upper_bound = Some(self.requested_upper_bound.map_or(end, |b| b.max(end)));

        if self.pending.is_none() {
            self.request_more();
        }
    }

    /// Merge a fetched batch and wake any waiters it satisfies.
    pub fn on_fetched(&mut self, request_offset: u64, batch: Vec<FileHash>) {
        match &self.pending {
            Some(pending) if pending.offset == request_offset => {}
            _ => {
                debug!(request_offset, "Ignoring stale hash batch");
                return;
            }
        }
        self.pending = None;

        let mut added = 0usize;
        for hash in &batch {
            let Some((offset, end)) = hash_span(hash) else {
                continue;
            };
            if self.hashes.insert(offset, hash.hash.clone()).is_none() {
                added += 1;
            }
            self.known_upper_bound = self.known_upper_bound.max(end);
        }
        let exhausted = added == 0;
        trace!(
            request_offset,
            added,
            known_upper_bound = self.known_upper_bound,
            "Hash batch merged"
        );

        let waiters = std::mem::take(&mut self.waiters);
        for waiter in waiters {
            if waiter.reply.is_closed() {
                continue;
            }
            if let Some(found) = self.lookup(waiter.offset, waiter.limit) {
                let _ = waiter.reply.send(Ok(found));
            } else if exhausted || waiter.end() <= self.known_upper_bound {
                // Hand over what exists; verification decides if it suffices.
                let partial = self.collect(waiter.offset, waiter.limit);
                let _ = waiter.reply.send(Ok(partial));
            } else {
                self.waiters.push(waiter);
            }
        }

        if exhausted {
            debug!(request_offset, "Hash batch added nothing, releasing waiters");
        }

        self.requested_upper_bound = self.waiters.iter().map(HashWaiter::end).max();
        if self
            .requested_upper_bound
            .is_some_and(|bound| bound > self.known_upper_bound)
        {
            self.request_more();
        }
    }

    /// Every segment hash for the range, or `None` if any is missing.
    fn lookup(&self, offset: u64, limit: u64) -> Option<PartHashes> {
        let mut found = PartHashes::new();
        for segment in segment_offsets(offset, limit) {
            let hash = self.hashes.get(&segment)?;
            found.insert(segment, hash.clone());
        }
        Some(found)
    }

    /// The segment hashes present for the range.
    fn collect(&self, offset: u64, limit: u64) -> PartHashes {
        segment_offsets(offset, limit)
            .filter_map(|segment| self.hashes.get(&segment).map(|h| (segment, h.clone())))
            .collect()
    }

    fn request_more(&mut self) {
        let offset = self.known_upper_bound;
        let cancel = self.cancel.child_token();
        let task_cancel = cancel.clone();
        let master = self.master.get();
        let file_token = self.file_token.clone();
        let events = self.events.clone();

        debug!(offset, "Fetching CDN hashes");
        tokio::spawn(async move {
            let fetch = async move {
                let download = master.await;
                match download.get_cdn_file_hashes(&file_token, offset as i64).await {
                    Ok(hashes) => hashes,
                    Err(e) => {
                        debug!(offset, error = %e, "CDN hash fetch failed");
                        Vec::new()
                    }
                }
            };
            tokio::select! {
                _ = task_cancel.cancelled() => {}
                hashes = fetch => {
                    let _ = events.send(ManagerEvent::HashesFetched {
                        request_offset: offset,
                        hashes,
                    });
                }
            }
        });

        self.pending = Some(PendingHashFetch { offset, cancel });
    }
}

impl Drop for CdnHashSource {
    fn drop(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.cancel.cancel();
        }
    }
}

fn hash_span(hash: &FileHash) -> Option<(u64, u64)> {
    let offset = u64::try_from(hash.offset).ok()?;
    let limit = u64::try_from(hash.limit).unwrap_or(0);
    Some((offset, offset.saturating_add(limit)))
}

fn segment_offsets(offset: u64, limit: u64) -> impl Iterator<Item = u64> {
    let end = offset.saturating_add(limit);
    (offset..end).step_by(HASH_SEGMENT_LENGTH as usize)
}
