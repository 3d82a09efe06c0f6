//! The per-fetch actor that schedules, collects and releases chunks.
//!
//! A manager owns every piece of mutable fetch state and runs on a single
//! task. Chunk requests, hash batches and re-uploads execute as spawned
//! futures that report back through an unbounded event queue, so state is only
//! ever touched between `select!` iterations:
//!
//! ```text
//!   ranges (watch) ──┐
//!   cancel token ────┼──► select! ──► check_state ──► spawn chunk ──┐
//!   events (mpsc) ───┘        ▲                                      │
//!                             └──────────── ChunkCompleted ◄─────────┘
//! ```
//!
//! Every state change ends in [`FetchManager::check_state`], which releases
//! finished chunks, detects completion and tops up in-flight requests.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::event::{EventSender, ManagerEvent};
use super::source::{CdnSource, FetchSource};
use super::wrapper::DownloadWrapper;
use super::{FetchEvent, FetchRequest};
use crate::config::FetchConfig;
use crate::crypto::DecryptionState;
use crate::error::{FetchError, FetchResult};
use crate::ranges::{plan_chunk, ChunkPlan, RangeSet};
use crate::transport::{CdnRedirect, DownloadProvider};

struct InFlightChunk {
    len: u64,
    cancel: CancellationToken,
}

/// Spawn a manager for `request` on the current runtime.
pub(crate) fn spawn(
    request: FetchRequest,
    ranges: watch::Receiver<RangeSet>,
    provider: Arc<dyn DownloadProvider>,
    config: FetchConfig,
    output: mpsc::UnboundedSender<FetchEvent>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let manager = FetchManager::new(request, provider, config, output, events_tx, cancel);
    tokio::spawn(manager.run(ranges, events_rx))
}

pub(crate) struct FetchManager {
    config: FetchConfig,
    parallel_parts: usize,
    provider: Arc<dyn DownloadProvider>,
    source: FetchSource,
    state: DecryptionState,

    current_ranges: Option<RangeSet>,
    filled: RangeSet,
    complete_size: Option<u64>,
    complete_size_reported: bool,

    fetching: BTreeMap<u64, InFlightChunk>,
    fetched: BTreeMap<u64, Bytes>,
    reuploading: bool,

    cancel: CancellationToken,
    events: EventSender,
    output: mpsc::UnboundedSender<FetchEvent>,
}

impl FetchManager {
    fn new(
        request: FetchRequest,
        provider: Arc<dyn DownloadProvider>,
        config: FetchConfig,
        output: mpsc::UnboundedSender<FetchEvent>,
        events: EventSender,
        cancel: CancellationToken,
    ) -> Self {
        let download = Arc::new(DownloadWrapper::new(
            request.location.datacenter_id(),
            false,
            Arc::clone(&provider),
        ));
        let state = DecryptionState::new(request.encryption_key.as_ref(), request.decrypted_size);

        Self {
            parallel_parts: config.parallel_parts(request.size),
            config,
            provider,
            source: FetchSource::Master {
                location: request.location,
                download,
            },
            state,
            current_ranges: None,
            filled: RangeSet::new(),
            complete_size: request.size,
            complete_size_reported: false,
            fetching: BTreeMap::new(),
            fetched: BTreeMap::new(),
            reuploading: false,
            cancel,
            events,
            output,
        }
    }

    async fn run(
        mut self,
        mut ranges: watch::Receiver<RangeSet>,
        mut events: mpsc::UnboundedReceiver<ManagerEvent>,
    ) {
        info!(
            size = ?self.complete_size,
            parallel_parts = self.parallel_parts,
            encrypted = self.state.is_encrypted(),
            "Multipart fetch started"
        );

        if self.state.is_encrypted() {
            self.emit(FetchEvent::Reset);
        }

        let cancel = self.cancel.clone();
        let initial = ranges.borrow_and_update().clone();
        self.update_ranges(initial);

        let mut ranges_open = true;
        while !self.complete_size_reported && (ranges_open || !self.is_settled()) {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!("Multipart fetch cancelled");
                    break;
                }

                changed = ranges.changed(), if ranges_open => {
                    match changed {
                        Ok(()) => {
                            let desired = ranges.borrow_and_update().clone();
                            self.update_ranges(desired);
                        }
                        // The last desired set stays in effect.
                        Err(_) => ranges_open = false,
                    }
                }

                Some(event) = events.recv() => {
                    self.handle_event(event);
                }
            }
        }

        self.shutdown();
    }

    /// Nothing in flight and every desired byte delivered.
    fn is_settled(&self) -> bool {
        self.fetching.is_empty()
            && !self.reuploading
            && self
                .current_ranges
                .as_ref()
                .map_or(true, |desired| desired.difference(&self.filled).is_empty())
    }

    fn update_ranges(&mut self, desired: RangeSet) {
        let desired = self.widen_for_decryption(desired);
        let desired = match self.current_ranges {
            Some(_) => desired.difference(&self.filled),
            None => desired,
        };
        debug!(ranges = ?desired, "Desired ranges updated");
        self.current_ranges = Some(desired);
        self.check_state();
    }

    /// The running decryption only advances from offset 0, so an encrypted
    /// fetch wants every byte below the end of its desired set.
    fn widen_for_decryption(&self, desired: RangeSet) -> RangeSet {
        if !self.state.is_encrypted() {
            return desired;
        }
        match desired.ranges().last() {
            Some(last) => RangeSet::from(0..last.end),
            None => desired,
        }
    }

    /// Forward `event` to the consumer. A dropped receiver cancels the fetch.
    fn emit(&mut self, event: FetchEvent) -> bool {
        if self.output.send(event).is_ok() {
            return true;
        }
        if !self.cancel.is_cancelled() {
            debug!("Consumer dropped, cancelling multipart fetch");
            self.cancel.cancel();
        }
        false
    }

    fn handle_event(&mut self, event: ManagerEvent) {
        match event {
            ManagerEvent::ChunkCompleted { offset, result } => {
                self.on_chunk_completed(offset, result);
            }
            ManagerEvent::HashesFetched {
                request_offset,
                hashes,
            } => {
                if let FetchSource::Cdn(cdn) = &mut self.source {
                    cdn.hash_source.on_fetched(request_offset, hashes);
                    trace!(
                        known_upper_bound = cdn.hash_source.known_upper_bound(),
                        fetching = cdn.hash_source.is_fetching(),
                        "CDN hash state"
                    );
                }
            }
            ManagerEvent::ReuploadCompleted => {
                debug!("CDN re-upload finished");
                self.reuploading = false;
                self.check_state();
            }
        }
    }

    fn on_chunk_completed(&mut self, offset: u64, result: FetchResult<Bytes>) {
        let Some(chunk) = self.fetching.remove(&offset) else {
            debug!(offset, "Ignoring result for unknown chunk");
            return;
        };

        match result {
            Ok(data) => {
                let len = data.len() as u64;
                if len < chunk.len {
                    let size = offset + len;
                    let narrowed = self.complete_size.map_or(size, |known| known.min(size));
                    debug!(offset, len, size = narrowed, "Short chunk, resource size found");
                    self.complete_size = Some(narrowed);
                }
                self.fetched.insert(offset, data);
            }
            Err(FetchError::SwitchToCdn(redirect)) => self.switch_to_cdn(redirect),
            Err(FetchError::ReuploadToCdn { request_token, .. }) => {
                self.start_reupload(request_token)
            }
            Err(e) => {
                warn!(offset, error = %e, "Chunk failed, will retry");
            }
        }

        self.check_state();
    }

    fn switch_to_cdn(&mut self, redirect: CdnRedirect) {
        let FetchSource::Master { location, download } = &self.source else {
            debug!("Ignoring CDN redirect, not on master");
            return;
        };
        info!(
            master_datacenter_id = download.datacenter_id(),
            datacenter_id = redirect.datacenter_id,
            "Switching multipart fetch to CDN"
        );
        let cdn = CdnSource::from_redirect(
            location.datacenter_id(),
            redirect,
            Arc::clone(download),
            Arc::clone(&self.provider),
            self.events.clone(),
            self.cancel.child_token(),
        );
        self.source = FetchSource::Cdn(Box::new(cdn));
    }

    fn start_reupload(&mut self, request_token: Bytes) {
        let FetchSource::Cdn(cdn) = &self.source else {
            debug!("Ignoring re-upload request, not on CDN");
            return;
        };
        if self.reuploading {
            debug!("Re-upload already in progress");
            return;
        }
        self.reuploading = true;

        info!(
            master_datacenter_id = cdn.master_datacenter_id,
            "Requesting CDN re-upload"
        );
        let master = cdn.master_download.get();
        let file_token = cdn.file_token.clone();
        let events = self.events.clone();
        let cancel = self.cancel.child_token();

        tokio::spawn(async move {
            let reupload = async move {
                let download = master.await;
                if let Err(e) = download.reupload_cdn_file(&file_token, &request_token).await {
                    debug!(error = %e, "CDN re-upload failed");
                }
            };
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = reupload => {
                    let _ = events.send(ManagerEvent::ReuploadCompleted);
                }
            }
        });
    }

    /// Release ready chunks, detect completion and issue new requests.
    fn check_state(&mut self) {
        let Some(current) = self.current_ranges.as_ref() else {
            return;
        };
        let mut to_fetch = current.difference(&self.filled);
        let single_range = to_fetch.range_count() == 1;

        self.release_fetched(&mut to_fetch, single_range);
        if self.cancel.is_cancelled() {
            return;
        }

        for (&offset, chunk) in &self.fetching {
            to_fetch.remove(offset..offset + chunk.len);
        }

        if let Some(complete_size) = self.complete_size {
            self.filled.insert(complete_size..u64::MAX);
            to_fetch.remove(complete_size..u64::MAX);

            if to_fetch.is_empty() && self.fetching.is_empty() && !self.complete_size_reported {
                self.complete_size_reported = true;
                let size = self.state.decrypted_size().unwrap_or(complete_size);
                info!(size, "Multipart fetch complete");
                self.emit(FetchEvent::ResourceSizeUpdated(size));
                return;
            }
        }

        while self.fetching.len() < self.parallel_parts && !self.reuploading {
            let Some(plan) = self.next_chunk(&mut to_fetch) else {
                break;
            };
            to_fetch.remove(plan.download.clone());
            self.issue_chunk(plan);
        }
    }

    fn release_fetched(&mut self, to_fetch: &mut RangeSet, single_range: bool) {
        let offsets: Vec<u64> = self.fetched.keys().copied().collect();
        for offset in offsets {
            let Some(len) = self.fetched.get(&offset).map(|d| d.len() as u64) else {
                continue;
            };
            let part = offset..offset + len;
            to_fetch.remove(part.clone());

            // One contiguous range is delivered in order, and decryption
            // only accepts the chunk at its cursor.
            let gap_below = to_fetch.first().is_some_and(|r| r.start < offset)
                || self.fetching.range(..offset).next().is_some();
            if single_range && gap_below {
                trace!(offset, "Holding chunk until lower bytes arrive");
                continue;
            }
            if self.state.is_encrypted() && offset > self.state.current_size() {
                trace!(offset, cursor = self.state.current_size(), "Holding encrypted chunk");
                continue;
            }
            let Some(data) = self.fetched.remove(&offset) else {
                continue;
            };

            let fresh = RangeSet::from(part.clone()).difference(&self.filled);
            self.filled.insert(part);
            let data = self.state.transform(offset, data);
            let data_end = offset + data.len() as u64;

            for range in fresh.ranges() {
                let end = range.end.min(data_end);
                if range.start >= end {
                    continue;
                }
                let slice = data.slice((range.start - offset) as usize..(end - offset) as usize);
                debug!(offset = range.start, len = slice.len(), "Releasing part");
                let delivered = self.emit(FetchEvent::DataPart {
                    offset: range.start,
                    data: slice,
                });
                if !delivered {
                    return;
                }
            }
        }
    }

    /// Plan the lowest uncovered chunk that does not overlap outstanding work.
    fn next_chunk(&self, to_fetch: &mut RangeSet) -> Option<ChunkPlan> {
        while let Some(range) = to_fetch.first() {
            let plan = plan_chunk(range, &self.config)?;
            if self.is_occupied(&plan) {
                debug!(offset = plan.offset(), "Chunk overlaps outstanding work, skipping");
                to_fetch.remove(plan.raw.clone());
                continue;
            }
            return Some(plan);
        }
        None
    }

    fn is_occupied(&self, plan: &ChunkPlan) -> bool {
        let overlaps = |start: u64, len: u64| {
            start < plan.download.end && plan.download.start < start + len
        };
        self.fetching
            .iter()
            .any(|(&start, chunk)| overlaps(start, chunk.len))
            || self
                .fetched
                .iter()
                .any(|(&start, data)| overlaps(start, data.len() as u64))
    }

    fn issue_chunk(&mut self, plan: ChunkPlan) {
        let offset = plan.offset();
        debug!(
            offset,
            len = plan.len(),
            limit = plan.request_limit,
            cdn = self.source.is_cdn(),
            "Requesting chunk"
        );

        let request = self.source.request(offset, plan.request_limit);
        let cancel = self.cancel.child_token();
        let task_cancel = cancel.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = task_cancel.cancelled() => {}
                result = request => {
                    let _ = events.send(ManagerEvent::ChunkCompleted { offset, result });
                }
            }
        });

        self.fetching.insert(
            offset,
            InFlightChunk {
                len: plan.len(),
                cancel,
            },
        );
    }

    fn shutdown(&mut self) {
        for chunk in self.fetching.values() {
            chunk.cancel.cancel();
        }
        self.fetching.clear();
        self.fetched.clear();
        self.source = FetchSource::None;
        self.cancel.cancel();
        debug!(filled = ?self.filled, "Multipart fetch stopped");
    }
}
