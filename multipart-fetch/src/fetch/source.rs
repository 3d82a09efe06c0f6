//! Where chunks come from: the master datacenter or a CDN datacenter.

use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use super::event::{EventSender, PartHashes};
use super::hash_source::CdnHashSource;
use super::wrapper::DownloadWrapper;
use crate::config::HASH_SEGMENT_LENGTH;
use crate::crypto::{cdn_decrypt, segment_hash};
use crate::error::{FetchError, FetchResult};
use crate::ranges::transport_limit;
use crate::transport::{
    BoxFuture, CdnFile, CdnRedirect, Download, DownloadProvider, InputFileLocation,
    InputWebFileLocation, UploadFile,
};

/// Location of a resource on its master datacenter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterLocation {
    /// A stored file, which may be redirected to a CDN.
    Generic {
        datacenter_id: i32,
        location: InputFileLocation,
    },
    /// A web-proxied file.
    Web {
        datacenter_id: i32,
        location: InputWebFileLocation,
    },
}

impl MasterLocation {
    /// Datacenter holding the resource.
    pub fn datacenter_id(&self) -> i32 {
        match self {
            Self::Generic { datacenter_id, .. } | Self::Web { datacenter_id, .. } => {
                *datacenter_id
            }
        }
    }
}

/// State needed to read and verify a CDN-hosted file.
pub(crate) struct CdnSource {
    pub master_datacenter_id: i32,
    pub file_token: Bytes,
    pub encryption_key: Bytes,
    pub encryption_iv: Bytes,
    pub download: Arc<DownloadWrapper>,
    pub master_download: Arc<DownloadWrapper>,
    pub hash_source: CdnHashSource,
}

impl CdnSource {
    /// Build the CDN source described by a master redirect.
    pub fn from_redirect(
        master_datacenter_id: i32,
        redirect: CdnRedirect,
        master_download: Arc<DownloadWrapper>,
        provider: Arc<dyn DownloadProvider>,
        events: EventSender,
        cancel: CancellationToken,
    ) -> Self {
        let hash_source = CdnHashSource::new(
            redirect.file_token.clone(),
            &redirect.file_hashes,
            Arc::clone(&master_download),
            events,
            cancel,
        );
        Self {
            master_datacenter_id,
            file_token: redirect.file_token,
            encryption_key: redirect.encryption_key,
            encryption_iv: redirect.encryption_iv,
            download: Arc::new(DownloadWrapper::new(redirect.datacenter_id, true, provider)),
            master_download,
            hash_source,
        }
    }
}

/// The active source of a fetch.
pub(crate) enum FetchSource {
    /// Torn down; requests never complete.
    None,
    /// Reading from the master datacenter.
    Master {
        location: MasterLocation,
        download: Arc<DownloadWrapper>,
    },
    /// Reading from a CDN datacenter after a redirect.
    Cdn(Box<CdnSource>),
}

impl FetchSource {
    /// Returns true once the fetch has migrated to a CDN.
    pub fn is_cdn(&self) -> bool {
        matches!(self, Self::Cdn(_))
    }

    /// Start a request for `limit` bytes at `offset`.
    ///
    /// The returned future owns everything it needs. For CDN sources the hash
    /// lookup is registered here, on the manager task, before the future is
    /// handed off.
    pub fn request(&mut self, offset: u64, limit: u64) -> BoxFuture<'static, FetchResult<Bytes>> {
        match self {
            Self::None => Box::pin(futures::future::pending()),
            Self::Master { location, download } => {
                request_master(location.clone(), download.get(), offset, limit)
            }
            Self::Cdn(cdn) => {
                let (reply, hashes) = oneshot::channel();
                cdn.hash_source.get(offset, limit, reply);
                request_cdn(cdn, hashes, offset, limit)
            }
        }
    }
}

fn request_master(
    location: MasterLocation,
    download: impl Future<Output = Arc<dyn Download>> + Send + 'static,
    offset: u64,
    limit: u64,
) -> BoxFuture<'static, FetchResult<Bytes>> {
    let wire_limit = transport_limit(limit) as i32;
    Box::pin(async move {
        let download = download.await;
        let bytes = match &location {
            MasterLocation::Generic { location, .. } => {
                match download.get_file(location, offset as i64, wire_limit).await? {
                    UploadFile::File { bytes } => bytes,
                    UploadFile::CdnRedirect(redirect) => {
                        return Err(FetchError::SwitchToCdn(redirect))
                    }
                }
            }
            MasterLocation::Web { location, .. } => {
                download
                    .get_web_file(location, offset as i64, wire_limit)
                    .await?
                    .bytes
            }
        };
        trace!(offset, len = bytes.len(), "Master chunk received");
        Ok(truncate(bytes, limit))
    })
}

fn request_cdn(
    cdn: &CdnSource,
    hashes: oneshot::Receiver<FetchResult<PartHashes>>,
    offset: u64,
    limit: u64,
) -> BoxFuture<'static, FetchResult<Bytes>> {
    let download = cdn.download.get();
    let file_token = cdn.file_token.clone();
    let key = cdn.encryption_key.clone();
    let iv = cdn.encryption_iv.clone();
    let master_datacenter_id = cdn.master_datacenter_id;
    let wire_limit = transport_limit(limit) as i32;

    Box::pin(async move {
        let download = download.await;
        let encrypted = match download
            .get_cdn_file(&file_token, offset as i64, wire_limit)
            .await?
        {
            CdnFile::File { bytes } => bytes,
            CdnFile::ReuploadNeeded { request_token } => {
                return Err(FetchError::ReuploadToCdn {
                    master_datacenter_id,
                    request_token,
                })
            }
        };
        if encrypted.is_empty() {
            return Ok(encrypted);
        }

        let data = cdn_decrypt(&key, &iv, offset, &truncate(encrypted, limit))?;
        let hashes = hashes.await.map_err(|_| FetchError::HashesMissing)??;
        verify_segments(offset, &data, &hashes)?;
        trace!(offset, len = data.len(), "CDN chunk verified");
        Ok(data)
    })
}

/// Check each segment of `data` against its expected SHA-256.
pub(crate) fn verify_segments(offset: u64, data: &[u8], hashes: &PartHashes) -> FetchResult<()> {
    for (index, segment) in data.chunks(HASH_SEGMENT_LENGTH as usize).enumerate() {
        let segment_offset = offset + index as u64 * HASH_SEGMENT_LENGTH;
        let expected = hashes.get(&segment_offset).ok_or_else(|| {
            FetchError::generic(format!("no hash for segment at {segment_offset}"))
        })?;
        if segment_hash(segment)[..] != expected[..] {
            return Err(FetchError::generic(format!(
                "hash mismatch for segment at {segment_offset}"
            )));
        }
    }
    Ok(())
}

fn truncate(mut bytes: Bytes, limit: u64) -> Bytes {
    if bytes.len() as u64 > limit {
        bytes.truncate(limit as usize);
    }
    bytes
}
