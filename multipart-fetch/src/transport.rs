//! Transport abstraction consumed by the fetch engine.
//!
//! The engine never talks to the network itself. It asks a
//! [`DownloadProvider`] for a [`Download`] connection keyed by
//! `(datacenter_id, is_cdn)` and issues the five file RPCs below on it.
//! Serialization of these calls is the transport's business; the engine only
//! sees the typed replies.
//!
//! # Design Principles
//!
//! - **Opaque locations**: file and web-file locations are carried as the
//!   transport's own encoded bytes
//! - **Dyn-compatible**: async methods return [`BoxFuture`] so connections can
//!   be shared as `Arc<dyn Download>`
//! - **Typed replies**: redirects and re-upload requests are enum variants, not
//!   errors, so the engine decides what they mean

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use thiserror::Error;

/// Boxed future type for dyn-compatible async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Encoded location of a file stored on a datacenter.
#[derive(Clone, PartialEq, Eq)]
pub struct InputFileLocation(pub Bytes);

/// Encoded location of a file proxied from the web.
#[derive(Clone, PartialEq, Eq)]
pub struct InputWebFileLocation(pub Bytes);

impl fmt::Debug for InputFileLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InputFileLocation({} bytes)", self.0.len())
    }
}

impl fmt::Debug for InputWebFileLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InputWebFileLocation({} bytes)", self.0.len())
    }
}

/// Hash of one segment of a CDN file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHash {
    /// Offset of the segment.
    pub offset: i64,
    /// Length of the segment (128 KiB on the wire).
    pub limit: i32,
    /// SHA-256 of the plaintext segment.
    pub hash: Bytes,
}

/// Instruction to continue a download on a CDN datacenter.
#[derive(Clone, PartialEq, Eq)]
pub struct CdnRedirect {
    /// CDN datacenter to connect to.
    pub datacenter_id: i32,
    /// Token identifying the file on the CDN.
    pub file_token: Bytes,
    /// AES-256 key for the CDN payload.
    pub encryption_key: Bytes,
    /// AES-CTR IV for the CDN payload.
    pub encryption_iv: Bytes,
    /// First batch of segment hashes.
    pub file_hashes: Vec<FileHash>,
}

impl fmt::Debug for CdnRedirect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Key material stays out of logs.
        f.debug_struct("CdnRedirect")
            .field("datacenter_id", &self.datacenter_id)
            .field("file_token_len", &self.file_token.len())
            .field("file_hashes", &self.file_hashes.len())
            .finish()
    }
}

/// Reply to `get_file`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadFile {
    /// File bytes for the requested range.
    File { bytes: Bytes },
    /// The file must be fetched from a CDN datacenter.
    CdnRedirect(CdnRedirect),
}

/// Reply to `get_web_file`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebFile {
    /// Total size reported by the proxy, if any.
    pub size: i32,
    /// MIME type reported by the proxy.
    pub mime_type: String,
    /// File bytes for the requested range.
    pub bytes: Bytes,
}

/// Reply to `get_cdn_file`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CdnFile {
    /// The CDN lost the file; the master must re-upload it.
    ReuploadNeeded { request_token: Bytes },
    /// Encrypted file bytes for the requested range.
    File { bytes: Bytes },
}

/// Error returned by the transport for a failed call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("RPC error {code}: {description}")]
pub struct RpcError {
    /// Numeric error code.
    pub code: i32,
    /// Error description as sent by the server.
    pub description: String,
}

impl RpcError {
    /// Create a new RPC error.
    pub fn new(code: i32, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }
}

/// A connection able to issue file RPCs against one datacenter.
pub trait Download: Send + Sync {
    /// Request a range of a stored file.
    fn get_file(
        &self,
        location: &InputFileLocation,
        offset: i64,
        limit: i32,
    ) -> BoxFuture<'_, Result<UploadFile, RpcError>>;

    /// Request a range of a web-proxied file.
    fn get_web_file(
        &self,
        location: &InputWebFileLocation,
        offset: i64,
        limit: i32,
    ) -> BoxFuture<'_, Result<WebFile, RpcError>>;

    /// Request a range of a CDN file.
    fn get_cdn_file(
        &self,
        file_token: &Bytes,
        offset: i64,
        limit: i32,
    ) -> BoxFuture<'_, Result<CdnFile, RpcError>>;

    /// Request the segment hashes of a CDN file starting at `offset`.
    fn get_cdn_file_hashes(
        &self,
        file_token: &Bytes,
        offset: i64,
    ) -> BoxFuture<'_, Result<Vec<FileHash>, RpcError>>;

    /// Ask the master to re-upload a CDN file.
    fn reupload_cdn_file(
        &self,
        file_token: &Bytes,
        request_token: &Bytes,
    ) -> BoxFuture<'_, Result<Vec<FileHash>, RpcError>>;
}

/// Source of connections, keyed by datacenter and CDN flag.
pub trait DownloadProvider: Send + Sync + 'static {
    /// Open (or borrow) a connection to the given datacenter.
    fn take(&self, datacenter_id: i32, cdn: bool) -> BoxFuture<'static, Arc<dyn Download>>;
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Mock connection returning canned replies and recording calls.
    #[derive(Default)]
    pub struct MockDownload {
        pub file_reply: Mutex<Option<Result<UploadFile, RpcError>>>,
        pub cdn_reply: Mutex<Option<Result<CdnFile, RpcError>>>,
        pub hashes_reply: Mutex<Vec<FileHash>>,
        /// Hash fetches stay pending while this is set.
        pub hold_hashes: std::sync::atomic::AtomicBool,
        /// Re-uploads stay pending while this is set.
        pub hold_reupload: std::sync::atomic::AtomicBool,
        pub calls: Mutex<Vec<String>>,
        pub hash_fetches: AtomicUsize,
        pub reuploads: AtomicUsize,
    }

    impl MockDownload {
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }
    }

    impl Download for MockDownload {
        fn get_file(
            &self,
            _location: &InputFileLocation,
            offset: i64,
            limit: i32,
        ) -> BoxFuture<'_, Result<UploadFile, RpcError>> {
            self.calls.lock().push(format!("get_file {offset} {limit}"));
            let reply = self
                .file_reply
                .lock()
                .clone()
                .unwrap_or_else(|| Err(RpcError::new(400, "NO_REPLY")));
            Box::pin(async move { reply })
        }

        fn get_web_file(
            &self,
            _location: &InputWebFileLocation,
            offset: i64,
            limit: i32,
        ) -> BoxFuture<'_, Result<WebFile, RpcError>> {
            self.calls
                .lock()
                .push(format!("get_web_file {offset} {limit}"));
            let reply = match self.file_reply.lock().clone() {
                Some(Ok(UploadFile::File { bytes })) => Ok(WebFile {
                    size: 0,
                    mime_type: "application/octet-stream".to_string(),
                    bytes,
                }),
                _ => Err(RpcError::new(400, "NO_REPLY")),
            };
            Box::pin(async move { reply })
        }

        fn get_cdn_file(
            &self,
            _file_token: &Bytes,
            offset: i64,
            limit: i32,
        ) -> BoxFuture<'_, Result<CdnFile, RpcError>> {
            self.calls
                .lock()
                .push(format!("get_cdn_file {offset} {limit}"));
            let reply = self
                .cdn_reply
                .lock()
                .clone()
                .unwrap_or_else(|| Err(RpcError::new(400, "NO_REPLY")));
            Box::pin(async move { reply })
        }

        fn get_cdn_file_hashes(
            &self,
            _file_token: &Bytes,
            offset: i64,
        ) -> BoxFuture<'_, Result<Vec<FileHash>, RpcError>> {
            self.hash_fetches.fetch_add(1, Ordering::SeqCst);
            self.calls
                .lock()
                .push(format!("get_cdn_file_hashes {offset}"));
            let hold = self.hold_hashes.load(Ordering::SeqCst);
            let reply = self.hashes_reply.lock().clone();
            Box::pin(async move {
                if hold {
                    futures::future::pending::<()>().await;
                }
                Ok(reply)
            })
        }

        fn reupload_cdn_file(
            &self,
            _file_token: &Bytes,
            _request_token: &Bytes,
        ) -> BoxFuture<'_, Result<Vec<FileHash>, RpcError>> {
            self.reuploads.fetch_add(1, Ordering::SeqCst);
            self.calls.lock().push("reupload_cdn_file".to_string());
            let hold = self.hold_reupload.load(Ordering::SeqCst);
            Box::pin(async move {
                if hold {
                    futures::future::pending::<()>().await;
                }
                Ok(Vec::new())
            })
        }
    }

    /// Provider handing out one shared mock connection and counting `take` calls.
    pub struct MockProvider {
        pub download: Arc<MockDownload>,
        pub takes: AtomicUsize,
    }

    impl MockProvider {
        pub fn new(download: Arc<MockDownload>) -> Self {
            Self {
                download,
                takes: AtomicUsize::new(0),
            }
        }
    }

    impl DownloadProvider for MockProvider {
        fn take(&self, _datacenter_id: i32, _cdn: bool) -> BoxFuture<'static, Arc<dyn Download>> {
            self.takes.fetch_add(1, Ordering::SeqCst);
            let download: Arc<dyn Download> = self.download.clone();
            Box::pin(async move {
                tokio::task::yield_now().await;
                download
            })
        }
    }

    #[tokio::test]
    async fn test_mock_download_records_calls() {
        let mock = MockDownload::default();
        *mock.file_reply.lock() = Some(Ok(UploadFile::File {
            bytes: Bytes::from_static(&[1, 2, 3]),
        }));

        let location = InputFileLocation(Bytes::from_static(b"loc"));
        let reply = mock.get_file(&location, 0, 4096).await.unwrap();
        assert_eq!(
            reply,
            UploadFile::File {
                bytes: Bytes::from_static(&[1, 2, 3])
            }
        );
        assert_eq!(mock.calls(), vec!["get_file 0 4096".to_string()]);
    }

    #[test]
    fn test_redirect_debug_hides_key() {
        let redirect = CdnRedirect {
            datacenter_id: 203,
            file_token: Bytes::from_static(b"token"),
            encryption_key: Bytes::from_static(b"secret-key"),
            encryption_iv: Bytes::from_static(b"secret-iv"),
            file_hashes: Vec::new(),
        };
        let rendered = format!("{:?}", redirect);
        assert!(rendered.contains("203"));
        assert!(!rendered.contains("secret"));
    }

    #[test]
    fn test_rpc_error_display() {
        let err = RpcError::new(303, "FILE_MIGRATE_2");
        assert_eq!(err.to_string(), "RPC error 303: FILE_MIGRATE_2");
    }
}
