//! Multipart Fetch - parallel, resumable downloads of remote file resources
//!
//! This library downloads one remote resource as a set of aligned chunks,
//! driven by the byte ranges its consumer currently wants. It follows master
//! datacenter redirects to CDN datacenters, verifies CDN payloads against
//! per-segment SHA-256 hashes, asks the master to re-upload files a CDN has
//! lost, and decrypts end-to-end encrypted payloads in order.
//!
//! # Modules
//!
//! - [`fetch`]: the per-fetch manager and its public entry point
//! - [`ranges`]: range-set arithmetic and chunk planning
//! - [`transport`]: the connection traits the engine consumes
//! - [`crypto`]: AES-IGE and AES-CTR payload decryption, segment hashing
//! - [`config`]: tunables and transport constants
//! - [`error`]: internal error taxonomy
//! - [`logging`]: optional tracing subscriber setup
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use multipart_fetch::{
//!     multipart_fetch, DownloadProvider, FetchConfig, FetchEvent, FetchRequest, MasterLocation,
//!     RangeSet,
//! };
//! use tokio::sync::watch;
//!
//! async fn download(provider: Arc<dyn DownloadProvider>, location: MasterLocation) {
//!     let (_ranges_tx, ranges_rx) = watch::channel(RangeSet::from(0..u64::MAX));
//!     let request = FetchRequest::new(location).with_size(Some(300_000));
//!     let (_handle, mut events) =
//!         multipart_fetch(request, ranges_rx, provider, FetchConfig::default());
//!
//!     while let Some(event) = events.recv().await {
//!         match event {
//!             FetchEvent::DataPart { offset, data } => println!("{} bytes at {}", data.len(), offset),
//!             FetchEvent::ResourceSizeUpdated(size) => println!("complete: {size} bytes"),
//!             FetchEvent::Reset => {}
//!         }
//!     }
//! }
//! ```

pub mod config;
pub mod crypto;
pub mod error;
pub mod fetch;
pub mod logging;
pub mod ranges;
pub mod transport;

pub use config::FetchConfig;
pub use crypto::SecretFileEncryptionKey;
pub use error::{FetchError, FetchResult};
pub use fetch::{multipart_fetch, FetchEvent, FetchHandle, FetchRequest, MasterLocation};
pub use logging::{init_logging, LoggingConfig, LoggingGuard};
pub use ranges::RangeSet;
pub use transport::{Download, DownloadProvider};
