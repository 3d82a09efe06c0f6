//! Error types for the fetch engine.
//!
//! None of these reach the consumer of a fetch: every kind is either a control
//! signal (source migration, token refresh) or a transient failure that the
//! manager recovers from by scheduling the affected range again.

use bytes::Bytes;
use thiserror::Error;

use crate::transport::{CdnRedirect, RpcError};

/// Result type for a single chunk request.
pub type FetchResult<T> = Result<T, FetchError>;

/// Outcome of a failed chunk request.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// Transport or integrity failure. The range stays outstanding.
    #[error("chunk request failed: {0}")]
    Generic(String),

    /// The master asked us to fetch this file from a CDN datacenter instead.
    #[error("file redirected to CDN datacenter {}", .0.datacenter_id)]
    SwitchToCdn(CdnRedirect),

    /// The CDN no longer holds the file and needs it re-uploaded by the master.
    #[error("CDN file needs re-upload via master datacenter {master_datacenter_id}")]
    ReuploadToCdn {
        master_datacenter_id: i32,
        request_token: Bytes,
    },

    /// Hashes for a CDN range could not be obtained.
    #[error("CDN part hashes missing")]
    HashesMissing,
}

impl FetchError {
    /// Shorthand for a generic failure.
    pub fn generic(reason: impl Into<String>) -> Self {
        Self::Generic(reason.into())
    }
}

impl From<RpcError> for FetchError {
    fn from(e: RpcError) -> Self {
        Self::Generic(e.to_string())
    }
}

impl From<CryptoError> for FetchError {
    fn from(e: CryptoError) -> Self {
        Self::Generic(e.to_string())
    }
}

/// Errors raised while decrypting chunk payloads.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Key material of the wrong size.
    #[error("invalid key length: {0} bytes")]
    InvalidKeyLength(usize),

    /// IV material of the wrong size.
    #[error("invalid IV length: {0} bytes")]
    InvalidIvLength(usize),

    /// Block-mode input that is not a whole number of blocks.
    #[error("payload of {0} bytes is not a multiple of the AES block size")]
    UnalignedPayload(usize),
}
