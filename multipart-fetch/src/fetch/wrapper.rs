//! Lazily established, shared datacenter connection.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{FutureExt, Shared};
use parking_lot::Mutex;
use tracing::debug;

use crate::transport::{BoxFuture, Download, DownloadProvider};

type PendingDownload = Shared<BoxFuture<'static, Arc<dyn Download>>>;

/// Memoizes one [`Download`] per `(datacenter_id, cdn)` pair.
///
/// The first caller of [`get`](Self::get) starts `DownloadProvider::take`;
/// every later or concurrent caller awaits the same shared future, so the
/// connection is established exactly once.
pub struct DownloadWrapper {
    datacenter_id: i32,
    cdn: bool,
    provider: Arc<dyn DownloadProvider>,
    value: Mutex<Option<PendingDownload>>,
}

impl DownloadWrapper {
    /// Create a wrapper; nothing is opened until the first `get`.
    pub fn new(datacenter_id: i32, cdn: bool, provider: Arc<dyn DownloadProvider>) -> Self {
        Self {
            datacenter_id,
            cdn,
            provider,
            value: Mutex::new(None),
        }
    }

    /// Datacenter this wrapper connects to.
    pub fn datacenter_id(&self) -> i32 {
        self.datacenter_id
    }

    /// Resolve the shared connection, starting it on first use.
    pub fn get(&self) -> impl Future<Output = Arc<dyn Download>> + Send + 'static {
        let mut slot = self.value.lock();
        slot.get_or_insert_with(|| {
            debug!(
                datacenter_id = self.datacenter_id,
                cdn = self.cdn,
                "Opening download connection"
            );
            self.provider.take(self.datacenter_id, self.cdn).shared()
        })
        .clone()
    }
}

impl fmt::Debug for DownloadWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadWrapper")
            .field("datacenter_id", &self.datacenter_id)
            .field("cdn", &self.cdn)
            .field("started", &self.value.lock().is_some())
            .finish()
    }
}
