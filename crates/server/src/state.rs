use std::sync::Arc;
use std::time::Duration;

use twinder_metrics::ThroughputCounter;
use twinder_queue::Publisher;
use twinder_store::UserStore;

/// Shared handles injected into every handler.
pub struct AppState {
    pub publisher: Arc<dyn Publisher>,
    pub store: Arc<dyn UserStore>,
    /// Successful publishes since the last metrics flush.
    pub throughput: Arc<ThroughputCounter>,
    /// Deadline applied to each store read.
    pub store_timeout: Duration,
}

impl AppState {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        store: Arc<dyn UserStore>,
        throughput: Arc<ThroughputCounter>,
        store_timeout: Duration,
    ) -> Self {
        Self {
            publisher,
            store,
            throughput,
            store_timeout,
        }
    }
}
