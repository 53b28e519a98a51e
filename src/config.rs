//! Node configuration.

use std::time::Duration;

use crate::routing::BUCKET_SIZE;

/// Upper bound for lookup `count` and replication factors.
pub const MAX_COUNT: usize = 100;

/// Tunables shared by the state actor, dispatcher and lookup engine.
#[derive(Clone, Debug)]
pub struct DhtConfig {
    /// Contacts kept per bucket.
    pub bucket_size: usize,
    /// Outbound requests a single lookup may have in flight.
    pub max_pending_requests: usize,
    /// Deadline for one RPC, and for each state operation an inbound
    /// handler performs.
    pub request_timeout: Duration,
    /// Jobs the state actor queue holds before producers wait.
    pub state_queue_capacity: usize,
    /// Clamp applied to `count` and replication factors.
    pub max_count: usize,
    /// Contacts requested by the self-lookup during registration.
    pub register_lookup_count: usize,
    /// Largest frame the TCP transport will read or write.
    pub max_frame_size: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            bucket_size: BUCKET_SIZE,
            max_pending_requests: 10,
            request_timeout: Duration::from_secs(1),
            state_queue_capacity: 1000,
            max_count: MAX_COUNT,
            register_lookup_count: 20,
            max_frame_size: 1024 * 1024,
        }
    }
}

impl DhtConfig {
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_max_pending_requests(mut self, n: usize) -> Self {
        self.max_pending_requests = n.max(1);
        self
    }
}
