use std::time::Duration;

/// Tunables for the realtime session. The ring timeout and busy-race grace
/// window carry the empirically tuned defaults of the production system;
/// they are configuration, not semantics.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// How long an unanswered call may stay ringing before it auto-ends.
    pub ring_timeout: Duration,
    /// A `busy` signal received within this window of ring start is treated
    /// as a stale echo from a mutual-dial race and ignored.
    pub busy_grace: Duration,
    /// Poll cadence while the push transport is healthy.
    pub poll_interval: Duration,
    /// Poll cadence while the push transport reports degraded connectivity.
    pub degraded_poll_interval: Duration,
    /// Upper bound of the recently-seen message id set.
    pub dedup_capacity: usize,
    /// Page size for history loads and poll catch-up fetches.
    pub history_page_size: u32,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            ring_timeout: Duration::from_secs(60),
            busy_grace: Duration::from_secs(3),
            poll_interval: Duration::from_secs(30),
            degraded_poll_interval: Duration::from_secs(10),
            dedup_capacity: 512,
            history_page_size: 50,
        }
    }
}
