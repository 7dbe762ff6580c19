use std::time::Duration;

use crate::registry::DEFAULT_CHANNEL_CAPACITY;

/// Tunables for delivery, pacing and session lifetime.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Delay before each produced response.
    pub pacing_interval: Duration,
    /// How long a stream waits for an item before emitting a heartbeat.
    pub idle_timeout: Duration,
    /// How long a push may wait for room in a full channel.
    pub push_timeout: Duration,
    pub channel_capacity: usize,
    /// Drop in-memory session state when its stream closes.
    pub release_state_on_detach: bool,
    /// How long a new session's parked channel waits for a stream before
    /// it is dropped.
    pub parked_ttl: Duration,
    /// Inclusive bounds for the number of responses per user message.
    pub min_responses: u32,
    pub max_responses: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pacing_interval: Duration::from_millis(500),
            idle_timeout: Duration::from_secs(30),
            push_timeout: Duration::from_secs(1),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            release_state_on_detach: true,
            parked_ttl: Duration::from_secs(300),
            min_responses: 1,
            max_responses: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let c = EngineConfig::default();
        assert_eq!(c.pacing_interval, Duration::from_millis(500));
        assert_eq!(c.idle_timeout, Duration::from_secs(30));
        assert_eq!(c.channel_capacity, 256);
        assert_eq!((c.min_responses, c.max_responses), (1, 10));
        assert!(c.release_state_on_detach);
        assert_eq!(c.parked_ttl, Duration::from_secs(300));
    }
}
