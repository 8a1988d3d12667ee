use std::time::Duration;

/// Timings and limits for one gateway's orchestration loop.
#[derive(Debug, Clone)]
pub struct MissionConfig {
    pub gateway_id: String,
    pub poll_initial_delay: Duration,
    pub poll_interval: Duration,
    pub debounce: Duration,
    pub recency_window: Duration,
    pub probe_history_limit: usize,
    pub completion_history_limit: usize,
    pub watcher_interval: Duration,
    pub watcher_history_limit: usize,
    pub idle_threshold: Duration,
    pub excerpt_chars: usize,
    pub title_chars: usize,
    pub tail_limit: usize,
    /// Spawn a logging-only `agent.wait` after each dispatch.
    pub wait_for_run: bool,
    pub agent_wait_timeout: Duration,
}

impl MissionConfig {
    pub fn new(gateway_id: impl Into<String>) -> Self {
        Self {
            gateway_id: gateway_id.into(),
            poll_initial_delay: Duration::from_secs(3),
            poll_interval: Duration::from_secs(10),
            debounce: Duration::from_secs(2),
            recency_window: Duration::from_secs(30 * 60),
            probe_history_limit: 5,
            completion_history_limit: 10,
            watcher_interval: Duration::from_secs(5),
            watcher_history_limit: 30,
            idle_threshold: Duration::from_secs(30),
            excerpt_chars: 500,
            title_chars: 80,
            tail_limit: 20,
            wait_for_run: false,
            agent_wait_timeout: Duration::from_secs(30),
        }
    }
}
