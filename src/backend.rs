use std::collections::HashMap;

use parking_lot::RwLock;

/// Observability sink for per-endpoint state, written on every job broadcast
pub trait StateSink: Send + Sync {
    fn record_endpoint_state(
        &self,
        pool_name: &str,
        endpoint_name: &str,
        listen: &str,
        session_count: usize,
        difficulty: u64,
    );
}

/// Snapshot of the last state recorded for one endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointState {
    pub listen: String,
    pub session_count: usize,
    pub difficulty: u64,
}

/// Keeps the latest state per endpoint in memory and logs it
#[derive(Debug, Default)]
pub struct LogStateSink {
    states: RwLock<HashMap<(String, String), EndpointState>>,
}

impl LogStateSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self, pool_name: &str, endpoint_name: &str) -> Option<EndpointState> {
        self.states
            .read()
            .get(&(pool_name.to_string(), endpoint_name.to_string()))
            .cloned()
    }
}

impl StateSink for LogStateSink {
    fn record_endpoint_state(
        &self,
        pool_name: &str,
        endpoint_name: &str,
        listen: &str,
        session_count: usize,
        difficulty: u64,
    ) {
        log::debug!(
            "📊 {}/{} on {}: {} sessions, difficulty {}",
            pool_name,
            endpoint_name,
            listen,
            session_count,
            difficulty
        );
        self.states.write().insert(
            (pool_name.to_string(), endpoint_name.to_string()),
            EndpointState {
                listen: listen.to_string(),
                session_count,
                difficulty,
            },
        );
    }
}
