use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::error::ProxyError;
use crate::server::ProxyServer;

/// Outcome of one job fan-out over an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Sessions in the registry snapshot
    pub sessions: usize,
    /// Pushes that failed; those sessions were removed from the registry
    pub failed: usize,
    pub elapsed: Duration,
}

impl ProxyServer {
    /// Push the current job to every registered session of one endpoint.
    ///
    /// Returns `Ok(None)` without writing anything when there is no usable
    /// template or the upstream is sick. A failed push drops that session
    /// from the registry; its handler notices the dead connection on its own.
    pub async fn broadcast_new_jobs(&self, index: usize) -> Result<Option<BroadcastReport>, ProxyError> {
        let endpoint = self.endpoint(index)?;

        let template = match self.templates.current_template() {
            Some(t) if !t.header.is_empty() => t,
            _ => return Ok(None),
        };
        if self.templates.is_sick() {
            return Ok(None);
        }

        let reply = Arc::new(vec![template.header, template.seed, endpoint.target.clone()]);
        let sessions = endpoint.registry.snapshot();
        let start = Instant::now();

        log::info!("📡 Broadcasting new job to {} miners on {}", sessions.len(), endpoint.config.name);
        self.sink.record_endpoint_state(
            &self.config.name,
            &endpoint.config.name,
            &endpoint.config.listen,
            sessions.len(),
            endpoint.config.difficulty,
        );

        let limiter = Arc::new(Semaphore::new(self.config.broadcast.concurrency.max(1)));
        let mut pushes = JoinSet::new();
        for session in &sessions {
            let Ok(permit) = Arc::clone(&limiter).acquire_owned().await else {
                break;
            };
            let session = Arc::clone(session);
            let registry = Arc::clone(&endpoint.registry);
            let reply = Arc::clone(&reply);
            pushes.spawn(async move {
                let _permit = permit;
                match session.push_notification(&*reply).await {
                    Ok(()) => {
                        session.renew_deadline();
                        true
                    }
                    Err(e) => {
                        log::warn!("Job transmit error to {}@{}: {}", session.login(), session.ip(), e);
                        registry.remove(session.id());
                        false
                    }
                }
            });
        }

        let mut failed = 0;
        while let Some(result) = pushes.join_next().await {
            match result {
                Ok(true) => {}
                Ok(false) => failed += 1,
                Err(e) => {
                    log::error!("❌ Job push task failed: {}", e);
                    failed += 1;
                }
            }
        }

        let elapsed = start.elapsed();
        log::info!("Jobs broadcast on {} finished in {:?}", endpoint.config.name, elapsed);
        Ok(Some(BroadcastReport {
            sessions: sessions.len(),
            failed,
            elapsed,
        }))
    }
}
