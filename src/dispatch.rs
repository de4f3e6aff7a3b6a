//! Load-aware request dispatch
//!
//! Selection and the matching `active_requests` increment happen inside one
//! registry critical section, so two concurrent dispatches can never both
//! observe the same worker as least loaded without accounting for each other.

use crate::registry::Registry;
use crate::worker::Worker;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;
use uuid::Uuid;

/// Accounting token for one dispatched request. Consumed exactly once by
/// [`Dispatcher::complete`].
#[derive(Debug)]
pub struct InFlight {
    pub worker_id: Uuid,
    pub port: u16,
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// Pick the least-loaded healthy worker and charge the request to it.
    /// Returns `None` when no worker is eligible (callers respond 503).
    pub fn checkout(&self) -> Option<InFlight> {
        self.registry.with_workers_mut(|workers| {
            let idx = pick(workers)?;
            let w = &mut workers[idx];
            w.active_requests += 1;
            w.total_requests += 1;
            w.last_request = Instant::now();
            debug!(
                worker_id = %w.id,
                port = w.port,
                active = w.active_requests,
                "Dispatched request"
            );
            Some(InFlight {
                worker_id: w.id,
                port: w.port,
            })
        })
    }

    /// Release request accounting. Runs synchronously on the completion
    /// path, so an autoscaler observing `active_requests = 0` sees a truly
    /// quiescent worker. `latency` is recorded only for successful
    /// completions; error paths leave the last sample untouched.
    pub fn complete(&self, flight: InFlight, latency: Option<Duration>) {
        self.registry.with_workers_mut(|workers| {
            if let Some(w) = workers.iter_mut().find(|w| w.id == flight.worker_id) {
                w.active_requests = w.active_requests.saturating_sub(1);
                if let Some(elapsed) = latency {
                    w.response_time_ms = Some(elapsed.as_millis() as u64);
                }
            }
        });
    }
}

/// Index of the eligible worker with the minimum load. Strict comparison
/// keeps the earliest-inserted worker on ties.
fn pick(workers: &[Worker]) -> Option<usize> {
    let mut best: Option<(usize, f64)> = None;
    for (idx, w) in workers.iter().enumerate() {
        if !w.is_eligible() {
            continue;
        }
        let load = w.load();
        match best {
            Some((_, best_load)) if load >= best_load => {}
            _ => best = Some((idx, load)),
        }
    }
    best.map(|(idx, _)| idx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;

    fn pool_of(n: usize) -> (Arc<Registry>, Vec<Uuid>, Dispatcher) {
        let registry = Arc::new(Registry::new(5001, 16));
        let mut ids = Vec::new();
        for _ in 0..n {
            let r = registry.reserve("scalegate").unwrap();
            registry.record_probe_success(r.id, Duration::from_millis(10));
            ids.push(r.id);
        }
        let dispatcher = Dispatcher::new(Arc::clone(&registry));
        (registry, ids, dispatcher)
    }

    #[test]
    fn test_checkout_with_empty_pool() {
        let registry = Arc::new(Registry::new(5001, 4));
        let dispatcher = Dispatcher::new(registry);
        assert!(dispatcher.checkout().is_none());
    }

    #[test]
    fn test_checkout_skips_unhealthy_workers() {
        let (registry, ids, dispatcher) = pool_of(2);
        registry.record_probe_failure(ids[0]);

        let flight = dispatcher.checkout().unwrap();
        assert_eq!(flight.worker_id, ids[1]);
    }

    #[test]
    fn test_checkout_skips_draining_workers() {
        let (registry, ids, dispatcher) = pool_of(2);
        registry.begin_drain(ids[1]).unwrap();

        let flight = dispatcher.checkout().unwrap();
        assert_eq!(flight.worker_id, ids[0]);

        registry.begin_drain(ids[0]).unwrap();
        assert!(dispatcher.checkout().is_none());
    }

    #[test]
    fn test_checkout_prefers_least_loaded() {
        let (_registry, ids, dispatcher) = pool_of(2);

        // First two dispatches spread across both workers
        let a = dispatcher.checkout().unwrap();
        let b = dispatcher.checkout().unwrap();
        assert_eq!(a.worker_id, ids[0]);
        assert_eq!(b.worker_id, ids[1]);

        // Releasing the first makes it least loaded again
        dispatcher.complete(a, None);
        let c = dispatcher.checkout().unwrap();
        assert_eq!(c.worker_id, ids[0]);
    }

    #[test]
    fn test_ties_break_by_insertion_order() {
        let (_registry, ids, dispatcher) = pool_of(3);
        let flight = dispatcher.checkout().unwrap();
        assert_eq!(flight.worker_id, ids[0]);
    }

    #[test]
    fn test_latency_penalty_steers_dispatch() {
        let (registry, ids, dispatcher) = pool_of(2);
        // First worker answered slowly, second quickly
        registry.record_probe_success(ids[0], Duration::from_millis(900));
        registry.record_probe_success(ids[1], Duration::from_millis(20));

        let flight = dispatcher.checkout().unwrap();
        assert_eq!(flight.worker_id, ids[1]);
    }

    #[test]
    fn test_checkout_increments_counters() {
        let (registry, ids, dispatcher) = pool_of(1);

        let a = dispatcher.checkout().unwrap();
        let b = dispatcher.checkout().unwrap();

        let snap = registry.snapshot();
        assert_eq!(snap[0].active_requests, 2);
        assert_eq!(snap[0].total_requests, 2);

        dispatcher.complete(a, Some(Duration::from_millis(250)));
        dispatcher.complete(b, None);

        let snap = registry.snapshot();
        assert_eq!(snap[0].active_requests, 0);
        assert_eq!(snap[0].total_requests, 2);
        // Only the successful completion updated the latency sample
        assert_eq!(snap[0].response_time_ms, Some(250));
        assert_eq!(ids.len(), 1);
    }

    #[test]
    fn test_complete_saturates_at_zero() {
        let (registry, ids, dispatcher) = pool_of(1);

        // A stale token must not drive the counter below zero
        let stale = InFlight {
            worker_id: ids[0],
            port: 5001,
        };
        dispatcher.complete(stale, None);

        assert_eq!(registry.snapshot()[0].active_requests, 0);
    }

    #[test]
    fn test_complete_for_removed_worker_is_noop() {
        let (registry, ids, dispatcher) = pool_of(1);
        let flight = dispatcher.checkout().unwrap();
        registry.remove(ids[0]);

        dispatcher.complete(flight, Some(Duration::from_millis(10)));
        assert!(registry.is_empty());
    }
}
