//! Autoscaling policy
//!
//! The decision is a pure function over a pool snapshot: the controller
//! feeds it one snapshot per tick and executes at most one resulting action.

use crate::config::ScalingConfig;
use crate::worker::WorkerSnapshot;
use std::time::Instant;
use uuid::Uuid;

/// At most one action fires per autoscaler tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleAction {
    /// Spawn one worker
    Up,
    /// Retire the given idle worker
    Down(Uuid),
    /// No action this tick
    Hold,
}

/// Evaluate the scaling rules in order; the first matching rule fires.
///
/// 1. Below minimum and below the pool bound: scale up.
/// 2. Average load above the up threshold and room to grow: scale up.
/// 3. Above minimum, average load below the down threshold, and an idle
///    worker exists: retire the one idle longest (earliest insertion on
///    ties).
/// 4. Otherwise hold.
pub fn decide(pool: &[WorkerSnapshot], config: &ScalingConfig, now: Instant) -> ScaleAction {
    let healthy: Vec<&WorkerSnapshot> = pool.iter().filter(|w| w.is_eligible()).collect();

    if healthy.len() < config.min_instances && pool.len() < config.max_instances {
        return ScaleAction::Up;
    }

    // Average load is undefined for an empty healthy set; rules 2 and 3
    // cannot apply.
    if healthy.is_empty() {
        return ScaleAction::Hold;
    }

    let avg_load = healthy.iter().map(|w| w.load()).sum::<f64>() / healthy.len() as f64;

    if avg_load > config.scale_up_threshold && healthy.len() < config.max_instances {
        return ScaleAction::Up;
    }

    if healthy.len() > config.min_instances && avg_load < config.scale_down_threshold {
        if let Some(candidate) = idle_candidate(&healthy, config, now) {
            return ScaleAction::Down(candidate);
        }
    }

    ScaleAction::Hold
}

/// The idle worker with the oldest last dispatch, if any worker has been
/// idle beyond the configured window
fn idle_candidate(
    healthy: &[&WorkerSnapshot],
    config: &ScalingConfig,
    now: Instant,
) -> Option<Uuid> {
    let idle_timeout = config.idle_timeout();
    let mut oldest: Option<&WorkerSnapshot> = None;
    for w in healthy {
        if w.active_requests > 0 {
            continue;
        }
        if now.duration_since(w.last_request) <= idle_timeout {
            continue;
        }
        match oldest {
            Some(best) if w.last_request >= best.last_request => {}
            _ => oldest = Some(w),
        }
    }
    oldest.map(|w| w.id)
}
