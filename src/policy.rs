//! Availability policy evaluation
//!
//! Decides whether enough GPUs are free, in one of two mutually exclusive
//! modes selected by the rule:
//! - Idle-count: at least `min_devices` GPUs with zero used memory
//! - Free-memory: at least `min_devices` GPUs with strictly more than
//!   `min_free_mib` free memory
//!
//! Pure and idempotent; the summary line is produced for every tick, not
//! only firing ones.

use serde::{Deserialize, Serialize};

use crate::status::ClusterSnapshot;

/// Threshold configured once at startup, immutable for the process lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityRule {
    /// Minimum number of qualifying GPUs. Always at least 1.
    pub min_devices: u32,
    /// When set, a GPU qualifies by free memory instead of being fully idle.
    pub min_free_mib: Option<u64>,
}

/// Per-tick result. Counts only - which devices qualified is not recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub available: bool,
    pub summary: String,
}

/// Evaluate the rule against one snapshot.
pub fn evaluate(snapshot: &ClusterSnapshot, rule: &AvailabilityRule) -> Decision {
    let total = snapshot.total();
    let idle = snapshot.idle_count();
    let in_use = total - idle;

    let qualifying = match rule.min_free_mib {
        None => idle,
        Some(min_free) => snapshot
            .devices
            .iter()
            .filter(|d| d.free_mib > min_free)
            .count(),
    };

    Decision {
        available: qualifying >= rule.min_devices as usize,
        summary: format!("{total} GPUs detected - {idle} idle, {in_use} in use"),
    }
}
