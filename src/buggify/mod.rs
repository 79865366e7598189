//! BUGGIFY - FoundationDB-Style Fault Injection
//!
//! Deterministic, reproducible fault injection for the simulated event log
//! and message source. Every injection site names a fault id; the decision
//! is drawn from the caller's seeded RNG so a failing seed replays exactly.
//!
//! ```ignore
//! if buggify!(&mut rng, faults::event_log::APPEND_FAIL, config.append_fail_prob) {
//!     return Err(EventLogError::Unavailable("simulated append failure".into()));
//! }
//! ```

use std::cell::RefCell;
use std::collections::HashMap;

/// Named fault injection sites
pub mod faults {
    pub mod event_log {
        /// Append rejected before anything is persisted
        pub const APPEND_FAIL: &str = "event_log.append_fail";
        /// Append times out before anything is persisted
        pub const APPEND_TIMEOUT: &str = "event_log.append_timeout";
        /// Append persisted but the acknowledgement is lost
        pub const ACK_LOST: &str = "event_log.ack_lost";
        /// Read fails
        pub const READ_FAIL: &str = "event_log.read_fail";
    }

    pub mod source {
        /// Poll returns a transient error
        pub const POLL_ERROR: &str = "source.poll_error";
        /// Poll returns nothing although a message is ready
        pub const SPURIOUS_EMPTY: &str = "source.spurious_empty";
    }

    pub const ALL_FAULTS: &[&str] = &[
        event_log::APPEND_FAIL,
        event_log::APPEND_TIMEOUT,
        event_log::ACK_LOST,
        event_log::READ_FAIL,
        source::POLL_ERROR,
        source::SPURIOUS_EMPTY,
    ];
}

pub use faults::ALL_FAULTS;

/// Statistics tracking for fault injection
#[derive(Debug, Clone, Default)]
pub struct BuggifyStats {
    /// Number of times each fault was checked
    pub checks: HashMap<String, u64>,
    /// Number of times each fault was triggered
    pub triggers: HashMap<String, u64>,
}

impl BuggifyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_check(&mut self, fault_id: &str) {
        *self.checks.entry(fault_id.to_string()).or_insert(0) += 1;
    }

    pub fn record_trigger(&mut self, fault_id: &str) {
        *self.triggers.entry(fault_id.to_string()).or_insert(0) += 1;
    }

    pub fn triggered(&self, fault_id: &str) -> u64 {
        self.triggers.get(fault_id).copied().unwrap_or(0)
    }

    pub fn trigger_rate(&self, fault_id: &str) -> f64 {
        let checks = self.checks.get(fault_id).copied().unwrap_or(0);
        let triggers = self.triggered(fault_id);
        if checks == 0 {
            0.0
        } else {
            triggers as f64 / checks as f64
        }
    }

    /// Per-fault triggers and checks, in `ALL_FAULTS` order, for faults
    /// that were checked at least once
    pub fn summary(&self) -> String {
        let mut lines = vec!["BUGGIFY Statistics:".to_string()];

        for fault_id in ALL_FAULTS {
            let checks = self.checks.get(*fault_id).copied().unwrap_or(0);
            if checks == 0 {
                continue;
            }
            lines.push(format!(
                "  {}: {}/{} ({:.2}%)",
                fault_id,
                self.triggered(fault_id),
                checks,
                self.trigger_rate(fault_id) * 100.0
            ));
        }

        lines.join("\n")
    }
}

thread_local! {
    static BUGGIFY_STATS: RefCell<BuggifyStats> = RefCell::new(BuggifyStats::new());
}

/// Buggify stats recorded on the current thread
pub fn get_stats() -> BuggifyStats {
    BUGGIFY_STATS.with(|stats| stats.borrow().clone())
}

/// Reset stats for the current thread
pub fn reset_stats() {
    BUGGIFY_STATS.with(|stats| *stats.borrow_mut() = BuggifyStats::new());
}

/// Core check - called by the `buggify!` macro
#[inline]
pub fn should_buggify_with_prob<R: crate::io::Rng>(
    rng: &mut R,
    fault_id: &str,
    probability: f64,
) -> bool {
    let random_value = rng.gen_range(0, 1_000_000) as f64 / 1_000_000.0;
    let triggered = random_value < probability.clamp(0.0, 1.0);

    BUGGIFY_STATS.with(|stats| {
        let mut stats = stats.borrow_mut();
        stats.record_check(fault_id);
        if triggered {
            stats.record_trigger(fault_id);
        }
    });
    triggered
}

/// BUGGIFY macro - the main interface for fault injection
#[macro_export]
macro_rules! buggify {
    ($rng:expr, $fault_id:expr, $prob:expr) => {
        $crate::buggify::should_buggify_with_prob($rng, $fault_id, $prob)
    };
}
