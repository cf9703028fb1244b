//! BUGGIFY - FoundationDB-Style Fault Injection
//!
//! Every decision point at the ledger boundary can be a fault injection site.
//! A `Buggify` instance owns its configuration and statistics; the caller
//! supplies the RNG so that a simulation seed fully determines which calls
//! fail.
//!
//! ```ignore
//! if buggify!(&mut state.buggify, &mut state.rng, faults::ledger::EXEC_FAIL) {
//!     return Err(LedgerError::Rejected("injected".into()));
//! }
//! ```

pub mod config;
pub mod faults;

pub use config::FaultConfig;
pub use faults::ALL_FAULTS;

use crate::io::Rng;
use std::collections::HashMap;

/// Statistics tracking for fault injection
#[derive(Debug, Clone, Default)]
pub struct BuggifyStats {
    /// Number of times each fault was checked
    pub checks: HashMap<String, u64>,
    /// Number of times each fault was triggered
    pub triggers: HashMap<String, u64>,
}

impl BuggifyStats {
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
        if checks == 0 {
            0.0
        } else {
            self.triggered(fault_id) as f64 / checks as f64
        }
    }

    pub fn summary(&self) -> String {
        let mut lines = vec!["BUGGIFY Statistics:".to_string()];

        let mut sorted_faults: Vec<_> = self.checks.keys().collect();
        sorted_faults.sort();

        for fault_id in sorted_faults {
            let checks = self.checks.get(fault_id).copied().unwrap_or(0);
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

/// Fault injection state: configuration plus what has fired so far.
#[derive(Debug, Clone, Default)]
pub struct Buggify {
    pub config: FaultConfig,
    pub stats: BuggifyStats,
}

impl Buggify {
    pub fn new(config: FaultConfig) -> Self {
        Buggify {
            config,
            stats: BuggifyStats::default(),
        }
    }

    /// Returns true if the fault should be injected, using the configured
    /// probability for `fault_id`.
    pub fn check<R: Rng>(&mut self, rng: &mut R, fault_id: &str) -> bool {
        let prob = self.config.get(fault_id);
        self.check_with_prob(rng, fault_id, prob)
    }

    /// Like `check`, with an explicit probability. Still honours `enabled`.
    pub fn check_with_prob<R: Rng>(&mut self, rng: &mut R, fault_id: &str, prob: f64) -> bool {
        self.stats.record_check(fault_id);

        if !self.config.enabled || prob <= 0.0 {
            return false;
        }

        let random_value = rng.gen_range(0, 1_000_000) as f64 / 1_000_000.0;
        let triggered = random_value < prob.clamp(0.0, 1.0);

        if triggered {
            self.stats.record_trigger(fault_id);
        }

        triggered
    }
}

/// BUGGIFY macro - the main interface for fault injection
///
/// ```ignore
/// // Configured probability
/// if buggify!(&mut b, &mut rng, faults::ledger::EXEC_FAIL) { ... }
///
/// // Explicit probability override
/// if buggify!(&mut b, &mut rng, faults::ledger::EXEC_FAIL, 0.5) { ... }
/// ```
#[macro_export]
macro_rules! buggify {
    ($state:expr, $rng:expr, $fault_id:expr) => {
        ($state).check($rng, $fault_id)
    };
    ($state:expr, $rng:expr, $fault_id:expr, $prob:expr) => {
        ($state).check_with_prob($rng, $fault_id, $prob)
    };
}
