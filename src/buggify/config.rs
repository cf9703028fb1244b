//! Fault probabilities for BUGGIFY.

use super::faults::ledger;
use std::collections::HashMap;

/// Per-fault probabilities plus a global on/off switch.
#[derive(Debug, Clone)]
pub struct FaultConfig {
    pub enabled: bool,
    /// Scales every configured probability (clamped to 1.0 after scaling).
    pub global_multiplier: f64,
    probabilities: HashMap<String, f64>,
}

impl Default for FaultConfig {
    fn default() -> Self {
        Self::disabled()
    }
}

impl FaultConfig {
    /// Enabled, but with no faults configured.
    pub fn new() -> Self {
        FaultConfig {
            enabled: true,
            global_multiplier: 1.0,
            probabilities: HashMap::new(),
        }
    }

    pub fn disabled() -> Self {
        FaultConfig {
            enabled: false,
            ..Self::new()
        }
    }

    /// Occasional transient failures; most batches land on the first attempt.
    pub fn moderate() -> Self {
        Self::new()
            .with(ledger::EXEC_FAIL, 0.05)
            .with(ledger::EXEC_TIMEOUT, 0.02)
            .with(ledger::SESSION_OPEN_FAIL, 0.02)
            .with(ledger::LIST_FAIL, 0.01)
            .with(ledger::CREATE_FAIL, 0.01)
            .with(ledger::SESSION_EXPIRED, 0.01)
    }

    /// Enough failures that some batches exhaust the retry budget.
    pub fn chaos() -> Self {
        Self::new()
            .with(ledger::EXEC_FAIL, 0.30)
            .with(ledger::EXEC_TIMEOUT, 0.10)
            .with(ledger::SESSION_OPEN_FAIL, 0.15)
            .with(ledger::LIST_FAIL, 0.05)
            .with(ledger::CREATE_FAIL, 0.05)
            .with(ledger::SESSION_EXPIRED, 0.05)
    }

    pub fn with(mut self, fault_id: &str, probability: f64) -> Self {
        self.probabilities
            .insert(fault_id.to_string(), probability.clamp(0.0, 1.0));
        self
    }

    /// Effective probability for a fault (0.0 when disabled or unknown).
    pub fn get(&self, fault_id: &str) -> f64 {
        if !self.enabled {
            return 0.0;
        }
        let base = self.probabilities.get(fault_id).copied().unwrap_or(0.0);
        (base * self.global_multiplier).clamp(0.0, 1.0)
    }
}
