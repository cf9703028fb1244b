//! Named fault injection points.
//!
//! Fault IDs are plain strings so that stats can be keyed and summarized
//! without an enum per subsystem.

/// Faults injected at the ledger store boundary.
pub mod ledger {
    /// `exec_all` rejects the transaction (nothing applied).
    pub const EXEC_FAIL: &str = "ledger.exec_fail";
    /// `exec_all` times out before reaching the store (nothing applied).
    pub const EXEC_TIMEOUT: &str = "ledger.exec_timeout";
    /// `open_session` is refused.
    pub const SESSION_OPEN_FAIL: &str = "ledger.session_open_fail";
    /// `list_databases` fails.
    pub const LIST_FAIL: &str = "ledger.list_fail";
    /// `create_database` fails.
    pub const CREATE_FAIL: &str = "ledger.create_fail";
    /// The store drops the session between calls.
    pub const SESSION_EXPIRED: &str = "ledger.session_expired";
}

pub const ALL_FAULTS: &[&str] = &[
    ledger::EXEC_FAIL,
    ledger::EXEC_TIMEOUT,
    ledger::SESSION_OPEN_FAIL,
    ledger::LIST_FAIL,
    ledger::CREATE_FAIL,
    ledger::SESSION_EXPIRED,
];
