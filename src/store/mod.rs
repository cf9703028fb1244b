//! Ledger Store Abstraction
//!
//! The durable store is an append-only, session-oriented ledger in the style
//! of immudb: a client opens a session against one database, submits
//! multi-operation transactions that are applied atomically, and can list and
//! create databases.
//!
//! Implementations:
//! - `InMemoryLedgerStore`: for unit tests, DST and `--store memory`
//! - `LocalFsLedgerStore`: durable append-only log per database
//! - `SimulatedLedgerStore`: fault-injecting wrapper around another store

pub mod local;
pub mod memory;
pub mod simulated;

pub use local::LocalFsLedgerStore;
pub use memory::{CommittedTx, InMemoryLedgerStore};
pub use simulated::{SimulatedLedgerStore, SimulatedStoreConfig, SimulatedStoreStats};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::Error as IoError;
use std::pin::Pin;
use std::sync::Arc;

/// Database every server has; administrative sessions open against it.
pub const SYSTEM_DATABASE: &str = "defaultdb";

/// Handle returned by `open_session`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

/// Identifier of a committed transaction, increasing per database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TxId(pub u64);

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

impl std::fmt::Display for TxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Result of `list_databases`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseInfo {
    pub name: String,
    /// Only loaded databases accept sessions.
    pub loaded: bool,
}

/// A single operation inside an atomic transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteOp {
    /// Plain key/value write.
    Set { key: Bytes, value: Bytes },
    /// Secondary key pointing at an existing (or same-transaction) key.
    Reference { key: Bytes, referenced_key: Bytes },
}

impl WriteOp {
    pub fn key(&self) -> &Bytes {
        match self {
            WriteOp::Set { key, .. } | WriteOp::Reference { key, .. } => key,
        }
    }

    pub fn is_reference(&self) -> bool {
        matches!(self, WriteOp::Reference { .. })
    }
}

/// Error type for ledger operations
#[derive(Debug)]
pub enum LedgerError {
    /// Wrong username or password
    Unauthorized(String),
    /// Database does not exist or is not loaded
    DatabaseNotFound(String),
    /// Database already exists
    DatabaseExists(String),
    /// Session unknown, closed, or expired
    SessionNotFound(SessionId),
    /// Transaction rejected before applying anything (empty, dangling reference...)
    InvalidTransaction(String),
    /// Store refused or failed the call
    Rejected(String),
    /// Call did not complete in time
    Timeout(String),
    /// Store unreachable
    Unavailable(String),
    /// On-disk data failed validation
    Corruption(String),
    /// I/O error
    Io(IoError),
}

impl std::fmt::Display for LedgerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LedgerError::Unauthorized(user) => write!(f, "invalid credentials for user {}", user),
            LedgerError::DatabaseNotFound(name) => write!(f, "database not found: {}", name),
            LedgerError::DatabaseExists(name) => write!(f, "database already exists: {}", name),
            LedgerError::SessionNotFound(id) => write!(f, "no such session: {}", id),
            LedgerError::InvalidTransaction(msg) => write!(f, "invalid transaction: {}", msg),
            LedgerError::Rejected(msg) => write!(f, "ledger rejected request: {}", msg),
            LedgerError::Timeout(msg) => write!(f, "ledger timeout: {}", msg),
            LedgerError::Unavailable(msg) => write!(f, "ledger unavailable: {}", msg),
            LedgerError::Corruption(msg) => write!(f, "ledger corruption: {}", msg),
            LedgerError::Io(e) => write!(f, "ledger I/O error: {}", e),
        }
    }
}

impl std::error::Error for LedgerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LedgerError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<IoError> for LedgerError {
    fn from(e: IoError) -> Self {
        LedgerError::Io(e)
    }
}

/// Boxed future returned by every `LedgerStore` call.
pub type LedgerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, LedgerError>> + Send + 'a>>;

/// Session-oriented ledger store.
///
/// Follows the boxed-future style of the rest of the I/O layer so the trait
/// stays object safe.
pub trait LedgerStore: Send + Sync + 'static {
    /// Authenticate and open a session bound to `database`.
    fn open_session<'a>(
        &'a self,
        credentials: &'a Credentials,
        database: &'a str,
    ) -> LedgerFuture<'a, SessionId>;

    /// Apply all operations atomically: either every op is committed under
    /// one transaction id, or none is.
    fn exec_all<'a>(&'a self, session: SessionId, ops: &'a [WriteOp]) -> LedgerFuture<'a, TxId>;

    /// List the databases known to the server.
    fn list_databases(&self, session: SessionId) -> LedgerFuture<'_, Vec<DatabaseInfo>>;

    /// Create a new, loaded, empty database.
    fn create_database<'a>(&'a self, session: SessionId, name: &'a str) -> LedgerFuture<'a, ()>;

    /// Close a session. Closing an unknown session is an error.
    fn close_session(&self, session: SessionId) -> LedgerFuture<'_, ()>;
}

impl<S: LedgerStore + ?Sized> LedgerStore for Arc<S> {
    fn open_session<'a>(
        &'a self,
        credentials: &'a Credentials,
        database: &'a str,
    ) -> LedgerFuture<'a, SessionId> {
        (**self).open_session(credentials, database)
    }

    fn exec_all<'a>(&'a self, session: SessionId, ops: &'a [WriteOp]) -> LedgerFuture<'a, TxId> {
        (**self).exec_all(session, ops)
    }

    fn list_databases(&self, session: SessionId) -> LedgerFuture<'_, Vec<DatabaseInfo>> {
        (**self).list_databases(session)
    }

    fn create_database<'a>(&'a self, session: SessionId, name: &'a str) -> LedgerFuture<'a, ()> {
        (**self).create_database(session, name)
    }

    fn close_session(&self, session: SessionId) -> LedgerFuture<'_, ()> {
        (**self).close_session(session)
    }
}

/// Check a transaction before applying it.
///
/// Rejects empty transactions, empty keys, and references whose target is
/// neither already stored nor written earlier in the same transaction.
pub(crate) fn validate_ops(
    ops: &[WriteOp],
    mut key_exists: impl FnMut(&[u8]) -> bool,
) -> Result<(), LedgerError> {
    if ops.is_empty() {
        return Err(LedgerError::InvalidTransaction(
            "no operations".to_string(),
        ));
    }

    let mut written: std::collections::HashSet<&[u8]> = std::collections::HashSet::new();
    for (i, op) in ops.iter().enumerate() {
        if op.key().is_empty() {
            return Err(LedgerError::InvalidTransaction(format!(
                "operation {} has an empty key",
                i
            )));
        }
        if let WriteOp::Reference { referenced_key, .. } = op {
            let target = referenced_key.as_ref();
            if !written.contains(target) && !key_exists(target) {
                return Err(LedgerError::InvalidTransaction(format!(
                    "operation {} references missing key {}",
                    i,
                    String::from_utf8_lossy(target)
                )));
            }
        }
        written.insert(op.key().as_ref());
    }
    Ok(())
}

/// Database names become directory names on disk; keep them boring.
pub(crate) fn validate_database_name(name: &str) -> Result<(), LedgerError> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(LedgerError::Rejected(format!(
            "invalid database name: {:?}",
            name
        )))
    }
}
