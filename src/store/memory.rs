//! In-memory ledger store for unit tests, DST and `--store memory`.

use super::{
    validate_database_name, validate_ops, Credentials, DatabaseInfo, LedgerError, LedgerFuture,
    LedgerStore, SessionId, TxId, WriteOp, SYSTEM_DATABASE,
};
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// A committed transaction as seen by tests.
#[derive(Debug, Clone, PartialEq)]
pub struct CommittedTx {
    pub id: TxId,
    pub ops: Vec<WriteOp>,
}

#[derive(Debug, Default)]
struct Database {
    loaded: bool,
    transactions: Vec<CommittedTx>,
    entries: HashMap<Bytes, Entry>,
}

#[derive(Debug, Clone)]
enum Entry {
    Value(Bytes),
    Reference(Bytes),
}

#[derive(Debug)]
struct State {
    users: HashMap<String, String>,
    databases: BTreeMap<String, Database>,
    sessions: HashMap<SessionId, String>,
    next_session: u64,
    available: bool,
}

/// In-memory ledger. Clones share the same state.
#[derive(Debug, Clone)]
pub struct InMemoryLedgerStore {
    state: Arc<RwLock<State>>,
}

impl Default for InMemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedgerStore {
    /// Store with the stock `immudb`/`immudb` admin account and the system
    /// database.
    pub fn new() -> Self {
        Self::with_credentials(&Credentials::new("immudb", "immudb"))
    }

    pub fn with_credentials(credentials: &Credentials) -> Self {
        let mut users = HashMap::new();
        users.insert(credentials.username.clone(), credentials.password.clone());

        let mut databases = BTreeMap::new();
        databases.insert(
            SYSTEM_DATABASE.to_string(),
            Database {
                loaded: true,
                ..Default::default()
            },
        );

        InMemoryLedgerStore {
            state: Arc::new(RwLock::new(State {
                users,
                databases,
                sessions: HashMap::new(),
                next_session: 1,
                available: true,
            })),
        }
    }

    /// Simulate the server going away (`false`) or coming back (`true`).
    /// Sessions do not survive an outage.
    pub fn set_available(&self, available: bool) {
        let mut state = self.state.write();
        state.available = available;
        if !available {
            state.sessions.clear();
        }
    }

    /// Register a database that exists but is not loaded.
    pub fn add_unloaded_database(&self, name: &str) {
        self.state.write().databases.insert(
            name.to_string(),
            Database {
                loaded: false,
                ..Default::default()
            },
        );
    }

    /// Forget every open session, as a server restart would.
    pub fn expire_sessions(&self) {
        self.state.write().sessions.clear();
    }

    pub fn open_session_count(&self) -> usize {
        self.state.read().sessions.len()
    }

    pub fn database_names(&self) -> Vec<String> {
        self.state.read().databases.keys().cloned().collect()
    }

    /// Committed transactions of a database, in commit order.
    pub fn transactions(&self, database: &str) -> Vec<CommittedTx> {
        self.state
            .read()
            .databases
            .get(database)
            .map(|db| db.transactions.clone())
            .unwrap_or_default()
    }

    /// Read a key, following references to the value they point at.
    pub fn get(&self, database: &str, key: &[u8]) -> Option<Bytes> {
        let state = self.state.read();
        let db = state.databases.get(database)?;
        let mut current = db.entries.get(key)?;
        // References point at plain keys, but guard against ref-to-ref chains.
        for _ in 0..8 {
            match current {
                Entry::Value(v) => return Some(v.clone()),
                Entry::Reference(target) => current = db.entries.get(target)?,
            }
        }
        None
    }

    fn check_available(state: &State) -> Result<(), LedgerError> {
        if state.available {
            Ok(())
        } else {
            Err(LedgerError::Unavailable("connection refused".to_string()))
        }
    }

    fn session_database(state: &State, session: SessionId) -> Result<String, LedgerError> {
        state
            .sessions
            .get(&session)
            .cloned()
            .ok_or(LedgerError::SessionNotFound(session))
    }
}

impl LedgerStore for InMemoryLedgerStore {
    fn open_session<'a>(
        &'a self,
        credentials: &'a Credentials,
        database: &'a str,
    ) -> LedgerFuture<'a, SessionId> {
        Box::pin(async move {
            let mut state = self.state.write();
            Self::check_available(&state)?;

            if state.users.get(&credentials.username) != Some(&credentials.password) {
                return Err(LedgerError::Unauthorized(credentials.username.clone()));
            }
            match state.databases.get(database) {
                Some(db) if db.loaded => {}
                _ => return Err(LedgerError::DatabaseNotFound(database.to_string())),
            }

            let id = SessionId(state.next_session);
            state.next_session += 1;
            state.sessions.insert(id, database.to_string());
            Ok(id)
        })
    }

    fn exec_all<'a>(&'a self, session: SessionId, ops: &'a [WriteOp]) -> LedgerFuture<'a, TxId> {
        Box::pin(async move {
            let mut state = self.state.write();
            Self::check_available(&state)?;
            let name = Self::session_database(&state, session)?;
            let db = state
                .databases
                .get_mut(&name)
                .ok_or_else(|| LedgerError::DatabaseNotFound(name.clone()))?;

            validate_ops(ops, |k| db.entries.contains_key(k))?;

            let id = TxId(db.transactions.len() as u64 + 1);
            for op in ops {
                match op {
                    WriteOp::Set { key, value } => {
                        db.entries.insert(key.clone(), Entry::Value(value.clone()));
                    }
                    WriteOp::Reference {
                        key,
                        referenced_key,
                    } => {
                        db.entries
                            .insert(key.clone(), Entry::Reference(referenced_key.clone()));
                    }
                }
            }
            db.transactions.push(CommittedTx {
                id,
                ops: ops.to_vec(),
            });
            Ok(id)
        })
    }

    fn list_databases(&self, session: SessionId) -> LedgerFuture<'_, Vec<DatabaseInfo>> {
        Box::pin(async move {
            let state = self.state.read();
            Self::check_available(&state)?;
            Self::session_database(&state, session)?;
            Ok(state
                .databases
                .iter()
                .map(|(name, db)| DatabaseInfo {
                    name: name.clone(),
                    loaded: db.loaded,
                })
                .collect())
        })
    }

    fn create_database<'a>(&'a self, session: SessionId, name: &'a str) -> LedgerFuture<'a, ()> {
        Box::pin(async move {
            let mut state = self.state.write();
            Self::check_available(&state)?;
            Self::session_database(&state, session)?;
            validate_database_name(name)?;

            if state.databases.contains_key(name) {
                return Err(LedgerError::DatabaseExists(name.to_string()));
            }
            state.databases.insert(
                name.to_string(),
                Database {
                    loaded: true,
                    ..Default::default()
                },
            );
            Ok(())
        })
    }

    fn close_session(&self, session: SessionId) -> LedgerFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.write();
            Self::check_available(&state)?;
            state
                .sessions
                .remove(&session)
                .map(|_| ())
                .ok_or(LedgerError::SessionNotFound(session))
        })
    }
}
