//! Durable append-only ledger on the local filesystem.
//!
//! ## Layout
//!
//! ```text
//! <base>/
//!   defaultdb/ledger.log
//!   log_2024_03/ledger.log
//! ```
//!
//! Each `ledger.log` is a sequence of transaction frames:
//!
//! ```text
//! ┌──────────────────────────────────┐
//! │ data_length: u32 LE              │
//! │ tx_id: u64 LE                    │
//! │ checksum: u32 LE (CRC32 of data) │
//! │ data: bincode(Vec<WriteOp>)      │
//! └──────────────────────────────────┘
//! ```
//!
//! A transaction is acknowledged only after its frame is fsynced. On open the
//! log is scanned; the scan stops at the first truncated or corrupt frame and
//! the file is cut back to the last good frame, so a torn write from a crash
//! never resurfaces.

use super::{
    validate_database_name, validate_ops, Credentials, DatabaseInfo, LedgerError, LedgerFuture,
    LedgerStore, SessionId, TxId, WriteOp, SYSTEM_DATABASE,
};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, warn};

pub const LEDGER_FILE: &str = "ledger.log";
/// Frame overhead: data_length(4) + tx_id(8) + checksum(4) = 16 bytes
pub const FRAME_OVERHEAD: usize = 16;

/// One decoded frame.
#[derive(Debug, Clone)]
pub struct TxFrame {
    pub tx_id: TxId,
    pub ops: Vec<WriteOp>,
}

impl TxFrame {
    pub fn encode(&self) -> Result<Vec<u8>, LedgerError> {
        let data = bincode::serialize(&self.ops)
            .map_err(|e| LedgerError::Corruption(format!("serialize: {}", e)))?;
        let data_len = u32::try_from(data.len())
            .map_err(|_| LedgerError::Rejected("transaction too large".to_string()))?;
        let checksum = crc32fast::hash(&data);

        let mut buf = Vec::with_capacity(FRAME_OVERHEAD + data.len());
        buf.extend_from_slice(&data_len.to_le_bytes());
        buf.extend_from_slice(&self.tx_id.0.to_le_bytes());
        buf.extend_from_slice(&checksum.to_le_bytes());
        buf.extend_from_slice(&data);
        Ok(buf)
    }

    /// Decode a frame from the front of `data`. Returns None if the frame is
    /// truncated or fails its checksum.
    pub fn decode(data: &[u8]) -> Option<(Self, usize)> {
        if data.len() < FRAME_OVERHEAD {
            return None;
        }

        let data_len = u32::from_le_bytes(data[0..4].try_into().ok()?) as usize;
        let tx_id = u64::from_le_bytes(data[4..12].try_into().ok()?);
        let checksum = u32::from_le_bytes(data[12..16].try_into().ok()?);

        let total = FRAME_OVERHEAD.checked_add(data_len)?;
        if data.len() < total {
            return None;
        }

        let payload = &data[FRAME_OVERHEAD..total];
        if crc32fast::hash(payload) != checksum {
            return None;
        }

        let ops: Vec<WriteOp> = bincode::deserialize(payload).ok()?;
        Some((
            TxFrame {
                tx_id: TxId(tx_id),
                ops,
            },
            total,
        ))
    }
}

/// Read every intact frame from a ledger file image.
/// Returns the frames and the byte length they cover.
pub fn scan_frames(data: &[u8]) -> (Vec<TxFrame>, usize) {
    let mut frames = Vec::new();
    let mut offset = 0;
    while let Some((frame, used)) = TxFrame::decode(&data[offset..]) {
        frames.push(frame);
        offset += used;
    }
    (frames, offset)
}

/// Open database: append handle plus what validation needs.
struct OpenDatabase {
    file: tokio::fs::File,
    last_tx: u64,
    keys: HashSet<Bytes>,
}

/// Local filesystem ledger store.
#[derive(Clone)]
pub struct LocalFsLedgerStore {
    inner: Arc<Inner>,
}

struct Inner {
    base_path: PathBuf,
    credentials: Credentials,
    sessions: Mutex<HashMap<SessionId, String>>,
    next_session: AtomicU64,
    /// Append handles are opened lazily and shared by all sessions on a database.
    databases: tokio::sync::Mutex<HashMap<String, OpenDatabase>>,
}

impl LocalFsLedgerStore {
    /// Open (or initialise) a store rooted at `base_path`. The system
    /// database is created if missing.
    pub async fn open(
        base_path: impl Into<PathBuf>,
        credentials: Credentials,
    ) -> Result<Self, LedgerError> {
        let base_path = base_path.into();
        tokio::fs::create_dir_all(base_path.join(SYSTEM_DATABASE)).await?;
        let system_log = base_path.join(SYSTEM_DATABASE).join(LEDGER_FILE);
        if !tokio::fs::try_exists(&system_log).await? {
            tokio::fs::File::create(&system_log).await?;
        }

        Ok(LocalFsLedgerStore {
            inner: Arc::new(Inner {
                base_path,
                credentials,
                sessions: Mutex::new(HashMap::new()),
                next_session: AtomicU64::new(1),
                databases: tokio::sync::Mutex::new(HashMap::new()),
            }),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.inner.base_path
    }

    fn ledger_path(&self, database: &str) -> PathBuf {
        self.inner.base_path.join(database).join(LEDGER_FILE)
    }

    /// Read back every committed transaction of a database.
    pub async fn read_transactions(&self, database: &str) -> Result<Vec<TxFrame>, LedgerError> {
        validate_database_name(database)?;
        let data = tokio::fs::read(self.ledger_path(database)).await?;
        Ok(scan_frames(&data).0)
    }

    fn session_database(&self, session: SessionId) -> Result<String, LedgerError> {
        self.inner
            .sessions
            .lock()
            .get(&session)
            .cloned()
            .ok_or(LedgerError::SessionNotFound(session))
    }

    /// Scan an existing ledger, cut off any torn tail, and open it for append.
    async fn load_database(&self, database: &str) -> Result<OpenDatabase, LedgerError> {
        let path = self.ledger_path(database);
        let data = tokio::fs::read(&path).await?;
        let (frames, valid_len) = scan_frames(&data);

        if valid_len < data.len() {
            warn!(
                "Ledger {} has {} trailing bytes after tx {}, truncating",
                database,
                data.len() - valid_len,
                frames.last().map(|f| f.tx_id.0).unwrap_or(0)
            );
        }

        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .await?;
        file.set_len(valid_len as u64).await?;
        file.seek(std::io::SeekFrom::Start(valid_len as u64)).await?;

        let last_tx = frames.last().map(|f| f.tx_id.0).unwrap_or(0);
        let keys = frames
            .iter()
            .flat_map(|f| f.ops.iter().map(|op| op.key().clone()))
            .collect();

        debug!(
            "Loaded ledger {}: {} transactions, last tx {}",
            database,
            frames.len(),
            last_tx
        );

        Ok(OpenDatabase {
            file,
            last_tx,
            keys,
        })
    }
}

impl LedgerStore for LocalFsLedgerStore {
    fn open_session<'a>(
        &'a self,
        credentials: &'a Credentials,
        database: &'a str,
    ) -> LedgerFuture<'a, SessionId> {
        Box::pin(async move {
            if *credentials != self.inner.credentials {
                return Err(LedgerError::Unauthorized(credentials.username.clone()));
            }
            validate_database_name(database)
                .map_err(|_| LedgerError::DatabaseNotFound(database.to_string()))?;
            if !tokio::fs::try_exists(self.ledger_path(database)).await? {
                return Err(LedgerError::DatabaseNotFound(database.to_string()));
            }

            let id = SessionId(self.inner.next_session.fetch_add(1, Ordering::SeqCst));
            self.inner.sessions.lock().insert(id, database.to_string());
            Ok(id)
        })
    }

    fn exec_all<'a>(&'a self, session: SessionId, ops: &'a [WriteOp]) -> LedgerFuture<'a, TxId> {
        Box::pin(async move {
            let name = self.session_database(session)?;

            let mut databases = self.inner.databases.lock().await;
            if !databases.contains_key(&name) {
                let loaded = self.load_database(&name).await?;
                databases.insert(name.clone(), loaded);
            }
            let db = databases
                .get_mut(&name)
                .ok_or_else(|| LedgerError::DatabaseNotFound(name.clone()))?;

            validate_ops(ops, |k| db.keys.contains(k))?;

            let frame = TxFrame {
                tx_id: TxId(db.last_tx + 1),
                ops: ops.to_vec(),
            };
            let encoded = frame.encode()?;

            if let Err(e) = write_durably(&mut db.file, &encoded).await {
                // The tail may now hold a partial frame; reload on next use.
                databases.remove(&name);
                return Err(e);
            }

            db.last_tx = frame.tx_id.0;
            db.keys.extend(frame.ops.into_iter().map(|op| match op {
                WriteOp::Set { key, .. } | WriteOp::Reference { key, .. } => key,
            }));
            Ok(TxId(db.last_tx))
        })
    }

    fn list_databases(&self, session: SessionId) -> LedgerFuture<'_, Vec<DatabaseInfo>> {
        Box::pin(async move {
            self.session_database(session)?;

            let mut names = Vec::new();
            let mut entries = tokio::fs::read_dir(&self.inner.base_path).await?;
            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_type().await?.is_dir() {
                    continue;
                }
                let name = entry.file_name().to_string_lossy().to_string();
                let loaded = tokio::fs::try_exists(entry.path().join(LEDGER_FILE)).await?;
                names.push(DatabaseInfo { name, loaded });
            }
            names.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(names)
        })
    }

    fn create_database<'a>(&'a self, session: SessionId, name: &'a str) -> LedgerFuture<'a, ()> {
        Box::pin(async move {
            self.session_database(session)?;
            validate_database_name(name)?;

            let dir = self.inner.base_path.join(name);
            if tokio::fs::try_exists(dir.join(LEDGER_FILE)).await? {
                return Err(LedgerError::DatabaseExists(name.to_string()));
            }
            tokio::fs::create_dir_all(&dir).await?;
            let file = tokio::fs::File::create(dir.join(LEDGER_FILE)).await?;
            file.sync_all().await?;
            Ok(())
        })
    }

    fn close_session(&self, session: SessionId) -> LedgerFuture<'_, ()> {
        Box::pin(async move {
            self.inner
                .sessions
                .lock()
                .remove(&session)
                .map(|_| ())
                .ok_or(LedgerError::SessionNotFound(session))
        })
    }
}

async fn write_durably(file: &mut tokio::fs::File, data: &[u8]) -> Result<(), LedgerError> {
    file.write_all(data).await?;
    file.flush().await?;
    file.sync_data().await?;
    Ok(())
}
