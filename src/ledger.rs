//! SQLite-backed certification ledger: storage, policy, counters and event
//! publication.  The registry operations live in [`crate::entity`],
//! [`crate::batch`], [`crate::certificate`] and [`crate::verify`].

use std::path::{Path, PathBuf};

use pbkdf2::pbkdf2_hmac;
use rusqlite::{params, Connection, OptionalExtension as _, Transaction, TransactionBehavior};
use secrecy::{ExposeSecret as _, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tracing::info;
use uuid::Uuid;

use crate::config::{DeploymentConfig, StageOrder};
use crate::error::{ProvcertError, Result, ResultExt as _};
use crate::events::{EventSink, JournalEntry};
use crate::journal;
use crate::model::{Batch, Certificate, Entity, StatusPipeline};

pub const LEDGER_SCHEMA_VERSION: i64 = 1;

pub(crate) const NEXT_BATCH_ID: &str = "next_batch_id";
pub(crate) const NEXT_CERTIFICATE_ID: &str = "next_certificate_id";

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode=WAL;
PRAGMA synchronous=FULL;
PRAGMA foreign_keys=ON;

CREATE TABLE IF NOT EXISTS meta(
  k TEXT PRIMARY KEY,
  v TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS entities(
  id TEXT PRIMARY KEY,
  mode TEXT NOT NULL,
  registered_at_utc TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS batches(
  id INTEGER PRIMARY KEY,
  origin TEXT NOT NULL,
  custodian TEXT NOT NULL REFERENCES entities(id),
  created_at_utc TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS certificates(
  id INTEGER PRIMARY KEY,
  issuer TEXT NOT NULL REFERENCES entities(id),
  prover TEXT NOT NULL REFERENCES entities(id),
  status TEXT NOT NULL,
  status_position INTEGER NOT NULL,
  batch_id INTEGER NOT NULL REFERENCES batches(id),
  signature BLOB NOT NULL,
  issued_at_utc TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS batch_certificates(
  batch_id INTEGER NOT NULL REFERENCES batches(id),
  position INTEGER NOT NULL,
  certificate_id INTEGER NOT NULL UNIQUE REFERENCES certificates(id),
  PRIMARY KEY(batch_id, position)
);

CREATE TABLE IF NOT EXISTS events(
  seq INTEGER PRIMARY KEY,
  ts_utc TEXT NOT NULL,
  kind TEXT NOT NULL,
  payload_json TEXT NOT NULL,
  payload_hash BLOB NOT NULL,
  prev_hash BLOB NOT NULL,
  entry_hash BLOB NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_certificates_batch ON certificates(batch_id);

CREATE TRIGGER IF NOT EXISTS entities_immutable BEFORE UPDATE ON entities
BEGIN SELECT RAISE(ABORT, 'entities are immutable'); END;
CREATE TRIGGER IF NOT EXISTS entities_permanent BEFORE DELETE ON entities
BEGIN SELECT RAISE(ABORT, 'entities are permanent'); END;
CREATE TRIGGER IF NOT EXISTS batches_immutable BEFORE UPDATE ON batches
BEGIN SELECT RAISE(ABORT, 'batches are immutable'); END;
CREATE TRIGGER IF NOT EXISTS batches_permanent BEFORE DELETE ON batches
BEGIN SELECT RAISE(ABORT, 'batches are permanent'); END;
CREATE TRIGGER IF NOT EXISTS certificates_immutable BEFORE UPDATE ON certificates
BEGIN SELECT RAISE(ABORT, 'certificates are immutable'); END;
CREATE TRIGGER IF NOT EXISTS certificates_permanent BEFORE DELETE ON certificates
BEGIN SELECT RAISE(ABORT, 'certificates are permanent'); END;
CREATE TRIGGER IF NOT EXISTS batch_certificates_append_only BEFORE UPDATE ON batch_certificates
BEGIN SELECT RAISE(ABORT, 'batch certificate lists are append-only'); END;
CREATE TRIGGER IF NOT EXISTS batch_certificates_permanent BEFORE DELETE ON batch_certificates
BEGIN SELECT RAISE(ABORT, 'batch certificate lists are append-only'); END;
CREATE TRIGGER IF NOT EXISTS events_append_only BEFORE UPDATE ON events
BEGIN SELECT RAISE(ABORT, 'events are append-only'); END;
CREATE TRIGGER IF NOT EXISTS events_permanent BEFORE DELETE ON events
BEGIN SELECT RAISE(ABORT, 'events are append-only'); END;
"#;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerMeta {
    pub ledger_id: Uuid,
    pub created_at_utc: String,
    pub schema_version: i64,
    pub sqlcipher_cipher_version: Option<String>,
    /// Pipeline fixed at creation; certificates store positions into it.
    pub status_pipeline: Vec<String>,
}

/// Rules a ledger instance enforces on top of referential integrity.
#[derive(Debug, Clone)]
pub struct LedgerPolicy {
    pub admin_id: Option<String>,
    pub pipeline: StatusPipeline,
    pub origin_vocabulary: Vec<String>,
    pub require_prover_custodian: bool,
    pub stage_order: StageOrder,
}

impl Default for LedgerPolicy {
    fn default() -> Self {
        Self {
            admin_id: None,
            pipeline: StatusPipeline::diamond(),
            origin_vocabulary: Vec::new(),
            require_prover_custodian: true,
            stage_order: StageOrder::Monotonic,
        }
    }
}

impl LedgerPolicy {
    pub fn from_deployment(cfg: &DeploymentConfig) -> Result<Self> {
        if let Some(admin) = &cfg.admin_id {
            crate::util::validate_entity_id(admin)
                .map_err(|e| ProvcertError::Config(format!("admin_id: {e}")))?;
        }
        Ok(Self {
            admin_id: cfg.admin_id.clone(),
            pipeline: cfg.pipeline()?,
            origin_vocabulary: cfg.origin_vocabulary.clone(),
            require_prover_custodian: cfg.require_prover_custodian,
            stage_order: cfg.stage_order,
        })
    }

    pub fn with_admin(mut self, admin_id: &str) -> Self {
        self.admin_id = Some(admin_id.to_string());
        self
    }

    /// Require `caller` to be the administrator, when one is configured.
    pub(crate) fn authorize_admin(&self, caller: &str, action: &'static str) -> Result<()> {
        match &self.admin_id {
            Some(admin) if admin != caller => Err(ProvcertError::Unauthorized {
                caller: caller.to_string(),
                action,
            }),
            _ => Ok(()),
        }
    }

    /// Issuance is open to the administrator and to the issuer itself.
    pub(crate) fn authorize_issuance(&self, caller: &str, issuer_id: &str) -> Result<()> {
        if caller == issuer_id {
            return Ok(());
        }
        self.authorize_admin(caller, "issue certificates for another issuer")
    }
}

/// Full JSON snapshot of a ledger for audit tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub format: String,
    pub exported_at_utc: String,
    pub meta: LedgerMeta,
    pub entities: Vec<Entity>,
    pub batches: Vec<Batch>,
    pub certificates: Vec<Certificate>,
    pub events: Vec<JournalEntry>,
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

pub struct Ledger {
    pub(crate) conn: Connection,
    pub(crate) policy: LedgerPolicy,
    meta: LedgerMeta,
    sinks: Vec<Box<dyn EventSink>>,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("meta", &self.meta)
            .field("policy", &self.policy)
            .field("sinks", &self.sinks.len())
            .finish_non_exhaustive()
    }
}

impl Ledger {
    pub fn create_new(
        db_path: &Path,
        db_key: Option<&SecretString>,
        policy: LedgerPolicy,
    ) -> Result<Self> {
        ensure_cipher_support(db_key)?;
        let salt_path = db_salt_path(db_path);
        if db_key.is_some() && salt_path.exists() {
            return Err(ProvcertError::Ledger(format!(
                "salt file {} already exists",
                salt_path.display()
            )));
        }
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                ProvcertError::Ledger(format!("create db parent dir {}: {e}", parent.display()))
            })?;
        }

        let conn = Connection::open(db_path)
            .map_err(|e| ProvcertError::Ledger(format!("open db {}: {e}", db_path.display())))?;
        // The salt lives beside the database: it is needed before any page
        // can be decrypted.
        let cipher_version = match db_key {
            Some(key) => {
                let salt = generate_db_salt();
                let cipher_version = apply_db_key(&conn, key, &salt)?;
                write_db_salt(&salt_path, &salt)?;
                Some(cipher_version)
            }
            None => None,
        };

        Self::initialize(conn, policy, cipher_version)
    }

    /// A throwaway ledger, mainly for tests and dry runs.
    pub fn open_in_memory(policy: LedgerPolicy) -> Result<Self> {
        let conn = Connection::open_in_memory().ctx_ledger("open in-memory db")?;
        Self::initialize(conn, policy, None)
    }

    fn initialize(
        conn: Connection,
        policy: LedgerPolicy,
        cipher_version: Option<String>,
    ) -> Result<Self> {
        conn.execute_batch(SCHEMA_SQL).ctx_ledger("create tables")?;

        let existing: Option<String> = conn
            .query_row("SELECT v FROM meta WHERE k='ledger_id'", [], |row| row.get(0))
            .optional()?;
        if existing.is_some() {
            return Err(ProvcertError::Ledger(
                "database already contains a ledger (use open_existing)".into(),
            ));
        }

        let meta = LedgerMeta {
            ledger_id: Uuid::new_v4(),
            created_at_utc: crate::util::now_utc_rfc3339(),
            schema_version: LEDGER_SCHEMA_VERSION,
            sqlcipher_cipher_version: cipher_version.clone(),
            status_pipeline: policy.pipeline.stages().to_vec(),
        };
        let pipeline_json =
            serde_json::to_string(&meta.status_pipeline).ctx_ledger("serialize pipeline")?;

        let put = |k: &str, v: String| -> Result<()> {
            conn.execute("INSERT INTO meta(k,v) VALUES (?1,?2)", params![k, v])?;
            Ok(())
        };
        put("ledger_id", meta.ledger_id.to_string())?;
        put("created_at_utc", meta.created_at_utc.clone())?;
        put("schema_version", meta.schema_version.to_string())?;
        put("status_pipeline", pipeline_json)?;
        put(NEXT_BATCH_ID, "0".into())?;
        put(NEXT_CERTIFICATE_ID, "0".into())?;
        if let Some(cv) = cipher_version {
            put("sqlcipher_cipher_version", cv)?;
        }

        info!(ledger_id = %meta.ledger_id, stages = meta.status_pipeline.len(), "ledger created");
        Ok(Self {
            conn,
            policy,
            meta,
            sinks: Vec::new(),
        })
    }

    pub fn open_existing(
        db_path: &Path,
        db_key: Option<&SecretString>,
        policy: LedgerPolicy,
    ) -> Result<Self> {
        ensure_cipher_support(db_key)?;
        if !db_path.exists() {
            return Err(ProvcertError::Ledger(format!(
                "ledger database {} does not exist",
                db_path.display()
            )));
        }
        let conn = Connection::open(db_path)
            .map_err(|e| ProvcertError::Ledger(format!("open db {}: {e}", db_path.display())))?;
        let cipher_version = match db_key {
            Some(key) => {
                let salt = read_db_salt(&db_salt_path(db_path))?;
                Some(apply_db_key(&conn, key, &salt)?)
            }
            None => None,
        };
        conn.execute_batch("PRAGMA foreign_keys=ON;")
            .ctx_ledger("enable foreign keys")?;

        let ledger_id: String = conn
            .query_row("SELECT v FROM meta WHERE k='ledger_id'", [], |row| row.get(0))
            .ctx_ledger("read ledger_id")?;
        let created_at_utc: String = conn
            .query_row("SELECT v FROM meta WHERE k='created_at_utc'", [], |row| row.get(0))
            .ctx_ledger("read created_at_utc")?;
        let schema_version: i64 = conn
            .query_row("SELECT v FROM meta WHERE k='schema_version'", [], |row| {
                row.get::<_, String>(0)
            })
            .ctx_ledger("read schema_version")?
            .parse()
            .ctx_ledger("parse schema_version")?;

        if schema_version != LEDGER_SCHEMA_VERSION {
            return Err(ProvcertError::Ledger(format!(
                "unsupported schema_version {schema_version} (expected {LEDGER_SCHEMA_VERSION})"
            )));
        }

        let status_pipeline: Vec<String> = serde_json::from_str(
            &conn
                .query_row("SELECT v FROM meta WHERE k='status_pipeline'", [], |row| {
                    row.get::<_, String>(0)
                })
                .ctx_ledger("read status_pipeline")?,
        )
        .ctx_ledger("parse status_pipeline")?;
        if status_pipeline.as_slice() != policy.pipeline.stages() {
            return Err(ProvcertError::Ledger(format!(
                "configured status pipeline {:?} does not match the ledger's {:?}",
                policy.pipeline.stages(),
                status_pipeline
            )));
        }

        let stored_cipher: Option<String> = conn
            .query_row("SELECT v FROM meta WHERE k='sqlcipher_cipher_version'", [], |row| {
                row.get(0)
            })
            .optional()?;

        let meta = LedgerMeta {
            ledger_id: Uuid::parse_str(&ledger_id).ctx_ledger("parse ledger_id uuid")?,
            created_at_utc,
            schema_version,
            sqlcipher_cipher_version: cipher_version.or(stored_cipher),
            status_pipeline,
        };
        Ok(Self {
            conn,
            policy,
            meta,
            sinks: Vec::new(),
        })
    }

    pub fn meta(&self) -> &LedgerMeta {
        &self.meta
    }

    pub fn policy(&self) -> &LedgerPolicy {
        &self.policy
    }

    /// Register a subscriber for events committed from now on.
    pub fn subscribe(&mut self, sink: Box<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub(crate) fn publish(&mut self, entry: &JournalEntry) {
        info!(seq = entry.seq, event = entry.event.kind(), entry_hash = %entry.entry_hash_hex, "event committed");
        for sink in &mut self.sinks {
            sink.deliver(entry);
        }
    }

    /// Journal entries after `after_seq` (0 for all), oldest first.
    pub fn events_since(&self, after_seq: i64) -> Result<Vec<JournalEntry>> {
        journal::entries_since(&self.conn, after_seq)
    }

    /// Verify the event journal's hash chain; returns the entry count.
    pub fn verify_journal(&self) -> Result<usize> {
        journal::verify(&self.conn)
    }

    pub fn snapshot(&self) -> Result<LedgerSnapshot> {
        Ok(LedgerSnapshot {
            format: "provcert-ledger-snapshot-v1".to_string(),
            exported_at_utc: crate::util::now_utc_rfc3339(),
            meta: self.meta.clone(),
            entities: self.list_entities()?,
            batches: self.list_batches()?,
            certificates: self.list_certificates()?,
            events: self.events_since(0)?,
        })
    }
}

// ---------------------------------------------------------------------------
// Transaction and counter helpers
// ---------------------------------------------------------------------------

/// Mutations take the write lock up front so that checks and writes see the
/// same state.
pub(crate) fn begin_write(conn: &mut Connection) -> Result<Transaction<'_>> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
        .ctx_ledger("begin tx")
}

pub(crate) fn read_counter(conn: &Connection, key: &str) -> Result<u64> {
    conn.query_row("SELECT v FROM meta WHERE k=?1", [key], |row| row.get::<_, String>(0))
        .ctx_ledger(&format!("read {key}"))?
        .parse()
        .ctx_ledger(&format!("parse {key}"))
}

/// Allocate the next id from `key` and advance the counter.
pub(crate) fn allocate_id(tx: &Transaction<'_>, key: &str) -> Result<u64> {
    let id = read_counter(tx, key)?;
    tx.execute(
        "UPDATE meta SET v=?2 WHERE k=?1",
        params![key, (id + 1).to_string()],
    )
    .ctx_ledger(&format!("advance {key}"))?;
    Ok(id)
}

/// SQLite integers are signed.  An id above `i64::MAX` names no row, so
/// lookups treat `None` as "not found".
pub(crate) fn sql_id(id: u64) -> Option<i64> {
    i64::try_from(id).ok()
}

/// [`sql_id`] for ids about to be written; counters never get that far.
pub(crate) fn sql_new_id(id: u64) -> Result<i64> {
    sql_id(id).ok_or_else(|| ProvcertError::Ledger(format!("id {id} exceeds SQLite integer range")))
}

// ---------------------------------------------------------------------------
// Export
// ---------------------------------------------------------------------------

/// Export the full ledger (meta, records, journal) to a JSON file.
pub fn export_ledger_json(ledger: &Ledger, out_path: &Path) -> Result<()> {
    let snapshot = ledger.snapshot()?;
    let json = serde_json::to_vec_pretty(&snapshot).ctx_ledger("serialize ledger export")?;
    std::fs::write(out_path, json)
        .map_err(|e| ProvcertError::Ledger(format!("write export {}: {e}", out_path.display())))?;
    info!(
        path = %out_path.display(),
        certificates = snapshot.certificates.len(),
        events = snapshot.events.len(),
        "ledger exported"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// SQLCipher helpers
// ---------------------------------------------------------------------------

/// Keys are only usable when rusqlite is built against SQLCipher.
fn ensure_cipher_support(db_key: Option<&SecretString>) -> Result<()> {
    if db_key.is_some() && !cfg!(feature = "sqlcipher") {
        return Err(ProvcertError::Config(
            "a database key was supplied but this build has no SQLCipher support \
             (rebuild with the `sqlcipher` feature)"
                .into(),
        ));
    }
    Ok(())
}

/// Key the connection and confirm the key opens the file.  Returns the
/// SQLCipher version.
fn apply_db_key(conn: &Connection, key: &SecretString, salt: &[u8]) -> Result<String> {
    let derived = derive_db_key(key.expose_secret(), salt);
    // PRAGMA values cannot be bound; the raw key is hex only.
    conn.execute_batch(&format!("PRAGMA key = \"x'{}'\";", hex::encode(derived)))
        .ctx_ledger("apply database key")?;
    conn.execute_batch("PRAGMA cipher_compatibility = 4;")
        .ctx_ledger("set cipher compatibility")?;

    let cipher_version: String = conn
        .query_row("PRAGMA cipher_version;", [], |row| row.get(0))
        .optional()
        .ctx_ledger("read cipher_version")?
        .ok_or_else(|| ProvcertError::Ledger("SQLCipher not active (cipher_version empty)".into()))?;

    // A wrong key only shows up on the first page read.
    conn.query_row("SELECT COUNT(*) FROM sqlite_master", [], |row| row.get::<_, i64>(0))
        .ctx_ledger("database key rejected")?;

    info!(sqlcipher_cipher_version = %cipher_version, "SQLCipher keyed");
    Ok(cipher_version)
}

/// Where the key-derivation salt of an encrypted ledger is kept.
pub fn db_salt_path(db_path: &Path) -> PathBuf {
    let mut path = db_path.as_os_str().to_owned();
    path.push(".salt");
    PathBuf::from(path)
}

fn read_db_salt(path: &Path) -> Result<Vec<u8>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ProvcertError::Ledger(format!("read salt file {}: {e}", path.display())))?;
    let salt = hex::decode(text.trim()).ctx_ledger("decode salt file")?;
    if salt.len() != DB_SALT_LEN {
        return Err(ProvcertError::Ledger(format!(
            "salt file {} holds {} bytes, expected {DB_SALT_LEN}",
            path.display(),
            salt.len()
        )));
    }
    Ok(salt)
}

fn write_db_salt(path: &Path, salt: &[u8]) -> Result<()> {
    std::fs::write(path, format!("{}\n", hex::encode(salt)))
        .map_err(|e| ProvcertError::Ledger(format!("write salt file {}: {e}", path.display())))
}

const DB_SALT_LEN: usize = 16;

fn derive_db_key(passphrase: &str, salt: &[u8]) -> [u8; 32] {
    const ITERATIONS: u32 = 100_000;
    let mut out = [0u8; 32];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, ITERATIONS, &mut out);
    out
}

fn generate_db_salt() -> [u8; DB_SALT_LEN] {
    use rand::RngCore as _;
    let mut salt = [0u8; DB_SALT_LEN];
    rand::rng().fill_bytes(&mut salt);
    salt
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
