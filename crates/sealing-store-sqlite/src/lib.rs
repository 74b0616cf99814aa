use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use rusqlite::types::Type;
use rusqlite::{
    params, params_from_iter, Connection, ErrorCode, OptionalExtension, Row, Transaction,
    TransactionBehavior,
};
use sealing_core::{
    execute_transition, restore_input_order, verify_chain, ActorRef, AuditAction, AuditEntry,
    AuditEntryId, AuditLedger, CaseDirectory, CaseFile, CaseId, CriminalRecord,
    CriminalRecordDetail, HydratedRecords, LedgerTip, LedgerVerification, LinkedRecordIds,
    RecordCategory, RecordId, SealError, SealRequest, SealingTransaction, SubstanceRecord,
    SubstanceRecordDetail, SupervisionRecord, SupervisionRecordDetail, TriState,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime};
use tracing::{debug, info, warn};
use ulid::Ulid;

const LATEST_SCHEMA_VERSION: i64 = 2;

pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

const HYDRATE_CHUNK_SIZE: usize = 500;

const LEDGER_EXPORT_FILE: &str = "seal_audit.ndjson";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS cases (
  case_id TEXT PRIMARY KEY,
  birth_date TEXT,
  sealed INTEGER CHECK (sealed IN (0, 1))
);

CREATE TABLE IF NOT EXISTS criminal_records (
  record_id INTEGER PRIMARY KEY CHECK (record_id > 0),
  case_id TEXT NOT NULL,
  record_date TEXT NOT NULL,
  branch_name TEXT,
  crime_name TEXT,
  sentence_type TEXT,
  memo TEXT,
  FOREIGN KEY (case_id) REFERENCES cases(case_id)
);

CREATE TABLE IF NOT EXISTS supervision_records (
  record_id INTEGER PRIMARY KEY CHECK (record_id > 0),
  case_id TEXT NOT NULL,
  notice_date TEXT NOT NULL,
  close_date TEXT,
  branch_name TEXT,
  source_text TEXT,
  archive_name TEXT,
  FOREIGN KEY (case_id) REFERENCES cases(case_id)
);

CREATE TABLE IF NOT EXISTS substance_records (
  record_id INTEGER PRIMARY KEY CHECK (record_id > 0),
  case_id TEXT NOT NULL,
  created_date TEXT NOT NULL,
  branch_name TEXT,
  substance_summary TEXT,
  referral_text TEXT,
  FOREIGN KEY (case_id) REFERENCES cases(case_id)
);

CREATE INDEX IF NOT EXISTS idx_criminal_records_case ON criminal_records(case_id, record_date);
CREATE INDEX IF NOT EXISTS idx_supervision_records_case ON supervision_records(case_id, notice_date);
CREATE INDEX IF NOT EXISTS idx_substance_records_case ON substance_records(case_id, created_date);
";

const MIGRATION_002_SQL: &str = r"
CREATE TABLE IF NOT EXISTS seal_audit (
  sequence INTEGER PRIMARY KEY CHECK (sequence >= 1),
  audit_id TEXT NOT NULL UNIQUE,
  case_id TEXT NOT NULL,
  action TEXT NOT NULL CHECK (action IN ('seal','restore')),
  reason TEXT NOT NULL,
  document_number INTEGER NOT NULL CHECK (document_number > 0),
  actor_id TEXT NOT NULL,
  actor_origin TEXT,
  recorded_at TEXT NOT NULL,
  snapshot_json TEXT NOT NULL,
  prev_hash TEXT NOT NULL,
  entry_hash TEXT NOT NULL UNIQUE,
  FOREIGN KEY (case_id) REFERENCES cases(case_id)
);

CREATE INDEX IF NOT EXISTS idx_seal_audit_case ON seal_audit(case_id, sequence);

CREATE TRIGGER IF NOT EXISTS seal_audit_reject_update
BEFORE UPDATE ON seal_audit
BEGIN
  SELECT RAISE(ABORT, 'seal_audit is append-only');
END;

CREATE TRIGGER IF NOT EXISTS seal_audit_reject_delete
BEFORE DELETE ON seal_audit
BEGIN
  SELECT RAISE(ABORT, 'seal_audit is append-only');
END;
";

const AUDIT_COLUMNS: &str = "sequence, audit_id, case_id, action, reason, document_number, \
     actor_id, actor_origin, recorded_at, snapshot_json, prev_hash, entry_hash";

const CRIMINAL_DETAIL_SQL: &str = "SELECT record_id, case_id, record_date, branch_name, \
     crime_name, sentence_type, memo FROM criminal_records";

const SUPERVISION_DETAIL_SQL: &str = "SELECT record_id, case_id, notice_date, close_date, \
     branch_name, source_text, archive_name FROM supervision_records";

const SUBSTANCE_DETAIL_SQL: &str = "SELECT record_id, case_id, created_date, branch_name, \
     substance_summary, referral_text FROM substance_records";

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreOptions {
    /// Longest wait for the database write lock before a transition reports a conflict.
    pub busy_timeout_ms: u64,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self { busy_timeout_ms: DEFAULT_BUSY_TIMEOUT_MS }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub ledger_tip_hash: Option<String>,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ForeignKeyViolation {
    pub table: String,
    pub rowid: i64,
    pub parent: String,
    pub fk_index: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub foreign_key_violations: Vec<ForeignKeyViolation>,
    pub schema_status: SchemaStatus,
    pub ledger: LedgerVerification,
}

/// Map a `SQLite` failure onto the domain taxonomy. Lock contention is retryable.
#[must_use]
pub fn store_error(context: &str, err: &rusqlite::Error) -> SealError {
    match err.sqlite_error_code() {
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) => {
            SealError::ConcurrencyConflict(format!("{context}: {err}"))
        }
        _ => SealError::Persistence(format!("{context}: {err}")),
    }
}

/// Classify an infrastructure failure from this crate. A `SQLite` error anywhere in the
/// context chain decides the kind, so lock contention during open or migration stays
/// retryable.
#[must_use]
pub fn classify_error(err: &anyhow::Error) -> SealError {
    match err.chain().find_map(|cause| cause.downcast_ref::<rusqlite::Error>()) {
        Some(sqlite) => store_error(&err.to_string(), sqlite),
        None => SealError::Persistence(format!("{err:#}")),
    }
}

trait SealContext<T> {
    fn seal_context(self, context: &str) -> Result<T, SealError>;
}

impl<T> SealContext<T> for rusqlite::Result<T> {
    fn seal_context(self, context: &str) -> Result<T, SealError> {
        self.map_err(|err| store_error(context, &err))
    }
}

impl SqliteStore {
    /// Open a SQLite-backed sealing store with default options.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, &StoreOptions::default())
    }

    /// Open a SQLite-backed sealing store and configure required runtime pragmas.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open_with(path: &Path, options: &StoreOptions) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.busy_timeout(Duration::from_millis(options.busy_timeout_ms))
            .context("failed to configure sqlite busy timeout")?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read or initialized.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;
        let current_version = current_schema_version(&self.conn)?;
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Ok(SchemaStatus {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
        })
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns an error when migration bootstrapping or any migration step fails.
    pub fn migrate(&mut self) -> Result<()> {
        self.conn
            .execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
            .context("failed to apply schema_migrations table")?;

        let mut version = current_schema_version(&self.conn)?;

        if version < 1 {
            self.apply_migration(1, MIGRATION_001_SQL)?;
            version = 1;
        }

        if version < 2 {
            self.apply_migration(2, MIGRATION_002_SQL)?;
            version = current_schema_version(&self.conn)?;
        }

        if version != LATEST_SCHEMA_VERSION {
            return Err(anyhow!(
                "unsupported schema version {version}; expected {LATEST_SCHEMA_VERSION}"
            ));
        }

        Ok(())
    }

    fn apply_migration(&mut self, version: i64, sql: &str) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .with_context(|| format!("failed to start migration v{version} transaction"))?;
        tx.execute_batch(sql).with_context(|| format!("failed to apply migration v{version}"))?;
        record_schema_version(&tx, version)?;
        tx.commit().with_context(|| format!("failed to commit migration v{version}"))?;
        info!(version, "applied schema migration");
        Ok(())
    }

    /// Create a case, or update the birth date of an existing one.
    ///
    /// The sealed flag is only taken from `case` on first insert and must be `False` or
    /// `Unknown`; a case only becomes sealed through [`SqliteStore::seal`], which writes the
    /// matching ledger entry.
    ///
    /// # Errors
    /// Returns an error when `case.sealed` is `True` or the case cannot be written.
    pub fn put_case(&self, case: &CaseFile) -> Result<()> {
        if case.sealed.is_true() {
            return Err(anyhow!(
                "case {} cannot be ingested as sealed; use seal to record the transition",
                case.case_id
            ));
        }
        let birth_date = case.birth_date.map(format_date).transpose()?;
        self.conn
            .execute(
                "INSERT INTO cases(case_id, birth_date, sealed) VALUES (?1, ?2, ?3)
                 ON CONFLICT(case_id) DO UPDATE SET birth_date = excluded.birth_date",
                params![case.case_id.as_str(), birth_date, case.sealed.as_option()],
            )
            .with_context(|| format!("failed to upsert case {}", case.case_id))?;
        Ok(())
    }

    /// # Errors
    /// Returns an error when the id is not positive, the case is unknown, or the write fails.
    pub fn insert_criminal_record(&self, record: &CriminalRecordDetail) -> Result<()> {
        require_positive_id(record.id)?;
        self.conn
            .execute(
                "INSERT INTO criminal_records(
                    record_id, case_id, record_date, branch_name, crime_name, sentence_type, memo
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.id.0,
                    record.case_id.as_str(),
                    format_date(record.record_date)?,
                    record.branch_name,
                    record.crime_name,
                    record.sentence_type,
                    record.memo,
                ],
            )
            .with_context(|| format!("failed to insert criminal record {}", record.id))?;
        Ok(())
    }

    /// Insert a supervision record. `closed` is derived from `close_date` and not stored.
    ///
    /// # Errors
    /// Returns an error when the id is not positive, the case is unknown, or the write fails.
    pub fn insert_supervision_record(&self, record: &SupervisionRecordDetail) -> Result<()> {
        require_positive_id(record.id)?;
        self.conn
            .execute(
                "INSERT INTO supervision_records(
                    record_id, case_id, notice_date, close_date, branch_name, source_text, archive_name
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    record.id.0,
                    record.case_id.as_str(),
                    format_date(record.notice_date)?,
                    record.close_date.map(format_date).transpose()?,
                    record.branch_name,
                    record.source_text,
                    record.archive_name,
                ],
            )
            .with_context(|| format!("failed to insert supervision record {}", record.id))?;
        Ok(())
    }

    /// Close a supervision record. This is the only mutation records allow.
    ///
    /// # Errors
    /// Returns an error when the record does not exist or the write fails.
    pub fn close_supervision_record(&self, id: RecordId, close_date: Date) -> Result<()> {
        let changed = self
            .conn
            .execute(
                "UPDATE supervision_records SET close_date = ?2 WHERE record_id = ?1",
                params![id.0, format_date(close_date)?],
            )
            .with_context(|| format!("failed to close supervision record {id}"))?;
        if changed == 0 {
            return Err(anyhow!("supervision record {id} not found"));
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error when the id is not positive, the case is unknown, or the write fails.
    pub fn insert_substance_record(&self, record: &SubstanceRecordDetail) -> Result<()> {
        require_positive_id(record.id)?;
        self.conn
            .execute(
                "INSERT INTO substance_records(
                    record_id, case_id, created_date, branch_name, substance_summary, referral_text
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.id.0,
                    record.case_id.as_str(),
                    format_date(record.created_date)?,
                    record.branch_name,
                    record.substance_summary,
                    record.referral_text,
                ],
            )
            .with_context(|| format!("failed to insert substance record {}", record.id))?;
        Ok(())
    }

    /// Fetch display fields for `ids` and return them in input order, dropping unknown ids.
    ///
    /// # Errors
    /// Returns a storage error when the lookup fails.
    pub fn hydrate(
        &self,
        category: RecordCategory,
        ids: &[RecordId],
    ) -> Result<HydratedRecords, SealError> {
        let hydrated = match category {
            RecordCategory::Criminal => {
                let fetched =
                    fetch_details(&self.conn, CRIMINAL_DETAIL_SQL, ids, criminal_detail_from_row)?;
                HydratedRecords::Criminal(restore_input_order(ids, fetched, |record| record.id))
            }
            RecordCategory::Supervision => {
                let fetched = fetch_details(
                    &self.conn,
                    SUPERVISION_DETAIL_SQL,
                    ids,
                    supervision_detail_from_row,
                )?;
                HydratedRecords::Supervision(restore_input_order(ids, fetched, |record| record.id))
            }
            RecordCategory::Substance => {
                let fetched =
                    fetch_details(&self.conn, SUBSTANCE_DETAIL_SQL, ids, substance_detail_from_row)?;
                HydratedRecords::Substance(restore_input_order(ids, fetched, |record| record.id))
            }
        };
        debug!(
            category = category.as_str(),
            requested = ids.len(),
            returned = hydrated.len(),
            "hydrated record details"
        );
        Ok(hydrated)
    }

    /// Seal a case: flag flip and audit append commit together or not at all.
    ///
    /// # Errors
    /// Returns the [`SealError`] raised by validation, the state machine, or storage.
    pub fn seal(&mut self, request: &SealRequest) -> Result<AuditEntry, SealError> {
        self.transition(AuditAction::Seal, request)
    }

    /// Restore a sealed case.
    ///
    /// # Errors
    /// Returns the [`SealError`] raised by validation, the state machine, or storage.
    pub fn restore(&mut self, request: &SealRequest) -> Result<AuditEntry, SealError> {
        self.transition(AuditAction::Restore, request)
    }

    fn transition(
        &mut self,
        action: AuditAction,
        request: &SealRequest,
    ) -> Result<AuditEntry, SealError> {
        let result = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .seal_context("failed to acquire sealing write lock")
            .and_then(|tx| {
                execute_transition(
                    SqliteSealingTransaction { tx },
                    action,
                    request,
                    OffsetDateTime::now_utc(),
                )
            });

        match &result {
            Ok(entry) => info!(
                case_id = %entry.case_id,
                action = action.as_str(),
                sequence = entry.sequence,
                actor_id = %entry.actor.actor_id,
                "audit entry committed"
            ),
            Err(SealError::ConcurrencyConflict(reason)) => warn!(
                case_id = %request.case_id,
                action = action.as_str(),
                reason = %reason,
                "sealing transaction hit lock contention"
            ),
            Err(_) => {}
        }
        result
    }

    /// Recompute the audit hash chain from the first entry.
    ///
    /// # Errors
    /// Returns a storage error when the ledger cannot be read.
    pub fn verify_ledger(&self) -> Result<LedgerVerification, SealError> {
        let entries = self.ledger_oldest_first()?;
        let report = verify_chain(&entries);
        if !report.ok {
            warn!(
                first_broken_sequence = report.first_broken_sequence,
                reason = report.reason.as_deref().unwrap_or(""),
                "audit ledger failed verification"
            );
        }
        Ok(report)
    }

    /// Export the ledger oldest first as NDJSON plus a digest manifest.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_ledger(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let entries = self.ledger_oldest_first()?;
        let ledger_path = out_dir.join(LEDGER_EXPORT_FILE);
        let (sha256, records) = write_ndjson_file(&ledger_path, &entries)?;

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            ledger_tip_hash: entries.last().map(|entry| entry.entry_hash.clone()),
            files: vec![ExportFileDigest { path: LEDGER_EXPORT_FILE.to_string(), sha256, records }],
        };

        let manifest_path = out_dir.join("manifest.json");
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        Ok(manifest)
    }

    /// Run quick-check, foreign-key-check, schema status, and ledger chain probes.
    ///
    /// # Errors
    /// Returns an error when any integrity probe query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let mut stmt = self
            .conn
            .prepare("PRAGMA foreign_key_check")
            .context("failed to prepare PRAGMA foreign_key_check")?;
        let rows = stmt.query_map([], |row| {
            Ok(ForeignKeyViolation {
                table: row.get(0)?,
                rowid: row.get(1)?,
                parent: row.get(2)?,
                fk_index: row.get(3)?,
            })
        })?;

        let mut foreign_key_violations = Vec::new();
        for row in rows {
            foreign_key_violations.push(row?);
        }

        let schema_status = self.schema_status()?;
        let ledger = if table_exists(&self.conn, "seal_audit")? {
            self.verify_ledger()?
        } else {
            verify_chain(&[])
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            foreign_key_violations,
            schema_status,
            ledger,
        })
    }

    fn ledger_oldest_first(&self) -> Result<Vec<AuditEntry>, SealError> {
        query_audit(
            &self.conn,
            &format!("SELECT {AUDIT_COLUMNS} FROM seal_audit ORDER BY sequence ASC"),
            [],
        )
    }
}

impl CaseDirectory for SqliteStore {
    fn get_case(&self, case_id: &CaseId) -> Result<Option<CaseFile>, SealError> {
        load_case(&self.conn, case_id)
    }

    fn supervision_records(&self, case_id: &CaseId) -> Result<Vec<SupervisionRecord>, SealError> {
        load_supervision_records(&self.conn, case_id)
    }

    fn criminal_records(&self, case_id: &CaseId) -> Result<Vec<CriminalRecord>, SealError> {
        load_criminal_records(&self.conn, case_id)
    }

    fn substance_records(&self, case_id: &CaseId) -> Result<Vec<SubstanceRecord>, SealError> {
        load_substance_records(&self.conn, case_id)
    }
}

impl AuditLedger for SqliteStore {
    fn list_by_case(&self, case_id: &CaseId) -> Result<Vec<AuditEntry>, SealError> {
        query_audit(
            &self.conn,
            &format!("SELECT {AUDIT_COLUMNS} FROM seal_audit WHERE case_id = ?1 ORDER BY sequence DESC"),
            params![case_id.as_str()],
        )
    }

    fn list_all(&self) -> Result<Vec<AuditEntry>, SealError> {
        query_audit(
            &self.conn,
            &format!("SELECT {AUDIT_COLUMNS} FROM seal_audit ORDER BY sequence DESC"),
            [],
        )
    }
}

/// An `IMMEDIATE` transaction holding the database write lock for one transition.
/// Dropping it without commit rolls everything back.
struct SqliteSealingTransaction<'conn> {
    tx: Transaction<'conn>,
}

impl CaseDirectory for SqliteSealingTransaction<'_> {
    fn get_case(&self, case_id: &CaseId) -> Result<Option<CaseFile>, SealError> {
        load_case(&self.tx, case_id)
    }

    fn supervision_records(&self, case_id: &CaseId) -> Result<Vec<SupervisionRecord>, SealError> {
        load_supervision_records(&self.tx, case_id)
    }

    fn criminal_records(&self, case_id: &CaseId) -> Result<Vec<CriminalRecord>, SealError> {
        load_criminal_records(&self.tx, case_id)
    }

    fn substance_records(&self, case_id: &CaseId) -> Result<Vec<SubstanceRecord>, SealError> {
        load_substance_records(&self.tx, case_id)
    }
}

impl SealingTransaction for SqliteSealingTransaction<'_> {
    fn set_sealed(&mut self, case_id: &CaseId, sealed: bool) -> Result<(), SealError> {
        let changed = self
            .tx
            .execute(
                "UPDATE cases SET sealed = ?2 WHERE case_id = ?1",
                params![case_id.as_str(), sealed],
            )
            .seal_context("failed to update sealed flag")?;
        if changed == 0 {
            return Err(SealError::case_not_found(case_id));
        }
        Ok(())
    }

    fn ledger_tip(&self) -> Result<Option<LedgerTip>, SealError> {
        let tip = self
            .tx
            .query_row(
                "SELECT sequence, entry_hash FROM seal_audit ORDER BY sequence DESC LIMIT 1",
                [],
                |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)),
            )
            .optional()
            .seal_context("failed to read ledger tip")?;

        tip.map(|(sequence, entry_hash)| {
            let sequence = u64::try_from(sequence).map_err(|_| {
                SealError::Persistence(format!("ledger tip has invalid sequence {sequence}"))
            })?;
            Ok(LedgerTip { sequence, entry_hash })
        })
        .transpose()
    }

    fn append_audit(&mut self, entry: &AuditEntry) -> Result<(), SealError> {
        let sequence = i64::try_from(entry.sequence).map_err(|_| {
            SealError::Persistence(format!("sequence {} exceeds storage range", entry.sequence))
        })?;
        let recorded_at = entry.recorded_at.format(&Rfc3339).map_err(|err| {
            SealError::Persistence(format!("failed to format recorded_at: {err}"))
        })?;
        let snapshot_json = serde_json::to_string(&entry.snapshot)
            .map_err(|err| SealError::Persistence(format!("failed to encode snapshot: {err}")))?;

        self.tx
            .execute(
                "INSERT INTO seal_audit(
                    sequence, audit_id, case_id, action, reason, document_number,
                    actor_id, actor_origin, recorded_at, snapshot_json, prev_hash, entry_hash
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    sequence,
                    entry.audit_id.to_string(),
                    entry.case_id.as_str(),
                    entry.action.as_str(),
                    entry.reason,
                    entry.document_number,
                    entry.actor.actor_id,
                    entry.actor.origin,
                    recorded_at,
                    snapshot_json,
                    entry.prev_hash,
                    entry.entry_hash,
                ],
            )
            .seal_context("failed to append audit entry")?;
        Ok(())
    }

    fn commit(self) -> Result<(), SealError> {
        self.tx.commit().seal_context("failed to commit sealing transaction")
    }
}

fn load_case(conn: &Connection, case_id: &CaseId) -> Result<Option<CaseFile>, SealError> {
    conn.query_row(
        "SELECT case_id, birth_date, sealed FROM cases WHERE case_id = ?1",
        params![case_id.as_str()],
        |row| {
            Ok(CaseFile {
                case_id: case_id_column(row, 0)?,
                birth_date: optional_date_column(row, 1)?,
                sealed: TriState::from_option(row.get::<_, Option<bool>>(2)?),
            })
        },
    )
    .optional()
    .seal_context("failed to load case")
}

fn load_supervision_records(
    conn: &Connection,
    case_id: &CaseId,
) -> Result<Vec<SupervisionRecord>, SealError> {
    let mut stmt = conn
        .prepare(
            "SELECT record_id, case_id, notice_date, close_date
             FROM supervision_records WHERE case_id = ?1",
        )
        .seal_context("failed to prepare supervision query")?;
    let rows = stmt
        .query_map(params![case_id.as_str()], |row| {
            Ok(SupervisionRecord {
                id: RecordId(row.get(0)?),
                case_id: case_id_column(row, 1)?,
                notice_date: date_column(row, 2)?,
                close_date: optional_date_column(row, 3)?,
            })
        })
        .seal_context("failed to query supervision records")?;

    let mut records = Vec::new();
    for row in rows {
        records.push(row.seal_context("failed to decode supervision record")?);
    }
    Ok(records)
}

fn load_criminal_records(
    conn: &Connection,
    case_id: &CaseId,
) -> Result<Vec<CriminalRecord>, SealError> {
    let mut stmt = conn
        .prepare("SELECT record_id, case_id, record_date FROM criminal_records WHERE case_id = ?1")
        .seal_context("failed to prepare criminal record query")?;
    let rows = stmt
        .query_map(params![case_id.as_str()], |row| {
            Ok(CriminalRecord {
                id: RecordId(row.get(0)?),
                case_id: case_id_column(row, 1)?,
                record_date: date_column(row, 2)?,
            })
        })
        .seal_context("failed to query criminal records")?;

    let mut records = Vec::new();
    for row in rows {
        records.push(row.seal_context("failed to decode criminal record")?);
    }
    Ok(records)
}

fn load_substance_records(
    conn: &Connection,
    case_id: &CaseId,
) -> Result<Vec<SubstanceRecord>, SealError> {
    let mut stmt = conn
        .prepare(
            "SELECT record_id, case_id, created_date FROM substance_records WHERE case_id = ?1",
        )
        .seal_context("failed to prepare substance record query")?;
    let rows = stmt
        .query_map(params![case_id.as_str()], |row| {
            Ok(SubstanceRecord {
                id: RecordId(row.get(0)?),
                case_id: case_id_column(row, 1)?,
                created_date: date_column(row, 2)?,
            })
        })
        .seal_context("failed to query substance records")?;

    let mut records = Vec::new();
    for row in rows {
        records.push(row.seal_context("failed to decode substance record")?);
    }
    Ok(records)
}

/// Set lookup by id; the result order is whatever `SQLite` returns.
fn fetch_details<T, F>(
    conn: &Connection,
    select_sql: &str,
    ids: &[RecordId],
    decode: F,
) -> Result<Vec<T>, SealError>
where
    F: Fn(&Row<'_>) -> rusqlite::Result<T>,
{
    let mut unique = ids.iter().map(|id| id.0).collect::<Vec<_>>();
    unique.sort_unstable();
    unique.dedup();

    let mut fetched = Vec::with_capacity(unique.len());
    for chunk in unique.chunks(HYDRATE_CHUNK_SIZE) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!("{select_sql} WHERE record_id IN ({placeholders})");
        let mut stmt = conn.prepare(&sql).seal_context("failed to prepare detail lookup")?;
        let rows = stmt
            .query_map(params_from_iter(chunk.iter()), &decode)
            .seal_context("failed to query record details")?;
        for row in rows {
            fetched.push(row.seal_context("failed to decode record detail")?);
        }
    }
    Ok(fetched)
}

fn criminal_detail_from_row(row: &Row<'_>) -> rusqlite::Result<CriminalRecordDetail> {
    Ok(CriminalRecordDetail {
        id: RecordId(row.get(0)?),
        case_id: case_id_column(row, 1)?,
        record_date: date_column(row, 2)?,
        branch_name: row.get(3)?,
        crime_name: row.get(4)?,
        sentence_type: row.get(5)?,
        memo: row.get(6)?,
    })
}

fn supervision_detail_from_row(row: &Row<'_>) -> rusqlite::Result<SupervisionRecordDetail> {
    let close_date = optional_date_column(row, 3)?;
    Ok(SupervisionRecordDetail {
        id: RecordId(row.get(0)?),
        case_id: case_id_column(row, 1)?,
        notice_date: date_column(row, 2)?,
        close_date,
        closed: close_date.is_some(),
        branch_name: row.get(4)?,
        source_text: row.get(5)?,
        archive_name: row.get(6)?,
    })
}

fn substance_detail_from_row(row: &Row<'_>) -> rusqlite::Result<SubstanceRecordDetail> {
    Ok(SubstanceRecordDetail {
        id: RecordId(row.get(0)?),
        case_id: case_id_column(row, 1)?,
        created_date: date_column(row, 2)?,
        branch_name: row.get(3)?,
        substance_summary: row.get(4)?,
        referral_text: row.get(5)?,
    })
}

fn query_audit<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> Result<Vec<AuditEntry>, SealError> {
    let mut stmt = conn.prepare(sql).seal_context("failed to prepare audit query")?;
    let rows = stmt
        .query_map(params, audit_entry_from_row)
        .seal_context("failed to query audit ledger")?;

    let mut entries = Vec::new();
    for row in rows {
        entries.push(row.seal_context("failed to decode audit entry")?);
    }
    Ok(entries)
}

fn audit_entry_from_row(row: &Row<'_>) -> rusqlite::Result<AuditEntry> {
    let sequence: i64 = row.get(0)?;
    let audit_id_raw: String = row.get(1)?;
    let action_raw: String = row.get(3)?;
    let recorded_at_raw: String = row.get(8)?;
    let snapshot_raw: String = row.get(9)?;

    let action = AuditAction::parse(&action_raw).ok_or_else(|| {
        conversion_error(3, SealError::Persistence(format!("unknown audit action: {action_raw}")))
    })?;
    let snapshot: LinkedRecordIds =
        serde_json::from_str(&snapshot_raw).map_err(|err| conversion_error(9, err))?;

    Ok(AuditEntry {
        audit_id: AuditEntryId(
            Ulid::from_string(&audit_id_raw).map_err(|err| conversion_error(1, err))?,
        ),
        sequence: u64::try_from(sequence).map_err(|err| conversion_error(0, err))?,
        case_id: case_id_column(row, 2)?,
        action,
        reason: row.get(4)?,
        document_number: row.get(5)?,
        actor: ActorRef { actor_id: row.get(6)?, origin: row.get(7)? },
        recorded_at: OffsetDateTime::parse(&recorded_at_raw, &Rfc3339)
            .map_err(|err| conversion_error(8, err))?,
        snapshot,
        prev_hash: row.get(10)?,
        entry_hash: row.get(11)?,
    })
}

fn conversion_error<E>(index: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err))
}

fn date_column(row: &Row<'_>, index: usize) -> rusqlite::Result<Date> {
    let raw: String = row.get(index)?;
    parse_date(&raw).map_err(|err| conversion_error(index, err))
}

fn optional_date_column(row: &Row<'_>, index: usize) -> rusqlite::Result<Option<Date>> {
    let raw: Option<String> = row.get(index)?;
    raw.map(|raw| parse_date(&raw).map_err(|err| conversion_error(index, err))).transpose()
}

fn case_id_column(row: &Row<'_>, index: usize) -> rusqlite::Result<CaseId> {
    let raw: String = row.get(index)?;
    CaseId::parse(&raw).map_err(|err| conversion_error(index, err))
}

fn parse_date(raw: &str) -> std::result::Result<Date, time::error::Parse> {
    Date::parse(raw, format_description!("[year]-[month]-[day]"))
}

fn format_date(date: Date) -> Result<String, SealError> {
    date.format(format_description!("[year]-[month]-[day]"))
        .map_err(|err| SealError::Persistence(format!("failed to format date {date}: {err}")))
}

fn require_positive_id(id: RecordId) -> Result<()> {
    if id.0 <= 0 {
        return Err(anyhow!("record id MUST be positive, got {id}"));
    }
    Ok(())
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    let version = conn
        .query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
            row.get::<_, i64>(0)
        })
        .context("failed to read current schema version")?;
    Ok(version)
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc().format(&Rfc3339).context("failed to format RFC3339 timestamp")
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        writer
            .write_all(b"\n")
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::thread;

    use super::*;
    use sealing_core::GENESIS_HASH;
    use time::macros::date;

    fn case_id(raw: &str) -> CaseId {
        CaseId::parse(raw).unwrap_or_else(|err| panic!("invalid fixture case id: {err}"))
    }

    fn request(raw: &str) -> SealRequest {
        SealRequest {
            case_id: case_id(raw),
            reason: "juvenile record sealing order".to_string(),
            document_number: 4471,
            actor: ActorRef {
                actor_id: "clerk-7".to_string(),
                origin: Some("10.1.2.3".to_string()),
            },
            require_eligibility: false,
        }
    }

    fn criminal(id: i64, case: &str, record_date: Date) -> CriminalRecordDetail {
        CriminalRecordDetail {
            id: RecordId(id),
            case_id: case_id(case),
            record_date,
            branch_name: Some("North Branch".to_string()),
            crime_name: Some(format!("offence {id}")),
            sentence_type: Some("probation".to_string()),
            memo: None,
        }
    }

    fn supervision(
        id: i64,
        case: &str,
        notice_date: Date,
        close_date: Option<Date>,
    ) -> SupervisionRecordDetail {
        SupervisionRecordDetail {
            id: RecordId(id),
            case_id: case_id(case),
            notice_date,
            close_date,
            closed: close_date.is_some(),
            branch_name: Some("North Branch".to_string()),
            source_text: Some("court referral".to_string()),
            archive_name: None,
        }
    }

    fn substance(id: i64, case: &str, created_date: Date) -> SubstanceRecordDetail {
        SubstanceRecordDetail {
            id: RecordId(id),
            case_id: case_id(case),
            created_date,
            branch_name: None,
            substance_summary: Some("screening".to_string()),
            referral_text: None,
        }
    }

    fn seed_case(store: &SqliteStore, raw: &str) -> Result<()> {
        store.put_case(&CaseFile {
            case_id: case_id(raw),
            birth_date: Some(date!(2000 - 06 - 15)),
            sealed: TriState::False,
        })?;
        store.insert_criminal_record(&criminal(12, raw, date!(2016 - 02 - 01)))?;
        store.insert_criminal_record(&criminal(11, raw, date!(2018 - 06 - 15)))?;
        store.insert_criminal_record(&criminal(10, raw, date!(2017 - 09 - 30)))?;
        store.insert_supervision_record(&supervision(
            20,
            raw,
            date!(2015 - 01 - 10),
            Some(date!(2016 - 01 - 10)),
        ))?;
        store.insert_supervision_record(&supervision(21, raw, date!(2019 - 04 - 01), None))?;
        store.insert_substance_record(&substance(30, raw, date!(2017 - 03 - 03)))?;
        Ok(())
    }

    fn seeded_store() -> Result<SqliteStore> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        seed_case(&store, "C-1")?;
        Ok(store)
    }

    fn unique_temp_db_path(prefix: &str) -> PathBuf {
        std::env::temp_dir().join(format!("{prefix}-{}.sqlite3", Ulid::new()))
    }

    fn cleanup_sqlite_files(db_path: &Path) -> Result<()> {
        for suffix in ["", "-wal", "-shm"] {
            let path = PathBuf::from(format!("{}{}", db_path.display(), suffix));
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("failed to cleanup sqlite file {}", path.display()))?;
            }
        }
        Ok(())
    }

    #[test]
    fn migrate_reaches_latest_schema_and_is_idempotent() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        let before = store.schema_status()?;
        assert_eq!(before.current_version, 0);
        assert_eq!(before.pending_versions, vec![1, 2]);

        store.migrate()?;
        store.migrate()?;
        let after = store.schema_status()?;
        assert_eq!(after.current_version, LATEST_SCHEMA_VERSION);
        assert!(after.pending_versions.is_empty());
        Ok(())
    }

    #[test]
    fn case_directory_reads_ingested_rows() -> Result<()> {
        let store = seeded_store()?;
        let id = case_id("C-1");

        let case = store.get_case(&id)?.ok_or_else(|| anyhow!("case missing"))?;
        assert_eq!(case.birth_date, Some(date!(2000 - 06 - 15)));
        assert_eq!(case.sealed, TriState::False);
        assert_eq!(store.criminal_records(&id)?.len(), 3);
        assert_eq!(store.supervision_records(&id)?.len(), 2);
        assert_eq!(store.substance_records(&id)?.len(), 1);
        assert!(store.get_case(&case_id("C-404"))?.is_none());
        Ok(())
    }

    #[test]
    fn null_sealed_flag_reads_as_unknown() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        store.put_case(&CaseFile {
            case_id: case_id("LEGACY-1"),
            birth_date: None,
            sealed: TriState::Unknown,
        })?;

        let case = store.get_case(&case_id("LEGACY-1"))?.ok_or_else(|| anyhow!("case missing"))?;
        assert_eq!(case.sealed, TriState::Unknown);
        assert_eq!(case.birth_date, None);
        Ok(())
    }

    #[test]
    fn put_case_never_changes_an_existing_sealed_flag() -> Result<()> {
        let mut store = seeded_store()?;
        store.seal(&request("C-1"))?;
        store.put_case(&CaseFile {
            case_id: case_id("C-1"),
            birth_date: Some(date!(2000 - 06 - 16)),
            sealed: TriState::False,
        })?;

        let case = store.get_case(&case_id("C-1"))?.ok_or_else(|| anyhow!("case missing"))?;
        assert_eq!(case.sealed, TriState::True);
        assert_eq!(case.birth_date, Some(date!(2000 - 06 - 16)));
        Ok(())
    }

    #[test]
    fn put_case_rejects_sealed_flag_without_ledger_entry() -> Result<()> {
        let mut store = SqliteStore::open(Path::new(":memory:"))?;
        store.migrate()?;
        let result = store.put_case(&CaseFile {
            case_id: case_id("PRESEALED-1"),
            birth_date: Some(date!(2000 - 06 - 15)),
            sealed: TriState::True,
        });
        assert!(result.is_err());
        assert!(store.get_case(&case_id("PRESEALED-1"))?.is_none());

        let restored = store.restore(&request("PRESEALED-1"));
        assert!(matches!(restored, Err(SealError::NotFound(_))));
        assert!(store.list_all()?.is_empty());
        Ok(())
    }

    #[test]
    fn close_supervision_record_sets_close_date() -> Result<()> {
        let store = seeded_store()?;
        store.close_supervision_record(RecordId(21), date!(2020 - 01 - 01))?;
        let records = store.supervision_records(&case_id("C-1"))?;
        let closed = records
            .iter()
            .find(|record| record.id == RecordId(21))
            .ok_or_else(|| anyhow!("supervision record missing"))?;
        assert_eq!(closed.close_date, Some(date!(2020 - 01 - 01)));

        assert!(store.close_supervision_record(RecordId(999), date!(2020 - 01 - 01)).is_err());
        Ok(())
    }

    #[test]
    fn ingestion_rejects_unknown_case_and_non_positive_ids() -> Result<()> {
        let store = seeded_store()?;
        assert!(store.insert_criminal_record(&criminal(50, "C-404", date!(2016 - 01 - 01))).is_err());
        assert!(store.insert_substance_record(&substance(0, "C-1", date!(2016 - 01 - 01))).is_err());
        Ok(())
    }

    #[test]
    fn hydrate_returns_details_in_request_order() -> Result<()> {
        let store = seeded_store()?;
        let ids = [RecordId(11), RecordId(999), RecordId(12), RecordId(10), RecordId(11)];

        let hydrated = store.hydrate(RecordCategory::Criminal, &ids)?;
        assert_eq!(hydrated.ids(), vec![RecordId(11), RecordId(12), RecordId(10), RecordId(11)]);

        let HydratedRecords::Criminal(records) = hydrated else {
            return Err(anyhow!("expected criminal details"));
        };
        assert_eq!(records[0].crime_name.as_deref(), Some("offence 11"));

        let supervision = store.hydrate(RecordCategory::Supervision, &[RecordId(21), RecordId(20)])?;
        let HydratedRecords::Supervision(records) = supervision else {
            return Err(anyhow!("expected supervision details"));
        };
        assert_eq!(records.len(), 2);
        assert!(!records[0].closed);
        assert!(records[1].closed);

        let empty = store.hydrate(RecordCategory::Substance, &[])?;
        assert!(empty.is_empty());
        Ok(())
    }

    #[test]
    fn seal_restore_seal_persists_three_chained_entries() -> Result<()> {
        let mut store = seeded_store()?;
        let req = request("C-1");

        let first = store.seal(&req)?;
        store.restore(&req)?;
        store.seal(&req)?;

        let newest_first = store.list_by_case(&case_id("C-1"))?;
        let actions = newest_first.iter().map(|entry| entry.action).collect::<Vec<_>>();
        assert_eq!(actions, vec![AuditAction::Seal, AuditAction::Restore, AuditAction::Seal]);
        assert_eq!(
            newest_first.iter().map(|entry| entry.sequence).collect::<Vec<_>>(),
            vec![3, 2, 1]
        );
        assert_eq!(newest_first[2], first);
        assert_eq!(first.prev_hash, GENESIS_HASH);
        assert_eq!(first.snapshot.criminal_ids, vec![RecordId(12), RecordId(10), RecordId(11)]);

        let case = store.get_case(&case_id("C-1"))?.ok_or_else(|| anyhow!("case missing"))?;
        assert_eq!(case.sealed, TriState::True);
        assert!(store.verify_ledger()?.ok);
        Ok(())
    }

    #[test]
    fn already_erased_leaves_flag_and_ledger_untouched() -> Result<()> {
        let mut store = seeded_store()?;
        store.seal(&request("C-1"))?;

        let retry = store.seal(&request("C-1"));
        assert!(matches!(retry, Err(SealError::AlreadyErased(_))));
        assert_eq!(store.list_all()?.len(), 1);

        let restore_missing = store.restore(&request("C-404"));
        assert!(matches!(restore_missing, Err(SealError::NotFound(_))));
        Ok(())
    }

    #[test]
    fn failed_snapshot_rolls_back_the_whole_transition() -> Result<()> {
        let mut store = seeded_store()?;
        store.conn.execute(
            "INSERT INTO substance_records(record_id, case_id, created_date) VALUES (31, 'C-1', 'not-a-date')",
            [],
        )?;

        let result = store.seal(&request("C-1"));
        assert!(matches!(result, Err(SealError::Persistence(_))));

        let case = store.get_case(&case_id("C-1"))?.ok_or_else(|| anyhow!("case missing"))?;
        assert_eq!(case.sealed, TriState::False);
        assert!(store.list_all()?.is_empty());
        Ok(())
    }

    #[test]
    fn audit_table_rejects_update_and_delete() -> Result<()> {
        let mut store = seeded_store()?;
        store.seal(&request("C-1"))?;

        let update = store.conn.execute("UPDATE seal_audit SET reason = 'edited'", []);
        assert!(update.is_err());
        let delete = store.conn.execute("DELETE FROM seal_audit", []);
        assert!(delete.is_err());
        assert_eq!(store.list_all()?.len(), 1);
        Ok(())
    }

    #[test]
    fn tampered_row_fails_ledger_verification() -> Result<()> {
        let mut store = seeded_store()?;
        store.seal(&request("C-1"))?;
        store.restore(&request("C-1"))?;

        store.conn.execute_batch(
            "DROP TRIGGER seal_audit_reject_update;
             UPDATE seal_audit SET document_number = 1 WHERE sequence = 1;",
        )?;

        let report = store.verify_ledger()?;
        assert!(!report.ok);
        assert_eq!(report.first_broken_sequence, Some(1));
        Ok(())
    }

    #[test]
    fn required_eligibility_is_checked_inside_the_transaction() -> Result<()> {
        let mut store = seeded_store()?;
        let mut req = request("C-1");
        req.require_eligibility = true;

        let refused = store.seal(&req);
        assert!(matches!(refused, Err(SealError::Ineligible { .. })));
        assert!(store.list_all()?.is_empty());

        store.close_supervision_record(RecordId(21), date!(2020 - 01 - 01))?;
        let entry = store.seal(&req)?;
        assert_eq!(entry.sequence, 1);
        Ok(())
    }

    #[test]
    fn export_ledger_writes_ndjson_and_manifest() -> Result<()> {
        let mut store = seeded_store()?;
        store.seal(&request("C-1"))?;
        store.restore(&request("C-1"))?;

        let out_dir = std::env::temp_dir().join(format!("sealing-export-{}", Ulid::new()));
        let manifest = store.export_ledger(&out_dir)?;
        assert_eq!(manifest.files.len(), 1);
        assert_eq!(manifest.files[0].records, 2);

        let body = fs::read_to_string(out_dir.join(LEDGER_EXPORT_FILE))?;
        let digest = format!("{:x}", Sha256::digest(body.as_bytes()));
        assert_eq!(digest, manifest.files[0].sha256);

        let first: AuditEntry = serde_json::from_str(
            body.lines().next().ok_or_else(|| anyhow!("export is empty"))?,
        )?;
        assert_eq!(first.sequence, 1);
        assert_eq!(manifest.ledger_tip_hash, store.list_all()?.first().map(|e| e.entry_hash.clone()));
        assert!(out_dir.join("manifest.json").exists());

        fs::remove_dir_all(&out_dir)?;
        Ok(())
    }

    #[test]
    fn integrity_check_reports_clean_database() -> Result<()> {
        let mut store = seeded_store()?;
        store.seal(&request("C-1"))?;

        let report = store.integrity_check()?;
        assert!(report.quick_check_ok);
        assert!(report.foreign_key_violations.is_empty());
        assert_eq!(report.schema_status.current_version, LATEST_SCHEMA_VERSION);
        assert!(report.ledger.ok);
        assert_eq!(report.ledger.entries, 1);
        Ok(())
    }

    #[test]
    fn classify_error_keeps_lock_contention_retryable_through_context() {
        let busy = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        );
        let wrapped = anyhow::Error::new(busy).context("failed to apply schema_migrations table");
        assert!(matches!(classify_error(&wrapped), SealError::ConcurrencyConflict(_)));

        let plain = anyhow!("unsupported schema version 9; expected 2");
        assert!(matches!(classify_error(&plain), SealError::Persistence(_)));
    }

    #[test]
    fn held_write_lock_surfaces_as_concurrency_conflict() -> Result<()> {
        let db_path = unique_temp_db_path("sealing-lock");
        {
            let mut init = SqliteStore::open(&db_path)?;
            init.migrate()?;
            seed_case(&init, "C-1")?;
        }

        let holder = Connection::open(&db_path)?;
        holder.execute_batch("BEGIN IMMEDIATE;")?;

        let mut contender = SqliteStore::open_with(&db_path, &StoreOptions { busy_timeout_ms: 0 })?;
        let result = contender.seal(&request("C-1"));
        assert!(matches!(result, Err(SealError::ConcurrencyConflict(_))));

        holder.execute_batch("ROLLBACK;")?;
        drop(holder);
        assert!(contender.list_all()?.is_empty());
        drop(contender);

        cleanup_sqlite_files(&db_path)
    }

    #[test]
    fn concurrent_seals_commit_exactly_one_entry() -> Result<()> {
        let db_path = unique_temp_db_path("sealing-concurrency");
        {
            let mut init = SqliteStore::open(&db_path)?;
            init.migrate()?;
            seed_case(&init, "C-1")?;
        }

        let mut handles = Vec::new();
        for _ in 0..6 {
            let worker_path = db_path.clone();
            handles.push(thread::spawn(move || -> Result<Result<AuditEntry, SealError>> {
                let mut store = SqliteStore::open(&worker_path)?;
                Ok(store.seal(&request("C-1")))
            }));
        }

        let mut committed = 0;
        for handle in handles {
            let Ok(thread_result) = handle.join() else {
                return Err(anyhow!("concurrency thread panicked"));
            };
            match thread_result? {
                Ok(_) => committed += 1,
                Err(SealError::AlreadyErased(_) | SealError::ConcurrencyConflict(_)) => {}
                Err(other) => return Err(anyhow!("unexpected seal failure: {other}")),
            }
        }
        assert_eq!(committed, 1);

        {
            let store = SqliteStore::open(&db_path)?;
            let entries = store.list_all()?;
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].action, AuditAction::Seal);
            assert!(store.verify_ledger()?.ok);
        }

        cleanup_sqlite_files(&db_path)
    }
}
