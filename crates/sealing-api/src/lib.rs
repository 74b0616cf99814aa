use std::path::{Path, PathBuf};

use anyhow::Result;
use sealing_core::{
    collect_all, collect_before_eighteen, collect_within, eighteenth_birthday,
    evaluate_eligibility, AuditEntry, AuditLedger, CaseDirectory, CaseId, CriminalRecordDetail,
    DateWindow, EligibilityReport, HydratedRecords, LedgerVerification, LinkedRecordIds,
    RecordCategory, RecordId, ScopedRecordIds, SealError, SealRequest, SubstanceRecordDetail,
    SupervisionRecordDetail,
};
use sealing_store_sqlite::{
    classify_error, ExportManifest, IntegrityReport, SchemaStatus, SqliteStore, StoreOptions,
};
use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use tracing::debug;

pub const API_CONTRACT_VERSION: &str = "api.v1";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectRequest {
    pub case_id: CaseId,
    #[serde(default)]
    pub before_eighteen_only: bool,
    #[serde(default)]
    pub window: Option<DateWindow>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HydrateRequest {
    pub category: RecordCategory,
    pub ids: Vec<RecordId>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EraseReviewRequest {
    pub case_id: CaseId,
    #[serde(default)]
    pub window: Option<DateWindow>,
    #[serde(default)]
    pub as_of: Option<Date>,
}

/// Eligibility plus the hydrated juvenile-era records an operator reviews before sealing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EraseReview {
    pub eligibility: EligibilityReport,
    pub eighteenth_birthday: Option<Date>,
    pub criminal: Vec<CriminalRecordDetail>,
    pub supervision: Vec<SupervisionRecordDetail>,
    pub substance: Vec<SubstanceRecordDetail>,
}

#[derive(Debug, Clone)]
pub struct SealingApi {
    db_path: PathBuf,
    options: StoreOptions,
}

impl SealingApi {
    #[must_use]
    pub fn new(db_path: PathBuf) -> Self {
        Self::with_options(db_path, StoreOptions::default())
    }

    #[must_use]
    pub fn with_options(db_path: PathBuf, options: StoreOptions) -> Self {
        Self { db_path, options }
    }

    #[must_use]
    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn open_store(&self) -> Result<SqliteStore> {
        SqliteStore::open_with(&self.db_path, &self.options)
    }

    fn open_migrated(&self) -> Result<SqliteStore, SealError> {
        let mut store = self.open_store().map_err(|err| classify_error(&err))?;
        store.migrate().map_err(|err| classify_error(&err))?;
        Ok(store)
    }

    /// Inspect schema status without applying migrations.
    ///
    /// # Errors
    /// Returns an error when the `SQLite` database cannot be opened or queried.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let store = self.open_store()?;
        store.schema_status()
    }

    /// Apply pending migrations, or return planned versions for dry-run mode.
    ///
    /// # Errors
    /// Returns an error when migration planning or execution fails.
    pub fn migrate(&self, dry_run: bool) -> Result<MigrateResult> {
        let mut store = self.open_store()?;
        let before = store.schema_status()?;
        if dry_run {
            return Ok(MigrateResult {
                dry_run: true,
                current_version: before.current_version,
                target_version: before.target_version,
                would_apply_versions: before.pending_versions,
                after_version: None,
                up_to_date: None,
            });
        }

        let planned_versions = before.pending_versions;
        store.migrate()?;
        let after = store.schema_status()?;
        Ok(MigrateResult {
            dry_run: false,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: planned_versions,
            after_version: Some(after.current_version),
            up_to_date: Some(after.pending_versions.is_empty()),
        })
    }

    /// Evaluate eligibility as of `as_of`, defaulting to today's UTC date.
    ///
    /// # Errors
    /// Returns [`SealError::NotFound`] for an unknown case, or a storage error.
    pub fn evaluate_eligibility(
        &self,
        case_id: &CaseId,
        as_of: Option<Date>,
    ) -> Result<EligibilityReport, SealError> {
        let store = self.open_migrated()?;
        evaluate_eligibility(&store, case_id, as_of.unwrap_or_else(today))
    }

    /// Linked record ids for a case.
    ///
    /// With `before_eighteen_only`, criminal and supervision ids are cut off at the 18th
    /// birthday and come back empty when the birth date is unknown. A window narrows
    /// criminal and supervision ids in both modes. Substance ids are never filtered.
    ///
    /// # Errors
    /// Returns [`SealError::Validation`] for an inverted window, [`SealError::NotFound`]
    /// for an unknown case, or a storage error.
    pub fn collect_linked_record_ids(
        &self,
        request: &CollectRequest,
    ) -> Result<LinkedRecordIds, SealError> {
        if let Some(window) = &request.window {
            window.validate()?;
        }
        let store = self.open_migrated()?;
        let all = collect_all(&store, &request.case_id)?;

        let scoped = if request.before_eighteen_only {
            juvenile_record_ids(&store, &request.case_id, request.window.as_ref())?
        } else if let Some(window) = &request.window {
            collect_within(&store, &request.case_id, window)?
        } else {
            ScopedRecordIds { criminal_ids: all.criminal_ids, supervision_ids: all.supervision_ids }
        };

        let linked = LinkedRecordIds {
            criminal_ids: scoped.criminal_ids,
            supervision_ids: scoped.supervision_ids,
            substance_ids: all.substance_ids,
        };
        debug!(case_id = %request.case_id, records = linked.total(), "collected linked record ids");
        Ok(linked)
    }

    /// Record details in the order of `request.ids`, dropping unknown ids.
    ///
    /// # Errors
    /// Returns a storage error when the lookup fails.
    pub fn hydrate(&self, request: &HydrateRequest) -> Result<HydratedRecords, SealError> {
        let store = self.open_migrated()?;
        store.hydrate(request.category, &request.ids)
    }

    /// # Errors
    /// Returns the [`SealError`] raised by validation, the state machine, or storage.
    pub fn seal(&self, request: &SealRequest) -> Result<AuditEntry, SealError> {
        let mut store = self.open_migrated()?;
        store.seal(request)
    }

    /// # Errors
    /// Returns the [`SealError`] raised by validation, the state machine, or storage.
    pub fn restore(&self, request: &SealRequest) -> Result<AuditEntry, SealError> {
        let mut store = self.open_migrated()?;
        store.restore(request)
    }

    /// Audit entries newest first, optionally for a single case.
    ///
    /// # Errors
    /// Returns a storage error when the ledger cannot be read.
    pub fn list_audit(&self, case_id: Option<&CaseId>) -> Result<Vec<AuditEntry>, SealError> {
        let store = self.open_migrated()?;
        match case_id {
            Some(case_id) => store.list_by_case(case_id),
            None => store.list_all(),
        }
    }

    /// Composite pre-sealing view of one case.
    ///
    /// # Errors
    /// Returns [`SealError::Validation`] for an inverted window, [`SealError::NotFound`]
    /// for an unknown case, or a storage error.
    pub fn erase_review(&self, request: &EraseReviewRequest) -> Result<EraseReview, SealError> {
        if let Some(window) = &request.window {
            window.validate()?;
        }
        let store = self.open_migrated()?;
        let eligibility =
            evaluate_eligibility(&store, &request.case_id, request.as_of.unwrap_or_else(today))?;
        let juvenile = juvenile_record_ids(&store, &request.case_id, request.window.as_ref())?;
        let all = collect_all(&store, &request.case_id)?;

        let HydratedRecords::Criminal(criminal) =
            store.hydrate(RecordCategory::Criminal, &juvenile.criminal_ids)?
        else {
            return Err(category_mismatch(RecordCategory::Criminal));
        };
        let HydratedRecords::Supervision(supervision) =
            store.hydrate(RecordCategory::Supervision, &juvenile.supervision_ids)?
        else {
            return Err(category_mismatch(RecordCategory::Supervision));
        };
        let HydratedRecords::Substance(substance) =
            store.hydrate(RecordCategory::Substance, &all.substance_ids)?
        else {
            return Err(category_mismatch(RecordCategory::Substance));
        };

        Ok(EraseReview {
            eighteenth_birthday: eligibility.eighteenth_birthday,
            eligibility,
            criminal,
            supervision,
            substance,
        })
    }

    /// # Errors
    /// Returns a storage error when the ledger cannot be read.
    pub fn verify_ledger(&self) -> Result<LedgerVerification, SealError> {
        let store = self.open_migrated()?;
        store.verify_ledger()
    }

    /// # Errors
    /// Returns an error when the store cannot be migrated or export files cannot be written.
    pub fn export_ledger(&self, out_dir: &Path) -> Result<ExportManifest> {
        let mut store = self.open_store()?;
        store.migrate()?;
        store.export_ledger(out_dir)
    }

    /// # Errors
    /// Returns an error when any integrity probe fails to run.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let store = self.open_store()?;
        store.integrity_check()
    }
}

fn juvenile_record_ids(
    store: &SqliteStore,
    case_id: &CaseId,
    window: Option<&DateWindow>,
) -> Result<ScopedRecordIds, SealError> {
    let case = store.get_case(case_id)?.ok_or_else(|| SealError::case_not_found(case_id))?;
    match case.birth_date.and_then(eighteenth_birthday) {
        Some(cutoff) => collect_before_eighteen(store, case_id, cutoff, window),
        None => Ok(ScopedRecordIds::default()),
    }
}

fn category_mismatch(expected: RecordCategory) -> SealError {
    SealError::Persistence(format!("store returned wrong detail category for {}", expected.as_str()))
}

fn today() -> Date {
    OffsetDateTime::now_utc().date()
}
