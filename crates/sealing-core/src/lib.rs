//! Domain model for juvenile record sealing.
//!
//! The crate is storage-agnostic: persistence layers implement [`CaseDirectory`],
//! [`AuditLedger`], and [`SealingTransaction`], and every rule about eligibility,
//! record collection, and the Seal/Restore state machine lives here.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::Date;

mod collector;
mod eligibility;
mod engine;
mod ledger;

pub use collector::{
    collect_all, collect_before_eighteen, collect_within, restore_input_order, DateWindow,
    LinkedRecordIds, ScopedRecordIds,
};
pub use eligibility::{
    eighteenth_birthday, evaluate_case, evaluate_eligibility, latest_supervision,
    EligibilityReport, AGE_OF_MAJORITY_YEARS,
};
pub use engine::{execute_transition, SealRequest, SealState, SealingTransaction};
pub use ledger::{
    verify_chain, ActorRef, AuditAction, AuditEntry, AuditEntryId, AuditLedger, LedgerTip,
    LedgerVerification, GENESIS_HASH,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SealError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("case {0} is already sealed")]
    AlreadyErased(CaseId),
    #[error("case {0} is not sealed")]
    NotErased(CaseId),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("case {case_id} is not eligible for sealing: {reason}")]
    Ineligible { case_id: CaseId, reason: String },
    #[error("concurrency conflict: {0}")]
    ConcurrencyConflict(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
}

impl SealError {
    /// Stable machine-readable name of the error kind.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::AlreadyErased(_) => "already_erased",
            Self::NotErased(_) => "not_erased",
            Self::Validation(_) => "validation_error",
            Self::Ineligible { .. } => "ineligible",
            Self::ConcurrencyConflict(_) => "concurrency_conflict",
            Self::Persistence(_) => "persistence_failure",
        }
    }

    #[must_use]
    pub fn case_not_found(case_id: &CaseId) -> Self {
        Self::NotFound(format!("case {case_id}"))
    }
}

/// Case number identifying one subject's case file.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct CaseId(String);

impl CaseId {
    /// Parse a case number, trimming surrounding whitespace.
    ///
    /// # Errors
    /// Returns [`SealError::Validation`] when the value is blank.
    pub fn parse(raw: &str) -> Result<Self, SealError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(SealError::Validation("case_id MUST be provided".to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl Display for CaseId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a linked record. Higher values were created later.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct RecordId(pub i64);

impl Display for RecordId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Three-valued flag. `Unknown` is never read as `False`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TriState {
    True,
    False,
    Unknown,
}

impl TriState {
    #[must_use]
    pub fn from_option(value: Option<bool>) -> Self {
        match value {
            Some(true) => Self::True,
            Some(false) => Self::False,
            None => Self::Unknown,
        }
    }

    #[must_use]
    pub fn as_option(self) -> Option<bool> {
        match self {
            Self::True => Some(true),
            Self::False => Some(false),
            Self::Unknown => None,
        }
    }

    #[must_use]
    pub fn is_true(self) -> bool {
        self == Self::True
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::True => "true",
            Self::False => "false",
            Self::Unknown => "unknown",
        }
    }
}

impl From<bool> for TriState {
    fn from(value: bool) -> Self {
        if value {
            Self::True
        } else {
            Self::False
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum RecordCategory {
    Criminal,
    Supervision,
    Substance,
}

impl RecordCategory {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Criminal => "criminal",
            Self::Supervision => "supervision",
            Self::Substance => "substance",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "criminal" => Some(Self::Criminal),
            "supervision" => Some(Self::Supervision),
            "substance" => Some(Self::Substance),
            _ => None,
        }
    }
}

/// The slice of a case file this subsystem reads. Only `sealed` is ever written here.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CaseFile {
    pub case_id: CaseId,
    pub birth_date: Option<Date>,
    pub sealed: TriState,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SupervisionRecord {
    pub id: RecordId,
    pub case_id: CaseId,
    pub notice_date: Date,
    pub close_date: Option<Date>,
}

impl SupervisionRecord {
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.close_date.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CriminalRecord {
    pub id: RecordId,
    pub case_id: CaseId,
    pub record_date: Date,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SubstanceRecord {
    pub id: RecordId,
    pub case_id: CaseId,
    pub created_date: Date,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct CriminalRecordDetail {
    pub id: RecordId,
    pub case_id: CaseId,
    pub record_date: Date,
    pub branch_name: Option<String>,
    pub crime_name: Option<String>,
    pub sentence_type: Option<String>,
    pub memo: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SupervisionRecordDetail {
    pub id: RecordId,
    pub case_id: CaseId,
    pub notice_date: Date,
    pub close_date: Option<Date>,
    pub closed: bool,
    pub branch_name: Option<String>,
    pub source_text: Option<String>,
    pub archive_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SubstanceRecordDetail {
    pub id: RecordId,
    pub case_id: CaseId,
    pub created_date: Date,
    pub branch_name: Option<String>,
    pub substance_summary: Option<String>,
    pub referral_text: Option<String>,
}

/// Detail objects for one category, in caller-supplied order.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "category", content = "records", rename_all = "snake_case")]
pub enum HydratedRecords {
    Criminal(Vec<CriminalRecordDetail>),
    Supervision(Vec<SupervisionRecordDetail>),
    Substance(Vec<SubstanceRecordDetail>),
}

impl HydratedRecords {
    #[must_use]
    pub fn category(&self) -> RecordCategory {
        match self {
            Self::Criminal(_) => RecordCategory::Criminal,
            Self::Supervision(_) => RecordCategory::Supervision,
            Self::Substance(_) => RecordCategory::Substance,
        }
    }

    #[must_use]
    pub fn ids(&self) -> Vec<RecordId> {
        match self {
            Self::Criminal(records) => records.iter().map(|record| record.id).collect(),
            Self::Supervision(records) => records.iter().map(|record| record.id).collect(),
            Self::Substance(records) => records.iter().map(|record| record.id).collect(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        match self {
            Self::Criminal(records) => records.len(),
            Self::Supervision(records) => records.len(),
            Self::Substance(records) => records.len(),
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Read-only view of the case-management collaborators.
///
/// Record sequences may come back in any order; callers sort.
pub trait CaseDirectory {
    /// Load the case file, or `None` when no such case exists.
    ///
    /// # Errors
    /// Returns [`SealError::Persistence`] or [`SealError::ConcurrencyConflict`] when the
    /// backing store fails.
    fn get_case(&self, case_id: &CaseId) -> Result<Option<CaseFile>, SealError>;

    /// # Errors
    /// Returns a storage error when the backing store fails.
    fn supervision_records(&self, case_id: &CaseId) -> Result<Vec<SupervisionRecord>, SealError>;

    /// # Errors
    /// Returns a storage error when the backing store fails.
    fn criminal_records(&self, case_id: &CaseId) -> Result<Vec<CriminalRecord>, SealError>;

    /// # Errors
    /// Returns a storage error when the backing store fails.
    fn substance_records(&self, case_id: &CaseId) -> Result<Vec<SubstanceRecord>, SealError>;
}

impl<D: CaseDirectory + ?Sized> CaseDirectory for &D {
    fn get_case(&self, case_id: &CaseId) -> Result<Option<CaseFile>, SealError> {
        (**self).get_case(case_id)
    }

    fn supervision_records(&self, case_id: &CaseId) -> Result<Vec<SupervisionRecord>, SealError> {
        (**self).supervision_records(case_id)
    }

    fn criminal_records(&self, case_id: &CaseId) -> Result<Vec<CriminalRecord>, SealError> {
        (**self).criminal_records(case_id)
    }

    fn substance_records(&self, case_id: &CaseId) -> Result<Vec<SubstanceRecord>, SealError> {
        (**self).substance_records(case_id)
    }
}
