use serde::{Deserialize, Serialize};
use time::Date;

use crate::{CaseDirectory, CaseFile, CaseId, RecordId, SealError, SupervisionRecord, TriState};

pub const AGE_OF_MAJORITY_YEARS: i32 = 18;

/// Calendar date of the 18th birthday. A Feb 29 birth date maps to Feb 28 in common years.
///
/// Returns `None` only when the result falls outside the supported calendar range.
#[must_use]
pub fn eighteenth_birthday(birth_date: Date) -> Option<Date> {
    let year = birth_date.year().checked_add(AGE_OF_MAJORITY_YEARS)?;
    Date::from_calendar_date(year, birth_date.month(), birth_date.day())
        .or_else(|_| Date::from_calendar_date(year, birth_date.month(), 28))
        .ok()
}

/// Most recent supervision record: maximum notice date, ties broken by highest id.
#[must_use]
pub fn latest_supervision(records: &[SupervisionRecord]) -> Option<&SupervisionRecord> {
    records.iter().max_by_key(|record| (record.notice_date, record.id))
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct EligibilityReport {
    pub case_id: CaseId,
    pub as_of: Date,
    pub is_over_18: TriState,
    pub is_latest_supervision_closed: TriState,
    pub is_sealed: TriState,
    pub eighteenth_birthday: Option<Date>,
    pub latest_supervision_id: Option<RecordId>,
}

impl EligibilityReport {
    /// Adult subject whose latest supervision case is closed. Indeterminate values never qualify.
    #[must_use]
    pub fn is_eligible(&self) -> bool {
        self.is_over_18.is_true() && self.is_latest_supervision_closed.is_true()
    }

    /// Human-readable reason the case does not qualify, if any.
    #[must_use]
    pub fn ineligibility_reason(&self) -> Option<String> {
        match (self.is_over_18, self.is_latest_supervision_closed) {
            (TriState::True, TriState::True) => None,
            (TriState::Unknown, _) => Some("birth date is unknown".to_string()),
            (TriState::False, _) => Some(format!("subject is under 18 as of {}", self.as_of)),
            (_, TriState::Unknown) => Some("case has no supervision record".to_string()),
            (_, TriState::False) => Some("latest supervision record is still open".to_string()),
        }
    }
}

/// Pure evaluation over already-loaded collaborator data.
#[must_use]
pub fn evaluate_case(
    case: &CaseFile,
    supervision: &[SupervisionRecord],
    as_of: Date,
) -> EligibilityReport {
    let eighteenth = case.birth_date.and_then(eighteenth_birthday);
    let is_over_18 = match (case.birth_date, eighteenth) {
        (None, _) => TriState::Unknown,
        (Some(_), Some(cutoff)) => TriState::from(as_of >= cutoff),
        (Some(_), None) => TriState::False,
    };

    let latest = latest_supervision(supervision);
    let is_latest_supervision_closed =
        latest.map_or(TriState::Unknown, |record| TriState::from(record.is_closed()));

    EligibilityReport {
        case_id: case.case_id.clone(),
        as_of,
        is_over_18,
        is_latest_supervision_closed,
        is_sealed: case.sealed,
        eighteenth_birthday: eighteenth,
        latest_supervision_id: latest.map(|record| record.id),
    }
}

/// Read-only eligibility check for one case.
///
/// # Errors
/// Returns [`SealError::NotFound`] when the case does not exist, or a storage error
/// when the directory fails. Missing sub-conditions are reported as `Unknown`.
pub fn evaluate_eligibility<D: CaseDirectory + ?Sized>(
    directory: &D,
    case_id: &CaseId,
    as_of: Date,
) -> Result<EligibilityReport, SealError> {
    let case = directory
        .get_case(case_id)?
        .ok_or_else(|| SealError::case_not_found(case_id))?;
    let supervision = directory.supervision_records(case_id)?;
    Ok(evaluate_case(&case, &supervision, as_of))
}
