use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::Date;

use crate::{CaseDirectory, CaseId, RecordId, SealError};

/// All record ids linked to one case, each ascending by record date then id.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct LinkedRecordIds {
    pub criminal_ids: Vec<RecordId>,
    pub supervision_ids: Vec<RecordId>,
    pub substance_ids: Vec<RecordId>,
}

impl LinkedRecordIds {
    #[must_use]
    pub fn total(&self) -> usize {
        self.criminal_ids.len() + self.supervision_ids.len() + self.substance_ids.len()
    }
}

/// Criminal and supervision ids after date filtering. Substance records are never filtered.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
pub struct ScopedRecordIds {
    pub criminal_ids: Vec<RecordId>,
    pub supervision_ids: Vec<RecordId>,
}

/// Inclusive `[start, end]` date range.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct DateWindow {
    pub start: Date,
    pub end: Date,
}

impl DateWindow {
    /// # Errors
    /// Returns [`SealError::Validation`] when `start` is after `end`.
    pub fn new(start: Date, end: Date) -> Result<Self, SealError> {
        let window = Self { start, end };
        window.validate()?;
        Ok(window)
    }

    /// # Errors
    /// Returns [`SealError::Validation`] when `start` is after `end`.
    pub fn validate(&self) -> Result<(), SealError> {
        if self.start > self.end {
            return Err(SealError::Validation(format!(
                "window start {} is after window end {}",
                self.start, self.end
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, date: Date) -> bool {
        self.start <= date && date <= self.end
    }
}

fn require_case<D: CaseDirectory + ?Sized>(directory: &D, case_id: &CaseId) -> Result<(), SealError> {
    match directory.get_case(case_id)? {
        Some(_) => Ok(()),
        None => Err(SealError::case_not_found(case_id)),
    }
}

fn ordered_ids(mut dated: Vec<(Date, RecordId)>) -> Vec<RecordId> {
    dated.sort_unstable();
    dated.into_iter().map(|(_, id)| id).collect()
}

fn scoped<D, F>(directory: &D, case_id: &CaseId, keep: F) -> Result<ScopedRecordIds, SealError>
where
    D: CaseDirectory + ?Sized,
    F: Fn(Date) -> bool,
{
    require_case(directory, case_id)?;

    let criminal = directory
        .criminal_records(case_id)?
        .into_iter()
        .filter(|record| keep(record.record_date))
        .map(|record| (record.record_date, record.id))
        .collect();
    let supervision = directory
        .supervision_records(case_id)?
        .into_iter()
        .filter(|record| keep(record.notice_date))
        .map(|record| (record.notice_date, record.id))
        .collect();

    Ok(ScopedRecordIds {
        criminal_ids: ordered_ids(criminal),
        supervision_ids: ordered_ids(supervision),
    })
}

/// Unfiltered snapshot of every record linked to the case.
///
/// # Errors
/// Returns [`SealError::NotFound`] when the case does not exist, or a storage error.
pub fn collect_all<D: CaseDirectory + ?Sized>(
    directory: &D,
    case_id: &CaseId,
) -> Result<LinkedRecordIds, SealError> {
    require_case(directory, case_id)?;

    let criminal = directory
        .criminal_records(case_id)?
        .into_iter()
        .map(|record| (record.record_date, record.id))
        .collect();
    let supervision = directory
        .supervision_records(case_id)?
        .into_iter()
        .map(|record| (record.notice_date, record.id))
        .collect();
    let substance = directory
        .substance_records(case_id)?
        .into_iter()
        .map(|record| (record.created_date, record.id))
        .collect();

    Ok(LinkedRecordIds {
        criminal_ids: ordered_ids(criminal),
        supervision_ids: ordered_ids(supervision),
        substance_ids: ordered_ids(substance),
    })
}

/// Criminal and supervision ids dated strictly before `eighteenth_birthday`,
/// optionally narrowed to an inclusive window.
///
/// # Errors
/// Returns [`SealError::Validation`] for an inverted window, [`SealError::NotFound`]
/// when the case does not exist, or a storage error.
pub fn collect_before_eighteen<D: CaseDirectory + ?Sized>(
    directory: &D,
    case_id: &CaseId,
    eighteenth_birthday: Date,
    window: Option<&DateWindow>,
) -> Result<ScopedRecordIds, SealError> {
    if let Some(window) = window {
        window.validate()?;
    }
    scoped(directory, case_id, |date| {
        let in_window = match window {
            Some(window) => window.contains(date),
            None => true,
        };
        date < eighteenth_birthday && in_window
    })
}

/// Criminal and supervision ids dated inside the window, with no age cutoff.
///
/// # Errors
/// Returns [`SealError::Validation`] for an inverted window, [`SealError::NotFound`]
/// when the case does not exist, or a storage error.
pub fn collect_within<D: CaseDirectory + ?Sized>(
    directory: &D,
    case_id: &CaseId,
    window: &DateWindow,
) -> Result<ScopedRecordIds, SealError> {
    window.validate()?;
    scoped(directory, case_id, |date| window.contains(date))
}

/// Reassemble `fetched` in the order of `ids`.
///
/// Set lookups return rows in arbitrary order. Ids with no fetched row are dropped and
/// repeated ids repeat their row.
#[must_use]
pub fn restore_input_order<T, K, F>(ids: &[K], fetched: Vec<T>, key: F) -> Vec<T>
where
    T: Clone,
    K: Ord + Clone,
    F: Fn(&T) -> K,
{
    let by_id = fetched
        .into_iter()
        .map(|item| (key(&item), item))
        .collect::<BTreeMap<_, _>>();
    ids.iter().filter_map(|id| by_id.get(id).cloned()).collect()
}
