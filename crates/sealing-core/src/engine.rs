use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, warn};

use crate::{
    collect_all, evaluate_eligibility, ActorRef, AuditAction, AuditEntry, AuditEntryId,
    CaseDirectory, CaseId, LedgerTip, SealError, TriState, GENESIS_HASH,
};

/// Sealing state of a case. A case with no recorded flag starts out `Active`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SealState {
    Active,
    Sealed,
}

impl SealState {
    #[must_use]
    pub fn from_flag(flag: TriState) -> Self {
        if flag.is_true() {
            Self::Sealed
        } else {
            Self::Active
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Sealed => "sealed",
        }
    }

    /// Next state for `action`, or the error a retried action must report.
    ///
    /// # Errors
    /// Returns [`SealError::AlreadyErased`] for Seal on a sealed case and
    /// [`SealError::NotErased`] for Restore on an active one.
    pub fn transition(self, action: AuditAction, case_id: &CaseId) -> Result<Self, SealError> {
        match (self, action) {
            (Self::Active, AuditAction::Seal) => Ok(Self::Sealed),
            (Self::Sealed, AuditAction::Restore) => Ok(Self::Active),
            (Self::Sealed, AuditAction::Seal) => Err(SealError::AlreadyErased(case_id.clone())),
            (Self::Active, AuditAction::Restore) => Err(SealError::NotErased(case_id.clone())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct SealRequest {
    pub case_id: CaseId,
    pub reason: String,
    pub document_number: i64,
    pub actor: ActorRef,
    /// Re-check eligibility inside the locked transaction before sealing.
    #[serde(default)]
    pub require_eligibility: bool,
}

impl SealRequest {
    /// # Errors
    /// Returns [`SealError::Validation`] naming the first missing or malformed input.
    pub fn validate(&self) -> Result<(), SealError> {
        if self.case_id.is_blank() {
            return Err(SealError::Validation("case_id MUST be provided".to_string()));
        }
        if self.reason.trim().is_empty() {
            return Err(SealError::Validation("reason MUST be provided".to_string()));
        }
        if self.actor.actor_id.trim().is_empty() {
            return Err(SealError::Validation("actor_id MUST be provided".to_string()));
        }
        if self.document_number <= 0 {
            return Err(SealError::Validation(format!(
                "document_number MUST be positive, got {}",
                self.document_number
            )));
        }
        Ok(())
    }
}

/// A unit of work holding the exclusive write lock for one Seal/Restore.
///
/// Reads through the [`CaseDirectory`] supertrait observe the transaction's own view.
/// Dropping the value without calling [`SealingTransaction::commit`] must discard every
/// write made through it.
pub trait SealingTransaction: CaseDirectory {
    /// # Errors
    /// Returns a storage error when the flag cannot be written.
    fn set_sealed(&mut self, case_id: &CaseId, sealed: bool) -> Result<(), SealError>;

    /// # Errors
    /// Returns a storage error when the ledger cannot be read.
    fn ledger_tip(&self) -> Result<Option<LedgerTip>, SealError>;

    /// # Errors
    /// Returns a storage error when the entry cannot be appended.
    fn append_audit(&mut self, entry: &AuditEntry) -> Result<(), SealError>;

    /// # Errors
    /// Returns a storage error when the commit fails; nothing is published in that case.
    fn commit(self) -> Result<(), SealError>
    where
        Self: Sized;
}

/// Run one Seal or Restore inside `tx` and commit it.
///
/// Any error before the commit drops `tx`, which rolls back the flag change and the
/// ledger append together.
///
/// # Errors
/// Returns [`SealError::Validation`], [`SealError::NotFound`], [`SealError::AlreadyErased`],
/// [`SealError::NotErased`], [`SealError::Ineligible`], or a storage error.
pub fn execute_transition<T: SealingTransaction>(
    mut tx: T,
    action: AuditAction,
    request: &SealRequest,
    recorded_at: OffsetDateTime,
) -> Result<AuditEntry, SealError> {
    request.validate()?;
    let case_id = &request.case_id;

    let case = tx.get_case(case_id)?.ok_or_else(|| SealError::case_not_found(case_id))?;
    let next = SealState::from_flag(case.sealed).transition(action, case_id).map_err(|err| {
        warn!(case_id = %case_id, action = action.as_str(), error = %err, "transition rejected");
        err
    })?;

    if action == AuditAction::Seal && request.require_eligibility {
        let report = evaluate_eligibility(&tx, case_id, recorded_at.date())?;
        if let Some(reason) = report.ineligibility_reason() {
            warn!(case_id = %case_id, reason = %reason, "seal refused by eligibility check");
            return Err(SealError::Ineligible { case_id: case_id.clone(), reason });
        }
    }

    let snapshot = collect_all(&tx, case_id)?;
    debug!(case_id = %case_id, records = snapshot.total(), "snapshot collected");

    tx.set_sealed(case_id, next == SealState::Sealed)?;

    let (sequence, prev_hash) = match tx.ledger_tip()? {
        Some(tip) => (tip.sequence + 1, tip.entry_hash),
        None => (1, GENESIS_HASH.to_string()),
    };
    let mut entry = AuditEntry {
        audit_id: AuditEntryId::new(),
        sequence,
        case_id: case_id.clone(),
        action,
        reason: request.reason.trim().to_string(),
        document_number: request.document_number,
        actor: ActorRef {
            actor_id: request.actor.actor_id.trim().to_string(),
            origin: request.actor.origin.clone(),
        },
        recorded_at,
        snapshot,
        prev_hash,
        entry_hash: String::new(),
    };
    entry.entry_hash = entry.compute_hash()?;

    tx.append_audit(&entry)?;
    tx.commit()?;
    Ok(entry)
}
