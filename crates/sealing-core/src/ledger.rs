use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use ulid::Ulid;

use crate::{CaseId, LinkedRecordIds, SealError};

/// `prev_hash` of the first entry in the ledger.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

const FIELD_ABSENT: u8 = 0;
const FIELD_PRESENT: u8 = 1;

/// Feed one field as a presence tag, a big-endian byte length, then the bytes, so no
/// two distinct field sequences share an encoding.
fn hash_field(hasher: &mut Sha256, field: Option<&str>) {
    match field {
        None => hasher.update([FIELD_ABSENT]),
        Some(value) => {
            hasher.update([FIELD_PRESENT]);
            hasher.update((value.len() as u64).to_be_bytes());
            hasher.update(value.as_bytes());
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AuditEntryId(pub Ulid);

impl AuditEntryId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for AuditEntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for AuditEntryId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Seal,
    Restore,
}

impl AuditAction {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Seal => "seal",
            Self::Restore => "restore",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "seal" => Some(Self::Seal),
            "restore" => Some(Self::Restore),
            _ => None,
        }
    }
}

/// Who performed an action and from where (typically a network address).
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ActorRef {
    pub actor_id: String,
    #[serde(default)]
    pub origin: Option<String>,
}

/// One immutable Seal/Restore record.
///
/// `entry_hash` commits to every other field and to `prev_hash`, so editing any stored
/// entry breaks the chain from that point on.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct AuditEntry {
    pub audit_id: AuditEntryId,
    pub sequence: u64,
    pub case_id: CaseId,
    pub action: AuditAction,
    pub reason: String,
    pub document_number: i64,
    pub actor: ActorRef,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    pub snapshot: LinkedRecordIds,
    pub prev_hash: String,
    pub entry_hash: String,
}

impl AuditEntry {
    /// SHA-256 (lowercase hex) over the canonical field encoding.
    ///
    /// # Errors
    /// Returns [`SealError::Persistence`] when the timestamp or snapshot cannot be encoded.
    pub fn compute_hash(&self) -> Result<String, SealError> {
        let recorded_at = self
            .recorded_at
            .format(&Rfc3339)
            .map_err(|err| SealError::Persistence(format!("failed to format recorded_at: {err}")))?;
        let snapshot = serde_json::to_string(&self.snapshot)
            .map_err(|err| SealError::Persistence(format!("failed to encode snapshot: {err}")))?;

        let sequence = self.sequence.to_string();
        let audit_id = self.audit_id.to_string();
        let document_number = self.document_number.to_string();
        let fields: [Option<&str>; 11] = [
            Some(&sequence),
            Some(&audit_id),
            Some(self.case_id.as_str()),
            Some(self.action.as_str()),
            Some(&self.reason),
            Some(&document_number),
            Some(&self.actor.actor_id),
            self.actor.origin.as_deref(),
            Some(&recorded_at),
            Some(&snapshot),
            Some(&self.prev_hash),
        ];

        let mut hasher = Sha256::new();
        for field in fields {
            hash_field(&mut hasher, field);
        }
        Ok(format!("{:x}", hasher.finalize()))
    }

    #[must_use]
    pub fn tip(&self) -> LedgerTip {
        LedgerTip { sequence: self.sequence, entry_hash: self.entry_hash.clone() }
    }
}

/// Position and hash of the newest ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LedgerTip {
    pub sequence: u64,
    pub entry_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct LedgerVerification {
    pub entries: usize,
    pub ok: bool,
    pub first_broken_sequence: Option<u64>,
    pub reason: Option<String>,
    pub tip_hash: Option<String>,
}

/// Recompute the hash chain over entries ordered oldest first.
#[must_use]
pub fn verify_chain(entries: &[AuditEntry]) -> LedgerVerification {
    let broken = |sequence: u64, reason: String| LedgerVerification {
        entries: entries.len(),
        ok: false,
        first_broken_sequence: Some(sequence),
        reason: Some(reason),
        tip_hash: entries.last().map(|entry| entry.entry_hash.clone()),
    };

    let mut expected_prev = GENESIS_HASH.to_string();
    let mut expected_sequence = 1_u64;
    for entry in entries {
        if entry.sequence != expected_sequence {
            return broken(
                entry.sequence,
                format!("expected sequence {expected_sequence}, found {}", entry.sequence),
            );
        }
        if entry.prev_hash != expected_prev {
            return broken(entry.sequence, "prev_hash does not match preceding entry".to_string());
        }
        match entry.compute_hash() {
            Ok(hash) if hash == entry.entry_hash => {}
            Ok(_) => {
                return broken(entry.sequence, "entry_hash does not match entry content".to_string())
            }
            Err(err) => return broken(entry.sequence, err.to_string()),
        }
        expected_prev.clone_from(&entry.entry_hash);
        expected_sequence += 1;
    }

    LedgerVerification {
        entries: entries.len(),
        ok: true,
        first_broken_sequence: None,
        reason: None,
        tip_hash: entries.last().map(|entry| entry.entry_hash.clone()),
    }
}

/// Read side of the append-only audit ledger. Appends only happen inside a
/// [`crate::SealingTransaction`].
pub trait AuditLedger {
    /// Entries for one case, newest first.
    ///
    /// # Errors
    /// Returns a storage error when the ledger cannot be read.
    fn list_by_case(&self, case_id: &CaseId) -> Result<Vec<AuditEntry>, SealError>;

    /// Every entry, newest first.
    ///
    /// # Errors
    /// Returns a storage error when the ledger cannot be read.
    fn list_all(&self) -> Result<Vec<AuditEntry>, SealError>;
}
