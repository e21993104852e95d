#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::access::UserId;
use crate::form::{FormId, SubFormId};
use crate::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};

/// The one identifier shared by a ledger row and its dynamic row.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SubmissionId(pub Uuid);

impl SubmissionId {
    pub fn allocate() -> Self {
        SubmissionId(Uuid::new_v4())
    }

    pub fn parse(raw: &str) -> Result<Self, ContractViolation> {
        Uuid::parse_str(raw.trim())
            .map(SubmissionId)
            .map_err(|_| ContractViolation::InvalidValue {
                field: "submission_id",
                reason: "must be a uuid",
            })
    }
}

impl std::fmt::Display for SubmissionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct SubRecordId(pub Uuid);

impl SubRecordId {
    pub fn allocate() -> Self {
        SubRecordId(Uuid::new_v4())
    }
}

impl std::fmt::Display for SubRecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmissionStatus {
    Submitted,
    Updated,
}

/// Canonical ledger row. Holds no field values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submission {
    pub submission_id: SubmissionId,
    pub form_id: FormId,
    pub submitter_id: UserId,
    pub status: SubmissionStatus,
    pub created_at: MonotonicTimeNs,
    pub updated_at: MonotonicTimeNs,
    pub form_version: SchemaVersion,
}

impl Validate for Submission {
    fn validate(&self) -> Result<(), ContractViolation> {
        if self.updated_at < self.created_at {
            return Err(ContractViolation::InvalidValue {
                field: "submission.updated_at",
                reason: "must be >= created_at",
            });
        }
        if self.form_version.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "submission.form_version",
                reason: "must be > 0",
            });
        }
        Ok(())
    }
}

/// Sealed value of a sensitive field: per-value nonce, ciphertext and AEAD tag,
/// plus the id of the key that sealed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldEnvelope {
    pub key_id: String,
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub tag: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CellValue {
    Null,
    Text(String),
    Numeric(f64),
    /// Normalized ISO-8601 form (`YYYY-MM-DD` for dates, RFC 3339 UTC for date-times).
    Timestamp(String),
    Boolean(bool),
    Document(serde_json::Value),
    Encrypted(FieldEnvelope),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }
}

pub type Cells = BTreeMap<String, CellValue>;

/// One row of a form's dynamic table. `record_id` equals the ledger row's id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicRecord {
    pub record_id: SubmissionId,
    pub form_version: SchemaVersion,
    pub cells: Cells,
    pub created_at: MonotonicTimeNs,
    pub updated_at: MonotonicTimeNs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubFormRecord {
    pub sub_record_id: SubRecordId,
    pub parent_ref: SubmissionId,
    pub sub_form_id: SubFormId,
    pub form_version: SchemaVersion,
    pub cells: Cells,
    pub created_at: MonotonicTimeNs,
    /// Insertion order within the sub-form table.
    pub seq: u64,
}

/// Optional audit entry for a sub-form record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubFormLedgerRow {
    pub sub_record_id: SubRecordId,
    pub parent_submission_id: SubmissionId,
    pub form_id: FormId,
    pub sub_form_id: SubFormId,
    pub submitter_id: UserId,
    pub created_at: MonotonicTimeNs,
}
