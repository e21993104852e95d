#![forbid(unsafe_code)]

use std::sync::Arc;

use formvault_contracts::access::UserId;
use formvault_contracts::form::{FormDefinition, SubFormId};
use formvault_contracts::submission::{
    SubFormLedgerRow, SubFormRecord, SubRecordId, Submission, SubmissionId,
};
use formvault_contracts::{MonotonicTimeNs, SchemaVersion};
use formvault_engines::field_codec::KeyProvider;
use formvault_engines::payload::{Payload, PayloadCodec, ValidationError};
use formvault_storage::repo::{FormRegistryRepo, SubmissionRepo};
use formvault_storage::store::{FormStore, StorageError, WriteBatch, WriteOp};
use formvault_storage::table_manager::TableManager;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::{EngineConfig, SubFormAuditPolicy};
use crate::coordinator::commit_with_retry;
use crate::error::EngineError;

/// Decoded sub-form record as handed to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubFormEntry {
    pub sub_record_id: SubRecordId,
    pub parent_ref: SubmissionId,
    pub sub_form_id: SubFormId,
    pub form_version: SchemaVersion,
    pub created_at: MonotonicTimeNs,
    pub values: Payload,
}

/// Attaches sub-form records to a parent submission through `parent_ref`, which
/// is the parent's submission id itself.
pub struct SubformLinker {
    store: Arc<FormStore>,
    tables: Arc<TableManager>,
    keys: Arc<dyn KeyProvider>,
    config: EngineConfig,
}

impl SubformLinker {
    pub fn new(tables: Arc<TableManager>, keys: Arc<dyn KeyProvider>, config: EngineConfig) -> Self {
        Self {
            store: tables.store().clone(),
            tables,
            keys,
            config,
        }
    }

    pub fn submit_subform(
        &self,
        parent_id: &SubmissionId,
        sub_form_id: &SubFormId,
        payload: &Payload,
        submitter: &UserId,
    ) -> Result<SubRecordId, EngineError> {
        let parent = self.resolve_parent(parent_id)?;
        let lock = self.tables.schema_lock(&parent.form_id);
        let _shared = lock.read();

        let definition = self.definition(&parent)?;
        let Some(sub_def) = definition.sub_form(sub_form_id) else {
            return Err(ValidationError::single("sub_form_id", "unknown sub-form for this form").into());
        };
        let table = TableManager::sub_table_name(&parent.form_id, sub_form_id);
        let shape = self.store.dynamic_table_shape(&table).ok_or_else(|| {
            EngineError::from_storage(
                "submit_subform",
                StorageError::TableMissing {
                    table: table.clone(),
                },
            )
        })?;

        let normalized = PayloadCodec::validate(&sub_def.fields, &shape.columns, payload)?;
        let cells = PayloadCodec::encode(&normalized, self.keys.as_ref())
            .map_err(|e| EngineError::from_encryption("submit_subform", e))?;

        let sub_record_id = SubRecordId::allocate();
        let now = MonotonicTimeNs::now();
        let ledger = match self.config.sub_form_audit {
            SubFormAuditPolicy::LedgerEntry => Some(SubFormLedgerRow {
                sub_record_id,
                parent_submission_id: *parent_id,
                form_id: parent.form_id.clone(),
                sub_form_id: sub_form_id.clone(),
                submitter_id: submitter.clone(),
                created_at: now,
            }),
            SubFormAuditPolicy::AuditExempt => None,
        };
        let mut batch = WriteBatch::new();
        batch.push(WriteOp::InsertSubFormRecord {
            table,
            record: SubFormRecord {
                sub_record_id,
                parent_ref: *parent_id,
                sub_form_id: sub_form_id.clone(),
                form_version: definition.version,
                cells,
                created_at: now,
                seq: 0,
            },
            ledger,
        });

        match commit_with_retry(&*self.store, &self.config.retry, "submit_subform", batch) {
            Ok(_) => {
                info!(
                    parent_id = %parent_id,
                    sub_form_id = %sub_form_id,
                    sub_record_id = %sub_record_id,
                    "sub-form record committed"
                );
                Ok(sub_record_id)
            }
            // Parent removed between resolve and commit.
            Err(StorageError::ForeignKeyViolation { .. }) => Err(EngineError::ParentNotFound),
            Err(e) => Err(EngineError::from_storage("submit_subform", e)),
        }
    }

    /// Every sub-form record whose `parent_ref` is `parent_id`, across all of the
    /// form's sub-forms, in insertion order. Empty for a parent with no children.
    pub fn list_subforms(&self, parent_id: &SubmissionId) -> Result<Vec<SubFormEntry>, EngineError> {
        let parent = self.resolve_parent(parent_id)?;
        let lock = self.tables.schema_lock(&parent.form_id);
        let _shared = lock.read();
        let definition = self.definition(&parent)?;

        let mut rows: Vec<(SubFormRecord, Vec<_>)> = Vec::new();
        for sub in &definition.sub_forms {
            let table = TableManager::sub_table_name(&parent.form_id, &sub.sub_form_id);
            let Some(shape) = self.store.dynamic_table_shape(&table) else {
                debug!(sub_form_id = %sub.sub_form_id, "sub-form table not materialized");
                continue;
            };
            let records = self
                .store
                .sub_record_rows_for_parent(&table, parent_id)
                .map_err(|e| EngineError::from_storage("list_subforms", e))?;
            rows.extend(records.into_iter().map(|r| (r, shape.columns.clone())));
        }
        rows.sort_by_key(|(r, _)| r.seq);

        rows.into_iter()
            .map(|(record, columns)| {
                let values = PayloadCodec::decode(&columns, &record.cells, self.keys.as_ref())
                    .map_err(|e| EngineError::from_encryption("list_subforms", e))?;
                Ok(SubFormEntry {
                    sub_record_id: record.sub_record_id,
                    parent_ref: record.parent_ref,
                    sub_form_id: record.sub_form_id,
                    form_version: record.form_version,
                    created_at: record.created_at,
                    values,
                })
            })
            .collect()
    }

    /// The parent must exist as a full pair; a lone ledger row is an integrity failure.
    pub(crate) fn resolve_parent(&self, parent_id: &SubmissionId) -> Result<Submission, EngineError> {
        let Some(ledger) = self.store.ledger_row(parent_id) else {
            return Err(EngineError::ParentNotFound);
        };
        let table = TableManager::form_table_name(&ledger.form_id);
        match self.store.submission_pair_rows(&table, parent_id) {
            Ok((Some(l), Some(_))) => Ok(l),
            Ok((None, None)) => Err(EngineError::ParentNotFound),
            Ok(_) => Err(EngineError::integrity(
                "resolve_parent",
                "parent ledger row has no dynamic row",
            )),
            Err(e) => Err(EngineError::from_storage("resolve_parent", e)),
        }
    }

    fn definition(&self, parent: &Submission) -> Result<FormDefinition, EngineError> {
        self.store
            .form_row(&parent.form_id)
            .ok_or_else(|| EngineError::FormNotFound(parent.form_id.clone()))
    }
}
