#![forbid(unsafe_code)]

use std::sync::Arc;
use std::thread;

use formvault_contracts::access::UserId;
use formvault_contracts::form::{FormDefinition, FormId};
use formvault_contracts::submission::{
    DynamicRecord, Submission, SubmissionId, SubmissionStatus,
};
use formvault_contracts::{MonotonicTimeNs, SchemaVersion};
use formvault_engines::field_codec::KeyProvider;
use formvault_engines::payload::{Payload, PayloadCodec};
use formvault_storage::repo::{FormRegistryRepo, SubmissionRepo};
use formvault_storage::store::{
    CommitReceipt, FormStore, StorageError, TableShape, WriteBatch, WriteOp,
};
use formvault_storage::table_manager::TableManager;
use tracing::{debug, info, warn};

use crate::config::{DeletePolicy, EngineConfig, RetryPolicy};
use crate::error::EngineError;

/// Commits `batch`, retrying transient failures with bounded backoff. Safe because
/// every id in the batch was allocated before the first attempt and a failed
/// commit leaves nothing behind.
pub(crate) fn commit_with_retry(
    repo: &dyn SubmissionRepo,
    policy: &RetryPolicy,
    op: &'static str,
    batch: WriteBatch,
) -> Result<CommitReceipt, StorageError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match repo.commit_batch(batch.clone()) {
            Ok(receipt) => {
                if attempt > 1 {
                    info!(op, attempt, "commit succeeded after retry");
                }
                return Ok(receipt);
            }
            Err(err) if err.is_transient() && attempt < max_attempts => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(op, attempt, ?delay, error = %err, "transient commit failure, retrying");
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// A fully built, not yet committed submission. Dropping it leaves no trace.
#[must_use = "a prepared submission does nothing until committed"]
#[derive(Debug, Clone)]
pub struct PreparedSubmission {
    submission_id: SubmissionId,
    form_id: FormId,
    form_version: SchemaVersion,
    submitter: UserId,
    payload: Payload,
    batch: WriteBatch,
}

impl PreparedSubmission {
    pub fn submission_id(&self) -> SubmissionId {
        self.submission_id
    }

    pub fn form_id(&self) -> &FormId {
        &self.form_id
    }

    pub fn form_version(&self) -> SchemaVersion {
        self.form_version
    }
}

struct ResolvedForm {
    definition: FormDefinition,
    table: String,
    shape: TableShape,
}

/// Writes ledger and dynamic rows as one unit, always under one shared id.
pub struct SubmissionCoordinator {
    store: Arc<FormStore>,
    tables: Arc<TableManager>,
    keys: Arc<dyn KeyProvider>,
    config: EngineConfig,
}

impl SubmissionCoordinator {
    pub fn new(tables: Arc<TableManager>, keys: Arc<dyn KeyProvider>, config: EngineConfig) -> Self {
        Self {
            store: tables.store().clone(),
            tables,
            keys,
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn submit(
        &self,
        form_id: &FormId,
        payload: &Payload,
        submitter: &UserId,
    ) -> Result<SubmissionId, EngineError> {
        let lock = self.tables.schema_lock(form_id);
        let _shared = lock.read();
        let prepared =
            self.build_insert(form_id, payload.clone(), submitter, SubmissionId::allocate())?;
        self.commit_locked(prepared)
    }

    /// Validates, allocates the id and encrypts, but writes nothing.
    pub fn prepare_submit(
        &self,
        form_id: &FormId,
        payload: &Payload,
        submitter: &UserId,
    ) -> Result<PreparedSubmission, EngineError> {
        let lock = self.tables.schema_lock(form_id);
        let _shared = lock.read();
        self.build_insert(form_id, payload.clone(), submitter, SubmissionId::allocate())
    }

    /// Commits a prepared submission. If the form evolved in between, the payload is
    /// validated again against the current schema under the same id.
    pub fn commit(&self, prepared: PreparedSubmission) -> Result<SubmissionId, EngineError> {
        let lock = self.tables.schema_lock(&prepared.form_id);
        let _shared = lock.read();
        let current = self
            .store
            .form_row(&prepared.form_id)
            .ok_or_else(|| EngineError::FormNotFound(prepared.form_id.clone()))?;
        let prepared = if current.version == prepared.form_version {
            prepared
        } else {
            debug!(
                form_id = %prepared.form_id,
                from = prepared.form_version.0,
                to = current.version.0,
                "schema moved since prepare, rebuilding"
            );
            let PreparedSubmission {
                submission_id,
                form_id,
                submitter,
                payload,
                ..
            } = prepared;
            self.build_insert(&form_id, payload, &submitter, submission_id)?
        };
        self.commit_locked(prepared)
    }

    /// Replaces every field value of a submission. `Ok(None)` when it does not exist.
    pub fn update(
        &self,
        submission_id: &SubmissionId,
        payload: &Payload,
    ) -> Result<Option<Submission>, EngineError> {
        let Some(existing) = self.store.ledger_row(submission_id) else {
            return Ok(None);
        };
        let lock = self.tables.schema_lock(&existing.form_id);
        let _shared = lock.read();
        let form = self.resolve_form(&existing.form_id)?;

        let (ledger, dynamic) = self
            .store
            .submission_pair_rows(&form.table, submission_id)
            .map_err(|e| EngineError::from_storage("update", e))?;
        let (ledger, dynamic) = match (ledger, dynamic) {
            (Some(l), Some(d)) => (l, d),
            (None, None) => return Ok(None),
            _ => return Err(EngineError::integrity("update", "pair incomplete before update")),
        };

        let normalized =
            PayloadCodec::validate(&form.definition.fields, &form.shape.columns, payload)?;
        let cells = PayloadCodec::encode(&normalized, self.keys.as_ref())
            .map_err(|e| EngineError::from_encryption("update", e))?;
        let now = MonotonicTimeNs::now().max(ledger.created_at);

        let updated = Submission {
            status: SubmissionStatus::Updated,
            updated_at: now,
            form_version: form.definition.version,
            ..ledger
        };
        let record = DynamicRecord {
            record_id: *submission_id,
            form_version: form.definition.version,
            cells,
            created_at: dynamic.created_at,
            updated_at: now,
        };
        let mut batch = WriteBatch::new();
        batch.push(WriteOp::UpdateSubmission {
            table: form.table,
            ledger: updated.clone(),
            record,
        });
        match commit_with_retry(&*self.store, &self.config.retry, "update", batch) {
            Ok(_) => {
                info!(
                    submission_id = %submission_id,
                    form_id = %updated.form_id,
                    version = updated.form_version.0,
                    "submission updated"
                );
                Ok(Some(updated))
            }
            Err(StorageError::NotFound { .. }) => Ok(None),
            Err(e) => Err(EngineError::from_storage("update", e)),
        }
    }

    /// Removes the pair, applying the configured policy to sub-form rows.
    /// `Ok(None)` when the submission does not exist.
    pub fn delete(&self, submission_id: &SubmissionId) -> Result<Option<Submission>, EngineError> {
        let Some(existing) = self.store.ledger_row(submission_id) else {
            return Ok(None);
        };
        let lock = self.tables.schema_lock(&existing.form_id);
        let _shared = lock.read();
        let form = self.resolve_form(&existing.form_id)?;

        let mut batch = WriteBatch::new();
        if self.config.delete_policy == DeletePolicy::Cascade {
            for sub in &form.definition.sub_forms {
                let table = TableManager::sub_table_name(&existing.form_id, &sub.sub_form_id);
                if self.store.dynamic_table_shape(&table).is_some() {
                    batch.push(WriteOp::DeleteSubFormRecords {
                        table,
                        parent_ref: *submission_id,
                    });
                }
            }
        }
        batch.push(WriteOp::DeleteSubmission {
            table: form.table,
            submission_id: *submission_id,
        });

        match commit_with_retry(&*self.store, &self.config.retry, "delete", batch) {
            Ok(_) => {
                info!(
                    submission_id = %submission_id,
                    form_id = %existing.form_id,
                    policy = ?self.config.delete_policy,
                    "submission deleted"
                );
                Ok(Some(existing))
            }
            Err(StorageError::ForeignKeyViolation { .. }) => Err(EngineError::HasDependents),
            Err(StorageError::NotFound { .. }) => Ok(None),
            Err(e) => Err(EngineError::from_storage("delete", e)),
        }
    }

    fn resolve_form(&self, form_id: &FormId) -> Result<ResolvedForm, EngineError> {
        let definition = self
            .store
            .form_row(form_id)
            .ok_or_else(|| EngineError::FormNotFound(form_id.clone()))?;
        let table = TableManager::form_table_name(form_id);
        let shape = self.store.dynamic_table_shape(&table).ok_or_else(|| {
            EngineError::from_storage(
                "resolve_form",
                StorageError::TableMissing {
                    table: table.clone(),
                },
            )
        })?;
        Ok(ResolvedForm {
            definition,
            table,
            shape,
        })
    }

    fn build_insert(
        &self,
        form_id: &FormId,
        payload: Payload,
        submitter: &UserId,
        submission_id: SubmissionId,
    ) -> Result<PreparedSubmission, EngineError> {
        let form = self.resolve_form(form_id)?;
        let normalized =
            PayloadCodec::validate(&form.definition.fields, &form.shape.columns, &payload)?;
        let cells = PayloadCodec::encode(&normalized, self.keys.as_ref())
            .map_err(|e| EngineError::from_encryption("submit", e))?;

        let now = MonotonicTimeNs::now();
        let version = form.definition.version;
        let ledger = Submission {
            submission_id,
            form_id: form_id.clone(),
            submitter_id: submitter.clone(),
            status: SubmissionStatus::Submitted,
            created_at: now,
            updated_at: now,
            form_version: version,
        };
        let record = DynamicRecord {
            record_id: submission_id,
            form_version: version,
            cells,
            created_at: now,
            updated_at: now,
        };
        let mut batch = WriteBatch::new();
        batch.push(WriteOp::InsertSubmission {
            table: form.table,
            ledger,
            record,
        });
        Ok(PreparedSubmission {
            submission_id,
            form_id: form_id.clone(),
            form_version: version,
            submitter: submitter.clone(),
            payload,
            batch,
        })
    }

    fn commit_locked(&self, prepared: PreparedSubmission) -> Result<SubmissionId, EngineError> {
        let PreparedSubmission {
            submission_id,
            form_id,
            form_version,
            batch,
            ..
        } = prepared;
        commit_with_retry(&*self.store, &self.config.retry, "submit", batch)
            .map_err(|e| EngineError::from_storage("submit", e))?;
        info!(
            submission_id = %submission_id,
            form_id = %form_id,
            version = form_version.0,
            "submission committed"
        );
        Ok(submission_id)
    }
}
