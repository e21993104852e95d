#![forbid(unsafe_code)]

use std::sync::Arc;

use formvault_contracts::access::{AccessRule, AuthContext};
use formvault_contracts::form::{FormDefinition, FormId, SubFormId};
use formvault_contracts::submission::{SubRecordId, Submission, SubmissionId};
use formvault_contracts::{SchemaVersion, Validate};
use formvault_engines::field_codec::KeyProvider;
use formvault_engines::payload::{Payload, PayloadCodec};
use formvault_engines::schema_registry::SchemaRegistry;
use formvault_storage::repo::{FormRegistryRepo, SubmissionRepo};
use formvault_storage::store::{FormStore, StorageError};
use formvault_storage::table_manager::TableManager;
use serde::Serialize;
use tracing::{info, warn};

use crate::access_filter::AccessFilter;
use crate::config::{ConfigError, EngineConfig, PermissionMatrixHandle};
use crate::coordinator::{PreparedSubmission, SubmissionCoordinator};
use crate::error::{EngineError, Outcome};
use crate::subform_linker::{SubFormEntry, SubformLinker};

/// A submission's ledger row together with its decoded field values.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubmissionView {
    pub submission: Submission,
    pub values: Payload,
}

/// The engine's caller-facing API. Every operation takes an already-verified
/// caller identity; permissions come from the injected matrix handle.
pub struct FormService {
    store: Arc<FormStore>,
    tables: Arc<TableManager>,
    coordinator: SubmissionCoordinator,
    linker: SubformLinker,
    keys: Arc<dyn KeyProvider>,
    permissions: Arc<PermissionMatrixHandle>,
}

impl FormService {
    pub fn new(
        config: EngineConfig,
        keys: Arc<dyn KeyProvider>,
        permissions: Arc<PermissionMatrixHandle>,
    ) -> Self {
        Self::with_store(Arc::new(FormStore::new_in_memory()), config, keys, permissions)
    }

    pub fn with_store(
        store: Arc<FormStore>,
        config: EngineConfig,
        keys: Arc<dyn KeyProvider>,
        permissions: Arc<PermissionMatrixHandle>,
    ) -> Self {
        let tables = Arc::new(TableManager::new(store.clone()));
        Self {
            coordinator: SubmissionCoordinator::new(tables.clone(), keys.clone(), config.clone()),
            linker: SubformLinker::new(tables.clone(), keys.clone(), config),
            store,
            tables,
            keys,
            permissions,
        }
    }

    pub fn store(&self) -> &Arc<FormStore> {
        &self.store
    }

    pub fn permissions(&self) -> &Arc<PermissionMatrixHandle> {
        &self.permissions
    }

    pub fn reload_permissions(
        &self,
        next: formvault_contracts::access::PermissionMatrix,
    ) -> Result<u64, ConfigError> {
        self.permissions.reload(next)
    }

    pub fn form_definition(&self, form_id: &FormId) -> Option<FormDefinition> {
        self.store.form_row(form_id)
    }

    /// Registers a new form and materializes its tables. The caller becomes the
    /// form's author.
    pub fn create_form(
        &self,
        ctx: &AuthContext,
        definition: FormDefinition,
    ) -> Result<FormId, EngineError> {
        let definition = FormDefinition {
            version: SchemaVersion::INITIAL,
            created_by: ctx.user_id.clone(),
            ..definition
        };
        definition.validate()?;
        let form_id = definition.form_id.clone();

        let lock = self.tables.schema_lock(&form_id);
        let _exclusive = lock.write();
        if self.store.form_row(&form_id).is_some() {
            return Err(EngineError::FormAlreadyExists(form_id));
        }
        self.materialize("create_form", &definition)?;
        self.store.insert_form_row(definition).map_err(|e| match e {
            StorageError::DuplicateKey { .. } => EngineError::FormAlreadyExists(form_id.clone()),
            other => EngineError::from_storage("create_form", other),
        })?;
        info!(form_id = %form_id, author = ctx.user_id.as_str(), "form created");
        Ok(form_id)
    }

    /// Replaces a form's definition with an additive superset of it and widens its
    /// tables to match. Only the author or a role that edits everything may evolve.
    pub fn evolve_form(
        &self,
        ctx: &AuthContext,
        next: FormDefinition,
    ) -> Result<SchemaVersion, EngineError> {
        let form_id = next.form_id.clone();
        let lock = self.tables.schema_lock(&form_id);
        let _exclusive = lock.write();

        let current = self
            .store
            .form_row(&form_id)
            .ok_or_else(|| EngineError::FormNotFound(form_id.clone()))?;
        if ctx.user_id != current.created_by && !self.rule_for(ctx).can_edit_all {
            return Err(EngineError::AccessDenied);
        }

        let next = FormDefinition {
            version: current.version.next(),
            created_by: current.created_by.clone(),
            ..next
        };
        next.validate()?;
        if let Err(v) = next.check_additive_over(&current) {
            warn!(form_id = %form_id, reason = %v, "non-additive form change refused");
            return Err(EngineError::SchemaConflict {
                reason: v.to_string(),
            });
        }
        self.materialize("evolve_form", &next)?;
        let version = next.version;
        self.store
            .replace_form_row(next)
            .map_err(|e| EngineError::from_storage("evolve_form", e))?;
        info!(form_id = %form_id, version = version.0, "form evolved");
        Ok(version)
    }

    /// Any authenticated caller may submit; reads and changes are gated.
    pub fn submit(
        &self,
        ctx: &AuthContext,
        form_id: &FormId,
        payload: &Payload,
    ) -> Result<SubmissionId, EngineError> {
        self.coordinator.submit(form_id, payload, &ctx.user_id)
    }

    pub fn prepare_submit(
        &self,
        ctx: &AuthContext,
        form_id: &FormId,
        payload: &Payload,
    ) -> Result<PreparedSubmission, EngineError> {
        self.coordinator.prepare_submit(form_id, payload, &ctx.user_id)
    }

    pub fn commit_prepared(&self, prepared: PreparedSubmission) -> Result<SubmissionId, EngineError> {
        self.coordinator.commit(prepared)
    }

    /// Requires the edit predicate on the parent's form. A parent the caller may
    /// not edit is reported exactly like a missing one.
    pub fn submit_subform(
        &self,
        ctx: &AuthContext,
        parent_id: &SubmissionId,
        sub_form_id: &SubFormId,
        payload: &Payload,
    ) -> Result<SubRecordId, EngineError> {
        let parent = self.linker.resolve_parent(parent_id)?;
        let form = self.definition_of(&parent)?;
        if !AccessFilter::can_edit(&self.rule_for(ctx), &form.tags) {
            return Err(EngineError::ParentNotFound);
        }
        self.linker
            .submit_subform(parent_id, sub_form_id, payload, &ctx.user_id)
    }

    pub fn get_submission(
        &self,
        ctx: &AuthContext,
        submission_id: &SubmissionId,
    ) -> Result<Outcome<SubmissionView>, EngineError> {
        let Some(ledger) = self.store.ledger_row(submission_id) else {
            return Ok(Outcome::NotFound);
        };
        let form = self.definition_of(&ledger)?;
        if !AccessFilter::can_read(&self.rule_for(ctx), &form.tags) {
            return Ok(Outcome::AccessDenied);
        }
        match self.read_view(submission_id, &ledger.form_id)? {
            Some(view) => Ok(Outcome::Done(view)),
            None => Ok(Outcome::NotFound),
        }
    }

    /// Submissions of one form visible to the caller, in submission order. A caller
    /// without access gets an empty list.
    pub fn list_submissions(
        &self,
        ctx: &AuthContext,
        form_id: &FormId,
    ) -> Result<Vec<SubmissionView>, EngineError> {
        let form = self
            .store
            .form_row(form_id)
            .ok_or_else(|| EngineError::FormNotFound(form_id.clone()))?;
        let rows = self.store.ledger_rows_for_form(form_id);
        let visible = AccessFilter::filter(&self.rule_for(ctx), rows, &form.tags);

        let mut out = Vec::with_capacity(visible.len());
        for row in visible {
            // Rows deleted since the ledger scan are skipped.
            if let Some(view) = self.read_view(&row.submission_id, form_id)? {
                out.push(view);
            }
        }
        Ok(out)
    }

    /// Children of a parent the caller may read; empty when the caller may not.
    pub fn list_subforms(
        &self,
        ctx: &AuthContext,
        parent_id: &SubmissionId,
    ) -> Result<Vec<SubFormEntry>, EngineError> {
        let parent = self.linker.resolve_parent(parent_id)?;
        let form = self.definition_of(&parent)?;
        if !AccessFilter::can_read(&self.rule_for(ctx), &form.tags) {
            return Ok(Vec::new());
        }
        self.linker.list_subforms(parent_id)
    }

    pub fn update_submission(
        &self,
        ctx: &AuthContext,
        submission_id: &SubmissionId,
        payload: &Payload,
    ) -> Result<Outcome<Submission>, EngineError> {
        let Some(ledger) = self.store.ledger_row(submission_id) else {
            return Ok(Outcome::NotFound);
        };
        let form = self.definition_of(&ledger)?;
        if !AccessFilter::can_edit(&self.rule_for(ctx), &form.tags) {
            return Ok(Outcome::AccessDenied);
        }
        Ok(match self.coordinator.update(submission_id, payload)? {
            Some(updated) => Outcome::Done(updated),
            None => Outcome::NotFound,
        })
    }

    pub fn delete_submission(
        &self,
        ctx: &AuthContext,
        submission_id: &SubmissionId,
    ) -> Result<Outcome<()>, EngineError> {
        let Some(ledger) = self.store.ledger_row(submission_id) else {
            return Ok(Outcome::NotFound);
        };
        let form = self.definition_of(&ledger)?;
        let rule = self.rule_for(ctx);
        if !AccessFilter::can_delete(&rule, &form.tags, ctx, &ledger.submitter_id) {
            return Ok(Outcome::AccessDenied);
        }
        Ok(match self.coordinator.delete(submission_id)? {
            Some(_) => Outcome::Done(()),
            None => Outcome::NotFound,
        })
    }

    /// Checks the identifier invariant for one id. `Ok(true)` when both rows exist,
    /// `Ok(false)` when neither does, `IdSyncViolation` otherwise.
    pub fn verify_submission_pair(&self, submission_id: &SubmissionId) -> Result<bool, EngineError> {
        let ledger = self.store.ledger_row(submission_id);
        let tables = match &ledger {
            Some(l) => vec![TableManager::form_table_name(&l.form_id)],
            None => self.store.form_table_names(),
        };
        let mut dynamic_found = false;
        for table in &tables {
            let (_, dynamic) = self
                .store
                .submission_pair_rows(table, submission_id)
                .map_err(|e| EngineError::from_storage("verify_submission_pair", e))?;
            if let Some(d) = dynamic {
                if d.record_id != *submission_id {
                    return Err(EngineError::integrity(
                        "verify_submission_pair",
                        "dynamic row carries a different id",
                    ));
                }
                dynamic_found = true;
            }
        }
        match (ledger.is_some(), dynamic_found) {
            (true, true) => Ok(true),
            (false, false) => Ok(false),
            (true, false) => Err(EngineError::integrity(
                "verify_submission_pair",
                "ledger row without dynamic row",
            )),
            (false, true) => Err(EngineError::integrity(
                "verify_submission_pair",
                "dynamic row without ledger row",
            )),
        }
    }

    fn rule_for(&self, ctx: &AuthContext) -> AccessRule {
        self.permissions.snapshot().rule_for(&ctx.role)
    }

    fn definition_of(&self, ledger: &Submission) -> Result<FormDefinition, EngineError> {
        self.store
            .form_row(&ledger.form_id)
            .ok_or_else(|| EngineError::FormNotFound(ledger.form_id.clone()))
    }

    fn materialize(&self, op: &'static str, definition: &FormDefinition) -> Result<(), EngineError> {
        let columns = SchemaRegistry::derive_columns(&definition.fields)?;
        self.tables
            .ensure_table(&definition.form_id, definition.version, &columns)
            .map_err(|e| EngineError::from_table(op, e))?;
        for sub in &definition.sub_forms {
            let columns = SchemaRegistry::derive_columns(&sub.fields)?;
            self.tables
                .ensure_sub_table(
                    &definition.form_id,
                    &sub.sub_form_id,
                    definition.version,
                    &columns,
                )
                .map_err(|e| EngineError::from_table(op, e))?;
        }
        Ok(())
    }

    /// Reads and decodes one pair. `None` when both rows are gone; a half pair
    /// is an integrity failure and is never repaired here.
    fn read_view(
        &self,
        submission_id: &SubmissionId,
        form_id: &FormId,
    ) -> Result<Option<SubmissionView>, EngineError> {
        let lock = self.tables.schema_lock(form_id);
        let _shared = lock.read();
        let table = TableManager::form_table_name(form_id);
        let shape = self.store.dynamic_table_shape(&table).ok_or_else(|| {
            EngineError::from_storage(
                "read_submission",
                StorageError::TableMissing {
                    table: table.clone(),
                },
            )
        })?;
        let (ledger, dynamic) = self
            .store
            .submission_pair_rows(&table, submission_id)
            .map_err(|e| EngineError::from_storage("read_submission", e))?;
        match (ledger, dynamic) {
            (Some(submission), Some(record)) => {
                let values = PayloadCodec::decode(&shape.columns, &record.cells, self.keys.as_ref())
                    .map_err(|e| EngineError::from_encryption("read_submission", e))?;
                Ok(Some(SubmissionView { submission, values }))
            }
            (None, None) => Ok(None),
            _ => Err(EngineError::integrity(
                "read_submission",
                "ledger and dynamic rows out of step",
            )),
        }
    }
}
