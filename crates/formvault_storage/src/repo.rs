#![forbid(unsafe_code)]

use formvault_contracts::form::{FormDefinition, FormId};
use formvault_contracts::submission::{
    DynamicRecord, SubFormLedgerRow, SubFormRecord, Submission, SubmissionId,
};

use crate::store::{
    CommitReceipt, FormStore, SchemaMigrationRow, StorageError, TableShape, WriteBatch,
};

/// Typed repo for the form definition registry.
pub trait FormRegistryRepo {
    fn insert_form_row(&self, definition: FormDefinition) -> Result<(), StorageError>;
    fn replace_form_row(&self, definition: FormDefinition) -> Result<(), StorageError>;
    fn form_row(&self, form_id: &FormId) -> Option<FormDefinition>;
}

/// Typed repo for the canonical ledger and the dynamic tables it pairs with.
pub trait SubmissionRepo {
    fn commit_batch(&self, batch: WriteBatch) -> Result<CommitReceipt, StorageError>;
    fn ledger_row(&self, id: &SubmissionId) -> Option<Submission>;
    fn ledger_rows_for_form(&self, form_id: &FormId) -> Vec<Submission>;
    fn submission_pair_rows(
        &self,
        table: &str,
        id: &SubmissionId,
    ) -> Result<(Option<Submission>, Option<DynamicRecord>), StorageError>;
    fn sub_record_rows_for_parent(
        &self,
        table: &str,
        parent: &SubmissionId,
    ) -> Result<Vec<SubFormRecord>, StorageError>;
    fn dynamic_table_shape(&self, table: &str) -> Option<TableShape>;
}

/// Typed repo for append-only structural and audit ledgers.
pub trait SchemaMigrationRepo {
    fn schema_migration_rows(&self) -> Vec<SchemaMigrationRow>;
    fn attempt_overwrite_schema_migration_row(&self, migration_id: u64)
        -> Result<(), StorageError>;
    fn sub_form_ledger_rows(&self) -> Vec<SubFormLedgerRow>;
}

impl FormRegistryRepo for FormStore {
    fn insert_form_row(&self, definition: FormDefinition) -> Result<(), StorageError> {
        self.insert_form_definition(definition)
    }

    fn replace_form_row(&self, definition: FormDefinition) -> Result<(), StorageError> {
        self.replace_form_definition(definition)
    }

    fn form_row(&self, form_id: &FormId) -> Option<FormDefinition> {
        self.form_definition(form_id)
    }
}

impl SubmissionRepo for FormStore {
    fn commit_batch(&self, batch: WriteBatch) -> Result<CommitReceipt, StorageError> {
        self.commit(batch)
    }

    fn ledger_row(&self, id: &SubmissionId) -> Option<Submission> {
        FormStore::ledger_row(self, id)
    }

    fn ledger_rows_for_form(&self, form_id: &FormId) -> Vec<Submission> {
        FormStore::ledger_rows_for_form(self, form_id)
    }

    fn submission_pair_rows(
        &self,
        table: &str,
        id: &SubmissionId,
    ) -> Result<(Option<Submission>, Option<DynamicRecord>), StorageError> {
        self.submission_pair(table, id)
    }

    fn sub_record_rows_for_parent(
        &self,
        table: &str,
        parent: &SubmissionId,
    ) -> Result<Vec<SubFormRecord>, StorageError> {
        self.sub_records_for_parent(table, parent)
    }

    fn dynamic_table_shape(&self, table: &str) -> Option<TableShape> {
        self.table_shape(table)
    }
}

impl SchemaMigrationRepo for FormStore {
    fn schema_migration_rows(&self) -> Vec<SchemaMigrationRow> {
        FormStore::schema_migration_rows(self)
    }

    fn attempt_overwrite_schema_migration_row(
        &self,
        migration_id: u64,
    ) -> Result<(), StorageError> {
        FormStore::attempt_overwrite_schema_migration_row(self, migration_id)
    }

    fn sub_form_ledger_rows(&self) -> Vec<SubFormLedgerRow> {
        self.sub_ledger_rows()
    }
}
