#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use formvault_contracts::form::{FormDefinition, FormId, SubFormId};
use formvault_contracts::submission::{
    Cells, DynamicRecord, SubFormLedgerRow, SubFormRecord, SubRecordId, Submission,
    SubmissionId,
};
use formvault_contracts::table::{
    ColumnSpec, COLUMN_CREATED_AT, COLUMN_FORM_VERSION, COLUMN_ID, COLUMN_PARENT_REF,
    COLUMN_UPDATED_AT,
};
use formvault_contracts::{ContractViolation, MonotonicTimeNs, SchemaVersion, Validate};
use parking_lot::RwLock;

const TABLE_SUBMISSIONS: &str = "submissions";
const TABLE_SUBFORM_LEDGER: &str = "subform_submissions";
const TABLE_FORMS: &str = "forms";
const TABLE_SCHEMA_MIGRATIONS: &str = "schema_migrations";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StorageError {
    #[error("foreign key violation on {table}: {key}")]
    ForeignKeyViolation { table: String, key: String },
    #[error("duplicate key on {table}: {key}")]
    DuplicateKey { table: String, key: String },
    #[error("row not found in {table}: {key}")]
    NotFound { table: String, key: String },
    #[error("table {table} does not exist")]
    TableMissing { table: String },
    #[error("table {table} has no column {column}")]
    UnknownColumn { table: String, column: String },
    #[error("column {column} of table {table} must not be null")]
    NullViolation { table: String, column: String },
    #[error("table {table} is append-only")]
    AppendOnlyViolation { table: &'static str },
    #[error("identifier divergence: ledger {ledger_id:?} vs dynamic {dynamic_id:?}")]
    IdSyncViolation {
        ledger_id: Option<SubmissionId>,
        dynamic_id: Option<SubmissionId>,
    },
    #[error("transient storage failure: {reason}")]
    Transient { reason: String },
    #[error("storage backend failure: {reason}")]
    Backend { reason: String },
    #[error(transparent)]
    ContractViolation(#[from] ContractViolation),
}

impl StorageError {
    /// Failures that may succeed when the same write is attempted again.
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableScope {
    Form {
        form_id: FormId,
    },
    SubForm {
        form_id: FormId,
        sub_form_id: SubFormId,
    },
}

impl TableScope {
    pub fn form_id(&self) -> &FormId {
        match self {
            TableScope::Form { form_id } | TableScope::SubForm { form_id, .. } => form_id,
        }
    }

    pub fn system_columns(&self) -> &'static [&'static str] {
        match self {
            TableScope::Form { .. } => &[
                COLUMN_ID,
                COLUMN_FORM_VERSION,
                COLUMN_CREATED_AT,
                COLUMN_UPDATED_AT,
            ],
            TableScope::SubForm { .. } => &[
                COLUMN_ID,
                COLUMN_PARENT_REF,
                COLUMN_FORM_VERSION,
                COLUMN_CREATED_AT,
            ],
        }
    }
}

/// Physical shape of one dynamic table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableShape {
    pub table_name: String,
    pub scope: TableScope,
    pub columns: Vec<ColumnSpec>,
    pub indexes: BTreeSet<String>,
}

impl TableShape {
    pub fn column(&self, column_name: &str) -> Option<&ColumnSpec> {
        self.columns.iter().find(|c| c.column_name == column_name)
    }
}

/// Immutable record of one structural change to a dynamic table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaMigrationRow {
    pub migration_id: u64,
    pub table_name: String,
    pub form_id: FormId,
    pub sub_form_id: Option<SubFormId>,
    pub form_version: SchemaVersion,
    pub created_table: bool,
    pub added_columns: Vec<String>,
    /// Columns whose NOT NULL constraint was dropped by this change.
    pub relaxed_columns: Vec<String>,
    pub applied_at: MonotonicTimeNs,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    InsertSubmission {
        table: String,
        ledger: Submission,
        record: DynamicRecord,
    },
    UpdateSubmission {
        table: String,
        ledger: Submission,
        record: DynamicRecord,
    },
    DeleteSubmission {
        table: String,
        submission_id: SubmissionId,
    },
    InsertSubFormRecord {
        table: String,
        record: SubFormRecord,
        ledger: Option<SubFormLedgerRow>,
    },
    DeleteSubFormRecords {
        table: String,
        parent_ref: SubmissionId,
    },
}

/// Ordered set of writes applied all-or-nothing by [`FormStore::commit`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, op: WriteOp) {
        self.ops.push(op);
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitReceipt {
    pub commit_seq: u64,
    pub ops_applied: usize,
}

#[derive(Debug, Clone)]
struct LedgerEntry {
    seq: u64,
    row: Submission,
}

#[derive(Debug, Clone)]
enum TableRows {
    Form(BTreeMap<SubmissionId, DynamicRecord>),
    SubForm {
        rows: BTreeMap<SubRecordId, SubFormRecord>,
        // parent_ref -> (seq -> sub_record_id), ordered by insertion.
        by_parent: BTreeMap<SubmissionId, BTreeMap<u64, SubRecordId>>,
    },
}

#[derive(Debug, Clone)]
struct DynamicTable {
    shape: TableShape,
    rows: TableRows,
}

#[derive(Debug, Default)]
struct StoreState {
    forms: BTreeMap<FormId, FormDefinition>,
    tables: BTreeMap<String, DynamicTable>,
    // form_id -> table name of the form's own dynamic table.
    form_tables: BTreeMap<FormId, String>,
    ledger: BTreeMap<SubmissionId, LedgerEntry>,
    sub_ledger: BTreeMap<SubRecordId, SubFormLedgerRow>,
    migrations: Vec<SchemaMigrationRow>,
    next_seq: u64,
    next_commit_seq: u64,
}

enum Undo {
    RemoveLedger(SubmissionId),
    RestoreLedger(LedgerEntry),
    RemoveDynamic {
        table: String,
        id: SubmissionId,
    },
    RestoreDynamic {
        table: String,
        record: DynamicRecord,
    },
    RemoveSubRecord {
        table: String,
        id: SubRecordId,
    },
    RestoreSubRecord {
        table: String,
        record: SubFormRecord,
    },
    RemoveSubLedger(SubRecordId),
    RestoreSubLedger(SubFormLedgerRow),
}

#[derive(Debug, Default)]
struct FaultPlan {
    fail_commits: AtomicU32,
    fail_mid_commits: AtomicU32,
    fail_table_ops: AtomicU32,
    commit_attempts: AtomicU64,
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// In-memory transactional store for the form registry, the canonical ledger
/// and every dynamic table. Commits run under one write lock, so readers only
/// ever observe whole batches.
#[derive(Debug)]
pub struct FormStore {
    state: RwLock<StoreState>,
    faults: FaultPlan,
}

impl FormStore {
    pub fn new_in_memory() -> Self {
        Self {
            state: RwLock::new(StoreState {
                next_seq: 1,
                next_commit_seq: 1,
                ..StoreState::default()
            }),
            faults: FaultPlan::default(),
        }
    }

    // ------------------------
    // Fault injection hooks.
    // ------------------------

    /// The next `n` commits fail with a transient error before touching any row.
    pub fn fail_next_commits(&self, n: u32) {
        self.faults.fail_commits.store(n, Ordering::SeqCst);
    }

    /// The next `n` commits apply their first op and then fail, exercising rollback.
    pub fn fail_next_commits_midway(&self, n: u32) {
        self.faults.fail_mid_commits.store(n, Ordering::SeqCst);
    }

    /// The next `n` table create/alter operations fail with a backend error.
    pub fn fail_next_table_ops(&self, n: u32) {
        self.faults.fail_table_ops.store(n, Ordering::SeqCst);
    }

    pub fn commit_attempts(&self) -> u64 {
        self.faults.commit_attempts.load(Ordering::SeqCst)
    }

    /// Deletes a dynamic row while leaving its ledger row behind. Exists only so
    /// integrity checks can be exercised; no engine path calls it.
    pub fn corrupt_drop_dynamic_row(&self, table: &str, id: &SubmissionId) -> bool {
        let mut state = self.state.write();
        match state.tables.get_mut(table).map(|t| &mut t.rows) {
            Some(TableRows::Form(rows)) => rows.remove(id).is_some(),
            _ => false,
        }
    }

    // ------------------------
    // Form registry.
    // ------------------------

    pub fn insert_form_definition(&self, definition: FormDefinition) -> Result<(), StorageError> {
        definition.validate()?;
        let mut state = self.state.write();
        if state.forms.contains_key(&definition.form_id) {
            return Err(StorageError::DuplicateKey {
                table: TABLE_FORMS.to_string(),
                key: definition.form_id.to_string(),
            });
        }
        state.forms.insert(definition.form_id.clone(), definition);
        Ok(())
    }

    /// Optimistic replace: succeeds only when `definition.version` is exactly one
    /// past the stored version.
    pub fn replace_form_definition(&self, definition: FormDefinition) -> Result<(), StorageError> {
        definition.validate()?;
        let mut state = self.state.write();
        let Some(current) = state.forms.get(&definition.form_id) else {
            return Err(StorageError::NotFound {
                table: TABLE_FORMS.to_string(),
                key: definition.form_id.to_string(),
            });
        };
        if definition.version != current.version.next() {
            return Err(StorageError::ContractViolation(
                ContractViolation::InvalidValue {
                    field: "form_definition.version",
                    reason: "must be exactly one past the stored version",
                },
            ));
        }
        state.forms.insert(definition.form_id.clone(), definition);
        Ok(())
    }

    pub fn form_definition(&self, form_id: &FormId) -> Option<FormDefinition> {
        self.state.read().forms.get(form_id).cloned()
    }

    // ------------------------
    // Dynamic table DDL.
    // ------------------------

    pub fn table_shape(&self, table: &str) -> Option<TableShape> {
        self.state.read().tables.get(table).map(|t| t.shape.clone())
    }

    pub fn form_table_name(&self, form_id: &FormId) -> Option<String> {
        self.state.read().form_tables.get(form_id).cloned()
    }

    pub fn form_table_names(&self) -> Vec<String> {
        self.state.read().form_tables.values().cloned().collect()
    }

    pub fn create_table(
        &self,
        shape: TableShape,
        form_version: SchemaVersion,
        applied_at: MonotonicTimeNs,
    ) -> Result<(), StorageError> {
        if take_one(&self.faults.fail_table_ops) {
            return Err(StorageError::Backend {
                reason: "injected table operation failure".to_string(),
            });
        }
        let mut state = self.state.write();
        if state.tables.contains_key(&shape.table_name) {
            return Err(StorageError::DuplicateKey {
                table: TABLE_SCHEMA_MIGRATIONS.to_string(),
                key: shape.table_name.clone(),
            });
        }
        let mut seen = BTreeSet::new();
        for c in &shape.columns {
            if shape.scope.system_columns().contains(&c.column_name.as_str())
                || !seen.insert(c.column_name.as_str())
            {
                return Err(StorageError::DuplicateKey {
                    table: shape.table_name.clone(),
                    key: c.column_name.clone(),
                });
            }
        }

        let (rows, sub_form_id) = match &shape.scope {
            TableScope::Form { form_id } => {
                state
                    .form_tables
                    .insert(form_id.clone(), shape.table_name.clone());
                (TableRows::Form(BTreeMap::new()), None)
            }
            TableScope::SubForm {
                form_id,
                sub_form_id,
            } => {
                if !state.form_tables.contains_key(form_id) {
                    return Err(StorageError::ForeignKeyViolation {
                        table: shape.table_name.clone(),
                        key: form_id.to_string(),
                    });
                }
                (
                    TableRows::SubForm {
                        rows: BTreeMap::new(),
                        by_parent: BTreeMap::new(),
                    },
                    Some(sub_form_id.clone()),
                )
            }
        };

        let migration_id = state.migrations.len() as u64 + 1;
        state.migrations.push(SchemaMigrationRow {
            migration_id,
            table_name: shape.table_name.clone(),
            form_id: shape.scope.form_id().clone(),
            sub_form_id,
            form_version,
            created_table: true,
            added_columns: shape.columns.iter().map(|c| c.column_name.clone()).collect(),
            relaxed_columns: Vec::new(),
            applied_at,
        });
        state
            .tables
            .insert(shape.table_name.clone(), DynamicTable { shape, rows });
        Ok(())
    }

    /// Additive alter: appends columns and indexes and drops NOT NULL from the
    /// `relaxed` columns. Never drops or retypes.
    pub fn alter_table(
        &self,
        table: &str,
        columns: Vec<ColumnSpec>,
        relaxed: Vec<String>,
        indexes: BTreeSet<String>,
        form_version: SchemaVersion,
        applied_at: MonotonicTimeNs,
    ) -> Result<(), StorageError> {
        if take_one(&self.faults.fail_table_ops) {
            return Err(StorageError::Backend {
                reason: "injected table operation failure".to_string(),
            });
        }
        let mut state = self.state.write();
        let Some(t) = state.tables.get_mut(table) else {
            return Err(StorageError::TableMissing {
                table: table.to_string(),
            });
        };
        for c in &columns {
            if t.shape.column(&c.column_name).is_some()
                || t.shape.scope.system_columns().contains(&c.column_name.as_str())
            {
                return Err(StorageError::DuplicateKey {
                    table: table.to_string(),
                    key: c.column_name.clone(),
                });
            }
        }
        if let Some(unknown) = relaxed.iter().find(|r| t.shape.column(r).is_none()) {
            return Err(StorageError::UnknownColumn {
                table: table.to_string(),
                column: unknown.clone(),
            });
        }
        for c in t.shape.columns.iter_mut() {
            if relaxed.contains(&c.column_name) {
                c.nullable = true;
            }
        }
        let added: Vec<String> = columns.iter().map(|c| c.column_name.clone()).collect();
        t.shape.columns.extend(columns);
        t.shape.indexes.extend(indexes);
        let scope = t.shape.scope.clone();

        let migration_id = state.migrations.len() as u64 + 1;
        state.migrations.push(SchemaMigrationRow {
            migration_id,
            table_name: table.to_string(),
            form_id: scope.form_id().clone(),
            sub_form_id: match scope {
                TableScope::SubForm { sub_form_id, .. } => Some(sub_form_id),
                TableScope::Form { .. } => None,
            },
            form_version,
            created_table: false,
            added_columns: added,
            relaxed_columns: relaxed,
            applied_at,
        });
        Ok(())
    }

    pub fn schema_migration_rows(&self) -> Vec<SchemaMigrationRow> {
        self.state.read().migrations.clone()
    }

    pub fn attempt_overwrite_schema_migration_row(
        &self,
        _migration_id: u64,
    ) -> Result<(), StorageError> {
        Err(StorageError::AppendOnlyViolation {
            table: TABLE_SCHEMA_MIGRATIONS,
        })
    }

    // ------------------------
    // Transactional writes.
    // ------------------------

    pub fn commit(&self, batch: WriteBatch) -> Result<CommitReceipt, StorageError> {
        self.faults.commit_attempts.fetch_add(1, Ordering::SeqCst);
        if take_one(&self.faults.fail_commits) {
            return Err(StorageError::Transient {
                reason: "injected commit failure".to_string(),
            });
        }
        let fail_midway = take_one(&self.faults.fail_mid_commits);

        let mut state = self.state.write();
        let mut undo: Vec<Undo> = Vec::new();
        let mut applied = 0usize;
        for op in batch.ops {
            if let Err(err) = apply(&mut state, op, &mut undo) {
                rollback(&mut state, undo);
                return Err(err);
            }
            applied += 1;
            if fail_midway {
                rollback(&mut state, undo);
                return Err(StorageError::Transient {
                    reason: "injected failure inside commit".to_string(),
                });
            }
        }
        let commit_seq = state.next_commit_seq;
        state.next_commit_seq = state.next_commit_seq.saturating_add(1);
        Ok(CommitReceipt {
            commit_seq,
            ops_applied: applied,
        })
    }

    // ------------------------
    // Reads (committed data only).
    // ------------------------

    pub fn ledger_row(&self, id: &SubmissionId) -> Option<Submission> {
        self.state.read().ledger.get(id).map(|e| e.row.clone())
    }

    /// Ledger rows of one form in insertion order.
    pub fn ledger_rows_for_form(&self, form_id: &FormId) -> Vec<Submission> {
        let state = self.state.read();
        let mut rows: Vec<&LedgerEntry> = state
            .ledger
            .values()
            .filter(|e| &e.row.form_id == form_id)
            .collect();
        rows.sort_by_key(|e| e.seq);
        rows.into_iter().map(|e| e.row.clone()).collect()
    }

    pub fn dynamic_row(
        &self,
        table: &str,
        id: &SubmissionId,
    ) -> Result<Option<DynamicRecord>, StorageError> {
        let state = self.state.read();
        match state.tables.get(table).map(|t| &t.rows) {
            Some(TableRows::Form(rows)) => Ok(rows.get(id).cloned()),
            _ => Err(StorageError::TableMissing {
                table: table.to_string(),
            }),
        }
    }

    /// Ledger row and dynamic row for one id, read under a single lock.
    pub fn submission_pair(
        &self,
        table: &str,
        id: &SubmissionId,
    ) -> Result<(Option<Submission>, Option<DynamicRecord>), StorageError> {
        let state = self.state.read();
        let ledger = state.ledger.get(id).map(|e| e.row.clone());
        let dynamic = match state.tables.get(table).map(|t| &t.rows) {
            Some(TableRows::Form(rows)) => rows.get(id).cloned(),
            _ => {
                return Err(StorageError::TableMissing {
                    table: table.to_string(),
                })
            }
        };
        Ok((ledger, dynamic))
    }

    pub fn dynamic_row_ids(&self, table: &str) -> Result<Vec<SubmissionId>, StorageError> {
        let state = self.state.read();
        match state.tables.get(table).map(|t| &t.rows) {
            Some(TableRows::Form(rows)) => Ok(rows.keys().copied().collect()),
            _ => Err(StorageError::TableMissing {
                table: table.to_string(),
            }),
        }
    }

    /// Sub-form rows whose `parent_ref` equals `parent`, in insertion order.
    pub fn sub_records_for_parent(
        &self,
        table: &str,
        parent: &SubmissionId,
    ) -> Result<Vec<SubFormRecord>, StorageError> {
        let state = self.state.read();
        match state.tables.get(table).map(|t| &t.rows) {
            Some(TableRows::SubForm { rows, by_parent }) => Ok(by_parent
                .get(parent)
                .map(|ids| ids.values().filter_map(|id| rows.get(id).cloned()).collect())
                .unwrap_or_default()),
            _ => Err(StorageError::TableMissing {
                table: table.to_string(),
            }),
        }
    }

    pub fn sub_ledger_rows(&self) -> Vec<SubFormLedgerRow> {
        self.state.read().sub_ledger.values().cloned().collect()
    }

    pub fn sub_ledger_row(&self, id: &SubRecordId) -> Option<SubFormLedgerRow> {
        self.state.read().sub_ledger.get(id).cloned()
    }
}

fn table_mut<'a>(
    state: &'a mut StoreState,
    table: &str,
) -> Result<&'a mut DynamicTable, StorageError> {
    state
        .tables
        .get_mut(table)
        .ok_or_else(|| StorageError::TableMissing {
            table: table.to_string(),
        })
}

fn check_cells(shape: &TableShape, cells: &Cells) -> Result<(), StorageError> {
    for column in cells.keys() {
        if shape.column(column).is_none() {
            return Err(StorageError::UnknownColumn {
                table: shape.table_name.clone(),
                column: column.clone(),
            });
        }
    }
    for spec in shape.columns.iter().filter(|c| !c.nullable) {
        if cells.get(&spec.column_name).map_or(true, |c| c.is_null()) {
            return Err(StorageError::NullViolation {
                table: shape.table_name.clone(),
                column: spec.column_name.clone(),
            });
        }
    }
    Ok(())
}

fn check_pair(ledger: &Submission, record: &DynamicRecord) -> Result<(), StorageError> {
    if ledger.submission_id != record.record_id {
        return Err(StorageError::IdSyncViolation {
            ledger_id: Some(ledger.submission_id),
            dynamic_id: Some(record.record_id),
        });
    }
    ledger.validate()?;
    Ok(())
}

fn form_rows_mut<'a>(
    t: &'a mut DynamicTable,
    form_id: &FormId,
) -> Result<&'a mut BTreeMap<SubmissionId, DynamicRecord>, StorageError> {
    match (&t.shape.scope, &mut t.rows) {
        (TableScope::Form { form_id: owner }, TableRows::Form(rows)) if owner == form_id => {
            Ok(rows)
        }
        _ => Err(StorageError::ForeignKeyViolation {
            table: t.shape.table_name.clone(),
            key: form_id.to_string(),
        }),
    }
}

fn apply(state: &mut StoreState, op: WriteOp, undo: &mut Vec<Undo>) -> Result<(), StorageError> {
    match op {
        WriteOp::InsertSubmission {
            table,
            ledger,
            record,
        } => {
            check_pair(&ledger, &record)?;
            let id = ledger.submission_id;
            if state.ledger.contains_key(&id) {
                return Err(StorageError::DuplicateKey {
                    table: TABLE_SUBMISSIONS.to_string(),
                    key: id.to_string(),
                });
            }
            let t = table_mut(state, &table)?;
            check_cells(&t.shape, &record.cells)?;
            let rows = form_rows_mut(t, &ledger.form_id)?;
            if rows.contains_key(&id) {
                return Err(StorageError::DuplicateKey {
                    table: table.clone(),
                    key: id.to_string(),
                });
            }
            rows.insert(id, record);
            undo.push(Undo::RemoveDynamic { table, id });

            let seq = state.next_seq;
            state.next_seq = state.next_seq.saturating_add(1);
            state.ledger.insert(id, LedgerEntry { seq, row: ledger });
            undo.push(Undo::RemoveLedger(id));
        }
        WriteOp::UpdateSubmission {
            table,
            ledger,
            record,
        } => {
            check_pair(&ledger, &record)?;
            let id = ledger.submission_id;
            let Some(prev_ledger) = state.ledger.get(&id).cloned() else {
                return Err(StorageError::NotFound {
                    table: TABLE_SUBMISSIONS.to_string(),
                    key: id.to_string(),
                });
            };
            let t = table_mut(state, &table)?;
            check_cells(&t.shape, &record.cells)?;
            let rows = form_rows_mut(t, &ledger.form_id)?;
            let Some(prev_record) = rows.insert(id, record) else {
                rows.remove(&id);
                return Err(StorageError::IdSyncViolation {
                    ledger_id: Some(id),
                    dynamic_id: None,
                });
            };
            undo.push(Undo::RestoreDynamic {
                table,
                record: prev_record,
            });
            state.ledger.insert(
                id,
                LedgerEntry {
                    seq: prev_ledger.seq,
                    row: ledger,
                },
            );
            undo.push(Undo::RestoreLedger(prev_ledger));
        }
        WriteOp::DeleteSubmission {
            table,
            submission_id,
        } => {
            let Some(prev_ledger) = state.ledger.get(&submission_id).cloned() else {
                return Err(StorageError::NotFound {
                    table: TABLE_SUBMISSIONS.to_string(),
                    key: submission_id.to_string(),
                });
            };
            let form_id = prev_ledger.row.form_id.clone();
            let has_children = state.tables.values().any(|t| match (&t.shape.scope, &t.rows) {
                (TableScope::SubForm { form_id: owner, .. }, TableRows::SubForm { by_parent, .. }) => {
                    owner == &form_id
                        && by_parent.get(&submission_id).is_some_and(|c| !c.is_empty())
                }
                _ => false,
            });
            if has_children {
                return Err(StorageError::ForeignKeyViolation {
                    table: TABLE_SUBMISSIONS.to_string(),
                    key: submission_id.to_string(),
                });
            }
            let t = table_mut(state, &table)?;
            let rows = form_rows_mut(t, &form_id)?;
            let Some(prev_record) = rows.remove(&submission_id) else {
                return Err(StorageError::IdSyncViolation {
                    ledger_id: Some(submission_id),
                    dynamic_id: None,
                });
            };
            undo.push(Undo::RestoreDynamic {
                table,
                record: prev_record,
            });
            state.ledger.remove(&submission_id);
            undo.push(Undo::RestoreLedger(prev_ledger));
        }
        WriteOp::InsertSubFormRecord {
            table,
            record,
            ledger,
        } => {
            let parent_form = match state.tables.get(&table).map(|t| &t.shape.scope) {
                Some(TableScope::SubForm {
                    form_id,
                    sub_form_id,
                }) if sub_form_id == &record.sub_form_id => form_id.clone(),
                Some(_) => {
                    return Err(StorageError::ForeignKeyViolation {
                        table: table.clone(),
                        key: record.sub_form_id.to_string(),
                    })
                }
                None => return Err(StorageError::TableMissing { table }),
            };
            let parent_exists = state
                .form_tables
                .get(&parent_form)
                .and_then(|name| state.tables.get(name))
                .is_some_and(|t| match &t.rows {
                    TableRows::Form(rows) => rows.contains_key(&record.parent_ref),
                    TableRows::SubForm { .. } => false,
                });
            if !parent_exists {
                return Err(StorageError::ForeignKeyViolation {
                    table: table.clone(),
                    key: record.parent_ref.to_string(),
                });
            }
            if let Some(l) = &ledger {
                if l.sub_record_id != record.sub_record_id
                    || l.parent_submission_id != record.parent_ref
                {
                    return Err(StorageError::ContractViolation(
                        ContractViolation::InvalidValue {
                            field: "subform_ledger_row.sub_record_id",
                            reason: "must match the sub-form record it audits",
                        },
                    ));
                }
                if state.sub_ledger.contains_key(&l.sub_record_id) {
                    return Err(StorageError::DuplicateKey {
                        table: TABLE_SUBFORM_LEDGER.to_string(),
                        key: l.sub_record_id.to_string(),
                    });
                }
            }

            let seq = state.next_seq;
            let t = table_mut(state, &table)?;
            check_cells(&t.shape, &record.cells)?;
            let TableRows::SubForm { rows, by_parent } = &mut t.rows else {
                return Err(StorageError::TableMissing { table });
            };
            let id = record.sub_record_id;
            if rows.contains_key(&id) {
                return Err(StorageError::DuplicateKey {
                    table: table.clone(),
                    key: id.to_string(),
                });
            }
            let mut record = record;
            record.seq = seq;
            by_parent
                .entry(record.parent_ref)
                .or_default()
                .insert(seq, id);
            rows.insert(id, record);
            state.next_seq = state.next_seq.saturating_add(1);
            undo.push(Undo::RemoveSubRecord { table, id });

            if let Some(l) = ledger {
                state.sub_ledger.insert(id, l);
                undo.push(Undo::RemoveSubLedger(id));
            }
        }
        WriteOp::DeleteSubFormRecords { table, parent_ref } => {
            let t = table_mut(state, &table)?;
            let TableRows::SubForm { rows, by_parent } = &mut t.rows else {
                return Err(StorageError::TableMissing { table });
            };
            let ids: Vec<SubRecordId> = by_parent
                .remove(&parent_ref)
                .map(|m| m.into_values().collect())
                .unwrap_or_default();
            let mut removed = Vec::with_capacity(ids.len());
            for id in ids {
                if let Some(r) = rows.remove(&id) {
                    removed.push(r);
                }
            }
            for r in removed {
                let id = r.sub_record_id;
                undo.push(Undo::RestoreSubRecord {
                    table: table.clone(),
                    record: r,
                });
                if let Some(l) = state.sub_ledger.remove(&id) {
                    undo.push(Undo::RestoreSubLedger(l));
                }
            }
        }
    }
    Ok(())
}

fn rollback(state: &mut StoreState, undo: Vec<Undo>) {
    for entry in undo.into_iter().rev() {
        match entry {
            Undo::RemoveLedger(id) => {
                state.ledger.remove(&id);
            }
            Undo::RestoreLedger(e) => {
                state.ledger.insert(e.row.submission_id, e);
            }
            Undo::RemoveDynamic { table, id } => {
                if let Some(TableRows::Form(rows)) = state.tables.get_mut(&table).map(|t| &mut t.rows)
                {
                    rows.remove(&id);
                }
            }
            Undo::RestoreDynamic { table, record } => {
                if let Some(TableRows::Form(rows)) = state.tables.get_mut(&table).map(|t| &mut t.rows)
                {
                    rows.insert(record.record_id, record);
                }
            }
            Undo::RemoveSubRecord { table, id } => {
                if let Some(TableRows::SubForm { rows, by_parent }) =
                    state.tables.get_mut(&table).map(|t| &mut t.rows)
                {
                    if let Some(r) = rows.remove(&id) {
                        if let Some(children) = by_parent.get_mut(&r.parent_ref) {
                            children.remove(&r.seq);
                            if children.is_empty() {
                                by_parent.remove(&r.parent_ref);
                            }
                        }
                    }
                }
            }
            Undo::RestoreSubRecord { table, record } => {
                if let Some(TableRows::SubForm { rows, by_parent }) =
                    state.tables.get_mut(&table).map(|t| &mut t.rows)
                {
                    by_parent
                        .entry(record.parent_ref)
                        .or_default()
                        .insert(record.seq, record.sub_record_id);
                    rows.insert(record.sub_record_id, record);
                }
            }
            Undo::RemoveSubLedger(id) => {
                state.sub_ledger.remove(&id);
            }
            Undo::RestoreSubLedger(row) => {
                state.sub_ledger.insert(row.sub_record_id, row);
            }
        }
    }
}
