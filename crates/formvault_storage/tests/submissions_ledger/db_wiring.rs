#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use formvault_contracts::access::UserId;
use formvault_contracts::form::{
    FieldDefinition, FieldType, FormDefinition, FormId, SubFormId,
};
use formvault_contracts::submission::{
    CellValue, Cells, DynamicRecord, SubFormLedgerRow, SubFormRecord, SubRecordId, Submission,
    SubmissionId, SubmissionStatus,
};
use formvault_contracts::table::{ColumnSpec, StorageType};
use formvault_contracts::{MonotonicTimeNs, SchemaVersion};
use formvault_storage::repo::{FormRegistryRepo, SchemaMigrationRepo, SubmissionRepo};
use formvault_storage::store::{FormStore, StorageError, WriteBatch, WriteOp};
use formvault_storage::table_manager::TableManager;

struct Fixture {
    store: Arc<FormStore>,
    form_id: FormId,
    sub_form_id: SubFormId,
    table: String,
    sub_table: String,
}

fn col(name: &str, nullable: bool) -> ColumnSpec {
    ColumnSpec {
        column_name: name.to_string(),
        source_field: name.to_string(),
        field_type: FieldType::ShortText,
        storage_type: StorageType::Text,
        nullable,
        indexed: false,
    }
}

fn fixture() -> Fixture {
    let store = Arc::new(FormStore::new_in_memory());
    let tm = TableManager::new(store.clone());
    let form_id = FormId::new("hr_intake").unwrap();
    let sub_form_id = SubFormId::new("dependents").unwrap();
    let table = tm
        .ensure_table(&form_id, SchemaVersion(1), &[col("name", false)])
        .unwrap()
        .table_name;
    let sub_table = tm
        .ensure_sub_table(&form_id, &sub_form_id, SchemaVersion(1), &[col("dep", true)])
        .unwrap()
        .table_name;
    Fixture {
        store,
        form_id,
        sub_form_id,
        table,
        sub_table,
    }
}

fn text_cells(name: &str) -> Cells {
    Cells::from([("name".to_string(), CellValue::Text(name.to_string()))])
}

fn pair(f: &Fixture, id: SubmissionId, name: &str) -> (Submission, DynamicRecord) {
    let now = MonotonicTimeNs(10);
    (
        Submission {
            submission_id: id,
            form_id: f.form_id.clone(),
            submitter_id: UserId::new("somchai").unwrap(),
            status: SubmissionStatus::Submitted,
            created_at: now,
            updated_at: now,
            form_version: SchemaVersion(1),
        },
        DynamicRecord {
            record_id: id,
            form_version: SchemaVersion(1),
            cells: text_cells(name),
            created_at: now,
            updated_at: now,
        },
    )
}

fn insert(f: &Fixture, name: &str) -> SubmissionId {
    let id = SubmissionId::allocate();
    let (ledger, record) = pair(f, id, name);
    let mut batch = WriteBatch::new();
    batch.push(WriteOp::InsertSubmission {
        table: f.table.clone(),
        ledger,
        record,
    });
    f.store.commit_batch(batch).unwrap();
    id
}

fn child(f: &Fixture, parent: SubmissionId, audit: bool) -> WriteOp {
    let sub_record_id = SubRecordId::allocate();
    WriteOp::InsertSubFormRecord {
        table: f.sub_table.clone(),
        record: SubFormRecord {
            sub_record_id,
            parent_ref: parent,
            sub_form_id: f.sub_form_id.clone(),
            form_version: SchemaVersion(1),
            cells: Cells::from([("dep".to_string(), CellValue::Text("Nok".to_string()))]),
            created_at: MonotonicTimeNs(11),
            seq: 0,
        },
        ledger: audit.then(|| SubFormLedgerRow {
            sub_record_id,
            parent_submission_id: parent,
            form_id: f.form_id.clone(),
            sub_form_id: f.sub_form_id.clone(),
            submitter_id: UserId::new("somchai").unwrap(),
            created_at: MonotonicTimeNs(11),
        }),
    }
}

#[test]
fn at_ledger_db_01_insert_writes_both_rows_with_one_id() {
    let f = fixture();
    let id = insert(&f, "Somchai");
    let (ledger, dynamic) = f.store.submission_pair_rows(&f.table, &id).unwrap();
    assert_eq!(ledger.unwrap().submission_id, id);
    assert_eq!(dynamic.unwrap().record_id, id);
}

#[test]
fn at_ledger_db_02_mismatched_ids_are_refused() {
    let f = fixture();
    let (ledger, mut record) = pair(&f, SubmissionId::allocate(), "Somchai");
    record.record_id = SubmissionId::allocate();
    let mut batch = WriteBatch::new();
    batch.push(WriteOp::InsertSubmission {
        table: f.table.clone(),
        ledger: ledger.clone(),
        record,
    });
    assert!(matches!(
        f.store.commit_batch(batch),
        Err(StorageError::IdSyncViolation { .. })
    ));
    assert!(f.store.ledger_row(&ledger.submission_id).is_none());
}

#[test]
fn at_ledger_db_03_failed_batch_rolls_back_every_op() {
    let f = fixture();
    let first = SubmissionId::allocate();
    let (l1, r1) = pair(&f, first, "Somchai");
    let (l2, mut r2) = pair(&f, SubmissionId::allocate(), "Malee");
    r2.cells.clear();

    let mut batch = WriteBatch::new();
    batch.push(WriteOp::InsertSubmission {
        table: f.table.clone(),
        ledger: l1,
        record: r1,
    });
    batch.push(WriteOp::InsertSubmission {
        table: f.table.clone(),
        ledger: l2,
        record: r2,
    });
    assert!(matches!(
        f.store.commit_batch(batch),
        Err(StorageError::NullViolation { .. })
    ));
    assert!(f.store.ledger_row(&first).is_none());
    assert!(f.store.dynamic_row(&f.table, &first).unwrap().is_none());
    assert!(f.store.ledger_rows_for_form(&f.form_id).is_empty());
}

#[test]
fn at_ledger_db_04_injected_faults_leave_no_partial_state() {
    let f = fixture();
    let id = SubmissionId::allocate();
    let (ledger, record) = pair(&f, id, "Somchai");
    let mut batch = WriteBatch::new();
    batch.push(WriteOp::InsertSubmission {
        table: f.table.clone(),
        ledger,
        record,
    });

    f.store.fail_next_commits(1);
    let err = f.store.commit_batch(batch.clone()).unwrap_err();
    assert!(err.is_transient());

    f.store.fail_next_commits_midway(1);
    let err = f.store.commit_batch(batch.clone()).unwrap_err();
    assert!(err.is_transient());
    assert!(f.store.ledger_row(&id).is_none());
    assert!(f.store.dynamic_row(&f.table, &id).unwrap().is_none());

    f.store.commit_batch(batch).unwrap();
    assert_eq!(f.store.commit_attempts(), 3);
    assert!(f.store.ledger_row(&id).is_some());
}

#[test]
fn at_ledger_db_05_child_rows_need_existing_parent() {
    let f = fixture();
    let mut batch = WriteBatch::new();
    batch.push(child(&f, SubmissionId::allocate(), true));
    assert!(matches!(
        f.store.commit_batch(batch),
        Err(StorageError::ForeignKeyViolation { .. })
    ));
    assert!(f.store.sub_form_ledger_rows().is_empty());
}

#[test]
fn at_ledger_db_06_children_listed_in_insertion_order() {
    let f = fixture();
    let parent = insert(&f, "Somchai");
    let other = insert(&f, "Malee");
    let mut ids = Vec::new();
    for audit in [true, false, true] {
        let op = child(&f, parent, audit);
        if let WriteOp::InsertSubFormRecord { record, .. } = &op {
            ids.push(record.sub_record_id);
        }
        let mut batch = WriteBatch::new();
        batch.push(op);
        f.store.commit_batch(batch).unwrap();
    }
    let mut batch = WriteBatch::new();
    batch.push(child(&f, other, true));
    f.store.commit_batch(batch).unwrap();

    let rows = f.store.sub_record_rows_for_parent(&f.sub_table, &parent).unwrap();
    let listed: Vec<SubRecordId> = rows.iter().map(|r| r.sub_record_id).collect();
    assert_eq!(listed, ids);
    assert!(rows.windows(2).all(|w| w[0].seq < w[1].seq));
    assert_eq!(f.store.sub_form_ledger_rows().len(), 3);
}

#[test]
fn at_ledger_db_07_delete_refused_while_children_exist() {
    let f = fixture();
    let parent = insert(&f, "Somchai");
    let mut batch = WriteBatch::new();
    batch.push(child(&f, parent, true));
    f.store.commit_batch(batch).unwrap();

    let mut plain = WriteBatch::new();
    plain.push(WriteOp::DeleteSubmission {
        table: f.table.clone(),
        submission_id: parent,
    });
    assert!(matches!(
        f.store.commit_batch(plain.clone()),
        Err(StorageError::ForeignKeyViolation { .. })
    ));

    let mut cascade = WriteBatch::new();
    cascade.push(WriteOp::DeleteSubFormRecords {
        table: f.sub_table.clone(),
        parent_ref: parent,
    });
    for op in plain.ops() {
        cascade.push(op.clone());
    }
    f.store.commit_batch(cascade).unwrap();
    assert!(f.store.ledger_row(&parent).is_none());
    assert!(f
        .store
        .sub_record_rows_for_parent(&f.sub_table, &parent)
        .unwrap()
        .is_empty());
    assert!(f.store.sub_form_ledger_rows().is_empty());
}

#[test]
fn at_ledger_db_08_update_keeps_insertion_order() {
    let f = fixture();
    let a = insert(&f, "Somchai");
    let b = insert(&f, "Malee");
    let (mut ledger, mut record) = pair(&f, a, "Somchai J.");
    ledger.status = SubmissionStatus::Updated;
    ledger.updated_at = MonotonicTimeNs(20);
    record.updated_at = MonotonicTimeNs(20);
    let mut batch = WriteBatch::new();
    batch.push(WriteOp::UpdateSubmission {
        table: f.table.clone(),
        ledger,
        record,
    });
    f.store.commit_batch(batch).unwrap();

    let rows = f.store.ledger_rows_for_form(&f.form_id);
    let order: Vec<SubmissionId> = rows.iter().map(|r| r.submission_id).collect();
    assert_eq!(order, vec![a, b]);
    assert_eq!(rows[0].status, SubmissionStatus::Updated);
    assert_eq!(
        f.store.dynamic_row(&f.table, &a).unwrap().unwrap().cells,
        text_cells("Somchai J.")
    );
}

#[test]
fn at_ledger_db_09_form_registry_replace_is_optimistic() {
    let store = FormStore::new_in_memory();
    let def = FormDefinition::v1(
        FormId::new("hr_intake").unwrap(),
        "HR intake".to_string(),
        vec![FieldDefinition::new("name", FieldType::ShortText)],
        Vec::new(),
        BTreeSet::new(),
        UserId::new("author").unwrap(),
    )
    .unwrap();
    store.insert_form_row(def.clone()).unwrap();
    assert!(matches!(
        store.insert_form_row(def.clone()),
        Err(StorageError::DuplicateKey { .. })
    ));

    let mut stale = def.clone();
    stale.version = SchemaVersion(3);
    assert!(store.replace_form_row(stale).is_err());

    let mut next = def.clone();
    next.version = def.version.next();
    store.replace_form_row(next).unwrap();
    assert_eq!(
        store.form_row(&def.form_id).unwrap().version,
        SchemaVersion(2)
    );
}
