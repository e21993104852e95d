#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::sync::Arc;

use formvault_contracts::form::{FieldType, FormId, SubFormId};
use formvault_contracts::table::{ColumnSpec, StorageType};
use formvault_contracts::SchemaVersion;
use formvault_storage::repo::SchemaMigrationRepo;
use formvault_storage::store::{FormStore, StorageError, TableScope};
use formvault_storage::table_manager::{TableError, TableManager};

fn form(id: &str) -> FormId {
    FormId::new(id).unwrap()
}

fn col(name: &str, field_type: FieldType, storage_type: StorageType) -> ColumnSpec {
    ColumnSpec {
        column_name: name.to_string(),
        source_field: name.to_string(),
        field_type,
        storage_type,
        nullable: true,
        indexed: field_type == FieldType::Email,
    }
}

fn manager() -> TableManager {
    TableManager::new(Arc::new(FormStore::new_in_memory()))
}

#[test]
fn at_tables_db_01_create_records_one_migration_row() {
    let tm = manager();
    let hr = form("hr_intake");
    let cols = vec![
        col("name", FieldType::ShortText, StorageType::Text),
        col("email", FieldType::Email, StorageType::Text),
        col("salary", FieldType::ShortText, StorageType::EncryptedText),
    ];
    let ensured = tm.ensure_table(&hr, SchemaVersion(1), &cols).unwrap();

    let shape = tm.store().table_shape(&ensured.table_name).unwrap();
    assert_eq!(shape.scope, TableScope::Form { form_id: hr.clone() });
    assert_eq!(shape.columns, cols);
    assert!(shape.indexes.contains("email"));
    assert!(!shape.indexes.contains("salary"));

    let rows = tm.store().schema_migration_rows();
    assert_eq!(rows.len(), 1);
    assert!(rows[0].created_table);
    assert_eq!(rows[0].form_version, SchemaVersion(1));
    assert_eq!(rows[0].added_columns, vec!["name", "email", "salary"]);
    assert_eq!(rows[0].sub_form_id, None);
}

#[test]
fn at_tables_db_02_evolution_adds_only_missing_columns() {
    let tm = manager();
    let hr = form("hr_intake");
    let v1 = vec![col("name", FieldType::ShortText, StorageType::Text)];
    tm.ensure_table(&hr, SchemaVersion(1), &v1).unwrap();

    let mut v2 = v1.clone();
    v2.push(col("start_date", FieldType::Date, StorageType::Timestamp));
    v2.push(col("age", FieldType::Number, StorageType::Numeric));
    let ensured = tm.ensure_table(&hr, SchemaVersion(2), &v2).unwrap();
    assert!(!ensured.created);
    assert_eq!(ensured.added_columns, vec!["start_date", "age"]);

    // Omitting a column from the desired set never drops it.
    tm.ensure_table(&hr, SchemaVersion(3), &v1).unwrap();
    let shape = tm.store().table_shape(&ensured.table_name).unwrap();
    let names: Vec<&str> = shape.columns.iter().map(|c| c.column_name.as_str()).collect();
    assert_eq!(names, vec!["name", "start_date", "age"]);

    let rows = tm.store().schema_migration_rows();
    assert_eq!(rows.len(), 2);
    assert!(!rows[1].created_table);
    assert_eq!(rows[1].form_version, SchemaVersion(2));
}

#[test]
fn at_tables_db_03_migration_ledger_is_append_only() {
    let tm = manager();
    let hr = form("hr_intake");
    tm.ensure_table(
        &hr,
        SchemaVersion(1),
        &[col("name", FieldType::ShortText, StorageType::Text)],
    )
    .unwrap();
    let store = tm.store();
    let first = store.schema_migration_rows()[0].migration_id;
    assert!(matches!(
        SchemaMigrationRepo::attempt_overwrite_schema_migration_row(store.as_ref(), first),
        Err(StorageError::AppendOnlyViolation { .. })
    ));
}

#[test]
fn at_tables_db_04_field_moved_onto_existing_column_conflicts() {
    let tm = manager();
    let hr = form("hr_intake");
    tm.ensure_table(
        &hr,
        SchemaVersion(1),
        &[col("name", FieldType::ShortText, StorageType::Text)],
    )
    .unwrap();

    let mut moved = col("name", FieldType::ShortText, StorageType::Text);
    moved.source_field = "Name ".to_string();
    let err = tm.ensure_table(&hr, SchemaVersion(2), &[moved]).unwrap_err();
    assert!(matches!(err, TableError::SchemaConflict { .. }));
    assert_eq!(tm.store().schema_migration_rows().len(), 1);
}

#[test]
fn at_tables_db_05_sub_tables_are_scoped_to_their_form() {
    let tm = manager();
    let hr = form("hr_intake");
    let ops = form("ops_intake");
    let deps = SubFormId::new("dependents").unwrap();
    let base = [col("name", FieldType::ShortText, StorageType::Text)];
    tm.ensure_table(&hr, SchemaVersion(1), &base).unwrap();
    tm.ensure_table(&ops, SchemaVersion(1), &base).unwrap();

    let a = tm.ensure_sub_table(&hr, &deps, SchemaVersion(1), &base).unwrap();
    let b = tm.ensure_sub_table(&ops, &deps, SchemaVersion(1), &base).unwrap();
    assert_ne!(a.table_name, b.table_name);

    let shape = tm.store().table_shape(&a.table_name).unwrap();
    assert_eq!(
        shape.scope,
        TableScope::SubForm {
            form_id: hr,
            sub_form_id: deps
        }
    );
    let all: BTreeSet<String> = tm
        .store()
        .schema_migration_rows()
        .into_iter()
        .map(|r| r.table_name)
        .collect();
    assert_eq!(all.len(), 4);
}

#[test]
fn at_tables_db_06_alter_failure_leaves_shape_untouched() {
    let tm = manager();
    let hr = form("hr_intake");
    let v1 = vec![col("name", FieldType::ShortText, StorageType::Text)];
    let ensured = tm.ensure_table(&hr, SchemaVersion(1), &v1).unwrap();

    let mut v2 = v1.clone();
    v2.push(col("age", FieldType::Number, StorageType::Numeric));
    tm.store().fail_next_table_ops(1);
    assert!(matches!(
        tm.ensure_table(&hr, SchemaVersion(2), &v2),
        Err(TableError::TableCreation { .. })
    ));
    assert_eq!(
        tm.store().table_shape(&ensured.table_name).unwrap().columns,
        v1
    );
    assert_eq!(tm.store().schema_migration_rows().len(), 1);
}

#[test]
fn at_tables_db_07_flag_only_evolution_relaxes_and_records() {
    let tm = manager();
    let hr = form("hr_intake");
    let mut name = col("name", FieldType::ShortText, StorageType::Text);
    name.nullable = false;
    let ensured = tm.ensure_table(&hr, SchemaVersion(1), &[name.clone()]).unwrap();

    // Same column set, same nullability: nothing to record.
    assert!(!tm
        .ensure_table(&hr, SchemaVersion(2), &[name.clone()])
        .unwrap()
        .changed());
    assert_eq!(tm.store().schema_migration_rows().len(), 1);

    name.nullable = true;
    let relaxed = tm.ensure_table(&hr, SchemaVersion(3), &[name]).unwrap();
    assert_eq!(relaxed.relaxed_columns, vec!["name"]);
    assert!(relaxed.added_columns.is_empty());

    let shape = tm.store().table_shape(&ensured.table_name).unwrap();
    assert!(shape.column("name").unwrap().nullable);
    let rows = tm.store().schema_migration_rows();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[1].form_version, SchemaVersion(3));
    assert_eq!(rows[1].relaxed_columns, vec!["name"]);
    assert!(rows[1].added_columns.is_empty());
}

#[test]
fn at_tables_db_08_concurrent_ensure_converges_without_lock() {
    let tm = Arc::new(manager());
    let hr = form("hr_intake");
    let cols = vec![col("name", FieldType::ShortText, StorageType::Text)];
    let barrier = Arc::new(std::sync::Barrier::new(4));

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let tm = tm.clone();
            let hr = hr.clone();
            let cols = cols.clone();
            let barrier = barrier.clone();
            std::thread::spawn(move || {
                barrier.wait();
                tm.ensure_table(&hr, SchemaVersion(1), &cols)
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert!(results.iter().all(|r| r.is_ok()));
    let created = results
        .iter()
        .filter(|r| r.as_ref().map(|e| e.created).unwrap_or(false))
        .count();
    assert_eq!(created, 1);
    assert_eq!(tm.store().schema_migration_rows().len(), 1);
}
