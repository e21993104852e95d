#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use formvault_contracts::form::{FormId, SubFormId};
use formvault_contracts::table::{ColumnSpec, COLUMN_PARENT_REF};
use formvault_contracts::{MonotonicTimeNs, SchemaVersion};
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::store::{FormStore, StorageError, TableScope, TableShape};

const TABLE_PREFIX: &str = "fv_";
const MAX_SLUG_LEN: usize = 24;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TableError {
    #[error("table creation failed: {reason}")]
    TableCreation { reason: String },
    #[error("column {column} conflicts with the existing table: {reason}")]
    SchemaConflict {
        column: String,
        reason: &'static str,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Result of reconciling a table with its desired column set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsuredTable {
    pub table_name: String,
    pub created: bool,
    pub added_columns: Vec<String>,
    pub relaxed_columns: Vec<String>,
}

impl EnsuredTable {
    pub fn changed(&self) -> bool {
        self.created || !self.added_columns.is_empty() || !self.relaxed_columns.is_empty()
    }
}

/// Creates and additively alters dynamic tables.
///
/// Every structural change for a form is serialized through that form's schema
/// lock. Writers of submissions take the same lock shared, so a column can never
/// appear halfway through a submission's validate-and-commit. Independently of
/// that lock, each diff-and-apply runs under `ddl`, so concurrent `ensure_*`
/// calls for one table converge instead of racing on create.
#[derive(Debug)]
pub struct TableManager {
    store: Arc<FormStore>,
    form_locks: Mutex<BTreeMap<FormId, Arc<RwLock<()>>>>,
    ddl: Mutex<()>,
}

impl TableManager {
    pub fn new(store: Arc<FormStore>) -> Self {
        Self {
            store,
            form_locks: Mutex::new(BTreeMap::new()),
            ddl: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<FormStore> {
        &self.store
    }

    /// Per-form schema lock. Hold it exclusively while changing a form's tables,
    /// shared while writing submissions against them.
    pub fn schema_lock(&self, form_id: &FormId) -> Arc<RwLock<()>> {
        self.form_locks
            .lock()
            .entry(form_id.clone())
            .or_insert_with(|| Arc::new(RwLock::new(())))
            .clone()
    }

    pub fn form_table_name(form_id: &FormId) -> String {
        format!(
            "{TABLE_PREFIX}{}_{}",
            slug(form_id.as_str()),
            hash8(form_id.as_str())
        )
    }

    pub fn sub_table_name(form_id: &FormId, sub_form_id: &SubFormId) -> String {
        format!(
            "{TABLE_PREFIX}{}__{}_{}",
            slug(form_id.as_str()),
            slug(sub_form_id.as_str()),
            hash8(&format!("{}/{}", form_id.as_str(), sub_form_id.as_str()))
        )
    }

    /// Brings the form's dynamic table to at least `columns`. Callers that write
    /// the form definition alongside hold the form's schema lock exclusively.
    pub fn ensure_table(
        &self,
        form_id: &FormId,
        form_version: SchemaVersion,
        columns: &[ColumnSpec],
    ) -> Result<EnsuredTable, TableError> {
        let scope = TableScope::Form {
            form_id: form_id.clone(),
        };
        self.ensure(Self::form_table_name(form_id), scope, form_version, columns)
    }

    /// Sub-form counterpart of [`TableManager::ensure_table`]. The parent form
    /// table must already exist.
    pub fn ensure_sub_table(
        &self,
        form_id: &FormId,
        sub_form_id: &SubFormId,
        form_version: SchemaVersion,
        columns: &[ColumnSpec],
    ) -> Result<EnsuredTable, TableError> {
        let scope = TableScope::SubForm {
            form_id: form_id.clone(),
            sub_form_id: sub_form_id.clone(),
        };
        self.ensure(
            Self::sub_table_name(form_id, sub_form_id),
            scope,
            form_version,
            columns,
        )
    }

    fn ensure(
        &self,
        table_name: String,
        scope: TableScope,
        form_version: SchemaVersion,
        columns: &[ColumnSpec],
    ) -> Result<EnsuredTable, TableError> {
        let _ddl = self.ddl.lock();
        let now = MonotonicTimeNs::now();
        let Some(existing) = self.store.table_shape(&table_name) else {
            let mut indexes: BTreeSet<String> = columns
                .iter()
                .filter(|c| c.indexed)
                .map(|c| c.column_name.clone())
                .collect();
            if matches!(scope, TableScope::SubForm { .. }) {
                indexes.insert(COLUMN_PARENT_REF.to_string());
            }
            let shape = TableShape {
                table_name: table_name.clone(),
                scope,
                columns: columns.to_vec(),
                indexes,
            };
            self.store
                .create_table(shape, form_version, now)
                .map_err(backend_as_creation)?;
            info!(
                table = %table_name,
                columns = columns.len(),
                version = form_version.0,
                "created dynamic table"
            );
            return Ok(EnsuredTable {
                table_name,
                created: true,
                added_columns: columns.iter().map(|c| c.column_name.clone()).collect(),
                relaxed_columns: Vec::new(),
            });
        };

        if existing.scope != scope {
            return Err(TableError::TableCreation {
                reason: format!("table {table_name} belongs to a different owner"),
            });
        }

        let mut additions = Vec::new();
        let mut relaxed = Vec::new();
        for desired in columns {
            match existing.column(&desired.column_name) {
                Some(current) => {
                    if current.source_field != desired.source_field {
                        return Err(TableError::SchemaConflict {
                            column: desired.column_name.clone(),
                            reason: "column already holds a different field",
                        });
                    }
                    if current.storage_type != desired.storage_type {
                        return Err(TableError::SchemaConflict {
                            column: desired.column_name.clone(),
                            reason: "column storage type cannot change",
                        });
                    }
                    // A field that became optional widens its column. The reverse
                    // is left to payload validation since old rows may hold nulls.
                    if desired.nullable && !current.nullable {
                        relaxed.push(desired.column_name.clone());
                    }
                }
                None => {
                    let mut added = desired.clone();
                    // Rows written before this column existed have no value for it.
                    added.nullable = true;
                    additions.push(added);
                }
            }
        }

        if additions.is_empty() && relaxed.is_empty() {
            debug!(table = %table_name, "dynamic table already up to date");
            return Ok(EnsuredTable {
                table_name,
                created: false,
                added_columns: Vec::new(),
                relaxed_columns: Vec::new(),
            });
        }

        let added_columns: Vec<String> = additions.iter().map(|c| c.column_name.clone()).collect();
        let indexes: BTreeSet<String> = additions
            .iter()
            .filter(|c| c.indexed)
            .map(|c| c.column_name.clone())
            .collect();
        self.store
            .alter_table(
                &table_name,
                additions,
                relaxed.clone(),
                indexes,
                form_version,
                now,
            )
            .map_err(backend_as_creation)?;
        info!(
            table = %table_name,
            added = ?added_columns,
            relaxed = ?relaxed,
            version = form_version.0,
            "altered dynamic table"
        );
        Ok(EnsuredTable {
            table_name,
            created: false,
            added_columns,
            relaxed_columns: relaxed,
        })
    }
}

fn backend_as_creation(err: StorageError) -> TableError {
    match err {
        StorageError::Backend { reason } => TableError::TableCreation { reason },
        other => TableError::Storage(other),
    }
}

fn slug(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    out.truncate(MAX_SLUG_LEN);
    out
}

fn hash8(raw: &str) -> String {
    Sha256::digest(raw.as_bytes())
        .iter()
        .take(4)
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use formvault_contracts::form::FieldType;
    use formvault_contracts::table::StorageType;

    fn col(name: &str, storage_type: StorageType, nullable: bool) -> ColumnSpec {
        ColumnSpec {
            column_name: name.to_string(),
            source_field: name.to_string(),
            field_type: FieldType::ShortText,
            storage_type,
            nullable,
            indexed: false,
        }
    }

    #[test]
    fn at_table_01_names_are_stable_and_distinct() {
        let form = FormId::new("HR-Intake").unwrap();
        let a = TableManager::form_table_name(&form);
        assert_eq!(a, TableManager::form_table_name(&form));
        assert!(a.starts_with("fv_hr_intake_"));
        assert!(a.len() <= 63);

        let other = FormId::new("hr_intake").unwrap();
        assert_ne!(a, TableManager::form_table_name(&other));

        let sub = SubFormId::new("dependents").unwrap();
        let s = TableManager::sub_table_name(&form, &sub);
        assert!(s.starts_with("fv_hr_intake__dependents_"));
        assert_ne!(s, a);
    }

    #[test]
    fn at_table_02_ensure_is_idempotent_and_additive() {
        let tm = TableManager::new(Arc::new(FormStore::new_in_memory()));
        let form = FormId::new("hr_intake").unwrap();
        let v1 = vec![col("name", StorageType::Text, false)];

        let first = tm.ensure_table(&form, SchemaVersion(1), &v1).unwrap();
        assert!(first.created);
        let again = tm.ensure_table(&form, SchemaVersion(1), &v1).unwrap();
        assert!(!again.changed());
        assert_eq!(tm.store().schema_migration_rows().len(), 1);

        let mut v2 = v1.clone();
        v2.push(col("start_date", StorageType::Timestamp, false));
        let evolved = tm.ensure_table(&form, SchemaVersion(2), &v2).unwrap();
        assert_eq!(evolved.added_columns, vec!["start_date".to_string()]);

        let shape = tm.store().table_shape(&evolved.table_name).unwrap();
        assert!(shape.column("start_date").unwrap().nullable);
        assert!(!shape.column("name").unwrap().nullable);
    }

    #[test]
    fn at_table_03_retype_is_schema_conflict() {
        let tm = TableManager::new(Arc::new(FormStore::new_in_memory()));
        let form = FormId::new("hr_intake").unwrap();
        tm.ensure_table(&form, SchemaVersion(1), &[col("salary", StorageType::Text, true)])
            .unwrap();
        let err = tm
            .ensure_table(
                &form,
                SchemaVersion(2),
                &[col("salary", StorageType::Numeric, true)],
            )
            .unwrap_err();
        assert!(matches!(err, TableError::SchemaConflict { column, .. } if column == "salary"));
    }

    #[test]
    fn at_table_04_sub_table_requires_parent_table() {
        let tm = TableManager::new(Arc::new(FormStore::new_in_memory()));
        let form = FormId::new("hr_intake").unwrap();
        let sub = SubFormId::new("dependents").unwrap();
        let cols = [col("dependent_name", StorageType::Text, true)];
        assert!(tm
            .ensure_sub_table(&form, &sub, SchemaVersion(1), &cols)
            .is_err());

        tm.ensure_table(&form, SchemaVersion(1), &[col("name", StorageType::Text, true)])
            .unwrap();
        let ensured = tm
            .ensure_sub_table(&form, &sub, SchemaVersion(1), &cols)
            .unwrap();
        let shape = tm.store().table_shape(&ensured.table_name).unwrap();
        assert!(shape.indexes.contains(COLUMN_PARENT_REF));
    }

    #[test]
    fn at_table_06_optional_field_relaxes_not_null() {
        let tm = TableManager::new(Arc::new(FormStore::new_in_memory()));
        let form = FormId::new("hr_intake").unwrap();
        let v1 = [col("name", StorageType::Text, false)];
        let first = tm.ensure_table(&form, SchemaVersion(1), &v1).unwrap();

        let v2 = [col("name", StorageType::Text, true)];
        let relaxed = tm.ensure_table(&form, SchemaVersion(2), &v2).unwrap();
        assert!(relaxed.changed());
        assert!(relaxed.added_columns.is_empty());
        assert_eq!(relaxed.relaxed_columns, vec!["name".to_string()]);
        let shape = tm.store().table_shape(&first.table_name).unwrap();
        assert!(shape.column("name").unwrap().nullable);

        // Tightening back is not a structural change.
        let again = tm.ensure_table(&form, SchemaVersion(3), &v1).unwrap();
        assert!(!again.changed());
        let shape = tm.store().table_shape(&first.table_name).unwrap();
        assert!(shape.column("name").unwrap().nullable);
    }

    #[test]
    fn at_table_05_backend_failure_surfaces_as_table_creation() {
        let tm = TableManager::new(Arc::new(FormStore::new_in_memory()));
        let form = FormId::new("hr_intake").unwrap();
        tm.store().fail_next_table_ops(1);
        let err = tm
            .ensure_table(&form, SchemaVersion(1), &[col("name", StorageType::Text, true)])
            .unwrap_err();
        assert!(matches!(err, TableError::TableCreation { .. }));
        assert!(tm.store().form_table_name(&form).is_none());

        assert!(tm
            .ensure_table(&form, SchemaVersion(1), &[col("name", StorageType::Text, true)])
            .unwrap()
            .created);
    }
}
