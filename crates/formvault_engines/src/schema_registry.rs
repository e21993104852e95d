#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use formvault_contracts::form::{FieldDefinition, FieldType};
use formvault_contracts::table::{ColumnSpec, StorageType, MAX_COLUMN_NAME_LEN, RESERVED_COLUMNS};
use formvault_contracts::{ContractViolation, Validate};
use sha2::{Digest, Sha256};

const COLLISION_SUFFIX_HEX_LEN: usize = 8;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SchemaError {
    #[error("fields '{first}' and '{second}' both map to column '{column}'")]
    Conflict {
        first: String,
        second: String,
        column: String,
    },
    #[error(transparent)]
    Contract(#[from] ContractViolation),
}

/// Maps field lists to column specs. Pure: the same field list always yields the
/// same columns, and appending fields never renames earlier ones.
#[derive(Debug, Default, Clone, Copy)]
pub struct SchemaRegistry;

impl SchemaRegistry {
    pub fn derive_columns(fields: &[FieldDefinition]) -> Result<Vec<ColumnSpec>, SchemaError> {
        let mut taken: BTreeMap<String, String> = BTreeMap::new();
        let mut raw_seen: BTreeSet<&str> = BTreeSet::new();
        let mut out = Vec::with_capacity(fields.len());

        // Declaration order, not display order: the declared list is append-only,
        // so earlier names never depend on later fields.
        for field in fields {
            field.validate()?;
            let base = normalize_column_name(&field.name);
            if !raw_seen.insert(field.name.as_str()) {
                return Err(SchemaError::Conflict {
                    first: field.name.clone(),
                    second: field.name.clone(),
                    column: base,
                });
            }

            let column_name = if taken.contains_key(&base) {
                free_suffixed_name(&taken, &base, &field.name, fields.len())?
            } else {
                base
            };

            taken.insert(column_name.clone(), field.name.clone());
            out.push(ColumnSpec {
                column_name,
                source_field: field.name.clone(),
                field_type: field.field_type,
                storage_type: storage_type_for(field),
                nullable: !field.required,
                indexed: index_hint(field),
            });
        }
        Ok(out)
    }
}

pub fn storage_type_for(field: &FieldDefinition) -> StorageType {
    if field.sensitive {
        return StorageType::EncryptedText;
    }
    match field.field_type {
        FieldType::ShortText | FieldType::LongText | FieldType::Email => StorageType::Text,
        FieldType::FileReference => StorageType::Text,
        FieldType::Number => StorageType::Numeric,
        FieldType::Date | FieldType::DateTime => StorageType::Timestamp,
        FieldType::Boolean => StorageType::Boolean,
        FieldType::Choice | FieldType::MultiChoice => StorageType::Document,
    }
}

fn index_hint(field: &FieldDefinition) -> bool {
    if field.sensitive {
        return false;
    }
    matches!(
        field.field_type,
        FieldType::Email
            | FieldType::Number
            | FieldType::Date
            | FieldType::DateTime
            | FieldType::Boolean
            | FieldType::Choice
    )
}

/// Deterministic slug: lowercase ASCII alphanumerics joined by single underscores.
pub fn normalize_column_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut last_was_sep = true;
    for c in raw.trim().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_was_sep = false;
        } else if !last_was_sep {
            out.push('_');
            last_was_sep = true;
        }
    }
    while out.ends_with('_') {
        out.pop();
    }

    if out.is_empty() {
        // Names with no ASCII content (e.g. Thai labels) still need a stable column.
        return format!("field_{}", short_hash_hex(raw));
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert_str(0, "f_");
    }
    if RESERVED_COLUMNS.contains(&out.as_str()) {
        out.push_str("_field");
    }
    truncate_column(&mut out, MAX_COLUMN_NAME_LEN);
    out
}

/// First free name among `base_<hash(raw)>`, `base_<hash(raw#2)>`, ... Columns
/// taken earlier in declaration order decide the round, so the result is stable.
fn free_suffixed_name(
    taken: &BTreeMap<String, String>,
    base: &str,
    raw: &str,
    max_rounds: usize,
) -> Result<String, SchemaError> {
    let mut candidate = suffixed_column_name(base, raw);
    for round in 2..=max_rounds + 1 {
        if !taken.contains_key(&candidate) {
            return Ok(candidate);
        }
        candidate = suffixed_column_name(base, &format!("{raw}#{round}"));
    }
    if let Some(existing) = taken.get(&candidate) {
        return Err(SchemaError::Conflict {
            first: existing.clone(),
            second: raw.to_string(),
            column: candidate,
        });
    }
    Ok(candidate)
}

fn suffixed_column_name(base: &str, raw: &str) -> String {
    let mut head = base.to_string();
    truncate_column(&mut head, MAX_COLUMN_NAME_LEN - COLLISION_SUFFIX_HEX_LEN - 1);
    format!("{head}_{}", short_hash_hex(raw))
}

fn truncate_column(s: &mut String, max_len: usize) {
    // ASCII only at this point, so byte truncation is char-safe.
    if s.len() > max_len {
        s.truncate(max_len);
    }
    while s.ends_with('_') {
        s.pop();
    }
}

pub(crate) fn short_hash_hex(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    digest
        .iter()
        .take(COLLISION_SUFFIX_HEX_LEN / 2)
        .map(|b| format!("{b:02x}"))
        .collect()
}
