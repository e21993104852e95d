#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};

use crate::form::FieldType;

pub const COLUMN_ID: &str = "id";
pub const COLUMN_PARENT_REF: &str = "parent_ref";
pub const COLUMN_FORM_VERSION: &str = "form_version";
pub const COLUMN_CREATED_AT: &str = "created_at";
pub const COLUMN_UPDATED_AT: &str = "updated_at";

/// Column names owned by the engine; derived field columns never take them.
pub const RESERVED_COLUMNS: &[&str] = &[
    COLUMN_ID,
    COLUMN_PARENT_REF,
    COLUMN_FORM_VERSION,
    COLUMN_CREATED_AT,
    COLUMN_UPDATED_AT,
];

pub const MAX_COLUMN_NAME_LEN: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageType {
    Text,
    Numeric,
    Timestamp,
    Boolean,
    Document,
    EncryptedText,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSpec {
    pub column_name: String,
    /// Raw field name this column was derived from.
    pub source_field: String,
    pub field_type: FieldType,
    pub storage_type: StorageType,
    pub nullable: bool,
    pub indexed: bool,
}
