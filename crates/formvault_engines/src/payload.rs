#![forbid(unsafe_code)]

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use formvault_contracts::form::{FieldDefinition, FieldType};
use formvault_contracts::submission::{CellValue, Cells};
use formvault_contracts::table::{ColumnSpec, StorageType};
use serde::Serialize;
use serde_json::{Map, Number, Value};

use crate::field_codec::{EncryptionCodec, EncryptionError, KeyProvider};

pub type Payload = Map<String, Value>;

const MAX_SHORT_TEXT_LEN: usize = 1_024;
const MAX_LONG_TEXT_LEN: usize = 65_536;
const MAX_FILE_REF_LEN: usize = 256;
const MAX_EMAIL_LEN: usize = 320;
/// Largest magnitude a numeric cell holds without losing integer precision (2^53).
const MAX_EXACT_INTEGER: i64 = 1 << 53;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldViolation {
    pub field: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("payload failed validation: {}", summarize(.violations))]
pub struct ValidationError {
    pub violations: Vec<FieldViolation>,
}

impl ValidationError {
    pub fn single(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            violations: vec![FieldViolation {
                field: field.into(),
                reason: reason.into(),
            }],
        }
    }
}

fn summarize(violations: &[FieldViolation]) -> String {
    violations
        .iter()
        .map(|v| format!("{}: {}", v.field, v.reason))
        .collect::<Vec<_>>()
        .join("; ")
}

#[derive(Debug, Clone, PartialEq)]
struct NormalizedEntry {
    column: ColumnSpec,
    value: Option<Value>,
}

/// A payload that passed validation, with every value coerced to its field type.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedPayload {
    entries: Vec<NormalizedEntry>,
}

impl NormalizedPayload {
    pub fn value(&self, field: &str) -> Option<&Value> {
        self.entries
            .iter()
            .find(|e| e.column.source_field == field)
            .and_then(|e| e.value.as_ref())
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PayloadCodec;

impl PayloadCodec {
    /// Checks required fields, rejects unknown keys and coerces each value. All
    /// violations are reported together.
    pub fn validate(
        fields: &[FieldDefinition],
        columns: &[ColumnSpec],
        payload: &Payload,
    ) -> Result<NormalizedPayload, ValidationError> {
        let mut violations = Vec::new();
        for key in payload.keys() {
            if !fields.iter().any(|f| &f.name == key) {
                violations.push(FieldViolation {
                    field: key.clone(),
                    reason: "unknown field".to_string(),
                });
            }
        }

        let mut entries = Vec::with_capacity(fields.len());
        for field in fields {
            let Some(column) = columns.iter().find(|c| c.source_field == field.name) else {
                violations.push(FieldViolation {
                    field: field.name.clone(),
                    reason: "field is not materialized in storage".to_string(),
                });
                continue;
            };
            let raw = payload.get(&field.name).filter(|v| !v.is_null());
            let value = match raw {
                None => None,
                Some(v) => match coerce(field, v) {
                    Ok(v) => v,
                    Err(reason) => {
                        violations.push(FieldViolation {
                            field: field.name.clone(),
                            reason,
                        });
                        continue;
                    }
                },
            };
            if field.required && value.is_none() {
                violations.push(FieldViolation {
                    field: field.name.clone(),
                    reason: "is required".to_string(),
                });
                continue;
            }
            entries.push(NormalizedEntry {
                column: column.clone(),
                value,
            });
        }

        if !violations.is_empty() {
            return Err(ValidationError { violations });
        }
        Ok(NormalizedPayload { entries })
    }

    /// Turns a normalized payload into storage cells, sealing encrypted columns.
    pub fn encode(
        normalized: &NormalizedPayload,
        keys: &dyn KeyProvider,
    ) -> Result<Cells, EncryptionError> {
        let mut cells = Cells::new();
        for entry in &normalized.entries {
            let cell = match &entry.value {
                None => CellValue::Null,
                Some(v) => to_cell(entry.column.storage_type, v, keys)?,
            };
            cells.insert(entry.column.column_name.clone(), cell);
        }
        Ok(cells)
    }

    /// Maps stored cells back to field-name keyed values. Null and absent cells
    /// are omitted, so rows written before a column existed read back cleanly.
    pub fn decode(
        columns: &[ColumnSpec],
        cells: &Cells,
        keys: &dyn KeyProvider,
    ) -> Result<Payload, EncryptionError> {
        let mut out = Payload::new();
        for column in columns {
            let Some(cell) = cells.get(&column.column_name) else {
                continue;
            };
            let value = match cell {
                CellValue::Null => continue,
                CellValue::Text(s) | CellValue::Timestamp(s) => Value::String(s.clone()),
                CellValue::Numeric(n) => number_value(*n),
                CellValue::Boolean(b) => Value::Bool(*b),
                CellValue::Document(v) => v.clone(),
                CellValue::Encrypted(envelope) => {
                    let plaintext = EncryptionCodec::open(keys, envelope)?;
                    serde_json::from_slice(&plaintext)
                        .map_err(|_| EncryptionError::MalformedEnvelope)?
                }
            };
            out.insert(column.source_field.clone(), value);
        }
        Ok(out)
    }
}

fn to_cell(
    storage_type: StorageType,
    value: &Value,
    keys: &dyn KeyProvider,
) -> Result<CellValue, EncryptionError> {
    let cell = match (storage_type, value) {
        (StorageType::EncryptedText, v) => {
            let plaintext =
                serde_json::to_vec(v).map_err(|_| EncryptionError::MalformedEnvelope)?;
            CellValue::Encrypted(EncryptionCodec::seal(keys, &plaintext)?)
        }
        (StorageType::Text, Value::String(s)) => CellValue::Text(s.clone()),
        (StorageType::Timestamp, Value::String(s)) => CellValue::Timestamp(s.clone()),
        (StorageType::Numeric, Value::Number(n)) => {
            CellValue::Numeric(n.as_f64().unwrap_or_default())
        }
        (StorageType::Boolean, Value::Bool(b)) => CellValue::Boolean(*b),
        (StorageType::Document, v) => CellValue::Document(v.clone()),
        (_, v) => CellValue::Document(v.clone()),
    };
    Ok(cell)
}

fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < (i64::MAX as f64) {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

fn coerce(field: &FieldDefinition, value: &Value) -> Result<Option<Value>, String> {
    match field.field_type {
        FieldType::ShortText => coerce_text(value, MAX_SHORT_TEXT_LEN, field.required),
        FieldType::LongText => coerce_text(value, MAX_LONG_TEXT_LEN, field.required),
        FieldType::Email => {
            let s = value.as_str().ok_or("must be a string")?.trim();
            if s.is_empty() {
                return Ok(None);
            }
            if s.len() > MAX_EMAIL_LEN || !looks_like_email(s) {
                return Err("must be an email address".to_string());
            }
            Ok(Some(Value::String(s.to_string())))
        }
        FieldType::Number => {
            let (n, whole) = match value {
                Value::Number(n) => (
                    n.as_f64(),
                    n.as_i64()
                        .map(i128::from)
                        .or_else(|| n.as_u64().map(i128::from)),
                ),
                Value::String(s) if s.trim().is_empty() => return Ok(None),
                Value::String(s) => (
                    s.trim().parse::<f64>().ok(),
                    s.trim().parse::<i128>().ok(),
                ),
                _ => (None, None),
            };
            if whole.is_some_and(|w| w.unsigned_abs() > MAX_EXACT_INTEGER as u128) {
                return Err("integer is too large to store exactly".to_string());
            }
            match n {
                Some(n) if n.fract() == 0.0 && n.abs() > MAX_EXACT_INTEGER as f64 => {
                    Err("integer is too large to store exactly".to_string())
                }
                Some(n) if n.is_finite() => Ok(Some(number_value(n))),
                _ => Err("must be a finite number".to_string()),
            }
        }
        FieldType::Date => {
            let s = value.as_str().ok_or("must be a date string")?.trim();
            if s.is_empty() {
                return Ok(None);
            }
            let d = NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .map_err(|_| "must be a date in YYYY-MM-DD form".to_string())?;
            Ok(Some(Value::String(d.format("%Y-%m-%d").to_string())))
        }
        FieldType::DateTime => {
            let s = value.as_str().ok_or("must be a date-time string")?.trim();
            if s.is_empty() {
                return Ok(None);
            }
            let dt = DateTime::parse_from_rfc3339(s)
                .map_err(|_| "must be an RFC 3339 date-time".to_string())?;
            Ok(Some(Value::String(
                dt.with_timezone(&Utc)
                    .to_rfc3339_opts(SecondsFormat::AutoSi, true),
            )))
        }
        FieldType::Boolean => match value {
            Value::Bool(b) => Ok(Some(Value::Bool(*b))),
            Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Ok(Some(Value::Bool(true))),
                "false" => Ok(Some(Value::Bool(false))),
                "" => Ok(None),
                _ => Err("must be true or false".to_string()),
            },
            _ => Err("must be true or false".to_string()),
        },
        FieldType::Choice => {
            let s = value.as_str().ok_or("must be one of the declared options")?;
            if s.is_empty() {
                return Ok(None);
            }
            if !field.options.iter().any(|o| o == s) {
                return Err(format!("'{s}' is not a declared option"));
            }
            Ok(Some(Value::String(s.to_string())))
        }
        FieldType::MultiChoice => {
            let items = value
                .as_array()
                .ok_or("must be a list of declared options")?;
            let mut picked: Vec<Value> = Vec::with_capacity(items.len());
            for item in items {
                let s = item.as_str().ok_or("must be a list of declared options")?;
                if !field.options.iter().any(|o| o == s) {
                    return Err(format!("'{s}' is not a declared option"));
                }
                if picked.iter().any(|p| p.as_str() == Some(s)) {
                    return Err(format!("'{s}' is selected more than once"));
                }
                picked.push(Value::String(s.to_string()));
            }
            if picked.is_empty() {
                return Ok(None);
            }
            Ok(Some(Value::Array(picked)))
        }
        FieldType::FileReference => {
            let s = value.as_str().ok_or("must be a file reference id")?;
            if s.is_empty() {
                return Ok(None);
            }
            if s.len() > MAX_FILE_REF_LEN || s.chars().any(char::is_whitespace) {
                return Err("must be an opaque file reference id".to_string());
            }
            Ok(Some(Value::String(s.to_string())))
        }
    }
}

fn coerce_text(value: &Value, max_len: usize, required: bool) -> Result<Option<Value>, String> {
    let s = match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return Err("must be text".to_string()),
    };
    if s.chars().count() > max_len {
        return Err(format!("must be at most {max_len} characters"));
    }
    if required && s.trim().is_empty() {
        return Ok(None);
    }
    Ok(Some(Value::String(s)))
}

fn looks_like_email(s: &str) -> bool {
    let Some((local, domain)) = s.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
        && !s.chars().any(char::is_whitespace)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field_codec::{FieldKey, KeyRing, KEY_LEN};
    use crate::schema_registry::SchemaRegistry;
    use serde_json::json;

    fn ring() -> KeyRing {
        KeyRing::new(FieldKey::new("k1", [9u8; KEY_LEN]).unwrap())
    }

    fn fields() -> Vec<FieldDefinition> {
        vec![
            FieldDefinition::new("name", FieldType::ShortText).required(),
            FieldDefinition::new("salary", FieldType::ShortText).sensitive(),
            FieldDefinition::new("age", FieldType::Number),
            FieldDefinition::new("start", FieldType::Date),
            FieldDefinition::new("dept", FieldType::Choice).with_options(["Sales", "HR"]),
            FieldDefinition::new("skills", FieldType::MultiChoice).with_options(["rust", "go"]),
            FieldDefinition::new("cv", FieldType::FileReference),
            FieldDefinition::new("contact", FieldType::Email),
        ]
    }

    fn payload(v: Value) -> Payload {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn at_payload_01_valid_payload_roundtrips_through_cells() {
        let fields = fields();
        let columns = SchemaRegistry::derive_columns(&fields).unwrap();
        let input = payload(json!({
            "name": "Somchai",
            "salary": "50000",
            "age": 41,
            "start": "2024-01-31",
            "dept": "Sales",
            "skills": ["rust"],
            "cv": "file_7f3a",
            "contact": "somchai@example.co.th"
        }));
        let normalized = PayloadCodec::validate(&fields, &columns, &input).unwrap();
        let keys = ring();
        let cells = PayloadCodec::encode(&normalized, &keys).unwrap();

        assert!(matches!(cells.get("salary"), Some(CellValue::Encrypted(_))));
        let raw = serde_json::to_string(&cells).unwrap();
        assert!(!raw.contains("50000"));

        let decoded = PayloadCodec::decode(&columns, &cells, &keys).unwrap();
        assert_eq!(decoded, input);
    }

    #[test]
    fn at_payload_02_all_violations_reported_together() {
        let fields = fields();
        let columns = SchemaRegistry::derive_columns(&fields).unwrap();
        let input = payload(json!({
            "age": "forty",
            "dept": "Marketing",
            "nickname": "x"
        }));
        let err = PayloadCodec::validate(&fields, &columns, &input).unwrap_err();
        let names: Vec<&str> = err.violations.iter().map(|v| v.field.as_str()).collect();
        assert!(names.contains(&"nickname"));
        assert!(names.contains(&"name"));
        assert!(names.contains(&"age"));
        assert!(names.contains(&"dept"));
        assert!(err.to_string().contains("name: is required"));
    }

    #[test]
    fn at_payload_03_coercions_normalize_values() {
        let fields = vec![
            FieldDefinition::new("n", FieldType::Number),
            FieldDefinition::new("b", FieldType::Boolean),
            FieldDefinition::new("t", FieldType::DateTime),
            FieldDefinition::new("label", FieldType::ShortText),
        ];
        let columns = SchemaRegistry::derive_columns(&fields).unwrap();
        let input = payload(json!({
            "n": " 12.5 ",
            "b": "TRUE",
            "t": "2024-01-31T10:00:00+07:00",
            "label": 7
        }));
        let normalized = PayloadCodec::validate(&fields, &columns, &input).unwrap();
        assert_eq!(normalized.value("n"), Some(&json!(12.5)));
        assert_eq!(normalized.value("b"), Some(&json!(true)));
        assert_eq!(normalized.value("t"), Some(&json!("2024-01-31T03:00:00Z")));
        assert_eq!(normalized.value("label"), Some(&json!("7")));
    }

    #[test]
    fn at_payload_04_bad_values_rejected() {
        let fields = fields();
        let columns = SchemaRegistry::derive_columns(&fields).unwrap();
        for (field, bad) in [
            ("start", json!("31/01/2024")),
            ("skills", json!(["rust", "rust"])),
            ("cv", json!("has space")),
            ("contact", json!("not-an-email")),
            ("age", json!(true)),
        ] {
            let mut input = payload(json!({ "name": "a" }));
            input.insert(field.to_string(), bad);
            let err = PayloadCodec::validate(&fields, &columns, &input).unwrap_err();
            assert_eq!(err.violations.len(), 1, "field {field}");
            assert_eq!(err.violations[0].field, field);
        }
    }

    #[test]
    fn at_payload_05_blank_required_text_is_missing() {
        let fields = fields();
        let columns = SchemaRegistry::derive_columns(&fields).unwrap();
        let input = payload(json!({ "name": "   " }));
        let err = PayloadCodec::validate(&fields, &columns, &input).unwrap_err();
        assert_eq!(err.violations[0].reason, "is required");
    }

    #[test]
    fn at_payload_06_columns_missing_from_old_rows_decode_as_absent() {
        let fields = fields();
        let columns = SchemaRegistry::derive_columns(&fields).unwrap();
        let mut cells = Cells::new();
        cells.insert("name".to_string(), CellValue::Text("Old".to_string()));
        let decoded = PayloadCodec::decode(&columns, &cells, &ring()).unwrap();
        assert_eq!(decoded, payload(json!({ "name": "Old" })));
    }

    #[test]
    fn at_payload_07_tampered_sensitive_cell_fails_closed() {
        let fields = fields();
        let columns = SchemaRegistry::derive_columns(&fields).unwrap();
        let input = payload(json!({ "name": "a", "salary": "50000" }));
        let normalized = PayloadCodec::validate(&fields, &columns, &input).unwrap();
        let keys = ring();
        let mut cells = PayloadCodec::encode(&normalized, &keys).unwrap();
        if let Some(CellValue::Encrypted(env)) = cells.get_mut("salary") {
            env.ciphertext[0] ^= 1;
        }
        assert_eq!(
            PayloadCodec::decode(&columns, &cells, &keys),
            Err(EncryptionError::Authentication)
        );
    }

    #[test]
    fn at_payload_08_large_integers_are_exact_or_rejected() {
        let fields = fields();
        let columns = SchemaRegistry::derive_columns(&fields).unwrap();
        let keys = ring();

        let edge = payload(json!({ "name": "a", "age": 9_007_199_254_740_992_i64 }));
        let normalized = PayloadCodec::validate(&fields, &columns, &edge).unwrap();
        let cells = PayloadCodec::encode(&normalized, &keys).unwrap();
        assert_eq!(PayloadCodec::decode(&columns, &cells, &keys).unwrap(), edge);

        for bad in [
            json!(9_007_199_254_740_993_i64),
            json!(-9_007_199_254_740_993_i64),
            json!(u64::MAX),
            json!("1234567890123456789"),
            json!(1e20),
        ] {
            let mut input = payload(json!({ "name": "a" }));
            input.insert("age".to_string(), bad.clone());
            let err = PayloadCodec::validate(&fields, &columns, &input).unwrap_err();
            assert_eq!(err.violations.len(), 1, "value {bad}");
            assert_eq!(err.violations[0].field, "age");
        }
    }
}
