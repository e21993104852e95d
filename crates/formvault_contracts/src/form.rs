#![forbid(unsafe_code)]

use std::collections::{BTreeSet, HashSet};

use serde::{Deserialize, Serialize};

use crate::access::UserId;
use crate::common::validate_token;
use crate::{ContractViolation, SchemaVersion, Validate};

const MAX_ID_LEN: usize = 64;
const MAX_FIELD_NAME_LEN: usize = 128;
const MAX_TITLE_LEN: usize = 256;
const MAX_TAG_LEN: usize = 64;
const MAX_CHOICE_OPTIONS: usize = 256;

fn validate_ident(field: &'static str, value: &str) -> Result<(), ContractViolation> {
    validate_token(field, value, MAX_ID_LEN)?;
    if !value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "must contain only ASCII letters, digits, '_' or '-'",
        });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FormId(String);

impl FormId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let id = id.into();
        validate_ident("form_id", &id)?;
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for FormId {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<FormId> for String {
    fn from(value: FormId) -> Self {
        value.0
    }
}

impl std::fmt::Display for FormId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SubFormId(String);

impl SubFormId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let id = id.into();
        validate_ident("sub_form_id", &id)?;
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for SubFormId {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<SubFormId> for String {
    fn from(value: SubFormId) -> Self {
        value.0
    }
}

impl std::fmt::Display for SubFormId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Semantic type of a user-designed field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    ShortText,
    LongText,
    Email,
    Number,
    Date,
    DateTime,
    Boolean,
    Choice,
    MultiChoice,
    FileReference,
}

impl FieldType {
    pub fn has_options(self) -> bool {
        matches!(self, FieldType::Choice | FieldType::MultiChoice)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub sensitive: bool,
    #[serde(default)]
    pub display_order: u32,
    /// Allowed values for choice and multi-choice fields.
    #[serde(default)]
    pub options: Vec<String>,
}

impl FieldDefinition {
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: false,
            sensitive: false,
            display_order: 0,
            options: Vec::new(),
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn sensitive(mut self) -> Self {
        self.sensitive = true;
        self
    }

    pub fn with_display_order(mut self, display_order: u32) -> Self {
        self.display_order = display_order;
        self
    }

    pub fn with_options<I, S>(mut self, options: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options = options.into_iter().map(Into::into).collect();
        self
    }
}

impl Validate for FieldDefinition {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_token("field_definition.name", &self.name, MAX_FIELD_NAME_LEN)?;
        if self.field_type.has_options() {
            if self.options.is_empty() {
                return Err(ContractViolation::InvalidValue {
                    field: "field_definition.options",
                    reason: "choice fields must declare at least one option",
                });
            }
            if self.options.len() > MAX_CHOICE_OPTIONS {
                return Err(ContractViolation::InvalidValue {
                    field: "field_definition.options",
                    reason: "too many options",
                });
            }
            let mut seen = HashSet::new();
            for option in &self.options {
                validate_token("field_definition.options", option, MAX_TITLE_LEN)?;
                if !seen.insert(option.as_str()) {
                    return Err(ContractViolation::InvalidValue {
                        field: "field_definition.options",
                        reason: "options must be unique",
                    });
                }
            }
        } else if !self.options.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "field_definition.options",
                reason: "only choice fields may declare options",
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubFormDefinition {
    pub sub_form_id: SubFormId,
    pub title: String,
    pub fields: Vec<FieldDefinition>,
}

impl Validate for SubFormDefinition {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_token("sub_form_definition.title", &self.title, MAX_TITLE_LEN)?;
        if self.fields.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "sub_form_definition.fields",
                reason: "must declare at least one field",
            });
        }
        for f in &self.fields {
            f.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormDefinition {
    pub form_id: FormId,
    pub title: String,
    pub fields: Vec<FieldDefinition>,
    #[serde(default)]
    pub sub_forms: Vec<SubFormDefinition>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default = "initial_version")]
    pub version: SchemaVersion,
    pub created_by: UserId,
}

fn initial_version() -> SchemaVersion {
    SchemaVersion::INITIAL
}

impl FormDefinition {
    pub fn v1(
        form_id: FormId,
        title: String,
        fields: Vec<FieldDefinition>,
        sub_forms: Vec<SubFormDefinition>,
        tags: BTreeSet<String>,
        created_by: UserId,
    ) -> Result<Self, ContractViolation> {
        let d = Self {
            form_id,
            title,
            fields,
            sub_forms,
            tags,
            version: SchemaVersion::INITIAL,
            created_by,
        };
        d.validate()?;
        Ok(d)
    }

    pub fn sub_form(&self, sub_form_id: &SubFormId) -> Option<&SubFormDefinition> {
        self.sub_forms.iter().find(|s| &s.sub_form_id == sub_form_id)
    }

    /// Checks that `self` only appends to `previous`: every existing field keeps its
    /// position, type, sensitivity and options, and every existing sub-form survives
    /// with the same rule applied to its fields.
    pub fn check_additive_over(&self, previous: &FormDefinition) -> Result<(), ContractViolation> {
        if self.form_id != previous.form_id {
            return Err(ContractViolation::InvalidValue {
                field: "form_definition.form_id",
                reason: "must not change across versions",
            });
        }
        check_fields_additive(
            "form_definition.fields",
            &previous.fields,
            &self.fields,
        )?;
        for prev_sub in &previous.sub_forms {
            let Some(next_sub) = self.sub_form(&prev_sub.sub_form_id) else {
                return Err(ContractViolation::InvalidValue {
                    field: "form_definition.sub_forms",
                    reason: "existing sub-forms must not be removed",
                });
            };
            check_fields_additive(
                "sub_form_definition.fields",
                &prev_sub.fields,
                &next_sub.fields,
            )?;
        }
        Ok(())
    }
}

fn check_fields_additive(
    field: &'static str,
    previous: &[FieldDefinition],
    next: &[FieldDefinition],
) -> Result<(), ContractViolation> {
    if next.len() < previous.len() {
        return Err(ContractViolation::InvalidValue {
            field,
            reason: "fields must not be removed",
        });
    }
    for (prev, cur) in previous.iter().zip(next.iter()) {
        if prev.name != cur.name {
            return Err(ContractViolation::InvalidValue {
                field,
                reason: "existing fields must keep their name and position",
            });
        }
        if prev.field_type != cur.field_type || prev.sensitive != cur.sensitive {
            return Err(ContractViolation::InvalidValue {
                field,
                reason: "existing fields must not be retyped",
            });
        }
        if !prev.options.iter().all(|o| cur.options.contains(o)) {
            return Err(ContractViolation::InvalidValue {
                field,
                reason: "existing choice options must not be removed",
            });
        }
    }
    Ok(())
}

impl Validate for FormDefinition {
    fn validate(&self) -> Result<(), ContractViolation> {
        validate_token("form_definition.title", &self.title, MAX_TITLE_LEN)?;
        if self.version.0 == 0 {
            return Err(ContractViolation::InvalidValue {
                field: "form_definition.version",
                reason: "must be > 0",
            });
        }
        if self.fields.is_empty() && self.sub_forms.is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "form_definition.fields",
                reason: "must declare at least one field or sub-form",
            });
        }
        for f in &self.fields {
            f.validate()?;
        }
        let mut sub_ids = HashSet::new();
        for s in &self.sub_forms {
            s.validate()?;
            if !sub_ids.insert(&s.sub_form_id) {
                return Err(ContractViolation::InvalidValue {
                    field: "form_definition.sub_forms",
                    reason: "sub_form_id must be unique within a form",
                });
            }
        }
        for tag in &self.tags {
            validate_token("form_definition.tags", tag, MAX_TAG_LEN)?;
            if tag.trim() != tag {
                return Err(ContractViolation::InvalidValue {
                    field: "form_definition.tags",
                    reason: "must not carry surrounding whitespace",
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn author() -> UserId {
        UserId::new("author_01").unwrap()
    }

    fn base_form() -> FormDefinition {
        FormDefinition::v1(
            FormId::new("hr_intake").unwrap(),
            "HR intake".to_string(),
            vec![
                FieldDefinition::new("name", FieldType::ShortText).required(),
                FieldDefinition::new("salary", FieldType::ShortText).sensitive(),
            ],
            vec![SubFormDefinition {
                sub_form_id: SubFormId::new("dependents").unwrap(),
                title: "Dependents".to_string(),
                fields: vec![FieldDefinition::new("dependent_name", FieldType::ShortText)],
            }],
            BTreeSet::from(["HR".to_string()]),
            author(),
        )
        .unwrap()
    }

    #[test]
    fn at_form_01_ids_reject_unsafe_characters() {
        assert!(FormId::new("hr intake").is_err());
        assert!(FormId::new("").is_err());
        assert!(SubFormId::new("dependents;drop").is_err());
        assert!(FormId::new("hr-intake_2").is_ok());
    }

    #[test]
    fn at_form_02_choice_fields_require_unique_options() {
        let missing = FieldDefinition::new("dept", FieldType::Choice);
        assert!(missing.validate().is_err());
        let dup = FieldDefinition::new("dept", FieldType::Choice).with_options(["a", "a"]);
        assert!(dup.validate().is_err());
        let stray = FieldDefinition::new("note", FieldType::ShortText).with_options(["a"]);
        assert!(stray.validate().is_err());
    }

    #[test]
    fn at_form_03_appending_fields_is_additive() {
        let prev = base_form();
        let mut next = prev.clone();
        next.fields
            .push(FieldDefinition::new("start_date", FieldType::Date));
        next.sub_forms[0]
            .fields
            .push(FieldDefinition::new("age", FieldType::Number));
        assert!(next.check_additive_over(&prev).is_ok());
    }

    #[test]
    fn at_form_04_retype_or_removal_is_not_additive() {
        let prev = base_form();

        let mut retyped = prev.clone();
        retyped.fields[1].field_type = FieldType::Number;
        assert!(retyped.check_additive_over(&prev).is_err());

        let mut removed = prev.clone();
        removed.fields.pop();
        assert!(removed.check_additive_over(&prev).is_err());

        let mut dropped_sub = prev.clone();
        dropped_sub.sub_forms.clear();
        assert!(dropped_sub.check_additive_over(&prev).is_err());

        let mut unflagged = prev.clone();
        unflagged.fields[1].sensitive = false;
        assert!(unflagged.check_additive_over(&prev).is_err());
    }

    #[test]
    fn at_form_05_duplicate_sub_form_ids_rejected() {
        let mut form = base_form();
        let dup = form.sub_forms[0].clone();
        form.sub_forms.push(dup);
        assert!(form.validate().is_err());
    }

    #[test]
    fn at_form_06_flag_changes_are_additive_with_one_error_kind() {
        let prev = base_form();
        let mut next = prev.clone();
        next.fields[0].required = false;
        next.fields[1].required = true;
        next.fields[0].display_order = 3;
        assert!(next.check_additive_over(&prev).is_ok());

        let mut renamed = prev.clone();
        renamed.fields[0].name = "full_name".to_string();
        assert!(matches!(
            renamed.check_additive_over(&prev),
            Err(ContractViolation::InvalidValue {
                field: "form_definition.fields",
                ..
            })
        ));
    }
}
