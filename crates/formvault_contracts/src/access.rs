#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::common::validate_token;
use crate::{ContractViolation, Validate};

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct UserId(String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Result<Self, ContractViolation> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(ContractViolation::InvalidValue {
                field: "user_id",
                reason: "must not be empty",
            });
        }
        if id.len() > 128 {
            return Err(ContractViolation::InvalidValue {
                field: "user_id",
                reason: "must be <= 128 chars",
            });
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for UserId {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<UserId> for String {
    fn from(value: UserId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoleName(String);

impl RoleName {
    pub fn new(role: impl Into<String>) -> Result<Self, ContractViolation> {
        let role = role.into();
        validate_token("role_name", &role, 64)?;
        Ok(Self(role))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for RoleName {
    type Error = ContractViolation;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<RoleName> for String {
    fn from(value: RoleName) -> Self {
        value.0
    }
}

/// Already-verified caller identity. Token verification happens upstream; the core
/// trusts this pair as given.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthContext {
    pub user_id: UserId,
    pub role: RoleName,
}

impl AuthContext {
    pub fn new(user_id: UserId, role: RoleName) -> Self {
        Self { user_id, role }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRule {
    #[serde(default)]
    pub can_read_all: bool,
    #[serde(default)]
    pub can_edit_all: bool,
    #[serde(default)]
    pub can_delete_all: bool,
    #[serde(default)]
    pub can_delete_own: bool,
    #[serde(default)]
    pub tag_access: BTreeSet<String>,
}

impl AccessRule {
    pub fn tags_intersect(&self, form_tags: &BTreeSet<String>) -> bool {
        self.tag_access.iter().any(|t| form_tags.contains(t))
    }
}

/// Role -> rule table, loaded from external RBAC configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionMatrix {
    pub version: u64,
    #[serde(default)]
    pub roles: BTreeMap<RoleName, AccessRule>,
}

impl PermissionMatrix {
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Unknown roles resolve to an all-false rule.
    pub fn rule_for(&self, role: &RoleName) -> AccessRule {
        self.roles.get(role).cloned().unwrap_or_default()
    }
}

impl Validate for PermissionMatrix {
    fn validate(&self) -> Result<(), ContractViolation> {
        for rule in self.roles.values() {
            for tag in &rule.tag_access {
                validate_token("access_rule.tag_access", tag, 64)?;
            }
        }
        Ok(())
    }
}
