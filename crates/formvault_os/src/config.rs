#![forbid(unsafe_code)]

use std::env;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use formvault_contracts::access::PermissionMatrix;
use formvault_contracts::{ContractViolation, Validate};
use parking_lot::Mutex;
use tracing::info;

pub const ENV_DELETE_POLICY: &str = "FORMVAULT_DELETE_POLICY";
pub const ENV_SUBFORM_AUDIT: &str = "FORMVAULT_SUBFORM_AUDIT";
pub const ENV_RETRY_MAX_ATTEMPTS: &str = "FORMVAULT_RETRY_MAX_ATTEMPTS";
pub const ENV_RETRY_INITIAL_BACKOFF_MS: &str = "FORMVAULT_RETRY_INITIAL_BACKOFF_MS";
pub const ENV_RETRY_MAX_BACKOFF_MS: &str = "FORMVAULT_RETRY_MAX_BACKOFF_MS";

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}")]
    InvalidValue { key: &'static str, value: String },
    #[error("permission matrix could not be parsed: {0}")]
    PermissionsParse(String),
    #[error(transparent)]
    Contract(#[from] ContractViolation),
    #[error("permission matrix version {offered} is not newer than {current}")]
    StaleVersion { current: u64, offered: u64 },
}

/// What happens to a submission's sub-form rows when the submission is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeletePolicy {
    Cascade,
    RefuseIfChildren,
}

/// Whether each sub-form record also gets an audit row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubFormAuditPolicy {
    LedgerEntry,
    AuditExempt,
}

/// Bounded exponential backoff for transient commit failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn mvp_v1() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(20),
            max_backoff: Duration::from_millis(500),
            multiplier: 2.0,
        }
    }

    /// Same attempt budget with no sleeping between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(30) as i32;
        let delay_ms = self.initial_backoff.as_millis() as f64 * self.multiplier.powi(exp);
        let capped = delay_ms.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub delete_policy: DeletePolicy,
    pub sub_form_audit: SubFormAuditPolicy,
    pub retry: RetryPolicy,
}

impl EngineConfig {
    pub fn mvp_v1() -> Self {
        Self {
            delete_policy: DeletePolicy::Cascade,
            sub_form_audit: SubFormAuditPolicy::LedgerEntry,
            retry: RetryPolicy::mvp_v1(),
        }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_map(|key| env::var(key).ok())
    }

    /// Unset keys keep their `mvp_v1` value; set but unparsable keys are errors.
    pub fn from_env_map<F>(get: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &'static str| {
            get(key)
                .map(|v| v.trim().to_ascii_lowercase())
                .filter(|v| !v.is_empty())
        };
        let mut config = Self::mvp_v1();

        if let Some(v) = read(ENV_DELETE_POLICY) {
            config.delete_policy = match v.as_str() {
                "cascade" => DeletePolicy::Cascade,
                "refuse" => DeletePolicy::RefuseIfChildren,
                _ => return Err(invalid(ENV_DELETE_POLICY, v)),
            };
        }
        if let Some(v) = read(ENV_SUBFORM_AUDIT) {
            config.sub_form_audit = match v.as_str() {
                "ledger" => SubFormAuditPolicy::LedgerEntry,
                "exempt" => SubFormAuditPolicy::AuditExempt,
                _ => return Err(invalid(ENV_SUBFORM_AUDIT, v)),
            };
        }
        if let Some(v) = read(ENV_RETRY_MAX_ATTEMPTS) {
            config.retry.max_attempts = v
                .parse::<u32>()
                .ok()
                .filter(|n| (1..=10).contains(n))
                .ok_or_else(|| invalid(ENV_RETRY_MAX_ATTEMPTS, v))?;
        }
        if let Some(v) = read(ENV_RETRY_INITIAL_BACKOFF_MS) {
            config.retry.initial_backoff = parse_ms(ENV_RETRY_INITIAL_BACKOFF_MS, v)?;
        }
        if let Some(v) = read(ENV_RETRY_MAX_BACKOFF_MS) {
            config.retry.max_backoff = parse_ms(ENV_RETRY_MAX_BACKOFF_MS, v)?;
        }
        if config.retry.max_backoff < config.retry.initial_backoff {
            return Err(invalid(
                ENV_RETRY_MAX_BACKOFF_MS,
                config.retry.max_backoff.as_millis().to_string(),
            ));
        }
        Ok(config)
    }
}

fn invalid(key: &'static str, value: String) -> ConfigError {
    ConfigError::InvalidValue { key, value }
}

fn parse_ms(key: &'static str, v: String) -> Result<Duration, ConfigError> {
    v.parse::<u64>()
        .ok()
        .filter(|ms| *ms <= 60_000)
        .map(Duration::from_millis)
        .ok_or_else(|| invalid(key, v))
}

/// Process-wide permission matrix. Readers take an immutable snapshot; the only
/// way to change it is a reload with a strictly newer version.
#[derive(Debug)]
pub struct PermissionMatrixHandle {
    current: ArcSwap<PermissionMatrix>,
    reload_lock: Mutex<()>,
}

impl PermissionMatrixHandle {
    pub fn new(matrix: PermissionMatrix) -> Result<Self, ConfigError> {
        matrix.validate()?;
        Ok(Self {
            current: ArcSwap::from_pointee(matrix),
            reload_lock: Mutex::new(()),
        })
    }

    pub fn parse_toml(raw: &str) -> Result<PermissionMatrix, ConfigError> {
        toml::from_str(raw).map_err(|e| ConfigError::PermissionsParse(e.to_string()))
    }

    pub fn parse_json(raw: &str) -> Result<PermissionMatrix, ConfigError> {
        PermissionMatrix::from_json_str(raw).map_err(|e| ConfigError::PermissionsParse(e.to_string()))
    }

    pub fn snapshot(&self) -> Arc<PermissionMatrix> {
        self.current.load_full()
    }

    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    pub fn reload(&self, next: PermissionMatrix) -> Result<u64, ConfigError> {
        next.validate()?;
        let _guard = self.reload_lock.lock();
        let current = self.current.load().version;
        if next.version <= current {
            return Err(ConfigError::StaleVersion {
                current,
                offered: next.version,
            });
        }
        let version = next.version;
        self.current.store(Arc::new(next));
        info!(from = current, to = version, "permission matrix reloaded");
        Ok(version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use formvault_contracts::access::RoleName;
    use std::collections::BTreeMap;

    #[test]
    fn at_config_01_env_overrides_defaults() {
        let vars = BTreeMap::from([
            (ENV_DELETE_POLICY, "refuse"),
            (ENV_SUBFORM_AUDIT, " Exempt "),
            (ENV_RETRY_MAX_ATTEMPTS, "5"),
        ]);
        let config =
            EngineConfig::from_env_map(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.delete_policy, DeletePolicy::RefuseIfChildren);
        assert_eq!(config.sub_form_audit, SubFormAuditPolicy::AuditExempt);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_backoff, RetryPolicy::mvp_v1().initial_backoff);

        let defaults = EngineConfig::from_env_map(|_| None).unwrap();
        assert_eq!(defaults, EngineConfig::mvp_v1());
    }

    #[test]
    fn at_config_02_bad_env_values_are_rejected() {
        let bad_policy = EngineConfig::from_env_map(|k| {
            (k == ENV_DELETE_POLICY).then(|| "sometimes".to_string())
        });
        assert!(matches!(
            bad_policy,
            Err(ConfigError::InvalidValue { key, .. }) if key == ENV_DELETE_POLICY
        ));
        let zero_attempts = EngineConfig::from_env_map(|k| {
            (k == ENV_RETRY_MAX_ATTEMPTS).then(|| "0".to_string())
        });
        assert!(zero_attempts.is_err());
    }

    #[test]
    fn at_config_03_backoff_grows_and_caps() {
        let p = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(35),
            multiplier: 2.0,
        };
        assert_eq!(p.delay_for_attempt(1), Duration::from_millis(10));
        assert_eq!(p.delay_for_attempt(2), Duration::from_millis(20));
        assert_eq!(p.delay_for_attempt(3), Duration::from_millis(35));
        assert_eq!(RetryPolicy::immediate(3).delay_for_attempt(2), Duration::ZERO);
    }

    #[test]
    fn at_config_04_matrix_reload_requires_newer_version() {
        let raw = r#"
            version = 1

            [roles.sales_rep]
            tag_access = ["Sales"]
            can_delete_own = true
        "#;
        let m = PermissionMatrixHandle::parse_toml(raw).unwrap();
        let handle = PermissionMatrixHandle::new(m.clone()).unwrap();
        let before = handle.snapshot();

        assert!(matches!(
            handle.reload(m.clone()),
            Err(ConfigError::StaleVersion { current: 1, offered: 1 })
        ));

        let mut next = m;
        next.version = 2;
        next.roles.insert(
            RoleName::new("auditor").unwrap(),
            formvault_contracts::access::AccessRule {
                can_read_all: true,
                ..Default::default()
            },
        );
        assert_eq!(handle.reload(next).unwrap(), 2);
        assert_eq!(handle.version(), 2);
        // Snapshots taken before the reload are unaffected.
        assert_eq!(before.version, 1);
        assert_eq!(before.roles.len(), 1);
    }
}
