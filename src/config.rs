//! Configuration management for Turnstile.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::guard::EndpointPolicy;
use crate::ratelimit::{
    AdmissionSettings, ExpiryPolicy, Rate, RateUpdatePolicy, RegistrySettings, DEFAULT_QPS,
};

/// Prefix for environment overrides, e.g. `TURNSTILE__REGISTRY__MAX_CALLERS`.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration for the Turnstile admission controller.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Registry sizing and expiry
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Admission policy
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Per-endpoint policies keyed by resource name
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointPolicy>,
}

/// Registry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Maximum number of callers tracked at once
    #[serde(default = "default_max_callers")]
    pub max_callers: usize,

    /// Seconds before an idle caller entry expires
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    /// What refreshes an entry's time-to-live
    #[serde(default)]
    pub expiry: ExpiryPolicy,

    /// Whether later calls may change an existing limiter's rate
    #[serde(default)]
    pub rate_update: RateUpdatePolicy,

    /// Seconds between background sweeps of expired entries
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_callers: default_max_callers(),
            ttl_secs: default_ttl_secs(),
            expiry: ExpiryPolicy::default(),
            rate_update: RateUpdatePolicy::default(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_max_callers() -> usize {
    100_000
}

fn default_ttl_secs() -> u64 {
    300
}

fn default_sweep_interval() -> u64 {
    60
}

/// Admission configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Permits per second for calls that do not request a rate; `0` disables limiting
    #[serde(default = "default_qps")]
    pub default_qps: f64,

    /// Milliseconds a call may wait for a permit
    #[serde(default = "default_wait_timeout")]
    pub wait_timeout_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            default_qps: default_qps(),
            wait_timeout_ms: default_wait_timeout(),
        }
    }
}

fn default_qps() -> f64 {
    DEFAULT_QPS
}

fn default_wait_timeout() -> u64 {
    5000
}

impl TurnstileConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional YAML file layered under
    /// `TURNSTILE__`-prefixed environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path, "Loading configuration");
            builder = builder.add_source(config::File::new(path, config::FileFormat::Yaml));
        }
        let config: TurnstileConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that cannot produce a working registry.
    pub fn validate(&self) -> Result<()> {
        if self.registry.max_callers == 0 {
            return Err(TurnstileError::Config(
                "registry.max_callers must be at least 1".to_string(),
            ));
        }
        if self.registry.ttl_secs == 0 {
            return Err(TurnstileError::Config(
                "registry.ttl_secs must be at least 1".to_string(),
            ));
        }
        if self.registry.sweep_interval_secs == 0 {
            return Err(TurnstileError::Config(
                "registry.sweep_interval_secs must be at least 1".to_string(),
            ));
        }
        self.default_rate()?;
        Ok(())
    }

    /// The default admission rate.
    pub fn default_rate(&self) -> Result<Rate> {
        Ok(Rate::from_qps(self.admission.default_qps)?)
    }

    /// Registry settings derived from this configuration.
    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            max_callers: self.registry.max_callers,
            ttl: Duration::from_secs(self.registry.ttl_secs),
            expiry: self.registry.expiry,
            rate_update: self.registry.rate_update,
        }
    }

    /// Admission settings derived from this configuration.
    pub fn admission_settings(&self) -> Result<AdmissionSettings> {
        Ok(AdmissionSettings {
            default_rate: self.default_rate()?,
            wait_timeout: Duration::from_millis(self.admission.wait_timeout_ms),
        })
    }

    /// Interval between background sweeps.
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.registry.sweep_interval_secs)
    }

    /// Policy for a resource, falling back to the default rate.
    pub fn endpoint_policy(&self, resource: &str) -> Result<EndpointPolicy> {
        match self.endpoints.get(resource) {
            Some(policy) => Ok(*policy),
            None => Ok(EndpointPolicy::with_rate(self.default_rate()?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guard::AlertMode;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_defaults() {
        let config = TurnstileConfig::default();

        assert_eq!(config.registry.max_callers, 100_000);
        assert_eq!(config.registry.ttl_secs, 300);
        assert_eq!(config.registry.expiry, ExpiryPolicy::AfterWrite);
        assert_eq!(config.registry.rate_update, RateUpdatePolicy::PinnedAtCreation);
        assert_eq!(config.admission.wait_timeout_ms, 5000);
        assert_eq!(assert_ok!(config.default_rate()), Rate::PerSecond(10.0));
        assert_ok!(config.validate());
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
registry:
  max_callers: 500
  ttl_secs: 60
  expiry: after_access
  rate_update: follow_request
admission:
  default_qps: 0
  wait_timeout_ms: 250
endpoints:
  /api/v1:
    qps: 2.0
    alert_mode: alert_notify
"#;
        let config = assert_ok!(TurnstileConfig::from_yaml(yaml));

        let settings = config.registry_settings();
        assert_eq!(settings.max_callers, 500);
        assert_eq!(settings.ttl, Duration::from_secs(60));
        assert_eq!(settings.expiry, ExpiryPolicy::AfterAccess);
        assert_eq!(settings.rate_update, RateUpdatePolicy::FollowRequest);

        let admission = assert_ok!(config.admission_settings());
        assert_eq!(admission.default_rate, Rate::Unlimited);
        assert_eq!(admission.wait_timeout, Duration::from_millis(250));

        let policy = assert_ok!(config.endpoint_policy("/api/v1"));
        assert_eq!(policy.qps, Rate::PerSecond(2.0));
        assert_eq!(policy.alert_mode, AlertMode::AlertNotify);

        let fallback = assert_ok!(config.endpoint_policy("/other"));
        assert_eq!(fallback.qps, Rate::Unlimited);
        assert_eq!(fallback.alert_mode, AlertMode::SilentReject);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = assert_ok!(TurnstileConfig::from_yaml("registry:\n  max_callers: 7\n"));
        assert_eq!(config.registry.max_callers, 7);
        assert_eq!(config.registry.ttl_secs, 300);
        assert_eq!(config.admission.default_qps, 10.0);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert_err!(TurnstileConfig::from_yaml("registry:\n  max_callers: 0\n"));
        assert_err!(TurnstileConfig::from_yaml("registry:\n  ttl_secs: 0\n"));
        assert_err!(TurnstileConfig::from_yaml("admission:\n  default_qps: -1\n"));
        assert_err!(TurnstileConfig::from_yaml("registry: [1, 2]"));
    }

    #[test]
    fn test_from_missing_file() {
        let err = TurnstileConfig::from_file("/nonexistent/turnstile.yaml").unwrap_err();
        assert!(matches!(err, TurnstileError::Io(_)));
    }

    #[test]
    fn test_load_without_file() {
        let config = assert_ok!(TurnstileConfig::load(None));
        assert_eq!(config.registry.max_callers, 100_000);
    }
}
