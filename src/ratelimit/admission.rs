//! Admission decisions for (caller, resource) pairs.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, trace, warn};

use super::bucket::TokenBucket;
use super::rate::Rate;
use super::registry::{LimiterEntry, LimiterRegistry};

/// Default time a request may wait for a permit.
pub const DEFAULT_WAIT: Duration = Duration::from_millis(5000);

/// Policy applied by an [`AdmissionController`].
#[derive(Debug, Clone)]
pub struct AdmissionSettings {
    /// Rate used when a call does not ask for one
    pub default_rate: Rate,
    /// Longest a call may wait for a permit
    pub wait_timeout: Duration,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            default_rate: Rate::default(),
            wait_timeout: DEFAULT_WAIT,
        }
    }
}

/// Decides whether a call may proceed.
///
/// All internal failures are contained here: callers only ever see a boolean.
/// Construction errors are logged and treated as a rejection.
pub struct AdmissionController {
    registry: Arc<LimiterRegistry>,
    settings: AdmissionSettings,
}

impl AdmissionController {
    /// Create a controller over an existing registry.
    pub fn new(registry: Arc<LimiterRegistry>, settings: AdmissionSettings) -> Self {
        Self { registry, settings }
    }

    /// The registry backing this controller.
    pub fn registry(&self) -> &Arc<LimiterRegistry> {
        &self.registry
    }

    /// The policy this controller applies.
    pub fn settings(&self) -> &AdmissionSettings {
        &self.settings
    }

    /// Admit or reject a call, blocking for at most the configured wait timeout.
    pub fn enter(&self, caller: &str, resource: &str, requested: Option<Rate>) -> bool {
        let started = Instant::now();
        let Some(entry) = self.resolve(caller, resource, requested, started) else {
            return false;
        };
        let Some(bucket) = Self::limited(&entry) else {
            return true;
        };

        let admitted = bucket.try_acquire(self.settings.wait_timeout);
        self.record(caller, resource, admitted, started);
        admitted
    }

    /// Async variant of [`enter`](Self::enter) that suspends the task instead of the thread.
    pub async fn enter_async(&self, caller: &str, resource: &str, requested: Option<Rate>) -> bool {
        let started = Instant::now();
        let Some(entry) = self.resolve(caller, resource, requested, started) else {
            return false;
        };
        let Some(bucket) = Self::limited(&entry) else {
            return true;
        };

        let admitted = bucket.try_acquire_async(self.settings.wait_timeout).await;
        self.record(caller, resource, admitted, started);
        admitted
    }

    /// Forget every limiter held for a caller.
    pub fn remove_caller(&self, caller: &str) -> bool {
        self.registry.remove(caller)
    }

    fn resolve(
        &self,
        caller: &str,
        resource: &str,
        requested: Option<Rate>,
        started: Instant,
    ) -> Option<Arc<LimiterEntry>> {
        let rate = requested.unwrap_or(self.settings.default_rate);
        match self.registry.get_or_create(caller, resource, rate) {
            Ok(entry) => Some(entry),
            Err(e) => {
                error!(
                    caller = %caller,
                    resource = %resource,
                    rate = %rate,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %e,
                    "Failed to resolve limiter, rejecting"
                );
                None
            }
        }
    }

    fn limited(entry: &LimiterEntry) -> Option<&TokenBucket> {
        if entry.rate().is_unlimited() {
            return None;
        }
        entry.bucket()
    }

    fn record(&self, caller: &str, resource: &str, admitted: bool, started: Instant) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        if admitted {
            trace!(caller = %caller, resource = %resource, elapsed_ms = elapsed_ms, "Admitted");
        } else {
            warn!(
                caller = %caller,
                resource = %resource,
                elapsed_ms = elapsed_ms,
                "Rate limit exceeded"
            );
        }
    }
}
