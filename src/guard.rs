//! Boundary between protected endpoints and the admission controller.
//!
//! An interception layer describes each protected endpoint with an
//! [`EndpointPolicy`] and asks the [`Guard`] before running the handler. A
//! rejection becomes either a structured [`TurnstileError::RateLimited`] or a
//! user-facing [`Notice`], depending on the endpoint's [`AlertMode`].

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{AdmissionController, Rate, DEFAULT_QPS};

/// Error code carried by a rate-limited rejection.
pub const BUSY_CODE: u16 = 500;
/// Message carried by a rate-limited rejection.
pub const BUSY_MESSAGE: &str = "system is busy, please try again later";

/// How a rejection is surfaced to the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertMode {
    /// Raise a structured rate-limited error
    #[default]
    SilentReject,
    /// Render a user-visible notice instead of failing
    AlertNotify,
}

/// Declarative rate limit attached to one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EndpointPolicy {
    /// Permits per second; `0` or `unlimited` disables limiting
    #[serde(default = "default_qps")]
    pub qps: Rate,
    /// How rejections are surfaced
    #[serde(default)]
    pub alert_mode: AlertMode,
}

fn default_qps() -> Rate {
    Rate::PerSecond(DEFAULT_QPS)
}

impl Default for EndpointPolicy {
    fn default() -> Self {
        Self {
            qps: default_qps(),
            alert_mode: AlertMode::default(),
        }
    }
}

impl EndpointPolicy {
    /// A policy with the given rate and the default alert mode.
    pub fn with_rate(qps: Rate) -> Self {
        Self {
            qps,
            ..Default::default()
        }
    }
}

/// Result envelope returned to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub success: bool,
    pub code: u16,
    pub msg: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl Envelope {
    /// Failure envelope with the given code and message.
    pub fn error(code: u16, msg: impl Into<String>) -> Self {
        Self {
            success: false,
            code,
            msg: msg.into(),
            timestamp: unix_millis(),
        }
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// User-visible rejection notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub message: String,
}

impl Notice {
    fn busy() -> Self {
        Self {
            message: BUSY_MESSAGE.to_string(),
        }
    }

    /// Render the notice as a JSON envelope.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&Envelope::error(BUSY_CODE, self.message.clone()))?)
    }
}

/// Outcome of a guarded call that did not raise.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The handler may run
    Proceed,
    /// The call was rejected; show this notice instead of running the handler
    Notify(Notice),
}

/// Envelope for a raised rejection, as an error handler would render it.
pub fn rejection_envelope(err: &TurnstileError) -> Option<Envelope> {
    match err {
        TurnstileError::RateLimited { code, message } => Some(Envelope::error(*code, message.clone())),
        _ => None,
    }
}

/// Applies endpoint policies through an [`AdmissionController`].
#[derive(Clone)]
pub struct Guard {
    controller: Arc<AdmissionController>,
}

impl Guard {
    /// Create a guard over a shared controller.
    pub fn new(controller: Arc<AdmissionController>) -> Self {
        Self { controller }
    }

    /// The controller this guard consults.
    pub fn controller(&self) -> &Arc<AdmissionController> {
        &self.controller
    }

    /// Check a call, blocking for at most the controller's wait timeout.
    pub fn check(&self, caller: &str, resource: &str, policy: &EndpointPolicy) -> Result<Verdict> {
        let admitted = self.controller.enter(caller, resource, Some(policy.qps));
        Self::verdict(caller, resource, policy, admitted)
    }

    /// Async variant of [`check`](Self::check).
    pub async fn check_async(
        &self,
        caller: &str,
        resource: &str,
        policy: &EndpointPolicy,
    ) -> Result<Verdict> {
        let admitted = self
            .controller
            .enter_async(caller, resource, Some(policy.qps))
            .await;
        Self::verdict(caller, resource, policy, admitted)
    }

    /// Out-of-band unblock of a caller.
    pub fn remove_caller(&self, caller: &str) -> bool {
        self.controller.remove_caller(caller)
    }

    fn verdict(
        caller: &str,
        resource: &str,
        policy: &EndpointPolicy,
        admitted: bool,
    ) -> Result<Verdict> {
        if admitted {
            return Ok(Verdict::Proceed);
        }

        debug!(
            caller = %caller,
            resource = %resource,
            alert_mode = ?policy.alert_mode,
            "Rejecting guarded call"
        );

        match policy.alert_mode {
            AlertMode::AlertNotify => Ok(Verdict::Notify(Notice::busy())),
            AlertMode::SilentReject => Err(TurnstileError::RateLimited {
                code: BUSY_CODE,
                message: BUSY_MESSAGE.to_string(),
            }),
        }
    }
}
