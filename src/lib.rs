//! Turnstile - In-process request admission control
//!
//! This crate decides, in bounded time, whether a call from a given caller to a
//! given resource may proceed. Each (caller, resource) pair gets its own token
//! bucket, created lazily on first access and held in a registry bounded by
//! both a maximum caller count and a time-to-live.

pub mod config;
pub mod error;
pub mod guard;
pub mod ratelimit;

use std::sync::Arc;

use crate::config::TurnstileConfig;
use crate::guard::Guard;
use crate::ratelimit::{AdmissionController, LimiterRegistry};

/// Assemble a registry, controller and guard from configuration.
///
/// The registry is returned separately so the caller can spawn its sweeper.
pub fn build(config: &TurnstileConfig) -> error::Result<(Arc<LimiterRegistry>, Guard)> {
    config.validate()?;
    let registry = Arc::new(LimiterRegistry::new(config.registry_settings()));
    let controller = AdmissionController::new(Arc::clone(&registry), config.admission_settings()?);
    Ok((registry, Guard::new(Arc::new(controller))))
}
