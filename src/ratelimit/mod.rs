//! Rate limiting logic and state management.

mod admission;
mod bucket;
mod clock;
mod rate;
mod registry;

pub use admission::{AdmissionController, AdmissionSettings, DEFAULT_WAIT};
pub use bucket::TokenBucket;
pub use clock::{Clock, ManualClock, SystemClock};
pub use rate::{Rate, DEFAULT_QPS};
pub use registry::{
    ExpiryPolicy, LimiterEntry, LimiterRegistry, RateUpdatePolicy, RegistrySettings,
    RegistryStats, DEFAULT_MAX_CALLERS, DEFAULT_TTL,
};
