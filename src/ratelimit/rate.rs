//! Rate policy values.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::time::Duration;

use crate::error::ConstructionError;

/// Process-wide default rate in permits per second.
pub const DEFAULT_QPS: f64 = 10.0;

/// Admission rate for a (caller, resource) pair.
///
/// `Unlimited` is a first-class policy outcome rather than a degenerate
/// numeric rate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rate {
    /// Admit everything without consulting a limiter
    Unlimited,
    /// Steady rate in permits per second
    PerSecond(f64),
}

impl Rate {
    /// Build a rate from a permits-per-second value.
    ///
    /// Zero means "no limiting"; negative, NaN and infinite values are rejected.
    pub fn from_qps(qps: f64) -> Result<Self, ConstructionError> {
        if qps.is_nan() {
            return Err(ConstructionError::InvalidRate {
                rate: qps,
                reason: "rate is not a number",
            });
        }
        if qps.is_infinite() {
            return Err(ConstructionError::InvalidRate {
                rate: qps,
                reason: "rate must be finite",
            });
        }
        if qps < 0.0 {
            return Err(ConstructionError::InvalidRate {
                rate: qps,
                reason: "rate must not be negative",
            });
        }
        if qps == 0.0 {
            return Ok(Rate::Unlimited);
        }
        if Duration::try_from_secs_f64(1.0 / qps).is_err() {
            return Err(ConstructionError::InvalidRate {
                rate: qps,
                reason: "rate is too small",
            });
        }
        Ok(Rate::PerSecond(qps))
    }

    /// Whether this rate skips the limiter entirely.
    pub fn is_unlimited(&self) -> bool {
        match self {
            Rate::Unlimited => true,
            Rate::PerSecond(qps) => *qps == 0.0,
        }
    }

    /// Permits per second, or `None` when unlimited.
    pub fn qps(&self) -> Option<f64> {
        match self {
            Rate::Unlimited => None,
            Rate::PerSecond(qps) => Some(*qps),
        }
    }
}

impl Default for Rate {
    fn default() -> Self {
        Rate::PerSecond(DEFAULT_QPS)
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rate::Unlimited => write!(f, "unlimited"),
            Rate::PerSecond(qps) => write!(f, "{}/s", qps),
        }
    }
}

impl Serialize for Rate {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Rate::Unlimited => serializer.serialize_str("unlimited"),
            Rate::PerSecond(qps) => serializer.serialize_f64(*qps),
        }
    }
}

impl<'de> Deserialize<'de> for Rate {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(qps) => Rate::from_qps(qps).map_err(de::Error::custom),
            Raw::Text(text) if text.eq_ignore_ascii_case("unlimited") => Ok(Rate::Unlimited),
            Raw::Text(text) => Err(de::Error::custom(format!(
                "expected a number or \"unlimited\", got {:?}",
                text
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_is_unlimited() {
        assert_eq!(Rate::from_qps(0.0), Ok(Rate::Unlimited));
        assert!(Rate::PerSecond(0.0).is_unlimited());
    }

    #[test]
    fn test_invalid_rates_rejected() {
        assert!(Rate::from_qps(-1.0).is_err());
        assert!(Rate::from_qps(f64::NAN).is_err());
        assert!(Rate::from_qps(f64::INFINITY).is_err());
        assert!(Rate::from_qps(1e-20).is_err());
        assert!(serde_yaml::from_str::<Rate>("1e-20").is_err());
    }

    #[test]
    fn test_default_rate() {
        assert_eq!(Rate::default(), Rate::PerSecond(DEFAULT_QPS));
        assert_eq!(Rate::default().qps(), Some(10.0));
    }

    #[test]
    fn test_deserialize_forms() {
        let rate: Rate = serde_yaml::from_str("2.5").unwrap();
        assert_eq!(rate, Rate::PerSecond(2.5));

        let rate: Rate = serde_yaml::from_str("0").unwrap();
        assert_eq!(rate, Rate::Unlimited);

        let rate: Rate = serde_yaml::from_str("unlimited").unwrap();
        assert_eq!(rate, Rate::Unlimited);

        assert!(serde_yaml::from_str::<Rate>("-3").is_err());
        assert!(serde_yaml::from_str::<Rate>("fast").is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(Rate::Unlimited.to_string(), "unlimited");
        assert_eq!(Rate::PerSecond(2.0).to_string(), "2/s");
    }
}
