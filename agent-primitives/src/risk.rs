//! Risk classification for tool calls.

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Tiered sensitivity label used to pick approval TTLs and escalation behaviour.
///
/// Ordering follows severity, so `RiskClass::Low < RiskClass::Critical`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum RiskClass {
    /// Read-only or trivially reversible effects.
    Low,
    /// Effects that are reversible with some effort.
    #[default]
    Medium,
    /// Effects on shared or external state.
    High,
    /// Irreversible or security-sensitive effects.
    Critical,
}

impl RiskClass {
    /// All tiers in ascending severity.
    pub const ALL: [Self; 4] = [Self::Low, Self::Medium, Self::High, Self::Critical];

    /// Returns the stable lowercase label for the tier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl Display for RiskClass {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RiskClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(Error::UnknownRiskClass(other.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_follows_severity() {
        assert!(RiskClass::Low < RiskClass::Medium);
        assert!(RiskClass::High < RiskClass::Critical);
        assert_eq!(RiskClass::ALL.iter().max(), Some(&RiskClass::Critical));
    }

    #[test]
    fn parses_labels_case_insensitively() {
        assert_eq!("HIGH".parse::<RiskClass>().unwrap(), RiskClass::High);
        assert!(matches!(
            "extreme".parse::<RiskClass>(),
            Err(Error::UnknownRiskClass(label)) if label == "extreme"
        ));
    }
}
