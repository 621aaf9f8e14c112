use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::freshness::FreshnessPolicy;

/// All known computation types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComputationType {
    /// Market and on-chain "Oracle" cards.
    Oracle,
    /// Short-horizon "Pulse" cards.
    Pulse,
    /// LLM-backed reasoning.
    Reasoning,
}

impl ComputationType {
    pub const ALL: [ComputationType; 3] = [Self::Oracle, Self::Pulse, Self::Reasoning];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Oracle => "oracle",
            Self::Pulse => "pulse",
            Self::Reasoning => "reasoning",
        }
    }
}

impl AsRef<str> for ComputationType {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl fmt::Display for ComputationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_ref())
    }
}

/// The given string does not name a [`ComputationType`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown computation type `{0}`")]
pub struct UnknownComputationType(pub String);

impl FromStr for ComputationType {
    type Err = UnknownComputationType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|ty| ty.as_ref() == s)
            .ok_or_else(|| UnknownComputationType(s.to_owned()))
    }
}

/// Configuration of a single computation type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct ComputationConfig {
    /// The `soft` and `hard` age thresholds.
    #[serde(flatten)]
    pub policy: FreshnessPolicy,

    /// The maximum number of soft-stale refreshes running in the background at once.
    ///
    /// Once reached, soft-stale artifacts are served without refreshing them until a slot frees up.
    #[serde(default = "default_max_lazy_refreshes")]
    pub max_lazy_refreshes: isize,
}

impl ComputationConfig {
    fn with_policy(policy: FreshnessPolicy) -> Self {
        Self {
            policy,
            max_lazy_refreshes: default_max_lazy_refreshes(),
        }
    }
}

fn default_max_lazy_refreshes() -> isize {
    20
}

/// The configuration of all computation types.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ComputationConfigs {
    /// Market and on-chain snapshots change quickly but are cheap-ish to fetch.
    pub oracle: ComputationConfig,
    pub pulse: ComputationConfig,
    /// LLM calls are slow and expensive, so their output is kept much longer.
    pub reasoning: ComputationConfig,
}

impl Default for ComputationConfigs {
    fn default() -> Self {
        Self {
            oracle: ComputationConfig::with_policy(FreshnessPolicy::ORACLE),
            pulse: ComputationConfig::with_policy(FreshnessPolicy::PULSE),
            reasoning: ComputationConfig::with_policy(FreshnessPolicy::REASONING),
        }
    }
}

impl ComputationConfigs {
    pub fn get(&self, computation: ComputationType) -> &ComputationConfig {
        match computation {
            ComputationType::Oracle => &self.oracle,
            ComputationType::Pulse => &self.pulse,
            ComputationType::Reasoning => &self.reasoning,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_names_roundtrip() {
        for ty in ComputationType::ALL {
            assert_eq!(ty.to_string().parse::<ComputationType>(), Ok(ty));
        }
        assert_eq!(
            "Pulse".parse::<ComputationType>(),
            Err(UnknownComputationType("Pulse".into()))
        );
    }

    #[test]
    fn test_partial_computation_configs() {
        let yaml = r#"
            pulse:
              soft: 10s
              hard: 1m
              max_lazy_refreshes: 5
        "#;
        let configs: ComputationConfigs = serde_yaml::from_str(yaml).unwrap();

        assert_eq!(
            configs.pulse,
            ComputationConfig {
                policy: FreshnessPolicy::from_secs(10, 60).unwrap(),
                max_lazy_refreshes: 5,
            }
        );
        assert_eq!(configs.oracle, ComputationConfigs::default().oracle);
        assert_eq!(
            configs.get(ComputationType::Reasoning).policy.hard().as_secs(),
            3600
        );
    }

    #[test]
    fn test_invalid_thresholds() {
        let yaml = r#"
            oracle:
              soft: 10m
              hard: 1m
        "#;
        let err = serde_yaml::from_str::<ComputationConfigs>(yaml).unwrap_err();
        assert!(err.to_string().contains("must be below the hard threshold"), "{err}");
    }
}
