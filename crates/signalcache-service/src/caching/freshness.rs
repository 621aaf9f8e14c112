//! Classification of artifacts into staleness tiers.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A configuration value that violates its invariants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidPolicy {
    #[error("soft threshold ({soft:?}) must be below the hard threshold ({hard:?})")]
    SoftNotBelowHard { soft: Duration, hard: Duration },
    #[error("freshness threshold ({0:?}) must be a whole number of seconds")]
    FractionalSeconds(Duration),
    #[error("retry policy needs at least one attempt")]
    NoAttempts,
}

/// The two age thresholds of a computation type.
///
/// Artifacts up to `soft` old are served as they are. Artifacts between `soft` and `hard` are
/// served while being refreshed in the background, and older artifacts must be refreshed before
/// answering. Both thresholds are inclusive ceilings and are compared at second granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawFreshnessPolicy")]
pub struct FreshnessPolicy {
    #[serde(with = "humantime_serde")]
    soft: Duration,
    #[serde(with = "humantime_serde")]
    hard: Duration,
}

#[derive(Deserialize)]
struct RawFreshnessPolicy {
    #[serde(with = "humantime_serde")]
    soft: Duration,
    #[serde(with = "humantime_serde")]
    hard: Duration,
}

impl TryFrom<RawFreshnessPolicy> for FreshnessPolicy {
    type Error = InvalidPolicy;

    fn try_from(raw: RawFreshnessPolicy) -> Result<Self, Self::Error> {
        Self::new(raw.soft, raw.hard)
    }
}

impl FreshnessPolicy {
    pub const ORACLE: Self = Self::const_from_secs(60, 10 * 60);
    pub const PULSE: Self = Self::const_from_secs(30, 2 * 60);
    pub const REASONING: Self = Self::const_from_secs(5 * 60, 60 * 60);

    const fn const_from_secs(soft: u64, hard: u64) -> Self {
        assert!(soft < hard);
        Self {
            soft: Duration::from_secs(soft),
            hard: Duration::from_secs(hard),
        }
    }

    pub fn new(soft: Duration, hard: Duration) -> Result<Self, InvalidPolicy> {
        // ages are floored to whole seconds before they are compared
        if let Some(threshold) = [soft, hard].into_iter().find(|d| d.subsec_nanos() != 0) {
            return Err(InvalidPolicy::FractionalSeconds(threshold));
        }
        if soft >= hard {
            return Err(InvalidPolicy::SoftNotBelowHard { soft, hard });
        }
        Ok(Self { soft, hard })
    }

    /// Shorthand for a policy given in whole seconds.
    pub fn from_secs(soft: u64, hard: u64) -> Result<Self, InvalidPolicy> {
        Self::new(Duration::from_secs(soft), Duration::from_secs(hard))
    }

    pub fn soft(&self) -> Duration {
        self.soft
    }

    /// The hard threshold, which is also the store TTL of artifacts.
    pub fn hard(&self) -> Duration {
        self.hard
    }

    /// Classifies an artifact produced at `produced_at`, as seen at `now`.
    pub fn classify(&self, produced_at: DateTime<Utc>, now: DateTime<Utc>) -> FreshnessVerdict {
        classify(produced_at, self, now)
    }
}

/// The staleness tier of an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Freshness {
    Fresh,
    SoftStale,
    HardStale,
}

impl Freshness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::SoftStale => "soft_stale",
            Self::HardStale => "hard_stale",
        }
    }
}

/// The tier together with the age it was derived from.
///
/// This is computed on every read and never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FreshnessVerdict {
    pub freshness: Freshness,
    pub age_seconds: u64,
}

impl FreshnessVerdict {
    pub fn is_fresh(&self) -> bool {
        self.freshness == Freshness::Fresh
    }
}

/// Maps the age of an artifact onto a [`Freshness`] tier.
///
/// Timestamps in the future count as an age of zero.
pub fn classify(
    produced_at: DateTime<Utc>,
    policy: &FreshnessPolicy,
    now: DateTime<Utc>,
) -> FreshnessVerdict {
    let age_seconds = (now - produced_at).num_seconds().max(0) as u64;

    let freshness = if age_seconds <= policy.soft.as_secs() {
        Freshness::Fresh
    } else if age_seconds <= policy.hard.as_secs() {
        Freshness::SoftStale
    } else {
        Freshness::HardStale
    };

    FreshnessVerdict {
        freshness,
        age_seconds,
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    fn verdict_at_age(policy: &FreshnessPolicy, age: TimeDelta) -> FreshnessVerdict {
        let now = Utc::now();
        policy.classify(now - age, now)
    }

    #[test]
    fn test_boundaries() {
        let policy = FreshnessPolicy::from_secs(30, 120).unwrap();

        let tiers: Vec<_> = [0, 30, 31, 120, 121, 3600]
            .into_iter()
            .map(|age| verdict_at_age(&policy, TimeDelta::seconds(age)).freshness)
            .collect();

        assert_eq!(
            tiers,
            [
                Freshness::Fresh,
                Freshness::Fresh,
                Freshness::SoftStale,
                Freshness::SoftStale,
                Freshness::HardStale,
                Freshness::HardStale,
            ]
        );
    }

    #[test]
    fn test_partial_seconds_round_down() {
        let policy = FreshnessPolicy::from_secs(30, 120).unwrap();

        let verdict = verdict_at_age(&policy, TimeDelta::milliseconds(30_999));
        assert_eq!(verdict.age_seconds, 30);
        assert!(verdict.is_fresh());
    }

    #[test]
    fn test_future_timestamp() {
        let policy = FreshnessPolicy::from_secs(30, 120).unwrap();

        let verdict = verdict_at_age(&policy, TimeDelta::seconds(-90));
        assert_eq!(
            verdict,
            FreshnessVerdict {
                freshness: Freshness::Fresh,
                age_seconds: 0,
            }
        );
    }

    #[test]
    fn test_invalid_policy() {
        assert_eq!(
            FreshnessPolicy::from_secs(120, 120),
            Err(InvalidPolicy::SoftNotBelowHard {
                soft: Duration::from_secs(120),
                hard: Duration::from_secs(120),
            })
        );
        assert!(FreshnessPolicy::from_secs(0, 1).is_ok());

        let err = serde_yaml::from_str::<FreshnessPolicy>("soft: 5m\nhard: 1m").unwrap_err();
        assert!(err.to_string().contains("must be below the hard threshold"));

        assert_eq!(
            FreshnessPolicy::new(Duration::from_millis(1200), Duration::from_millis(1800)),
            Err(InvalidPolicy::FractionalSeconds(Duration::from_millis(1200)))
        );
        let err = serde_yaml::from_str::<FreshnessPolicy>("soft: 30s\nhard: 90s 500ms").unwrap_err();
        assert!(err.to_string().contains("whole number of seconds"), "{err}");

        let policy: FreshnessPolicy = serde_yaml::from_str("soft: 30s\nhard: 2m").unwrap();
        assert_eq!(policy, FreshnessPolicy::from_secs(30, 120).unwrap());
    }

    #[test]
    fn test_verdict_payload() {
        let policy = FreshnessPolicy::from_secs(30, 120).unwrap();
        let verdict = verdict_at_age(&policy, TimeDelta::seconds(45));

        insta::assert_json_snapshot!(verdict, @r###"
        {
          "freshness": "soft_stale",
          "ageSeconds": 45
        }
        "###);
    }
}
