//! Runtime tuning for the sync protocol.

use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default grace delay before a predicted copy snaps to the authoritative
/// one. Tuned for a ~20 Hz host tick; scale with the tick cadence.
pub const DEFAULT_GRACE_DELAY: Duration = Duration::from_millis(90);

/// Environment variable overriding the grace delay, in milliseconds.
pub const GRACE_DELAY_ENV: &str = "BEHAVIOR_GRACE_DELAY_MS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// How long a predicted copy may disagree with the authoritative copy.
    #[serde(rename = "grace_delay_ms", with = "millis", default = "default_grace_delay")]
    pub grace_delay: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            grace_delay: DEFAULT_GRACE_DELAY,
        }
    }
}

fn default_grace_delay() -> Duration {
    DEFAULT_GRACE_DELAY
}

impl SyncConfig {
    /// Read overrides from the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(|key| env::var(key).ok())
    }

    /// Read overrides through `lookup`; unparsable values fall back to the
    /// defaults.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let grace_delay = lookup(GRACE_DELAY_ENV)
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(DEFAULT_GRACE_DELAY);
        Self { grace_delay }
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
