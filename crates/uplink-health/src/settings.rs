//! Probe engine settings.
//!
//! Every field has a default matching a 15 s tick, so an empty `[probe]`
//! table is a valid configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Deserializer};
use tracing::{debug, info};

/// Default tick interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(15);
/// Interval used when topology sync asks for an early tick.
pub const URGENT_INTERVAL: Duration = Duration::from_secs(1);
/// Remote probes run once every this many ticks.
pub const REMOTE_TO_LOCAL_RATIO: u32 = 10;
/// Lower bound for a user-defined remote ratio.
pub const MIN_PROBE_RATIO: u32 = 5;
/// How long an instance must stay down (or up) before fast convergence applies.
pub const STAY_MIN_PERIOD: Duration = Duration::from_secs(600);

/// Streak thresholds used by the hysteresis engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Thresholds {
    /// A verdict flips down once the failure streak exceeds this.
    pub max_fail: u32,
    /// A verdict flips up once the success streak exceeds this.
    pub max_success: u32,
    /// Failure streak after which the first success restores the gateway at once.
    pub stay_down_min: u32,
    /// Success streak after which the first failure marks a pending down transition.
    pub stay_up_min: u32,
}

impl Thresholds {
    /// Derive the stay-down/stay-up counts from the tick interval.
    pub fn for_interval(interval: Duration) -> Self {
        let ticks = (STAY_MIN_PERIOD.as_secs() / interval.as_secs().max(1)) as u32;
        Self {
            max_fail: 4,
            max_success: 3,
            stay_down_min: ticks,
            stay_up_min: ticks,
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self::for_interval(DEFAULT_INTERVAL)
    }
}

/// Settings of the probe scheduler and its probers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeSettings {
    #[serde(deserialize_with = "duration_str")]
    pub interval: Duration,
    #[serde(deserialize_with = "duration_str")]
    pub urgent_interval: Duration,
    #[serde(deserialize_with = "duration_str")]
    pub local_timeout: Duration,
    #[serde(deserialize_with = "duration_str")]
    pub remote_timeout: Duration,
    pub remote_ratio: u32,
    pub min_remote_ratio: u32,
    /// Minimum time between two honored urgent re-arms.
    #[serde(deserialize_with = "duration_str")]
    pub rearm_cooldown: Duration,
    /// File holding the default remote probe server.
    pub server_file: PathBuf,
    /// Server probed when `server_file` is missing or empty.
    pub fallback_server: String,
    /// Explicit thresholds; derived from `interval` when absent.
    pub thresholds: Option<Thresholds>,
}

impl Default for ProbeSettings {
    fn default() -> Self {
        Self {
            interval: DEFAULT_INTERVAL,
            urgent_interval: URGENT_INTERVAL,
            local_timeout: Duration::from_millis(100),
            remote_timeout: Duration::from_secs(3),
            remote_ratio: REMOTE_TO_LOCAL_RATIO,
            min_remote_ratio: MIN_PROBE_RATIO,
            rearm_cooldown: STAY_MIN_PERIOD,
            server_file: PathBuf::from("/config/server"),
            fallback_server: "www.google.com".to_string(),
            thresholds: None,
        }
    }
}

impl ProbeSettings {
    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
            .unwrap_or_else(|| Thresholds::for_interval(self.interval))
    }

    /// Remote probe ratio for an instance with the given interval override
    /// (seconds, 0 = none).
    pub fn remote_ratio_for(&self, probe_interval: u32) -> u32 {
        if probe_interval == 0 {
            return self.remote_ratio.max(1);
        }
        let tick = self.interval.as_secs().max(1) as u32;
        (probe_interval / tick).max(self.min_remote_ratio).max(1)
    }

    /// Resolve the default remote target once, at startup.
    pub fn resolve_default_server(&self) -> String {
        load_default_server(&self.server_file, &self.fallback_server)
    }
}

/// Read the server name from `path`, falling back to `fallback` if the file
/// is missing or blank.
pub fn load_default_server(path: &Path, fallback: &str) -> String {
    match std::fs::read_to_string(path) {
        Ok(content) => {
            let server = content.lines().next().unwrap_or("").trim();
            if server.is_empty() {
                debug!(?path, "server file empty, using fallback");
                fallback.to_string()
            } else {
                info!(?path, %server, "default probe server loaded");
                server.to_string()
            }
        }
        Err(e) => {
            debug!(?path, error = %e, "server file unreadable, using fallback");
            fallback.to_string()
        }
    }
}

/// Parse a duration string like "5s", "500ms", "1m".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(secs) = s.strip_suffix('s') {
        if let Some(ms) = secs.strip_suffix('m') {
            ms.parse::<u64>().ok().map(Duration::from_millis)
        } else {
            secs.parse::<u64>().ok().map(Duration::from_secs)
        }
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>().ok().map(|m| Duration::from_secs(m * 60))
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

fn duration_str<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_duration(&raw)
        .ok_or_else(|| serde::de::Error::custom(format!("invalid duration: {raw:?}")))
}
