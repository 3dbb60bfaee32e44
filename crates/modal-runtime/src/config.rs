//! Runtime configuration
//!
//! Every knob has a default matching the reference deployment. Durations
//! serialize as human-readable strings (`"10s"`, `"20ms"`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use modal_config::TransferTiming;
use modal_core::{ModalError, ModalResult, DEFAULT_CONTROL_RATE_HZ};
use modal_transport::RetryPolicy;

/// When a discovered node counts as registered
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JoinPolicy {
    /// On its first `Hello`
    #[default]
    Optimistic,
    /// Only after it answers the `Offer` with `Join`
    Confirmed,
}

impl std::str::FromStr for JoinPolicy {
    type Err = ModalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "optimistic" => Ok(JoinPolicy::Optimistic),
            "confirmed" => Ok(JoinPolicy::Confirmed),
            other => Err(ModalError::InvalidConfig(format!("unknown join policy {other}"))),
        }
    }
}

/// Log output settings
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            filter: "info".into(),
            json: false,
        }
    }
}

/// Audio loop settings
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    /// Frames rendered per block
    pub block_frames: usize,
}

impl AudioConfig {
    pub fn block_duration(&self) -> Duration {
        Duration::from_secs_f64(self.block_frames as f64 / self.sample_rate.max(1) as f64)
    }
}

impl Default for AudioConfig {
    fn default() -> Self {
        AudioConfig {
            sample_rate: 48_000,
            block_frames: 480,
        }
    }
}

/// Settings shared by node and hub runtimes
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub control_rate_hz: u16,
    pub audio: AudioConfig,
    pub excitation_queue_capacity: usize,
    #[serde(with = "duration_str")]
    pub poke_envelope: Duration,
    #[serde(with = "duration_str")]
    pub heartbeat_interval: Duration,
    #[serde(with = "duration_str")]
    pub stale_timeout: Duration,
    #[serde(with = "duration_str")]
    pub hello_interval: Duration,
    #[serde(with = "duration_str")]
    pub discovery_window: Duration,
    /// How often held notes are re-poked
    #[serde(with = "duration_str")]
    pub drive_interval: Duration,
    /// How long the hub waits for configuration ACKs
    #[serde(with = "duration_str")]
    pub ack_timeout: Duration,
    pub send_attempts: u32,
    #[serde(with = "duration_str")]
    pub send_retry_delay: Duration,
    #[serde(with = "duration_str")]
    pub cfg_begin_delay: Duration,
    #[serde(with = "duration_str")]
    pub cfg_chunk_delay: Duration,
    /// Transfers per node before the hub gives up on it
    pub max_config_attempts: u32,
    pub join_policy: JoinPolicy,
    pub log: LogConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            control_rate_hz: DEFAULT_CONTROL_RATE_HZ,
            audio: AudioConfig::default(),
            excitation_queue_capacity: 16,
            poke_envelope: Duration::from_millis(10),
            heartbeat_interval: Duration::from_secs(5),
            stale_timeout: Duration::from_secs(10),
            hello_interval: Duration::from_secs(1),
            discovery_window: Duration::from_secs(5),
            drive_interval: Duration::from_millis(100),
            ack_timeout: Duration::from_millis(500),
            send_attempts: 3,
            send_retry_delay: Duration::from_millis(5),
            cfg_begin_delay: Duration::from_millis(50),
            cfg_chunk_delay: Duration::from_millis(20),
            max_config_attempts: 3,
            join_policy: JoinPolicy::Optimistic,
            log: LogConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Defaults overlaid with `MODAL_*` environment variables
    pub fn from_env() -> ModalResult<Self> {
        let mut config = RuntimeConfig::default();
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Overlay values from `lookup`, keyed by environment variable name
    pub fn apply_overrides<F>(&mut self, lookup: F) -> ModalResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("MODAL_CONTROL_RATE_HZ") {
            self.control_rate_hz = parse_number("MODAL_CONTROL_RATE_HZ", &v)?;
        }
        if let Some(v) = lookup("MODAL_QUEUE_CAPACITY") {
            self.excitation_queue_capacity = parse_number("MODAL_QUEUE_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("MODAL_STALE_TIMEOUT") {
            self.stale_timeout = parse_duration("MODAL_STALE_TIMEOUT", &v)?;
        }
        if let Some(v) = lookup("MODAL_DISCOVERY_WINDOW") {
            self.discovery_window = parse_duration("MODAL_DISCOVERY_WINDOW", &v)?;
        }
        if let Some(v) = lookup("MODAL_HEARTBEAT_INTERVAL") {
            self.heartbeat_interval = parse_duration("MODAL_HEARTBEAT_INTERVAL", &v)?;
        }
        if let Some(v) = lookup("MODAL_JOIN_POLICY") {
            self.join_policy = v.parse()?;
        }
        if let Some(v) = lookup("MODAL_LOG") {
            self.log.filter = v;
        }
        if let Some(v) = lookup("MODAL_LOG_JSON") {
            self.log.json = matches!(v.as_str(), "1" | "true" | "yes");
        }
        Ok(())
    }

    /// Reject settings the runtime cannot operate with
    pub fn validate(&self) -> ModalResult<()> {
        let checks: [(bool, &str); 7] = [
            (self.control_rate_hz == 0, "control rate is zero"),
            (self.audio.sample_rate == 0, "audio sample rate is zero"),
            (self.audio.block_frames == 0, "audio block is empty"),
            (self.excitation_queue_capacity == 0, "excitation queue capacity is zero"),
            (self.send_attempts == 0, "send attempts is zero"),
            (self.max_config_attempts == 0, "max config attempts is zero"),
            (self.heartbeat_interval.is_zero(), "heartbeat interval is zero"),
        ];
        match checks.iter().find(|(failed, _)| *failed) {
            Some((_, reason)) => Err(ModalError::InvalidConfig((*reason).into())),
            None => Ok(()),
        }
    }

    /// Control step period
    pub fn control_period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.control_rate_hz.max(1) as f64)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.send_attempts,
            delay: self.send_retry_delay,
        }
    }

    pub fn transfer_timing(&self) -> TransferTiming {
        TransferTiming {
            begin_delay: self.cfg_begin_delay,
            chunk_delay: self.cfg_chunk_delay,
        }
    }

    pub fn to_json(&self) -> ModalResult<String> {
        serde_json::to_string_pretty(self).map_err(|e| ModalError::InvalidConfig(e.to_string()))
    }

    pub fn from_json(s: &str) -> ModalResult<Self> {
        let config: RuntimeConfig =
            serde_json::from_str(s).map_err(|e| ModalError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> ModalResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ModalError::InvalidConfig(format!("{key}: invalid number {value:?}")))
}

fn parse_duration(key: &str, value: &str) -> ModalResult<Duration> {
    humantime::parse_duration(value.trim())
        .map_err(|e| ModalError::InvalidConfig(format!("{key}: {e}")))
}

mod duration_str {
    use std::time::Duration;

    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&humantime::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_valid() {
        let config = RuntimeConfig::default();
        config.validate().unwrap();
        assert_eq!(config.control_period(), Duration::from_millis(2));
        assert_eq!(config.audio.block_duration(), Duration::from_millis(10));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.transfer_timing(), TransferTiming::default());
    }

    #[test]
    fn test_json_roundtrip_human_durations() {
        let config = RuntimeConfig::default();
        let json = config.to_json().unwrap();
        assert!(json.contains("\"stale_timeout\": \"10s\""));
        assert!(json.contains("\"cfg_chunk_delay\": \"20ms\""));
        assert_eq!(RuntimeConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config =
            RuntimeConfig::from_json(r#"{"control_rate_hz": 1000, "join_policy": "confirmed"}"#)
                .unwrap();
        assert_eq!(config.control_rate_hz, 1000);
        assert_eq!(config.join_policy, JoinPolicy::Confirmed);
        assert_eq!(config.excitation_queue_capacity, 16);
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("MODAL_CONTROL_RATE_HZ", "250"),
            ("MODAL_STALE_TIMEOUT", "30s"),
            ("MODAL_DISCOVERY_WINDOW", "1500ms"),
            ("MODAL_LOG_JSON", "true"),
        ]
        .into_iter()
        .collect();

        let mut config = RuntimeConfig::default();
        config
            .apply_overrides(|k| env.get(k).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.control_rate_hz, 250);
        assert_eq!(config.stale_timeout, Duration::from_secs(30));
        assert_eq!(config.discovery_window, Duration::from_millis(1500));
        assert!(config.log.json);
    }

    #[test]
    fn test_bad_override() {
        let mut config = RuntimeConfig::default();
        let err = config
            .apply_overrides(|k| (k == "MODAL_STALE_TIMEOUT").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ModalError::InvalidConfig(_)));
    }

    #[test]
    fn test_validate_rejects_zero() {
        let config = RuntimeConfig {
            excitation_queue_capacity: 0,
            ..RuntimeConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
