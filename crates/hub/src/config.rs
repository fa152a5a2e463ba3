//! TOML config file loading, environment overrides and validation.
//!
//! Every section and every key is optional; an absent file is the same as an
//! empty one.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::actuator::ActuatorConfig;
use crate::link::ReconnectPolicy;

pub const DEFAULT_CONFIG_PATH: &str = "dryrack.toml";

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub mqtt: MqttSection,
    pub topics: TopicsSection,
    pub reconnect: ReconnectSection,
    pub actuator: ActuatorSection,
    pub web: WebSection,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MqttSection {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_sec: u64,
    pub publish_timeout_ms: u64,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 1883,
            client_id: "dryrack-hub".into(),
            keep_alive_sec: 60,
            publish_timeout_ms: 2000,
        }
    }
}

impl MqttSection {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TopicsSection {
    pub telemetry: String,
    pub control: String,
    pub status: String,
    /// Also subscribe to `control`, for logging only.
    pub subscribe_control_echo: bool,
}

impl Default for TopicsSection {
    fn default() -> Self {
        Self {
            telemetry: "jemuran/data".into(),
            control: "jemuran/control".into(),
            status: "jemuran/status".into(),
            subscribe_control_echo: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconnectSection {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// 0 = unlimited.
    pub max_attempts: u32,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            max_attempts: 10,
        }
    }
}

impl ReconnectSection {
    pub fn policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
            max_attempts: (self.max_attempts > 0).then_some(self.max_attempts),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ActuatorSection {
    pub max_attempts: u32,
    pub confirm_window_ms: u64,
    pub settle_ms: u64,
    pub connect_timeout_ms: u64,
}

impl Default for ActuatorSection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            confirm_window_ms: 5000,
            settle_ms: 500,
            connect_timeout_ms: 5000,
        }
    }
}

impl ActuatorSection {
    pub fn actuator_config(&self) -> ActuatorConfig {
        ActuatorConfig {
            max_attempts: self.max_attempts,
            confirm_window: Duration::from_millis(self.confirm_window_ms),
            settle_delay: Duration::from_millis(self.settle_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebSection {
    pub port: u16,
}

impl Default for WebSection {
    fn default() -> Self {
        Self { port: 8000 }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all sections. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_mqtt(&mut errors);
        self.validate_topics(&mut errors);
        self.validate_reconnect(&mut errors);
        self.validate_actuator(&mut errors);

        if self.web.port == 0 {
            errors.push("web.port must be non-zero".into());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;
        if m.host.trim().is_empty() {
            errors.push("mqtt.host is empty".into());
        }
        if m.port == 0 {
            errors.push("mqtt.port must be non-zero".into());
        }
        if m.client_id.trim().is_empty() {
            errors.push("mqtt.client_id is empty".into());
        }
        if m.keep_alive_sec == 0 {
            errors.push("mqtt.keep_alive_sec must be positive".into());
        }
        if m.publish_timeout_ms == 0 {
            errors.push("mqtt.publish_timeout_ms must be positive".into());
        }
    }

    fn validate_topics(&self, errors: &mut Vec<String>) {
        let t = &self.topics;
        let mut seen: HashSet<&str> = HashSet::new();

        for (key, topic) in [
            ("telemetry", &t.telemetry),
            ("control", &t.control),
            ("status", &t.status),
        ] {
            if topic.trim().is_empty() {
                errors.push(format!("topics.{key} is empty"));
            } else if topic.contains(['+', '#']) {
                errors.push(format!("topics.{key} '{topic}' must not contain wildcards"));
            } else if !seen.insert(topic.as_str()) {
                errors.push(format!("topics.{key} '{topic}' is used by another topic"));
            }
        }
    }

    fn validate_reconnect(&self, errors: &mut Vec<String>) {
        let r = &self.reconnect;
        if r.initial_delay_ms == 0 {
            errors.push("reconnect.initial_delay_ms must be positive".into());
        }
        if r.max_delay_ms < r.initial_delay_ms {
            errors.push(format!(
                "reconnect.max_delay_ms ({}) must be >= initial_delay_ms ({})",
                r.max_delay_ms, r.initial_delay_ms
            ));
        }
        if !r.multiplier.is_finite() || r.multiplier < 1.0 {
            errors.push(format!(
                "reconnect.multiplier must be >= 1.0, got {}",
                r.multiplier
            ));
        }
    }

    fn validate_actuator(&self, errors: &mut Vec<String>) {
        let a = &self.actuator;
        if a.max_attempts == 0 {
            errors.push("actuator.max_attempts must be positive".into());
        }
        if a.confirm_window_ms == 0 {
            errors.push("actuator.confirm_window_ms must be positive".into());
        }
        if a.connect_timeout_ms == 0 {
            errors.push("actuator.connect_timeout_ms must be positive".into());
        }
    }

    /// Apply `MQTT_HOST`, `MQTT_PORT` and `WEB_PORT` from `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = lookup("MQTT_HOST") {
            self.mqtt.host = host;
        }
        if let Some(port) = lookup("MQTT_PORT") {
            self.mqtt.port = port
                .trim()
                .parse()
                .with_context(|| format!("MQTT_PORT '{port}' is not a port number"))?;
        }
        if let Some(port) = lookup("WEB_PORT") {
            self.web.port = port
                .trim()
                .parse()
                .with_context(|| format!("WEB_PORT '{port}' is not a port number"))?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file; a missing file yields the defaults.
pub fn load(path: &str) -> Result<Config> {
    if !Path::new(path).exists() {
        tracing::info!(path, "no config file, using defaults");
        return Ok(Config::default());
    }
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    Ok(config)
}

/// `CONFIG_PATH` file, then environment overrides, then validation.
pub fn from_env() -> Result<Config> {
    let path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let mut config = load(&path)?;
    config.apply_env(|key| std::env::var(key).ok())?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Assert validation fails and the error message contains `needle`.
    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(
            msg.contains(needle),
            "expected error containing {needle:?}, got: {msg}"
        );
    }

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    // -- Parsing ----------------------------------------------------------

    #[test]
    fn parse_empty_config_is_default() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config, Config::default());
        config.validate().unwrap();
    }

    #[test]
    fn parse_partial_sections_keep_defaults() {
        let toml_str = r#"
[mqtt]
host = "broker.local"

[actuator]
max_attempts = 5
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.mqtt.host, "broker.local");
        assert_eq!(config.mqtt.port, 1883);
        assert_eq!(config.actuator.max_attempts, 5);
        assert_eq!(config.actuator.confirm_window_ms, 5000);
        assert_eq!(config.topics.telemetry, "jemuran/data");
    }

    #[test]
    fn parse_unknown_key_rejected() {
        assert!(toml::from_str::<Config>("[mqtt]\nhots = \"x\"").is_err());
    }

    #[test]
    fn missing_file_is_default() {
        let config = load("/nonexistent/dryrack.toml").unwrap();
        assert_eq!(config, Config::default());
    }

    // -- Conversions ------------------------------------------------------

    #[test]
    fn zero_max_attempts_is_unlimited() {
        let section = ReconnectSection {
            max_attempts: 0,
            ..ReconnectSection::default()
        };
        assert_eq!(section.policy().max_attempts, None);
        assert_eq!(ReconnectSection::default().policy().max_attempts, Some(10));
    }

    #[test]
    fn actuator_durations() {
        let a = ActuatorSection::default().actuator_config();
        assert_eq!(a.max_attempts, 3);
        assert_eq!(a.confirm_window, Duration::from_secs(5));
        assert_eq!(a.settle_delay, Duration::from_millis(500));
    }

    // -- Environment ------------------------------------------------------

    #[test]
    fn env_overrides_file() {
        let mut cfg = Config::default();
        cfg.apply_env(env(&[("MQTT_HOST", "10.0.0.2"), ("MQTT_PORT", "8883"), ("WEB_PORT", "9000")]))
            .unwrap();
        assert_eq!(cfg.mqtt.host, "10.0.0.2");
        assert_eq!(cfg.mqtt.port, 8883);
        assert_eq!(cfg.web.port, 9000);
    }

    #[test]
    fn env_bad_port_rejected() {
        let mut cfg = Config::default();
        let err = cfg.apply_env(env(&[("MQTT_PORT", "eighty")])).unwrap_err();
        assert!(format!("{err:#}").contains("MQTT_PORT"));
    }

    // -- Validation -------------------------------------------------------

    #[test]
    fn empty_host_rejected() {
        let mut cfg = Config::default();
        cfg.mqtt.host = " ".into();
        assert_validation_err(&cfg, "mqtt.host is empty");
    }

    #[test]
    fn wildcard_topic_rejected() {
        let mut cfg = Config::default();
        cfg.topics.telemetry = "jemuran/+".into();
        assert_validation_err(&cfg, "must not contain wildcards");
    }

    #[test]
    fn duplicate_topic_rejected() {
        let mut cfg = Config::default();
        cfg.topics.status = cfg.topics.control.clone();
        assert_validation_err(&cfg, "topics.status 'jemuran/control' is used by another topic");
    }

    #[test]
    fn reconnect_delays_ordered() {
        let mut cfg = Config::default();
        cfg.reconnect.max_delay_ms = 10;
        assert_validation_err(&cfg, "must be >= initial_delay_ms");
    }

    #[test]
    fn reconnect_multiplier_below_one() {
        let mut cfg = Config::default();
        cfg.reconnect.multiplier = 0.5;
        assert_validation_err(&cfg, "reconnect.multiplier");
    }

    #[test]
    fn actuator_zero_attempts_rejected() {
        let mut cfg = Config::default();
        cfg.actuator.max_attempts = 0;
        assert_validation_err(&cfg, "actuator.max_attempts must be positive");
    }

    #[test]
    fn multiple_errors_collected() {
        let mut cfg = Config::default();
        cfg.mqtt.client_id = "".into();
        cfg.topics.control = "".into();
        cfg.actuator.confirm_window_ms = 0;
        cfg.web.port = 0;
        let msg = format!("{:#}", cfg.validate().unwrap_err());
        assert!(msg.contains("4 errors"), "{msg}");
        assert!(msg.contains("mqtt.client_id is empty"), "{msg}");
        assert!(msg.contains("topics.control is empty"), "{msg}");
        assert!(msg.contains("confirm_window_ms"), "{msg}");
        assert!(msg.contains("web.port"), "{msg}");
    }
}
