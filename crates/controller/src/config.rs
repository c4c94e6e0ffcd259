//! TOML config file loading, environment overrides, and validation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;

use crate::demand::Coefficients;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub weather: WeatherConfig,
    pub ledger: LedgerConfig,
    pub mqtt: MqttConfig,
    pub dispatch: DispatchConfig,
    pub demand: Coefficients,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WeatherConfig {
    pub station: String,
    pub app_key: String,
    pub base_url: String,
    /// Days of history summed per run.
    pub window_days: u32,
    pub cache_dir: PathBuf,
    pub retries: u32,
    pub retry_delay_ms: u64,
    pub timeout_secs: u64,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            station: String::new(),
            app_key: String::new(),
            base_url: "https://et.water.ca.gov/api/data".to_string(),
            window_days: 7,
            cache_dir: PathBuf::from("."),
            retries: 3,
            retry_delay_ms: 500,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub path: PathBuf,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("irrigation.json"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u64,
    pub ack_topic: String,
    pub connect_attempts: u32,
    pub connect_timeout_secs: u64,
    pub controllers: Vec<ControllerEntry>,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 1883,
            client_id: "irrigation-controller".to_string(),
            username: None,
            password: None,
            keep_alive_secs: 60,
            ack_topic: "/relay_done".to_string(),
            connect_attempts: 3,
            connect_timeout_secs: 10,
            controllers: vec![ControllerEntry {
                number: 1,
                topic: "/back_yard".to_string(),
            }],
        }
    }
}

/// A relay controller and the topic it listens on for activation commands.
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerEntry {
    pub number: u32,
    pub topic: String,
}

/// Relay timing. The reference flow rate of 1000 ms/gallon is a bench value
/// (1 gal/s); a real drip line rated in gal/h needs 3_600_000.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub flow_rate_ms_per_gallon: f64,
    pub wait_margin_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            flow_rate_ms_per_gallon: 1000.0,
            wait_margin_secs: 1,
        }
    }
}

// ---------------------------------------------------------------------------
// Environment overrides
// ---------------------------------------------------------------------------

impl Config {
    /// Apply `MQTT_*`, `WEATHER_*` and `LEDGER_PATH` overrides. `lookup` is
    /// `std::env::var` in production.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("MQTT_HOST") {
            self.mqtt.host = v;
        }
        if let Some(v) = lookup("MQTT_PORT").and_then(|s| s.parse().ok()) {
            self.mqtt.port = v;
        }
        if let Some(v) = lookup("MQTT_USERNAME") {
            self.mqtt.username = Some(v);
        }
        if let Some(v) = lookup("MQTT_PASSWORD") {
            self.mqtt.password = Some(v);
        }
        if let Some(v) = lookup("WEATHER_STATION") {
            self.weather.station = v;
        }
        if let Some(v) = lookup("WEATHER_APP_KEY") {
            self.weather.app_key = v;
        }
        if let Some(v) = lookup("LEDGER_PATH") {
            self.ledger.path = PathBuf::from(v);
        }
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all settings. Returns `Ok(())` or an error describing every
    /// violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_weather(&mut errors);
        self.validate_mqtt(&mut errors);
        self.validate_timing(&mut errors);

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

    fn validate_weather(&self, errors: &mut Vec<String>) {
        let w = &self.weather;
        if w.station.trim().is_empty() {
            errors.push("weather.station is empty".into());
        }
        if w.app_key.trim().is_empty() {
            errors.push("weather.app_key is empty".into());
        }
        if w.base_url.trim().is_empty() {
            errors.push("weather.base_url is empty".into());
        }
        if !(1..=31).contains(&w.window_days) {
            errors.push(format!(
                "weather.window_days {} out of range [1, 31]",
                w.window_days
            ));
        }
        if w.retries == 0 {
            errors.push("weather.retries must be at least 1".into());
        }
    }

    fn validate_mqtt(&self, errors: &mut Vec<String>) {
        let m = &self.mqtt;
        if m.host.trim().is_empty() {
            errors.push("mqtt.host is empty".into());
        }
        if m.client_id.trim().is_empty() {
            errors.push("mqtt.client_id is empty".into());
        }
        if m.ack_topic.trim().is_empty() {
            errors.push("mqtt.ack_topic is empty".into());
        }
        if m.connect_attempts == 0 {
            errors.push("mqtt.connect_attempts must be at least 1".into());
        }
        if m.password.is_some() && m.username.is_none() {
            errors.push("mqtt.password set without mqtt.username".into());
        }

        let mut seen: HashSet<u32> = HashSet::new();
        for (i, c) in m.controllers.iter().enumerate() {
            // Completions concatenate controller and relay digits, so the
            // controller number must be a single digit.
            if !(1..=9).contains(&c.number) {
                errors.push(format!(
                    "mqtt.controllers[{i}]: number {} out of range [1, 9]",
                    c.number
                ));
            } else if !seen.insert(c.number) {
                errors.push(format!(
                    "mqtt.controllers[{i}]: duplicate controller number {}",
                    c.number
                ));
            }
            if c.topic.trim().is_empty() {
                errors.push(format!("mqtt.controllers[{i}]: topic is empty"));
            }
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        let d = &self.dispatch;
        if !(d.flow_rate_ms_per_gallon.is_finite() && d.flow_rate_ms_per_gallon > 0.0) {
            errors.push(format!(
                "dispatch.flow_rate_ms_per_gallon must be positive, got {}",
                d.flow_rate_ms_per_gallon
            ));
        }
        if d.wait_margin_secs == 0 {
            errors.push("dispatch.wait_margin_secs must be at least 1".into());
        }

        let c = &self.demand;
        if !(c.inches_to_gallons.is_finite() && c.inches_to_gallons > 0.0) {
            errors.push(format!(
                "demand.inches_to_gallons must be positive, got {}",
                c.inches_to_gallons
            ));
        }
        for (name, v) in [
            ("precip_effectiveness", c.precip_effectiveness),
            ("irrigation_efficiency", c.irrigation_efficiency),
        ] {
            if !(v > 0.0 && v <= 1.0) {
                errors.push(format!("demand.{name} {v} out of range (0.0, 1.0]"));
            }
        }
        if !(c.credit_window_days.is_finite() && c.credit_window_days > 0.0) {
            errors.push(format!(
                "demand.credit_window_days must be positive, got {}",
                c.credit_window_days
            ));
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, override from the environment, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let mut config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config.apply_overrides(|key| std::env::var(key).ok());
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;

    tracing::info!(
        path,
        station = %config.weather.station,
        ledger = %config.ledger.path.display(),
        controllers = config.mqtt.controllers.len(),
        "config loaded"
    );
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
