//! Hub settings: pump wiring, loop timing and file locations, loaded from
//! TOML and validated up front. Runtime dosing settings (targets, volumes,
//! intervals) live in the dosing state file instead.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashSet;
use std::time::Duration;

use crate::engine::EngineLimits;
use crate::monitor::MonitorSettings;
use crate::role::ActuatorRole;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub pumps: Vec<PumpEntry>,
    #[serde(default)]
    pub timing: Timing,
    #[serde(default)]
    pub paths: Paths,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PumpEntry {
    /// `ph_up`, `ph_down` or `nutrient_<n>`.
    pub role: String,
    /// Actuator id shown in status and history, e.g. "pH Up".
    pub name: String,
    pub gpio_pin: i64,
    #[serde(default)]
    pub product: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Timing {
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    #[serde(default = "default_min_attempt_gap_sec")]
    pub min_attempt_gap_sec: u64,
    #[serde(default = "default_safety_ceiling_sec")]
    pub safety_ceiling_sec: u64,
    #[serde(default = "default_cycle_ceiling_sec")]
    pub cycle_ceiling_sec: u64,
    #[serde(default = "default_profile_refresh_sec")]
    pub profile_refresh_sec: u64,
    #[serde(default = "default_sensor_stale_sec")]
    pub sensor_stale_sec: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Paths {
    #[serde(default = "default_state_path")]
    pub state_path: String,
    #[serde(default = "default_profile_path")]
    pub profile_path: String,
    #[serde(default = "default_history_export_path")]
    pub history_export_path: String,
}

fn default_tick_ms() -> u64 {
    1000
}
fn default_min_attempt_gap_sec() -> u64 {
    60
}
fn default_safety_ceiling_sec() -> u64 {
    30
}
fn default_cycle_ceiling_sec() -> u64 {
    60
}
fn default_profile_refresh_sec() -> u64 {
    30
}
fn default_sensor_stale_sec() -> u64 {
    120
}
fn default_state_path() -> String {
    "data/dosing_state.json".to_string()
}
fn default_profile_path() -> String {
    "data/active_profile.json".to_string()
}
fn default_history_export_path() -> String {
    "data/dosing_history.json".to_string()
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            min_attempt_gap_sec: default_min_attempt_gap_sec(),
            safety_ceiling_sec: default_safety_ceiling_sec(),
            cycle_ceiling_sec: default_cycle_ceiling_sec(),
            profile_refresh_sec: default_profile_refresh_sec(),
            sensor_stale_sec: default_sensor_stale_sec(),
        }
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            state_path: default_state_path(),
            profile_path: default_profile_path(),
            history_export_path: default_history_export_path(),
        }
    }
}

impl Timing {
    pub fn engine_limits(&self) -> EngineLimits {
        EngineLimits {
            cycle_ceiling: Duration::from_secs(self.cycle_ceiling_sec),
            safety_ceiling: Duration::from_secs(self.safety_ceiling_sec),
        }
    }

    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            tick: Duration::from_millis(self.tick_ms),
            min_attempt_gap: Duration::from_secs(self.min_attempt_gap_sec),
            safety_ceiling: Duration::from_secs(self.safety_ceiling_sec),
            profile_refresh: Duration::from_secs(self.profile_refresh_sec),
        }
    }

    pub fn sensor_stale_after(&self) -> Duration {
        Duration::from_secs(self.sensor_stale_sec)
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: std::ops::RangeInclusive<i64> = 2..=27;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_pumps(&mut errors);
        self.validate_timing(&mut errors);
        self.validate_paths(&mut errors);

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

    /// Pumps with their parsed roles, in file order. Call after `validate`.
    pub fn pumps(&self) -> Vec<(ActuatorRole, &PumpEntry)> {
        self.pumps
            .iter()
            .filter_map(|p| p.role.parse().ok().map(|r| (r, p)))
            .collect()
    }

    fn validate_pumps(&self, errors: &mut Vec<String>) {
        let mut seen_roles: HashSet<ActuatorRole> = HashSet::new();
        let mut seen_names: HashSet<&str> = HashSet::new();
        let mut seen_pins: HashSet<i64> = HashSet::new();

        for (i, p) in self.pumps.iter().enumerate() {
            let ctx = || {
                if p.name.trim().is_empty() {
                    format!("pumps[{i}]")
                } else {
                    format!("pump '{}'", p.name)
                }
            };

            // ── Identity ────────────────────────────────────────
            match p.role.parse::<ActuatorRole>() {
                Ok(role) => {
                    if !seen_roles.insert(role) {
                        errors.push(format!("{}: duplicate role '{role}'", ctx()));
                    }
                }
                Err(e) => errors.push(format!("{}: {e}", ctx())),
            }

            if p.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            } else if !seen_names.insert(p.name.as_str()) {
                errors.push(format!("{}: duplicate name", ctx()));
            }

            if p.product.as_deref().is_some_and(|s| s.trim().is_empty()) {
                errors.push(format!("{}: product is empty (omit it instead)", ctx()));
            }

            // ── GPIO pin whitelist ──────────────────────────────
            if !VALID_GPIO_PINS.contains(&p.gpio_pin) {
                errors.push(format!(
                    "{}: gpio_pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                    ctx(),
                    p.gpio_pin
                ));
            } else if !seen_pins.insert(p.gpio_pin) {
                errors.push(format!(
                    "{}: gpio_pin {} is already used by another pump",
                    ctx(),
                    p.gpio_pin
                ));
            }
        }
    }

    fn validate_timing(&self, errors: &mut Vec<String>) {
        let t = &self.timing;
        for (name, v) in [
            ("tick_ms", t.tick_ms),
            ("min_attempt_gap_sec", t.min_attempt_gap_sec),
            ("safety_ceiling_sec", t.safety_ceiling_sec),
            ("cycle_ceiling_sec", t.cycle_ceiling_sec),
            ("profile_refresh_sec", t.profile_refresh_sec),
            ("sensor_stale_sec", t.sensor_stale_sec),
        ] {
            if v == 0 {
                errors.push(format!("timing: {name} must be positive"));
            }
        }

        // The sweep has to run at least once inside the ceiling.
        if t.safety_ceiling_sec > 0 && t.tick_ms > t.safety_ceiling_sec * 1000 {
            errors.push(format!(
                "timing: tick_ms ({}) exceeds safety_ceiling_sec ({}s)",
                t.tick_ms, t.safety_ceiling_sec
            ));
        }
    }

    fn validate_paths(&self, errors: &mut Vec<String>) {
        let p = &self.paths;
        for (name, v) in [
            ("state_path", &p.state_path),
            ("profile_path", &p.profile_path),
            ("history_export_path", &p.history_export_path),
        ] {
            if v.trim().is_empty() {
                errors.push(format!("paths: {name} is empty"));
            }
        }
        if p.state_path == p.history_export_path {
            errors.push("paths: state_path and history_export_path are the same file".to_string());
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
