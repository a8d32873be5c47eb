//! Actuator roles: the closed set of pump channels the controller knows
//! about. The string form (`ph_up`, `ph_down`, `nutrient_<n>`) is what
//! appears in `config.toml`, the persisted dosing state, and the HTTP API.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ActuatorRole {
    PhUp,
    PhDown,
    /// Nutrient channel, numbered from 1.
    Nutrient(u8),
}

impl ActuatorRole {
    pub fn is_nutrient(&self) -> bool {
        matches!(self, Self::Nutrient(_))
    }
}

impl fmt::Display for ActuatorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PhUp => write!(f, "ph_up"),
            Self::PhDown => write!(f, "ph_down"),
            Self::Nutrient(n) => write!(f, "nutrient_{n}"),
        }
    }
}

impl FromStr for ActuatorRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ph_up" => Ok(Self::PhUp),
            "ph_down" => Ok(Self::PhDown),
            other => {
                let n = other
                    .strip_prefix("nutrient_")
                    .and_then(|n| n.parse::<u8>().ok())
                    .filter(|n| *n > 0)
                    .ok_or_else(|| format!("unknown actuator role '{s}'"))?;
                Ok(Self::Nutrient(n))
            }
        }
    }
}

impl Serialize for ActuatorRole {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ActuatorRole {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
