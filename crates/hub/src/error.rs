//! Typed errors for the dosing core. Plumbing code (main, db, settings)
//! stays on `anyhow`; anything a caller has to branch on lives here.

use thiserror::Error;

use crate::role::ActuatorRole;

/// Bad identifiers or parameters. Rejected before any hardware action and
/// never retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("unknown actuator role '{0}'")]
    UnknownRole(ActuatorRole),
    #[error("no actuator config for role '{0}'")]
    MissingActuatorConfig(ActuatorRole),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SensorError {
    /// Bus or probe unreachable, or no fresh data.
    #[error("sensor connection error: {0}")]
    Connection(String),
    /// A value outside physical plausibility.
    #[error("sensor reading error: {0}")]
    Reading(String),
}

/// A pump output could not be driven.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("hardware fault on '{actuator_id}': {detail}")]
pub struct HardwareFault {
    pub actuator_id: String,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("actuator '{0}' is faulted and excluded until cleared")]
    Faulted(ActuatorRole),
    #[error(transparent)]
    Hardware(#[from] HardwareFault),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispenseError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("activation failed: {0}")]
    Activation(RegistryError),
    #[error("dispense interrupted by safety stop after {elapsed_ms} ms")]
    Interrupted { elapsed_ms: u64 },
    #[error("deactivation failed: {0}")]
    Deactivation(RegistryError),
}
