//! Actuator registry: every pump the hub drives, keyed by role, with its
//! live state (active / activated-at / latched fault) and the nutrient
//! metadata assigned by the active profile.
//!
//! All mutation goes through one `std::sync::Mutex` that is never held
//! across an `.await`. Hardware calls are short synchronous pin writes.
//!
//! Fault handling: when an output refuses a command the actuator latches
//! `last_error`, the registry immediately makes a best-effort OFF attempt,
//! and the actuator is refused any further activation until
//! [`ActuatorRegistry::clear_error`] is called. OFF commands are always
//! allowed, faulted or not.

use serde::Serialize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::{ConfigError, HardwareFault, RegistryError};
use crate::profile::PumpAssignment;
use crate::pump::PumpOutput;
use crate::role::ActuatorRole;

/// Snapshot of one actuator, as reported to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActuatorState {
    pub role: ActuatorRole,
    pub actuator_id: String,
    pub active: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub activated_at: Option<OffsetDateTime>,
    pub last_error: Option<String>,
    pub product: Option<String>,
}

struct Actuator {
    role: ActuatorRole,
    actuator_id: String,
    product: Option<String>,
    output: Box<dyn PumpOutput>,
    active: bool,
    activated_at: Option<OffsetDateTime>,
    activated_mono: Option<Instant>,
    last_error: Option<HardwareFault>,
}

impl Actuator {
    fn snapshot(&self) -> ActuatorState {
        ActuatorState {
            role: self.role,
            actuator_id: self.actuator_id.clone(),
            active: self.active,
            activated_at: self.activated_at,
            last_error: self.last_error.as_ref().map(|e| e.detail.clone()),
            product: self.product.clone(),
        }
    }

    fn mark_on(&mut self) {
        self.active = true;
        self.activated_at = Some(OffsetDateTime::now_utc());
        self.activated_mono = Some(Instant::now());
    }

    fn mark_off(&mut self) {
        self.active = false;
        self.activated_at = None;
        self.activated_mono = None;
    }

    /// Drive the output and keep the recorded state in step with it.
    fn drive(&mut self, on: bool) -> Result<(), HardwareFault> {
        match self.output.set(on) {
            Ok(()) => {
                if on {
                    self.mark_on();
                } else {
                    self.mark_off();
                }
                Ok(())
            }
            Err(fault) => {
                error!(
                    role = %self.role,
                    actuator = %self.actuator_id,
                    on,
                    "hardware fault: {}", fault.detail
                );
                self.last_error = Some(fault.clone());

                // Never leave the output commanded on after a fault.
                match self.output.set(false) {
                    Ok(()) => self.mark_off(),
                    Err(again) => {
                        error!(
                            role = %self.role,
                            actuator = %self.actuator_id,
                            "best-effort OFF after fault also failed: {}", again.detail
                        );
                        // Output state unknown: treat it as running so the
                        // stuck-actuator sweep keeps retrying.
                        if !self.active {
                            self.mark_on();
                        }
                    }
                }
                Err(fault)
            }
        }
    }
}

pub struct ActuatorRegistry {
    actuators: Mutex<Vec<Actuator>>,
    stops: watch::Sender<u64>,
}

impl Default for ActuatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ActuatorRegistry {
    pub fn new() -> Self {
        let (stops, _) = watch::channel(0);
        Self {
            actuators: Mutex::new(Vec::new()),
            stops,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Actuator>> {
        // A panicked holder must never wedge the safety sweep.
        self.actuators.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an actuator. Registration order is the order nutrient roles are
    /// dosed in. Re-registering a role replaces its output.
    pub fn register(
        &self,
        role: ActuatorRole,
        actuator_id: &str,
        product: Option<String>,
        output: Box<dyn PumpOutput>,
    ) {
        let actuator = Actuator {
            role,
            actuator_id: actuator_id.to_string(),
            product,
            output,
            active: false,
            activated_at: None,
            activated_mono: None,
            last_error: None,
        };
        let mut all = self.lock();
        match all.iter_mut().find(|a| a.role == role) {
            Some(slot) => *slot = actuator,
            None => all.push(actuator),
        }
        info!(role = %role, actuator = %actuator_id, "actuator registered");
    }

    /// Command an actuator on or off.
    pub fn set_output(&self, role: ActuatorRole, on: bool) -> Result<(), RegistryError> {
        let mut all = self.lock();
        let actuator = all
            .iter_mut()
            .find(|a| a.role == role)
            .ok_or(ConfigError::UnknownRole(role))?;

        if on && actuator.last_error.is_some() {
            return Err(RegistryError::Faulted(role));
        }
        actuator.drive(on)?;
        Ok(())
    }

    /// Force an actuator off and wake any dispense waiting on it.
    pub fn force_stop(&self, role: ActuatorRole) -> Result<(), RegistryError> {
        let result = self.set_output(role, false);
        self.stops.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
        result
    }

    /// Force every active actuator off. Returns the roles that were active.
    pub fn force_stop_all(&self) -> Vec<ActuatorRole> {
        let mut stopped = Vec::new();
        {
            let mut all = self.lock();
            for a in all.iter_mut().filter(|a| a.active) {
                warn!(role = %a.role, actuator = %a.actuator_id, "force stop");
                if a.drive(false).is_ok() {
                    stopped.push(a.role);
                }
            }
        }
        self.stops.send_modify(|epoch| *epoch = epoch.wrapping_add(1));
        stopped
    }

    /// Receiver that changes whenever a force stop happens. The dosing
    /// timer races its activation window against it.
    pub fn subscribe_stops(&self) -> watch::Receiver<u64> {
        self.stops.subscribe()
    }

    /// Actuators that have been on for longer than `ceiling`.
    pub fn stuck(&self, ceiling: Duration) -> Vec<(ActuatorRole, Duration)> {
        self.lock()
            .iter()
            .filter(|a| a.active)
            .filter_map(|a| {
                let on_for = a.activated_mono?.elapsed();
                (on_for > ceiling).then_some((a.role, on_for))
            })
            .collect()
    }

    pub fn state(&self, role: ActuatorRole) -> Result<ActuatorState, ConfigError> {
        self.lock()
            .iter()
            .find(|a| a.role == role)
            .map(Actuator::snapshot)
            .ok_or(ConfigError::UnknownRole(role))
    }

    pub fn list_states(&self) -> Vec<ActuatorState> {
        self.lock().iter().map(Actuator::snapshot).collect()
    }

    /// First active actuator, if any.
    pub fn any_active(&self) -> Option<ActuatorRole> {
        self.lock().iter().find(|a| a.active).map(|a| a.role)
    }

    /// All registered roles in registration order.
    pub fn roles(&self) -> Vec<ActuatorRole> {
        self.lock().iter().map(|a| a.role).collect()
    }

    pub fn nutrient_roles(&self) -> Vec<ActuatorRole> {
        self.lock()
            .iter()
            .filter(|a| a.role.is_nutrient())
            .map(|a| a.role)
            .collect()
    }

    pub fn clear_error(&self, role: ActuatorRole) -> Result<(), ConfigError> {
        let mut all = self.lock();
        let a = all
            .iter_mut()
            .find(|a| a.role == role)
            .ok_or(ConfigError::UnknownRole(role))?;
        if a.last_error.take().is_some() {
            info!(role = %role, actuator = %a.actuator_id, "fault cleared");
        }
        Ok(())
    }

    /// Refresh actuator ids and nutrient metadata from the active profile.
    /// Roles the registry does not drive are ignored.
    pub fn apply_assignments(&self, assignments: &[PumpAssignment]) -> usize {
        let mut all = self.lock();
        let mut applied = 0;
        for asg in assignments {
            match all.iter_mut().find(|a| a.role == asg.role) {
                Some(a) => {
                    if a.actuator_id != asg.pump_name || a.product != asg.product_name {
                        info!(
                            role = %a.role,
                            actuator = %asg.pump_name,
                            product = ?asg.product_name,
                            "assignment updated"
                        );
                    }
                    a.actuator_id = asg.pump_name.clone();
                    a.product = asg.product_name.clone();
                    applied += 1;
                }
                None => warn!(role = %asg.role, "profile assigns a role with no pump, ignored"),
            }
        }
        applied
    }
}

// ===========================================================================
// Tests
// ===========================================================================
