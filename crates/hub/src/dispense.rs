//! Dosing timer: delivers a volume by holding one pump on for
//! `volume / flow_rate` seconds.
//!
//! "Pump on" is a scoped acquisition. [`ActiveWindow`] turns the pump off
//! when dropped, so every exit path releases it: normal completion, a
//! safety stop interrupting the wait, or the whole future being dropped.
//! The wait itself is a single tokio timer raced against the registry's
//! stop signal.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::error::{ConfigError, DispenseError, RegistryError};
use crate::registry::ActuatorRegistry;
use crate::role::ActuatorRole;

/// One delivered dose.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DispenseRecord {
    pub role: ActuatorRole,
    pub actuator_id: String,
    pub volume_ml: f64,
    pub duration_ms: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub at: OffsetDateTime,
}

/// Run time for a dose. Rejects non-positive or non-finite parameters.
pub fn run_duration(volume_ml: f64, flow_rate_ml_per_sec: f64) -> Result<Duration, ConfigError> {
    if !(volume_ml.is_finite() && volume_ml > 0.0) {
        return Err(ConfigError::invalid("dose_volume_ml", format!("{volume_ml} is not > 0")));
    }
    if !(flow_rate_ml_per_sec.is_finite() && flow_rate_ml_per_sec > 0.0) {
        return Err(ConfigError::invalid(
            "flow_rate_ml_per_sec",
            format!("{flow_rate_ml_per_sec} is not > 0"),
        ));
    }
    Ok(Duration::from_secs_f64(volume_ml / flow_rate_ml_per_sec))
}

/// Guard for an actuator that is currently commanded on.
struct ActiveWindow<'a> {
    registry: &'a ActuatorRegistry,
    role: ActuatorRole,
    released: bool,
}

impl ActiveWindow<'_> {
    fn release(mut self) -> Result<(), RegistryError> {
        self.released = true;
        self.registry.set_output(self.role, false)
    }
}

impl Drop for ActiveWindow<'_> {
    fn drop(&mut self) {
        if !self.released {
            warn!(role = %self.role, "dispense abandoned mid-window, forcing pump off");
            if let Err(e) = self.registry.set_output(self.role, false) {
                error!(role = %self.role, "forced OFF failed, sweep will retry: {e}");
            }
        }
    }
}

#[derive(Clone)]
pub struct Dispenser {
    registry: Arc<ActuatorRegistry>,
}

impl Dispenser {
    pub fn new(registry: Arc<ActuatorRegistry>) -> Self {
        Self { registry }
    }

    /// Deliver `volume_ml` from the pump bound to `role`.
    pub async fn dispense(
        &self,
        role: ActuatorRole,
        volume_ml: f64,
        flow_rate_ml_per_sec: f64,
    ) -> Result<DispenseRecord, DispenseError> {
        let duration = run_duration(volume_ml, flow_rate_ml_per_sec)?;
        let actuator_id = self.registry.state(role)?.actuator_id;

        // Subscribe before activating so a stop issued right after the
        // pump turns on is not missed.
        let mut stops = self.registry.subscribe_stops();
        stops.borrow_and_update();

        self.registry
            .set_output(role, true)
            .map_err(DispenseError::Activation)?;
        let window = ActiveWindow {
            registry: &self.registry,
            role,
            released: false,
        };
        let started = Instant::now();
        info!(
            role = %role,
            actuator = %actuator_id,
            volume_ml,
            duration_ms = duration.as_millis() as u64,
            "dispense started"
        );

        let interrupted = tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            _ = stops.changed() => true,
        };
        let elapsed = started.elapsed();

        if interrupted {
            if let Err(e) = window.release() {
                error!(role = %role, "OFF after interrupt failed, sweep will retry: {e}");
            }
            warn!(role = %role, elapsed_ms = elapsed.as_millis() as u64, "dispense interrupted");
            return Err(DispenseError::Interrupted {
                elapsed_ms: elapsed.as_millis() as u64,
            });
        }

        window.release().map_err(DispenseError::Deactivation)?;

        let record = DispenseRecord {
            role,
            actuator_id,
            volume_ml,
            duration_ms: elapsed.as_millis() as u64,
            at: OffsetDateTime::now_utc(),
        };
        info!(
            role = %role,
            actuator = %record.actuator_id,
            volume_ml,
            duration_ms = record.duration_ms,
            "dispense complete"
        );
        Ok(record)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pump::MockPump;

    fn setup(role: ActuatorRole, name: &str) -> (Arc<ActuatorRegistry>, MockPump, Dispenser) {
        let reg = Arc::new(ActuatorRegistry::new());
        let pump = MockPump::new(name);
        reg.register(role, name, None, Box::new(pump.clone()));
        let d = Dispenser::new(Arc::clone(&reg));
        (reg, pump, d)
    }

    #[test]
    fn run_duration_is_volume_over_flow() {
        assert_eq!(run_duration(0.5, 1.0).unwrap(), Duration::from_millis(500));
        assert_eq!(run_duration(3.0, 1.5).unwrap(), Duration::from_secs(2));
    }

    #[test]
    fn run_duration_rejects_bad_parameters() {
        assert!(run_duration(0.0, 1.0).is_err());
        assert!(run_duration(1.0, -1.0).is_err());
        assert!(run_duration(f64::NAN, 1.0).is_err());
    }

    #[tokio::test]
    async fn dispense_runs_for_computed_duration() {
        let (reg, pump, d) = setup(ActuatorRole::PhUp, "pH Up");

        let t0 = std::time::Instant::now();
        let rec = d.dispense(ActuatorRole::PhUp, 1.0, 1.0).await.unwrap();
        let took = t0.elapsed();

        assert!(
            took >= Duration::from_millis(1000) && took < Duration::from_millis(1050),
            "took {took:?}"
        );
        assert_eq!(rec.volume_ml, 1.0);
        assert_eq!(rec.actuator_id, "pH Up");
        assert!(!pump.is_on());
        assert!(!reg.state(ActuatorRole::PhUp).unwrap().active);
    }

    #[tokio::test]
    async fn activation_fault_starts_no_timer() {
        let (_reg, pump, d) = setup(ActuatorRole::PhUp, "pH Up");
        pump.fail_on(true);

        let t0 = std::time::Instant::now();
        let err = d.dispense(ActuatorRole::PhUp, 5.0, 1.0).await.unwrap_err();
        assert!(matches!(err, DispenseError::Activation(_)));
        assert!(t0.elapsed() < Duration::from_millis(100));
        assert!(!pump.is_on());
    }

    #[tokio::test(start_paused = true)]
    async fn force_stop_interrupts_window() {
        let (reg, pump, d) = setup(ActuatorRole::Nutrient(1), "Pump 1");

        let task = tokio::spawn({
            let d = d.clone();
            async move { d.dispense(ActuatorRole::Nutrient(1), 20.0, 1.0).await }
        });
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(pump.is_on());

        reg.force_stop(ActuatorRole::Nutrient(1)).unwrap();
        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, DispenseError::Interrupted { .. }));
        assert!(!pump.is_on());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_future_releases_pump() {
        let (reg, pump, d) = setup(ActuatorRole::PhDown, "pH Down");

        let res = tokio::time::timeout(
            Duration::from_secs(1),
            d.dispense(ActuatorRole::PhDown, 10.0, 1.0),
        )
        .await;
        assert!(res.is_err(), "timeout should drop the dispense future");
        assert!(!pump.is_on());
        assert!(reg.any_active().is_none());
    }

    #[tokio::test]
    async fn deactivation_fault_is_reported() {
        let (reg, pump, d) = setup(ActuatorRole::PhUp, "pH Up");
        pump.fail_off(true);

        let err = d.dispense(ActuatorRole::PhUp, 0.1, 1.0).await.unwrap_err();
        assert!(matches!(err, DispenseError::Deactivation(_)));
        // Still on: the monitor's stuck sweep is the backstop.
        assert_eq!(reg.any_active(), Some(ActuatorRole::PhUp));
    }

    #[tokio::test]
    async fn unknown_role_is_rejected_before_hardware() {
        let (_reg, pump, d) = setup(ActuatorRole::PhUp, "pH Up");
        let err = d.dispense(ActuatorRole::PhDown, 1.0, 1.0).await.unwrap_err();
        assert!(matches!(err, DispenseError::Config(ConfigError::UnknownRole(_))));
        assert!(pump.switches().is_empty());
    }
}
