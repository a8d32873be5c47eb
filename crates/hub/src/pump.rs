//! Pump outputs via GPIO. The `gpio` feature gates the real rppal driver;
//! without it, a mock implementation logs state changes.
//!
//! A pump is a dumb binary output. Timing, exclusivity and fault latching
//! live in the registry and the dosing timer.

use anyhow::Result;

use crate::error::HardwareFault;

pub trait PumpOutput: Send {
    /// Drive the output. `true` = pump running.
    fn set(&mut self, on: bool) -> Result<(), HardwareFault>;
}

/// Open the output for one pump, forced OFF before it is returned.
#[cfg(feature = "gpio")]
pub fn open(name: &str, gpio_pin: u8, active_low: bool) -> Result<Box<dyn PumpOutput>> {
    let mut pump = GpioPump::new(name, gpio_pin, active_low)?;
    pump.set(false)?;
    Ok(Box::new(pump))
}

#[cfg(not(feature = "gpio"))]
pub fn open(name: &str, gpio_pin: u8, _active_low: bool) -> Result<Box<dyn PumpOutput>> {
    tracing::info!(pump = %name, gpio_pin, "[mock-gpio] registered pump (not wired)");
    Ok(Box::new(MockPump::new(name)))
}

// ---------------------------------------------------------------------------
// Real GPIO pump (production, requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub struct GpioPump {
    name: String,
    pin: rppal::gpio::OutputPin,
    active_low: bool, // many relay boards are active-low
}

#[cfg(feature = "gpio")]
impl GpioPump {
    pub fn new(name: &str, gpio_pin: u8, active_low: bool) -> Result<Self> {
        use anyhow::Context;
        let gpio = rppal::gpio::Gpio::new().context("failed to open gpio")?;
        let pin = gpio
            .get(gpio_pin)
            .with_context(|| format!("failed to claim gpio {gpio_pin} for pump '{name}'"))?
            .into_output();
        Ok(Self {
            name: name.to_string(),
            pin,
            active_low,
        })
    }
}

#[cfg(feature = "gpio")]
impl PumpOutput for GpioPump {
    fn set(&mut self, on: bool) -> Result<(), HardwareFault> {
        // active-low relay: LOW = ON, HIGH = OFF
        if on != self.active_low {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        tracing::debug!(pump = %self.name, on, "pump output set");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mock pump (development and tests, no hardware)
// ---------------------------------------------------------------------------

#[cfg(any(test, not(feature = "gpio")))]
pub use mock::MockPump;

#[cfg(any(test, not(feature = "gpio")))]
mod mock {
    use std::sync::{Arc, Mutex, PoisonError};
    use tokio::time::Instant;

    use super::PumpOutput;
    use crate::error::HardwareFault;

    #[derive(Default)]
    struct Inner {
        on: bool,
        fail_on: bool,
        fail_off: bool,
        switches: Vec<(bool, Instant)>,
    }

    /// In-memory pump. Clones share state, so a test can keep one handle
    /// while the registry owns another.
    #[derive(Clone)]
    pub struct MockPump {
        name: String,
        inner: Arc<Mutex<Inner>>,
    }

    impl MockPump {
        pub fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                inner: Arc::default(),
            }
        }

        fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
            self.inner.lock().unwrap_or_else(PoisonError::into_inner)
        }

        #[cfg_attr(not(test), allow(dead_code))]
        pub fn is_on(&self) -> bool {
            self.lock().on
        }

        /// Make every ON command fail.
        #[cfg_attr(not(test), allow(dead_code))]
        pub fn fail_on(&self, fail: bool) {
            self.lock().fail_on = fail;
        }

        /// Make every OFF command fail. The output stays on.
        #[cfg_attr(not(test), allow(dead_code))]
        pub fn fail_off(&self, fail: bool) {
            self.lock().fail_off = fail;
        }

        /// Every successful output change with the time it happened.
        #[cfg_attr(not(test), allow(dead_code))]
        pub fn switches(&self) -> Vec<(bool, Instant)> {
            self.lock().switches.clone()
        }
    }

    impl PumpOutput for MockPump {
        fn set(&mut self, on: bool) -> Result<(), HardwareFault> {
            let mut inner = self.lock();
            if (on && inner.fail_on) || (!on && inner.fail_off) {
                return Err(HardwareFault {
                    actuator_id: self.name.clone(),
                    detail: format!("mock driver refused {}", if on { "ON" } else { "OFF" }),
                });
            }
            inner.on = on;
            inner.switches.push((on, Instant::now()));
            tracing::debug!(
                pump = %self.name,
                "[mock-gpio] pump set {}",
                if on { "ON" } else { "OFF" }
            );
            Ok(())
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mock_pump_starts_off() {
        let pump = MockPump::new("pH Up");
        assert!(!pump.is_on());
    }

    #[test]
    fn mock_pump_clones_share_state() {
        let probe = MockPump::new("pH Up");
        let mut owned: Box<dyn PumpOutput> = Box::new(probe.clone());
        owned.set(true).unwrap();
        assert!(probe.is_on());
        owned.set(false).unwrap();
        assert!(!probe.is_on());
        assert_eq!(probe.switches().len(), 2);
    }

    #[test]
    fn mock_pump_injected_fault_keeps_state() {
        let probe = MockPump::new("Pump 1");
        let mut owned = probe.clone();
        owned.set(true).unwrap();
        probe.fail_off(true);
        let err = owned.set(false).unwrap_err();
        assert_eq!(err.actuator_id, "Pump 1");
        assert!(probe.is_on(), "failed OFF must not pretend the pump stopped");
    }

    #[test]
    fn mock_pump_fail_on_refuses_activation() {
        let probe = MockPump::new("Pump 2");
        probe.fail_on(true);
        let mut owned = probe.clone();
        assert!(owned.set(true).is_err());
        assert!(!probe.is_on());
    }
}
