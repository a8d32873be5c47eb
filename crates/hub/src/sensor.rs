//! Chemistry sensor input: the snapshot one dosing cycle works from, and
//! the provider trait the engine reads it through.

use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::Instant;

use crate::error::SensorError;

pub const PH_RANGE: (f64, f64) = (0.0, 14.0);
/// mS/cm
pub const EC_RANGE: (f64, f64) = (0.0, 20.0);
/// °C
pub const WATER_TEMP_RANGE: (f64, f64) = (-5.0, 60.0);

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorSnapshot {
    pub ph: f64,
    pub ec: f64,
    pub water_temp: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub captured_at: OffsetDateTime,
}

impl SensorSnapshot {
    /// Reject values no working probe could produce.
    pub fn validate(&self) -> Result<(), SensorError> {
        check("pH", self.ph, PH_RANGE)?;
        check("EC", self.ec, EC_RANGE)?;
        check("water temperature", self.water_temp, WATER_TEMP_RANGE)?;
        Ok(())
    }
}

fn check(name: &str, v: f64, (lo, hi): (f64, f64)) -> Result<(), SensorError> {
    if v.is_finite() && (lo..=hi).contains(&v) {
        Ok(())
    } else {
        Err(SensorError::Reading(format!("{name} {v} outside [{lo}, {hi}]")))
    }
}

#[async_trait]
pub trait SensorProvider: Send + Sync {
    async fn read(&self) -> Result<SensorSnapshot, SensorError>;
}

// ---------------------------------------------------------------------------
// Telemetry-fed provider
// ---------------------------------------------------------------------------

/// Holds the newest sample pushed in from the probe node's telemetry.
pub struct TelemetrySensor {
    latest: Mutex<Option<(SensorSnapshot, Instant)>>,
    stale_after: Duration,
}

impl TelemetrySensor {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            latest: Mutex::new(None),
            stale_after,
        }
    }

    pub fn ingest(&self, snapshot: SensorSnapshot) {
        let mut latest = self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        *latest = Some((snapshot, Instant::now()));
    }
}

#[async_trait]
impl SensorProvider for TelemetrySensor {
    async fn read(&self) -> Result<SensorSnapshot, SensorError> {
        let latest = *self.latest.lock().unwrap_or_else(PoisonError::into_inner);
        let (snapshot, received) =
            latest.ok_or_else(|| SensorError::Connection("no telemetry received yet".into()))?;

        let age = received.elapsed();
        if age > self.stale_after {
            return Err(SensorError::Connection(format!(
                "newest telemetry is {}s old (limit {}s)",
                age.as_secs(),
                self.stale_after.as_secs()
            )));
        }
        snapshot.validate()?;
        Ok(snapshot)
    }
}


// ===========================================================================
// Tests
// ===========================================================================
