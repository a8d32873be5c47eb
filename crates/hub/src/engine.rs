//! Dosing decision engine: turns one sensor snapshot into at most one
//! dosing action.
//!
//! ## Cycle
//!
//! ```text
//! try-lock cycle ──busy──▶ Waiting("cycle in progress")
//!      │
//!      ▼
//! disabled? ─────────────▶ None("disabled")
//! actuator active? ──────▶ Waiting("actuator busy")
//!      │
//!      ▼
//! read sensors (bounded by the cycle budget)
//!      │
//!      ▼
//! pH low  ──▶ PhUp              ┐
//! pH high ──▶ PhDown            │ first match wins,
//! EC low  ──▶ every nutrient,   │ same snapshot throughout
//!             one after another ┘
//! otherwise ─────────────▶ None("within targets")
//! ```
//!
//! Band edges count as in range. A dose only starts when the remaining
//! cycle budget covers its whole run time, and `lastDose` is recorded only
//! after the pump has been switched off again.

use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::db::Db;
use crate::dispense::{run_duration, DispenseRecord, Dispenser};
use crate::error::DispenseError;
use crate::registry::ActuatorRegistry;
use crate::role::ActuatorRole;
use crate::sensor::{SensorProvider, SensorSnapshot};
use crate::state::{DoseRecord, SharedState};
use crate::store::{DosingState, DosingStore};

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Dose {
    pub role: ActuatorRole,
    pub actuator_id: String,
    pub volume_ml: f64,
}

/// Result of one dosing cycle. Every cycle produces exactly one.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    None {
        reason: String,
    },
    /// One entry for a pH correction, one per delivered nutrient for EC.
    Dosed {
        doses: Vec<Dose>,
    },
    Waiting {
        role: Option<ActuatorRole>,
        reason: String,
    },
    TimedOut,
    Error {
        role: Option<ActuatorRole>,
        detail: String,
    },
}

impl CycleOutcome {
    fn none(reason: &str) -> Self {
        Self::None {
            reason: reason.to_string(),
        }
    }

    fn waiting(role: Option<ActuatorRole>, reason: &str) -> Self {
        Self::Waiting {
            role,
            reason: reason.to_string(),
        }
    }

    fn error(role: Option<ActuatorRole>, detail: impl Into<String>) -> Self {
        Self::Error {
            role,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None { reason } => write!(f, "no action: {reason}"),
            Self::Dosed { doses } => {
                write!(f, "dosed")?;
                for (i, d) in doses.iter().enumerate() {
                    let sep = if i == 0 { " " } else { ", " };
                    write!(f, "{sep}{} {:.2} mL ({})", d.actuator_id, d.volume_ml, d.role)?;
                }
                Ok(())
            }
            Self::Waiting { role: Some(r), reason } => write!(f, "waiting on {r}: {reason}"),
            Self::Waiting { role: None, reason } => write!(f, "waiting: {reason}"),
            Self::TimedOut => write!(f, "cycle timed out"),
            Self::Error { role: Some(r), detail } => write!(f, "error on {r}: {detail}"),
            Self::Error { role: None, detail } => write!(f, "error: {detail}"),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
pub struct EngineLimits {
    /// Wall-clock budget for one cycle, measured from entry.
    pub cycle_ceiling: Duration,
    /// Longest run time the safety monitor tolerates.
    pub safety_ceiling: Duration,
}

/// Why a single role was not dosed.
enum Skip {
    RateLimited,
    Busy(ActuatorRole),
    OverBudget,
    Failed(String),
    /// A safety stop cut the dose short. Ends the cycle.
    Interrupted(String),
}

/// What triggered a dose, for the history.
struct Correction {
    reason: &'static str,
    current: f64,
    target: f64,
}

pub struct DosingEngine {
    store: Arc<DosingStore>,
    registry: Arc<ActuatorRegistry>,
    dispenser: Dispenser,
    sensor: Arc<dyn SensorProvider>,
    shared: SharedState,
    db: Option<Db>,
    limits: EngineLimits,
    cycle: Mutex<()>,
}

impl DosingEngine {
    pub fn new(
        store: Arc<DosingStore>,
        registry: Arc<ActuatorRegistry>,
        sensor: Arc<dyn SensorProvider>,
        shared: SharedState,
        limits: EngineLimits,
    ) -> Self {
        Self {
            dispenser: Dispenser::new(Arc::clone(&registry)),
            store,
            registry,
            sensor,
            shared,
            db: None,
            limits,
            cycle: Mutex::new(()),
        }
    }

    /// Also append doses and readings to the SQLite history.
    pub fn with_db(mut self, db: Db) -> Self {
        self.db = Some(db);
        self
    }

    pub fn store(&self) -> &Arc<DosingStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ActuatorRegistry> {
        &self.registry
    }

    pub fn shared(&self) -> &SharedState {
        &self.shared
    }

    pub fn cycle_in_progress(&self) -> bool {
        self.cycle.try_lock().is_err()
    }

    /// Read the sensors and evaluate them against the current state.
    pub async fn run_cycle(&self) -> CycleOutcome {
        let Ok(_cycle) = self.cycle.try_lock() else {
            return CycleOutcome::waiting(None, "cycle in progress");
        };
        let deadline = Instant::now() + self.limits.cycle_ceiling;
        let config = self.store.snapshot();

        let outcome = match self.precondition(&config) {
            Some(early) => early,
            None => match tokio::time::timeout_at(deadline, self.sensor.read()).await {
                Err(_) => CycleOutcome::TimedOut,
                Ok(Err(e)) => {
                    warn!("sensor read failed: {e}");
                    CycleOutcome::error(None, e.to_string())
                }
                Ok(Ok(snapshot)) => {
                    self.record_reading(snapshot).await;
                    self.evaluate_until(&config, &snapshot, deadline).await
                }
            },
        };
        self.shared.write().await.record_outcome(&outcome);
        outcome
    }

    /// Evaluate a given state and snapshot. The cycle budget starts now.
    pub async fn evaluate(&self, config: &DosingState, snapshot: &SensorSnapshot) -> CycleOutcome {
        let Ok(_cycle) = self.cycle.try_lock() else {
            return CycleOutcome::waiting(None, "cycle in progress");
        };
        let deadline = Instant::now() + self.limits.cycle_ceiling;
        let outcome = self.evaluate_until(config, snapshot, deadline).await;
        self.shared.write().await.record_outcome(&outcome);
        outcome
    }

    fn precondition(&self, config: &DosingState) -> Option<CycleOutcome> {
        if !config.enabled {
            return Some(CycleOutcome::none("disabled"));
        }
        if let Some(role) = self.registry.any_active() {
            debug!(role = %role, "actuator active, skipping cycle");
            return Some(CycleOutcome::waiting(Some(role), "actuator busy"));
        }
        None
    }

    async fn evaluate_until(
        &self,
        config: &DosingState,
        snapshot: &SensorSnapshot,
        deadline: Instant,
    ) -> CycleOutcome {
        if let Some(early) = self.precondition(config) {
            return early;
        }
        let ph = config.targets.ph;
        let ec = config.targets.ec;

        if snapshot.ph < ph.low() {
            let why = Correction {
                reason: "pH too low",
                current: snapshot.ph,
                target: ph.target,
            };
            return self.dose_ph(config, ActuatorRole::PhUp, why, deadline).await;
        }
        if snapshot.ph > ph.high() {
            let why = Correction {
                reason: "pH too high",
                current: snapshot.ph,
                target: ph.target,
            };
            return self.dose_ph(config, ActuatorRole::PhDown, why, deadline).await;
        }
        if snapshot.ec < ec.low() {
            let why = Correction {
                reason: "EC too low",
                current: snapshot.ec,
                target: ec.target,
            };
            return self.dose_nutrients(config, why, deadline).await;
        }
        CycleOutcome::none("within targets")
    }

    async fn dose_ph(
        &self,
        config: &DosingState,
        role: ActuatorRole,
        why: Correction,
        deadline: Instant,
    ) -> CycleOutcome {
        match self.attempt(config, role, &why, deadline).await {
            Ok(rec) => CycleOutcome::Dosed {
                doses: vec![dose_of(rec)],
            },
            Err(Skip::RateLimited) => CycleOutcome::waiting(Some(role), "min interval not elapsed"),
            Err(Skip::Busy(other)) => CycleOutcome::waiting(Some(other), "actuator busy"),
            Err(Skip::OverBudget) => CycleOutcome::TimedOut,
            Err(Skip::Failed(detail) | Skip::Interrupted(detail)) => {
                CycleOutcome::error(Some(role), detail)
            }
        }
    }

    /// Every nutrient channel in registration order, one at a time, each
    /// gated by its own rate limit.
    async fn dose_nutrients(
        &self,
        config: &DosingState,
        why: Correction,
        deadline: Instant,
    ) -> CycleOutcome {
        let roles = self.registry.nutrient_roles();
        if roles.is_empty() {
            return CycleOutcome::none("no nutrient pumps assigned");
        }

        let mut doses = Vec::new();
        let mut first_failure: Option<(ActuatorRole, String)> = None;
        let mut first_waiting: Option<ActuatorRole> = None;
        let mut busy: Option<ActuatorRole> = None;
        let mut over_budget = false;

        for role in roles {
            if !doses.is_empty() && !self.store.is_enabled() {
                info!("auto dosing disabled mid-cycle, remaining nutrients skipped");
                break;
            }
            match self.attempt(config, role, &why, deadline).await {
                Ok(rec) => doses.push(dose_of(rec)),
                Err(Skip::RateLimited) => {
                    first_waiting.get_or_insert(role);
                }
                Err(Skip::Failed(detail)) => {
                    self.shared
                        .write()
                        .await
                        .record_error(format!("{role}: {detail}"));
                    first_failure.get_or_insert((role, detail));
                }
                Err(Skip::Interrupted(detail)) => {
                    warn!(role = %role, "safety stop during nutrient dosing, remaining nutrients skipped");
                    self.shared
                        .write()
                        .await
                        .record_error(format!("{role}: {detail}"));
                    first_failure.get_or_insert((role, detail));
                    break;
                }
                Err(Skip::Busy(other)) => {
                    busy = Some(other);
                    break;
                }
                Err(Skip::OverBudget) => {
                    over_budget = true;
                    break;
                }
            }
        }

        if over_budget {
            warn!(delivered = doses.len(), "cycle budget exhausted during nutrient dosing");
        }
        if !doses.is_empty() {
            return CycleOutcome::Dosed { doses };
        }
        if let Some((role, detail)) = first_failure {
            return CycleOutcome::error(Some(role), detail);
        }
        if over_budget {
            return CycleOutcome::TimedOut;
        }
        if let Some(other) = busy {
            return CycleOutcome::waiting(Some(other), "actuator busy");
        }
        CycleOutcome::waiting(first_waiting, "min interval not elapsed")
    }

    /// Dose one role if its rate limit, fault latch and the cycle budget
    /// allow it. Records `lastDose` only on success.
    async fn attempt(
        &self,
        config: &DosingState,
        role: ActuatorRole,
        why: &Correction,
        deadline: Instant,
    ) -> Result<DispenseRecord, Skip> {
        let settings = *config.actuator(role).map_err(|e| Skip::Failed(e.to_string()))?;
        if !config.can_dose(role, OffsetDateTime::now_utc()) {
            debug!(role = %role, "rate limited");
            return Err(Skip::RateLimited);
        }

        let actuator = self
            .registry
            .state(role)
            .map_err(|e| Skip::Failed(e.to_string()))?;
        if actuator.last_error.is_some() {
            return Err(Skip::Failed("actuator faulted".to_string()));
        }

        let duration = run_duration(settings.dose_volume_ml, settings.flow_rate_ml_per_sec)
            .map_err(|e| Skip::Failed(e.to_string()))?;
        if duration > self.limits.safety_ceiling {
            return Err(Skip::Failed(format!(
                "run time {:.1}s exceeds safety ceiling {}s",
                duration.as_secs_f64(),
                self.limits.safety_ceiling.as_secs()
            )));
        }
        if Instant::now() + duration > deadline {
            warn!(role = %role, "not enough cycle budget left for a {:.1}s dose", duration.as_secs_f64());
            return Err(Skip::OverBudget);
        }
        if let Some(other) = self.registry.any_active() {
            return Err(Skip::Busy(other));
        }

        let rec = self
            .dispenser
            .dispense(role, settings.dose_volume_ml, settings.flow_rate_ml_per_sec)
            .await
            .map_err(|e| {
                error!(role = %role, "dose failed: {e}");
                match e {
                    DispenseError::Interrupted { .. } => Skip::Interrupted(e.to_string()),
                    _ => Skip::Failed(e.to_string()),
                }
            })?;

        let at = rec.at;
        self.store.blocking(move |s| s.record_dose(role, at)).await;
        self.record_dose(&rec, actuator.product, why).await;
        Ok(rec)
    }

    // -----------------------------------------------------------------------
    // History
    // -----------------------------------------------------------------------

    async fn record_reading(&self, snapshot: SensorSnapshot) {
        if let Some(db) = &self.db {
            let db = db.clone();
            tokio::spawn(async move {
                if let Err(e) = db.insert_reading(&snapshot).await {
                    error!("db: insert_reading failed: {e:#}");
                }
            });
        }
        self.shared.write().await.record_reading(snapshot);
    }

    async fn record_dose(&self, rec: &DispenseRecord, product: Option<String>, why: &Correction) {
        let entry = DoseRecord {
            ts: rec.at,
            role: rec.role,
            actuator_id: rec.actuator_id.clone(),
            volume_ml: rec.volume_ml,
            reason: why.reason.to_string(),
            current_value: why.current,
            target_value: why.target,
            product,
        };
        if let Some(db) = &self.db {
            let db = db.clone();
            let row = entry.clone();
            tokio::spawn(async move {
                if let Err(e) = db.insert_dose(&row).await {
                    error!("db: insert_dose failed: {e:#}");
                }
            });
        }
        self.shared.write().await.record_dose(entry);
    }
}

fn dose_of(rec: DispenseRecord) -> Dose {
    Dose {
        role: rec.role,
        actuator_id: rec.actuator_id,
        volume_ml: rec.volume_ml,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
