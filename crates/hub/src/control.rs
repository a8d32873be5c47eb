//! Control surface: the operations the HTTP API and the MQTT command topic
//! call into. Everything that changes dosing state goes through the store;
//! nothing here keeps a second copy of the enable flag.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::info;

use crate::engine::{CycleOutcome, DosingEngine};
use crate::error::ConfigError;
use crate::monitor::{log_outcome, SafetyMonitor};
use crate::registry::ActuatorState;
use crate::role::ActuatorRole;
use crate::state::{History, SystemEvent};
use crate::store::{write_atomic, DosingPatch, DosingState, Targets};

/// Events included in a status response.
const STATUS_EVENTS: usize = 50;

#[derive(Debug, Serialize)]
pub struct ActuatorStatus {
    #[serde(flatten)]
    pub state: ActuatorState,
    /// Seconds until this pump may dose again. 0 when it may dose now.
    pub cooldown_remaining_sec: Option<u64>,
}

#[derive(Debug, Serialize)]
pub struct Status {
    pub enabled: bool,
    pub loop_running: bool,
    pub cycle_in_progress: bool,
    pub mqtt_connected: bool,
    pub uptime_sec: u64,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_attempt: Option<OffsetDateTime>,
    pub last_outcome: Option<CycleOutcome>,
    pub targets: Targets,
    pub actuator_states: Vec<ActuatorStatus>,
    pub events: Vec<SystemEvent>,
}

pub struct Controller {
    engine: Arc<DosingEngine>,
    monitor: Arc<SafetyMonitor>,
    history_export_path: PathBuf,
}

impl Controller {
    pub fn new(
        engine: Arc<DosingEngine>,
        monitor: Arc<SafetyMonitor>,
        history_export_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            engine,
            monitor,
            history_export_path: history_export_path.into(),
        }
    }

    /// Turn auto dosing on and make sure the loop is running.
    pub async fn enable(&self) -> Arc<DosingState> {
        let state = self.engine.store().blocking(|s| s.set_enabled(true)).await;
        self.monitor.start();
        info!("auto dosing enabled");
        self.engine
            .shared()
            .write()
            .await
            .record_system("auto dosing enabled".to_string());
        state
    }

    /// Turn auto dosing off. The loop keeps sweeping for stuck pumps.
    pub async fn disable(&self) -> Arc<DosingState> {
        let state = self.engine.store().blocking(|s| s.set_enabled(false)).await;
        info!("auto dosing disabled");
        self.engine
            .shared()
            .write()
            .await
            .record_system("auto dosing disabled".to_string());
        state
    }

    pub async fn update_config(&self, patch: &DosingPatch) -> Result<Arc<DosingState>, ConfigError> {
        let owned = patch.clone();
        let state = self
            .engine
            .store()
            .blocking(move |s| s.update_config(&owned))
            .await?;
        info!(enabled = state.enabled, "dosing config updated");
        if patch.enabled == Some(true) {
            self.monitor.start();
        }
        self.engine
            .shared()
            .write()
            .await
            .record_system("dosing config updated".to_string());
        Ok(state)
    }

    /// Run one cycle now. Returns `Waiting` if a cycle is already running.
    pub async fn trigger_dose_now(&self) -> CycleOutcome {
        let outcome = self.engine.run_cycle().await;
        log_outcome("manual", &outcome);
        outcome
    }

    pub fn clear_fault(&self, role: ActuatorRole) -> Result<ActuatorState, ConfigError> {
        let registry = self.engine.registry();
        registry.clear_error(role)?;
        registry.state(role)
    }

    pub async fn history(&self, limit: usize) -> History {
        self.engine.shared().read().await.history(limit)
    }

    pub async fn status(&self) -> Status {
        let config = self.engine.store().snapshot();
        let now = OffsetDateTime::now_utc();
        let actuator_states = self
            .engine
            .registry()
            .list_states()
            .into_iter()
            .map(|state| ActuatorStatus {
                cooldown_remaining_sec: config
                    .cooldown_remaining(state.role, now)
                    .map(|d| d.as_secs_f64().ceil() as u64),
                state,
            })
            .collect();

        let st = self.engine.shared().read().await;
        Status {
            enabled: config.enabled,
            loop_running: self.monitor.is_running(),
            cycle_in_progress: self.engine.cycle_in_progress(),
            mqtt_connected: st.mqtt_connected,
            uptime_sec: st.started_at.elapsed().as_secs(),
            last_attempt: st.last_attempt,
            last_outcome: st.last_outcome.clone(),
            targets: config.targets,
            actuator_states,
            events: st.recent_events().into_iter().take(STATUS_EVENTS).collect(),
        }
    }

    /// Write the in-memory dose and sensor history to the export file.
    pub async fn export_history(&self) -> Result<()> {
        let history = self.engine.shared().read().await.history(usize::MAX);
        let bytes = serde_json::to_vec_pretty(&history).context("failed to serialise history")?;
        write_atomic(&self.history_export_path, &bytes)?;
        info!(
            path = %self.history_export_path.display(),
            doses = history.dosing_history.len(),
            readings = history.sensor_history.len(),
            "history exported"
        );
        Ok(())
    }

    /// Stop the loop and switch every pump off.
    pub async fn shutdown(&self) {
        self.monitor.stop().await;
        self.engine
            .shared()
            .write()
            .await
            .record_system("hub stopping".to_string());
    }
}

// ===========================================================================
// Tests
// ===========================================================================
