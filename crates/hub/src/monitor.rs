//! Safety monitor loop. One periodic tick that:
//!
//! 1. force-stops any actuator on for longer than the safety ceiling,
//!    whether auto dosing is enabled or not;
//! 2. refreshes pump assignments from the active profile when due;
//! 3. if auto dosing is enabled (read fresh from the store every tick) and
//!    the attempt gap has elapsed, starts one dosing cycle.
//!
//! Cycles run as their own task so a dose in progress never delays the
//! stuck-actuator sweep.
//!
//! ```text
//! Stopped ──start()──▶ Running ──stop()──▶ Stopped
//!    ▲                   │ start() again: no-op
//!    └───────────────────┘
//! ```

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::engine::{CycleOutcome, DosingEngine};
use crate::profile::ProfileProvider;

#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    pub tick: Duration,
    pub min_attempt_gap: Duration,
    pub safety_ceiling: Duration,
    pub profile_refresh: Duration,
}

enum LoopState {
    Stopped,
    Running {
        task: JoinHandle<()>,
        shutdown: watch::Sender<bool>,
    },
}

pub struct SafetyMonitor {
    engine: Arc<DosingEngine>,
    profile: Option<Arc<dyn ProfileProvider>>,
    settings: MonitorSettings,
    state: Mutex<LoopState>,
}

impl SafetyMonitor {
    pub fn new(engine: Arc<DosingEngine>, settings: MonitorSettings) -> Self {
        Self {
            engine,
            profile: None,
            settings,
            state: Mutex::new(LoopState::Stopped),
        }
    }

    pub fn with_profile(mut self, provider: Arc<dyn ProfileProvider>) -> Self {
        self.profile = Some(provider);
        self
    }

    pub fn is_running(&self) -> bool {
        match &*self.lock_state() {
            LoopState::Running { task, .. } => !task.is_finished(),
            LoopState::Stopped => false,
        }
    }

    /// Start the loop. Returns false if it was already running.
    pub fn start(&self) -> bool {
        let mut state = self.lock_state();
        if let LoopState::Running { task, .. } = &*state {
            if !task.is_finished() {
                debug!("safety monitor already running");
                return false;
            }
            warn!("safety monitor task had exited, restarting");
        }

        let (shutdown, shutdown_rx) = watch::channel(false);
        let ticker = Ticker {
            engine: Arc::clone(&self.engine),
            profile: self.profile.clone(),
            settings: self.settings,
            last_attempt: None,
            last_refresh: None,
            cycle: None,
        };
        let task = tokio::spawn(ticker.run(shutdown_rx));
        *state = LoopState::Running { task, shutdown };

        info!(
            tick_ms = self.settings.tick.as_millis() as u64,
            min_attempt_gap_sec = self.settings.min_attempt_gap.as_secs(),
            safety_ceiling_sec = self.settings.safety_ceiling.as_secs(),
            "safety monitor started"
        );
        true
    }

    /// Stop the loop, cancelling any cycle in flight, and switch every
    /// pump off on the way out.
    pub async fn stop(&self) {
        let previous = std::mem::replace(&mut *self.lock_state(), LoopState::Stopped);
        let LoopState::Running { task, shutdown } = previous else {
            debug!("safety monitor not running");
            return;
        };
        let registry = self.engine.registry();

        let interrupted = registry.force_stop_all();
        let _ = shutdown.send(true);
        if let Err(e) = task.await {
            error!("safety monitor task ended abnormally: {e}");
        }

        let parting = registry.force_stop_all();
        let stopped = interrupted.len() + parting.len();
        if stopped > 0 {
            warn!(stopped, "actuators forced off on monitor stop");
            self.engine
                .shared()
                .write()
                .await
                .record_safety(format!("monitor stop forced {stopped} actuator(s) off"));
        }
        info!("safety monitor stopped");
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LoopState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ---------------------------------------------------------------------------
// Loop body
// ---------------------------------------------------------------------------

struct Ticker {
    engine: Arc<DosingEngine>,
    profile: Option<Arc<dyn ProfileProvider>>,
    settings: MonitorSettings,
    last_attempt: Option<Instant>,
    last_refresh: Option<Instant>,
    cycle: Option<JoinHandle<()>>,
}

impl Ticker {
    async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.settings.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }
            self.tick().await;
        }

        // Dropping the dispense future switches its pump off.
        if let Some(cycle) = self.cycle.take() {
            cycle.abort();
            if let Err(e) = cycle.await {
                if !e.is_cancelled() {
                    error!("dosing cycle task failed: {e}");
                }
            }
        }
    }

    async fn tick(&mut self) {
        self.sweep().await;
        self.refresh_profile().await;
        self.maybe_start_cycle().await;
    }

    async fn sweep(&self) {
        let registry = self.engine.registry();
        for (role, on_for) in registry.stuck(self.settings.safety_ceiling) {
            error!(
                role = %role,
                on_for_sec = on_for.as_secs(),
                ceiling_sec = self.settings.safety_ceiling.as_secs(),
                "actuator exceeded safety ceiling, forcing off"
            );
            let detail = match registry.force_stop(role) {
                Ok(()) => format!("{role} on for {}s, forced off", on_for.as_secs()),
                Err(e) => {
                    error!(role = %role, "force stop failed, retrying next tick: {e}");
                    format!("{role} on for {}s, force stop failed: {e}", on_for.as_secs())
                }
            };
            self.engine.shared().write().await.record_safety(detail);
        }
    }

    async fn refresh_profile(&mut self) {
        let Some(provider) = &self.profile else {
            return;
        };
        if self
            .last_refresh
            .is_some_and(|t| t.elapsed() < self.settings.profile_refresh)
        {
            return;
        }
        self.last_refresh = Some(Instant::now());

        if let Some(assignments) = provider.active_assignments().await {
            let applied = self.engine.registry().apply_assignments(&assignments);
            debug!(applied, "pump assignments refreshed");
        }
    }

    async fn maybe_start_cycle(&mut self) {
        if !self.engine.store().is_enabled() {
            return;
        }
        if self
            .last_attempt
            .is_some_and(|t| t.elapsed() < self.settings.min_attempt_gap)
        {
            return;
        }
        if self.engine.cycle_in_progress() {
            return;
        }

        self.last_attempt = Some(Instant::now());
        self.engine.shared().write().await.last_attempt = Some(OffsetDateTime::now_utc());

        let engine = Arc::clone(&self.engine);
        self.cycle = Some(tokio::spawn(async move {
            let outcome = engine.run_cycle().await;
            log_outcome("auto", &outcome);
        }));
    }
}

pub fn log_outcome(trigger: &str, outcome: &CycleOutcome) {
    match outcome {
        CycleOutcome::Error { .. } | CycleOutcome::TimedOut => {
            warn!(trigger, "dosing cycle: {outcome}")
        }
        CycleOutcome::Dosed { .. } => info!(trigger, "dosing cycle: {outcome}"),
        _ => debug!(trigger, "dosing cycle: {outcome}"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::{rig, Rig};
    use crate::profile::PumpAssignment;
    use crate::role::ActuatorRole;
    use crate::state::EventKind;
    use async_trait::async_trait;

    fn settings() -> MonitorSettings {
        MonitorSettings {
            tick: Duration::from_secs(1),
            min_attempt_gap: Duration::from_secs(60),
            safety_ceiling: Duration::from_secs(30),
            profile_refresh: Duration::from_secs(30),
        }
    }

    fn monitor(r: &Rig) -> SafetyMonitor {
        SafetyMonitor::new(Arc::clone(&r.engine), settings())
    }

    #[tokio::test(start_paused = true)]
    async fn start_is_idempotent() {
        let r = rig(6.0, 1.4);
        let m = monitor(&r);
        assert!(m.start());
        assert!(!m.start());
        assert!(m.is_running());

        m.stop().await;
        assert!(!m.is_running());
        assert!(m.start());
        m.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_actuator_is_forced_off_while_disabled() {
        let r = rig(6.0, 1.4);
        r.store.set_enabled(false);
        let m = monitor(&r);
        m.start();

        r.registry.set_output(ActuatorRole::PhUp, true).unwrap();
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(r.pumps[&ActuatorRole::PhUp].is_on());

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!r.pumps[&ActuatorRole::PhUp].is_on());
        assert!(r.registry.any_active().is_none());

        let st = r.engine.shared().read().await;
        assert!(st.events.iter().any(|e| e.kind == EventKind::Safety));
        drop(st);
        m.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn enabled_loop_runs_one_cycle_per_gap() {
        let r = rig(5.5, 1.4);
        let m = monitor(&r);
        m.start();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(r.sensor.reads(), 1);
        assert!(r.store.snapshot().last_dose(ActuatorRole::PhUp).is_some());
        assert!(r.engine.shared().read().await.last_attempt.is_some());

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(r.sensor.reads(), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(r.sensor.reads(), 2);
        m.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn enable_flag_is_read_every_tick() {
        let r = rig(5.5, 1.4);
        r.store.set_enabled(false);
        let m = monitor(&r);
        m.start();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(r.sensor.reads(), 0);

        r.store.set_enabled(true);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(r.sensor.reads(), 1);
        m.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_preempts_dose_in_progress() {
        let r = rig(5.0, 1.4);
        let mut patch = crate::store::DosingPatch::default();
        patch.actuators.insert(
            ActuatorRole::PhUp,
            crate::store::ActuatorConfigPatch {
                dose_volume_ml: Some(20.0),
                ..Default::default()
            },
        );
        r.store.update_config(&patch).unwrap();

        let m = monitor(&r);
        m.start();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(r.pumps[&ActuatorRole::PhUp].is_on());

        m.stop().await;
        assert!(!r.pumps[&ActuatorRole::PhUp].is_on());
        assert!(r.registry.any_active().is_none());
        // Interrupted doses do not start a cooldown.
        assert!(r.store.snapshot().last_dose(ActuatorRole::PhUp).is_none());
    }

    struct FixedProfile(Vec<PumpAssignment>);

    #[async_trait]
    impl ProfileProvider for FixedProfile {
        async fn active_assignments(&self) -> Option<Vec<PumpAssignment>> {
            Some(self.0.clone())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn profile_assignments_reach_the_registry() {
        let r = rig(6.0, 1.4);
        let profile = FixedProfile(vec![PumpAssignment {
            role: ActuatorRole::Nutrient(1),
            pump_name: "Pump 1".into(),
            product_name: Some("Grow A".into()),
            dosage_ml: Some(1.0),
        }]);
        let m = monitor(&r).with_profile(Arc::new(profile));
        m.start();
        tokio::time::sleep(Duration::from_secs(2)).await;

        let st = r.registry.state(ActuatorRole::Nutrient(1)).unwrap();
        assert_eq!(st.actuator_id, "Pump 1");
        assert_eq!(st.product.as_deref(), Some("Grow A"));
        m.stop().await;
    }
}
