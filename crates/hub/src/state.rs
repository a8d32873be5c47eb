use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::engine::CycleOutcome;
use crate::role::ActuatorRole;
use crate::sensor::SensorSnapshot;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

/// Maximum number of dose / sensor history entries kept in memory.
const MAX_HISTORY: usize = 1000;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub last_attempt: Option<OffsetDateTime>,
    pub last_outcome: Option<CycleOutcome>,
    pub events: VecDeque<SystemEvent>,
    pub doses: VecDeque<DoseRecord>,
    pub readings: VecDeque<SensorSnapshot>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Dose,
    Cycle,
    Safety,
    Error,
    System,
}

/// One delivered dose, with the reading that triggered it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DoseRecord {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub role: ActuatorRole,
    pub actuator_id: String,
    pub volume_ml: f64,
    pub reason: String,
    pub current_value: f64,
    pub target_value: f64,
    pub product: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct History {
    pub dosing_history: Vec<DoseRecord>,
    pub sensor_history: Vec<SensorSnapshot>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            last_attempt: None,
            last_outcome: None,
            events: VecDeque::with_capacity(MAX_EVENTS),
            doses: VecDeque::new(),
            readings: VecDeque::new(),
        }
    }

    pub fn shared() -> SharedState {
        Arc::new(RwLock::new(Self::new()))
    }

    /// Record a snapshot consumed by a dosing cycle.
    pub fn record_reading(&mut self, snapshot: SensorSnapshot) {
        push_capped(&mut self.readings, snapshot, MAX_HISTORY);
        self.push_event(
            EventKind::Reading,
            format!(
                "pH={:.2} EC={:.2} temp={:.1}",
                snapshot.ph, snapshot.ec, snapshot.water_temp
            ),
        );
    }

    /// Record a delivered dose.
    pub fn record_dose(&mut self, dose: DoseRecord) {
        let detail = format!(
            "{} ({}) dosed {:.2} mL for {}{}",
            dose.actuator_id,
            dose.role,
            dose.volume_ml,
            dose.reason,
            dose.product
                .as_ref()
                .map(|p| format!(", product {p}"))
                .unwrap_or_default()
        );
        push_capped(&mut self.doses, dose, MAX_HISTORY);
        self.push_event(EventKind::Dose, detail);
    }

    /// Record the result of a dosing cycle.
    pub fn record_outcome(&mut self, outcome: &CycleOutcome) {
        let kind = match outcome {
            CycleOutcome::Error { .. } | CycleOutcome::TimedOut => EventKind::Error,
            _ => EventKind::Cycle,
        };
        self.push_event(kind, outcome.to_string());
        self.last_outcome = Some(outcome.clone());
    }

    /// Record a safety action (force stop, fault).
    pub fn record_safety(&mut self, detail: String) {
        self.push_event(EventKind::Safety, detail);
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    /// Restore history persisted by a previous run. Entries recorded since
    /// start-up stay newest.
    pub fn seed_history(&mut self, doses: Vec<DoseRecord>, readings: Vec<SensorSnapshot>) {
        let live_doses = std::mem::take(&mut self.doses);
        let live_readings = std::mem::take(&mut self.readings);
        for d in doses.into_iter().chain(live_doses) {
            push_capped(&mut self.doses, d, MAX_HISTORY);
        }
        for r in readings.into_iter().chain(live_readings) {
            push_capped(&mut self.readings, r, MAX_HISTORY);
        }
    }

    /// Newest `limit` entries of each history, oldest first.
    pub fn history(&self, limit: usize) -> History {
        History {
            dosing_history: tail(&self.doses, limit),
            sensor_history: tail(&self.readings, limit),
        }
    }

    /// Newest events first.
    pub fn recent_events(&self) -> Vec<SystemEvent> {
        self.events.iter().rev().cloned().collect()
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        push_capped(
            &mut self.events,
            SystemEvent {
                ts: OffsetDateTime::now_utc(),
                kind,
                detail,
            },
            MAX_EVENTS,
        );
    }
}

fn push_capped<T>(buf: &mut VecDeque<T>, item: T, cap: usize) {
    if buf.len() >= cap {
        buf.pop_front();
    }
    buf.push_back(item);
}

fn tail<T: Clone>(buf: &VecDeque<T>, limit: usize) -> Vec<T> {
    buf.iter().skip(buf.len().saturating_sub(limit)).cloned().collect()
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sensor::testing::snapshot;

    fn dose(n: usize) -> DoseRecord {
        DoseRecord {
            ts: OffsetDateTime::now_utc(),
            role: ActuatorRole::Nutrient(1),
            actuator_id: "Pump 1".into(),
            volume_ml: n as f64,
            reason: "EC adjustment".into(),
            current_value: 0.9,
            target_value: 1.4,
            product: Some("Grow A".into()),
        }
    }

    #[test]
    fn event_ring_is_bounded() {
        let mut st = SystemState::new();
        for i in 0..(MAX_EVENTS + 10) {
            st.record_system(format!("e{i}"));
        }
        assert_eq!(st.events.len(), MAX_EVENTS);
        assert_eq!(st.recent_events()[0].detail, format!("e{}", MAX_EVENTS + 9));
    }

    #[test]
    fn dose_history_is_bounded_and_tail_ordered() {
        let mut st = SystemState::new();
        for i in 0..(MAX_HISTORY + 5) {
            st.record_dose(dose(i));
        }
        assert_eq!(st.doses.len(), MAX_HISTORY);

        let h = st.history(3);
        let vols: Vec<f64> = h.dosing_history.iter().map(|d| d.volume_ml).collect();
        let last = (MAX_HISTORY + 4) as f64;
        assert_eq!(vols, vec![last - 2.0, last - 1.0, last]);
    }

    #[test]
    fn readings_feed_sensor_history() {
        let mut st = SystemState::new();
        st.record_reading(snapshot(6.1, 1.2));
        st.record_reading(snapshot(6.0, 1.3));
        let h = st.history(50);
        assert_eq!(h.sensor_history.len(), 2);
        assert_eq!(h.sensor_history[1].ec, 1.3);
        assert_eq!(st.events.back().map(|e| e.kind), Some(EventKind::Reading));
    }

    #[test]
    fn seeded_history_sits_before_live_entries() {
        let mut st = SystemState::new();
        st.record_dose(dose(99));
        st.seed_history(vec![dose(1), dose(2)], vec![snapshot(6.0, 1.4)]);

        let vols: Vec<f64> = st.history(10).dosing_history.iter().map(|d| d.volume_ml).collect();
        assert_eq!(vols, vec![1.0, 2.0, 99.0]);
        assert_eq!(st.readings.len(), 1);
    }

    #[test]
    fn outcome_is_remembered() {
        let mut st = SystemState::new();
        st.record_outcome(&CycleOutcome::TimedOut);
        assert_eq!(st.last_outcome, Some(CycleOutcome::TimedOut));
        assert_eq!(st.events.back().map(|e| e.kind), Some(EventKind::Error));
    }
}
