//! Dosing state store: targets, per-pump dose settings, last-dose
//! timestamps and the global auto-dosing switch.
//!
//! This is the single source of truth for "is auto dosing enabled". Every
//! change goes through one writer lock: apply to a copy, validate, publish
//! the new snapshot, then persist it with an atomic replace. Readers take
//! the last published `Arc<DosingState>` and never see a half-applied
//! update. A failed write is logged and retried on the next change; the
//! in-memory state stays authoritative for the running process.
//!
//! On-disk format (JSON):
//!
//! ```text
//! {
//!   "enabled": false,
//!   "targets": { "ph": {"target": 6.0, "tolerance": 0.2}, "ec": {...} },
//!   "actuators": { "ph_up": {"doseVolumeMl": 0.5, "flowRateMlPerSec": 1.0, "minIntervalSec": 300} },
//!   "lastDose": { "ph_up": "2026-01-01T12:00:00Z", "ph_down": null }
//! }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::role::ActuatorRole;

pub const DEFAULT_PH_TARGET: f64 = 6.0;
pub const DEFAULT_PH_TOLERANCE: f64 = 0.2;
pub const DEFAULT_EC_TARGET: f64 = 1.4;
pub const DEFAULT_EC_TOLERANCE: f64 = 0.2;
pub const DEFAULT_DOSE_ML: f64 = 0.5;
pub const DEFAULT_FLOW_ML_PER_SEC: f64 = 1.0;
pub const DEFAULT_MIN_INTERVAL_SEC: u64 = 300;
/// Longest accepted `minIntervalSec`: 30 days.
pub const MAX_MIN_INTERVAL_SEC: u64 = 30 * 24 * 60 * 60;

// ---------------------------------------------------------------------------
// State types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TargetRange {
    pub target: f64,
    pub tolerance: f64,
}

impl TargetRange {
    pub fn low(&self) -> f64 {
        self.target - self.tolerance
    }

    pub fn high(&self) -> f64 {
        self.target + self.tolerance
    }

    /// Inclusive: a value exactly on a band edge is in range.
    pub fn contains(&self, value: f64) -> bool {
        value >= self.low() && value <= self.high()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Targets {
    pub ph: TargetRange,
    pub ec: TargetRange,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActuatorConfig {
    pub dose_volume_ml: f64,
    pub flow_rate_ml_per_sec: f64,
    pub min_interval_sec: u64,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            dose_volume_ml: DEFAULT_DOSE_ML,
            flow_rate_ml_per_sec: DEFAULT_FLOW_ML_PER_SEC,
            min_interval_sec: DEFAULT_MIN_INTERVAL_SEC,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DosingState {
    pub enabled: bool,
    pub targets: Targets,
    pub actuators: BTreeMap<ActuatorRole, ActuatorConfig>,
    #[serde(default, with = "last_dose_format")]
    pub last_dose: BTreeMap<ActuatorRole, Option<OffsetDateTime>>,
}

impl DosingState {
    /// Disabled, default targets, default dose settings for every role.
    pub fn default_for(roles: &[ActuatorRole]) -> Self {
        let mut state = Self {
            enabled: false,
            targets: Targets {
                ph: TargetRange {
                    target: DEFAULT_PH_TARGET,
                    tolerance: DEFAULT_PH_TOLERANCE,
                },
                ec: TargetRange {
                    target: DEFAULT_EC_TARGET,
                    tolerance: DEFAULT_EC_TOLERANCE,
                },
            },
            actuators: BTreeMap::new(),
            last_dose: BTreeMap::new(),
        };
        state.ensure_roles(roles);
        state
    }

    /// Give every role an actuator config and a last-dose slot. Returns
    /// true if anything was added.
    pub fn ensure_roles(&mut self, roles: &[ActuatorRole]) -> bool {
        let mut changed = false;
        for role in roles {
            if !self.actuators.contains_key(role) {
                self.actuators.insert(*role, ActuatorConfig::default());
                changed = true;
            }
            if !self.last_dose.contains_key(role) {
                self.last_dose.insert(*role, None);
                changed = true;
            }
        }
        changed
    }

    pub fn actuator(&self, role: ActuatorRole) -> Result<&ActuatorConfig, ConfigError> {
        self.actuators
            .get(&role)
            .ok_or(ConfigError::MissingActuatorConfig(role))
    }

    pub fn last_dose(&self, role: ActuatorRole) -> Option<OffsetDateTime> {
        self.last_dose.get(&role).copied().flatten()
    }

    /// Time left before `role` may dose again. Zero when it may dose now.
    /// A role without an actuator config never may.
    pub fn cooldown_remaining(&self, role: ActuatorRole, now: OffsetDateTime) -> Option<Duration> {
        let cfg = self.actuators.get(&role)?;
        let Some(last) = self.last_dose(role) else {
            return Some(Duration::ZERO);
        };
        let full = Duration::from_secs(cfg.min_interval_sec);
        // An interval too long to represent has never elapsed.
        let Ok(secs) = i64::try_from(cfg.min_interval_sec) else {
            return Some(full);
        };
        let interval = time::Duration::seconds(secs);
        let elapsed = now - last;
        if elapsed >= interval {
            Some(Duration::ZERO)
        } else {
            // Also covers a last-dose stamp in the future (clock stepped back).
            Some((interval - elapsed).unsigned_abs().min(full))
        }
    }

    pub fn can_dose(&self, role: ActuatorRole, now: OffsetDateTime) -> bool {
        self.cooldown_remaining(role, now) == Some(Duration::ZERO)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_range("targets.ph", &self.targets.ph)?;
        validate_range("targets.ec", &self.targets.ec)?;
        if !(0.0..=14.0).contains(&self.targets.ph.target) {
            return Err(ConfigError::invalid(
                "targets.ph.target",
                format!("{} outside [0, 14]", self.targets.ph.target),
            ));
        }
        if self.targets.ec.target < 0.0 {
            return Err(ConfigError::invalid(
                "targets.ec.target",
                format!("{} is negative", self.targets.ec.target),
            ));
        }
        for (role, a) in &self.actuators {
            if !(a.dose_volume_ml.is_finite() && a.dose_volume_ml > 0.0) {
                return Err(ConfigError::invalid(
                    format!("actuators.{role}.doseVolumeMl"),
                    format!("{} is not > 0", a.dose_volume_ml),
                ));
            }
            if !(a.flow_rate_ml_per_sec.is_finite() && a.flow_rate_ml_per_sec > 0.0) {
                return Err(ConfigError::invalid(
                    format!("actuators.{role}.flowRateMlPerSec"),
                    format!("{} is not > 0", a.flow_rate_ml_per_sec),
                ));
            }
            if a.min_interval_sec > MAX_MIN_INTERVAL_SEC {
                return Err(ConfigError::invalid(
                    format!("actuators.{role}.minIntervalSec"),
                    format!("{} exceeds {MAX_MIN_INTERVAL_SEC}", a.min_interval_sec),
                ));
            }
        }
        Ok(())
    }

    /// Deep-merge a patch into a copy of this state.
    pub fn merged(&self, patch: &DosingPatch) -> Result<Self, ConfigError> {
        let mut next = self.clone();
        if let Some(enabled) = patch.enabled {
            next.enabled = enabled;
        }
        if let Some(t) = &patch.targets {
            if let Some(p) = &t.ph {
                p.apply(&mut next.targets.ph);
            }
            if let Some(p) = &t.ec {
                p.apply(&mut next.targets.ec);
            }
        }
        for (role, p) in &patch.actuators {
            match next.actuators.get_mut(role) {
                Some(existing) => p.apply(existing),
                None => {
                    let created = p.complete().ok_or_else(|| {
                        ConfigError::invalid(
                            format!("actuators.{role}"),
                            "new actuator needs doseVolumeMl, flowRateMlPerSec and minIntervalSec",
                        )
                    })?;
                    next.actuators.insert(*role, created);
                    next.last_dose.entry(*role).or_insert(None);
                }
            }
        }
        next.validate()?;
        Ok(next)
    }
}

fn validate_range(field: &str, r: &TargetRange) -> Result<(), ConfigError> {
    if !r.target.is_finite() {
        return Err(ConfigError::invalid(format!("{field}.target"), "not a number"));
    }
    if !(r.tolerance.is_finite() && r.tolerance >= 0.0) {
        return Err(ConfigError::invalid(
            format!("{field}.tolerance"),
            format!("{} must be >= 0", r.tolerance),
        ));
    }
    Ok(())
}

/// `lastDose` values are ISO-8601 strings or null.
mod last_dose_format {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;
    use time::format_description::well_known::Rfc3339;
    use time::OffsetDateTime;

    use crate::role::ActuatorRole;

    pub fn serialize<S: Serializer>(
        map: &BTreeMap<ActuatorRole, Option<OffsetDateTime>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        let mut out: BTreeMap<ActuatorRole, Option<String>> = BTreeMap::new();
        for (role, ts) in map {
            let s = ts
                .map(|t| t.format(&Rfc3339))
                .transpose()
                .map_err(serde::ser::Error::custom)?;
            out.insert(*role, s);
        }
        out.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<BTreeMap<ActuatorRole, Option<OffsetDateTime>>, D::Error> {
        let raw = BTreeMap::<ActuatorRole, Option<String>>::deserialize(deserializer)?;
        raw.into_iter()
            .map(|(role, s)| {
                let ts = s
                    .map(|s| OffsetDateTime::parse(&s, &Rfc3339))
                    .transpose()
                    .map_err(serde::de::Error::custom)?;
                Ok((role, ts))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Partial updates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetRangePatch {
    pub target: Option<f64>,
    pub tolerance: Option<f64>,
}

impl TargetRangePatch {
    fn apply(&self, r: &mut TargetRange) {
        if let Some(v) = self.target {
            r.target = v;
        }
        if let Some(v) = self.tolerance {
            r.tolerance = v;
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetsPatch {
    pub ph: Option<TargetRangePatch>,
    pub ec: Option<TargetRangePatch>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ActuatorConfigPatch {
    pub dose_volume_ml: Option<f64>,
    pub flow_rate_ml_per_sec: Option<f64>,
    pub min_interval_sec: Option<u64>,
}

impl ActuatorConfigPatch {
    fn apply(&self, a: &mut ActuatorConfig) {
        if let Some(v) = self.dose_volume_ml {
            a.dose_volume_ml = v;
        }
        if let Some(v) = self.flow_rate_ml_per_sec {
            a.flow_rate_ml_per_sec = v;
        }
        if let Some(v) = self.min_interval_sec {
            a.min_interval_sec = v;
        }
    }

    fn complete(&self) -> Option<ActuatorConfig> {
        Some(ActuatorConfig {
            dose_volume_ml: self.dose_volume_ml?,
            flow_rate_ml_per_sec: self.flow_rate_ml_per_sec?,
            min_interval_sec: self.min_interval_sec?,
        })
    }
}

/// Field-by-field update. Absent fields keep their current value.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DosingPatch {
    pub enabled: Option<bool>,
    pub targets: Option<TargetsPatch>,
    #[serde(default)]
    pub actuators: BTreeMap<ActuatorRole, ActuatorConfigPatch>,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

pub struct DosingStore {
    path: PathBuf,
    published: watch::Sender<Arc<DosingState>>,
    /// Serialises writers. Holds "the last persist failed".
    writer: Mutex<bool>,
}

impl DosingStore {
    /// Load the state file, falling back to defaults when it is missing or
    /// unreadable, and make sure every role has an entry.
    pub fn open(path: impl Into<PathBuf>, roles: &[ActuatorRole]) -> Self {
        let path = path.into();
        let (mut state, from_disk) = match load(&path) {
            Ok(Some(s)) => (s, true),
            Ok(None) => {
                info!(path = %path.display(), "no dosing state file, using defaults");
                (DosingState::default_for(roles), false)
            }
            Err(e) => {
                warn!(path = %path.display(), "dosing state unreadable, using defaults: {e:#}");
                set_aside(&path);
                (DosingState::default_for(roles), false)
            }
        };
        let added = state.ensure_roles(roles);

        let store = Self::with_state(path, state);
        if !from_disk || added {
            if let Err(e) = store.persist() {
                warn!("initial dosing state write failed: {e:#}");
            }
        }
        store
    }

    pub fn with_state(path: impl Into<PathBuf>, state: DosingState) -> Self {
        let (published, _) = watch::channel(Arc::new(state));
        Self {
            path: path.into(),
            published,
            writer: Mutex::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The last published state.
    pub fn snapshot(&self) -> Arc<DosingState> {
        Arc::clone(&self.published.borrow())
    }

    pub fn is_enabled(&self) -> bool {
        self.published.borrow().enabled
    }

    pub fn set_enabled(&self, enabled: bool) -> Arc<DosingState> {
        // Cannot fail validation: only the flag changes.
        match self.commit(|s| {
            s.enabled = enabled;
            Ok(())
        }) {
            Ok(s) => s,
            Err(_) => self.snapshot(),
        }
    }

    pub fn update_config(&self, patch: &DosingPatch) -> Result<Arc<DosingState>, ConfigError> {
        self.commit(|s| {
            *s = s.merged(patch)?;
            Ok(())
        })
    }

    /// Record a delivered dose. Touches only that role's entry.
    pub fn record_dose(&self, role: ActuatorRole, at: OffsetDateTime) -> Arc<DosingState> {
        match self.commit(|s| {
            s.last_dose.insert(role, Some(at));
            Ok(())
        }) {
            Ok(s) => s,
            Err(_) => self.snapshot(),
        }
    }

    /// Run a store operation on the blocking pool. Every change fsyncs the
    /// state file, which must not stall an async worker.
    pub async fn blocking<T, F>(self: &Arc<Self>, op: F) -> T
    where
        T: Send + 'static,
        F: FnOnce(&DosingStore) -> T + Send + 'static,
    {
        let store = Arc::clone(self);
        match tokio::task::spawn_blocking(move || op(&store)).await {
            Ok(out) => out,
            // Blocking tasks are never aborted, so only a panic lands here.
            Err(e) => std::panic::resume_unwind(e.into_panic()),
        }
    }

    /// Write the published state to disk.
    pub fn persist(&self) -> Result<()> {
        let mut failed = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        let state = self.snapshot();
        let result = write_state(&self.path, &state);
        *failed = result.is_err();
        result
    }

    fn commit(
        &self,
        apply: impl FnOnce(&mut DosingState) -> Result<(), ConfigError>,
    ) -> Result<Arc<DosingState>, ConfigError> {
        let mut failed = self.writer.lock().unwrap_or_else(PoisonError::into_inner);

        let mut next = (*self.snapshot()).clone();
        apply(&mut next)?;
        next.validate()?;
        let next = Arc::new(next);
        self.published.send_replace(Arc::clone(&next));

        match write_state(&self.path, &next) {
            Ok(()) => {
                if *failed {
                    info!(path = %self.path.display(), "dosing state write recovered");
                }
                *failed = false;
            }
            Err(e) => {
                warn!(path = %self.path.display(), "dosing state write failed, will retry on next change: {e:#}");
                *failed = true;
            }
        }
        Ok(next)
    }
}

fn load(path: &Path) -> Result<Option<DosingState>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
    };
    let state: DosingState = serde_json::from_str(&contents)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    state
        .validate()
        .with_context(|| format!("invalid dosing state in {}", path.display()))?;
    Ok(Some(state))
}

fn set_aside(path: &Path) {
    let aside = sibling(path, "corrupt");
    if let Err(e) = std::fs::copy(path, &aside) {
        warn!(path = %aside.display(), "could not keep a copy of the unreadable state: {e}");
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

fn write_state(path: &Path, state: &DosingState) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(state).context("failed to serialise dosing state")?;
    write_atomic(path, &bytes)
}

/// Write to `<file>.tmp`, fsync, then rename over the target. Readers see
/// either the old file or the new one, never a partial write.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create {}", dir.display()))?;
    }
    let tmp = sibling(path, "tmp");
    {
        let mut f = std::fs::File::create(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        f.write_all(bytes)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        f.sync_all()
            .with_context(|| format!("failed to sync {}", tmp.display()))?;
    }
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    const ROLES: &[ActuatorRole] = &[
        ActuatorRole::PhUp,
        ActuatorRole::PhDown,
        ActuatorRole::Nutrient(1),
        ActuatorRole::Nutrient(2),
    ];

    fn tmp_store() -> (tempfile::TempDir, DosingStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = DosingStore::open(dir.path().join("dosing_state.json"), ROLES);
        (dir, store)
    }

    // -- TargetRange ------------------------------------------------------

    #[test]
    fn band_edges_are_in_range() {
        let r = TargetRange {
            target: 6.0,
            tolerance: 0.25,
        };
        assert!(r.contains(5.75));
        assert!(r.contains(6.25));
        assert!(!r.contains(5.7));
        assert!(!r.contains(6.3));
    }

    // -- Rate limiting ----------------------------------------------------

    #[test]
    fn can_dose_when_never_dosed() {
        let s = DosingState::default_for(ROLES);
        assert!(s.can_dose(ActuatorRole::PhUp, datetime!(2026-01-01 0:00 UTC)));
    }

    #[test]
    fn can_dose_respects_min_interval() {
        let mut s = DosingState::default_for(ROLES);
        s.actuators.get_mut(&ActuatorRole::PhUp).unwrap().min_interval_sec = 120;
        s.last_dose
            .insert(ActuatorRole::PhUp, Some(datetime!(2026-01-01 12:00 UTC)));

        assert!(!s.can_dose(ActuatorRole::PhUp, datetime!(2026-01-01 12:00:01 UTC)));
        assert!(!s.can_dose(ActuatorRole::PhUp, datetime!(2026-01-01 12:01:59 UTC)));
        assert!(s.can_dose(ActuatorRole::PhUp, datetime!(2026-01-01 12:02 UTC)));
        assert_eq!(
            s.cooldown_remaining(ActuatorRole::PhUp, datetime!(2026-01-01 12:01:30 UTC)),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn huge_min_interval_never_elapses_and_is_rejected() {
        let mut s = DosingState::default_for(ROLES);
        s.actuators.get_mut(&ActuatorRole::PhUp).unwrap().min_interval_sec = u64::MAX;
        s.last_dose
            .insert(ActuatorRole::PhUp, Some(datetime!(2026-01-01 12:00 UTC)));

        assert!(!s.can_dose(ActuatorRole::PhUp, datetime!(2026-01-01 12:00:01 UTC)));
        assert!(!s.can_dose(ActuatorRole::PhUp, datetime!(2036-01-01 12:00 UTC)));
        assert!(matches!(
            s.validate(),
            Err(ConfigError::Invalid { field, .. }) if field == "actuators.ph_up.minIntervalSec"
        ));

        s.actuators.get_mut(&ActuatorRole::PhUp).unwrap().min_interval_sec = MAX_MIN_INTERVAL_SEC;
        assert!(s.validate().is_ok());
        assert!(!s.can_dose(ActuatorRole::PhUp, datetime!(2026-01-30 12:00 UTC)));
        assert!(s.can_dose(ActuatorRole::PhUp, datetime!(2026-01-31 12:00 UTC)));
    }

    #[test]
    fn huge_min_interval_patch_is_rejected() {
        let (_dir, store) = tmp_store();
        let before = store.snapshot();
        let patch: DosingPatch = serde_json::from_value(serde_json::json!({
            "actuators": {"ph_up": {"minIntervalSec": u64::MAX}}
        }))
        .unwrap();
        assert!(matches!(
            store.update_config(&patch),
            Err(ConfigError::Invalid { .. })
        ));
        assert_eq!(*store.snapshot(), *before);
    }

    #[test]
    fn last_dose_in_future_blocks_dosing() {
        let mut s = DosingState::default_for(ROLES);
        s.last_dose
            .insert(ActuatorRole::PhDown, Some(datetime!(2026-01-01 13:00 UTC)));
        assert!(!s.can_dose(ActuatorRole::PhDown, datetime!(2026-01-01 12:00 UTC)));
    }

    #[test]
    fn role_without_config_cannot_dose() {
        let s = DosingState::default_for(&[ActuatorRole::PhUp]);
        assert!(!s.can_dose(ActuatorRole::Nutrient(9), datetime!(2026-01-01 0:00 UTC)));
    }

    // -- Merging ----------------------------------------------------------

    #[test]
    fn tolerance_patch_leaves_everything_else_byte_identical() {
        let mut base = DosingState::default_for(ROLES);
        base.last_dose
            .insert(ActuatorRole::Nutrient(1), Some(datetime!(2026-03-04 05:06:07.123456789 UTC)));

        let patch: DosingPatch =
            serde_json::from_str(r#"{"targets":{"ph":{"tolerance":0.3}}}"#).unwrap();
        let next = base.merged(&patch).unwrap();

        assert_eq!(next.targets.ph.tolerance, 0.3);
        assert_eq!(next.targets.ph.target, base.targets.ph.target);
        assert_eq!(
            serde_json::to_string(&next.targets.ec).unwrap(),
            serde_json::to_string(&base.targets.ec).unwrap()
        );
        assert_eq!(
            serde_json::to_string(&next.actuators).unwrap(),
            serde_json::to_string(&base.actuators).unwrap()
        );
        assert_eq!(next.last_dose, base.last_dose);
    }

    #[test]
    fn actuator_patch_touches_only_named_field() {
        let base = DosingState::default_for(ROLES);
        let patch: DosingPatch =
            serde_json::from_str(r#"{"actuators":{"nutrient_2":{"doseVolumeMl":2.5}}}"#).unwrap();
        let next = base.merged(&patch).unwrap();

        let n2 = next.actuators[&ActuatorRole::Nutrient(2)];
        assert_eq!(n2.dose_volume_ml, 2.5);
        assert_eq!(n2.flow_rate_ml_per_sec, DEFAULT_FLOW_ML_PER_SEC);
        assert_eq!(
            next.actuators[&ActuatorRole::Nutrient(1)],
            base.actuators[&ActuatorRole::Nutrient(1)]
        );
    }

    #[test]
    fn new_actuator_requires_complete_config() {
        let base = DosingState::default_for(&[ActuatorRole::PhUp]);
        let partial: DosingPatch =
            serde_json::from_str(r#"{"actuators":{"nutrient_3":{"doseVolumeMl":1.0}}}"#).unwrap();
        assert!(base.merged(&partial).is_err());

        let full: DosingPatch = serde_json::from_str(
            r#"{"actuators":{"nutrient_3":{"doseVolumeMl":1.0,"flowRateMlPerSec":2.0,"minIntervalSec":60}}}"#,
        )
        .unwrap();
        let next = base.merged(&full).unwrap();
        assert!(next.actuators.contains_key(&ActuatorRole::Nutrient(3)));
        assert_eq!(next.last_dose.get(&ActuatorRole::Nutrient(3)), Some(&None));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let base = DosingState::default_for(ROLES);
        for body in [
            r#"{"targets":{"ph":{"tolerance":-0.1}}}"#,
            r#"{"targets":{"ph":{"target":15.0}}}"#,
            r#"{"actuators":{"ph_up":{"flowRateMlPerSec":0.0}}}"#,
            r#"{"actuators":{"ph_down":{"doseVolumeMl":-1.0}}}"#,
        ] {
            let patch: DosingPatch = serde_json::from_str(body).unwrap();
            assert!(base.merged(&patch).is_err(), "accepted {body}");
        }
    }

    #[test]
    fn unknown_patch_fields_are_rejected() {
        assert!(serde_json::from_str::<DosingPatch>(r#"{"targets":{"ph":{"buffer":0.3}}}"#).is_err());
    }

    // -- Store ------------------------------------------------------------

    #[test]
    fn missing_file_yields_defaults_and_writes_them() {
        let (_dir, store) = tmp_store();
        let s = store.snapshot();
        assert!(!s.enabled);
        assert_eq!(s.targets.ph.target, DEFAULT_PH_TARGET);
        assert_eq!(s.actuators.len(), ROLES.len());
        assert!(store.path().exists());
    }

    #[test]
    fn corrupt_file_yields_defaults_and_is_set_aside() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dosing_state.json");
        std::fs::write(&path, b"{\"enabled\": tru").unwrap();

        let store = DosingStore::open(&path, ROLES);
        assert!(!store.is_enabled());
        assert!(dir.path().join("dosing_state.json.corrupt").exists());
        // Replaced with a readable file.
        let reread: DosingState =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(reread.actuators.len(), ROLES.len());
    }

    #[test]
    fn last_dose_survives_restart_byte_identical() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dosing_state.json");

        let store = DosingStore::open(&path, ROLES);
        store.set_enabled(true);
        store.record_dose(ActuatorRole::PhUp, datetime!(2026-10-19 08:15:30.987654321 UTC));
        store.record_dose(ActuatorRole::Nutrient(2), OffsetDateTime::now_utc());
        let on_disk: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        drop(store);

        let reopened = DosingStore::open(&path, ROLES);
        assert!(reopened.is_enabled());
        let reserialised = serde_json::to_value(&*reopened.snapshot()).unwrap();
        assert_eq!(reserialised["lastDose"], on_disk["lastDose"]);
        assert_eq!(
            reopened.snapshot().last_dose(ActuatorRole::PhUp),
            Some(datetime!(2026-10-19 08:15:30.987654321 UTC))
        );
    }

    #[test]
    fn record_dose_touches_only_that_role() {
        let (_dir, store) = tmp_store();
        let before = store.snapshot();
        store.record_dose(ActuatorRole::PhDown, datetime!(2026-01-01 0:00 UTC));
        let after = store.snapshot();

        assert_eq!(after.last_dose(ActuatorRole::PhDown), Some(datetime!(2026-01-01 0:00 UTC)));
        assert_eq!(after.last_dose(ActuatorRole::PhUp), None);
        assert_eq!(after.actuators, before.actuators);
        assert_eq!(after.targets, before.targets);
    }

    #[test]
    fn rejected_update_publishes_nothing() {
        let (_dir, store) = tmp_store();
        let before = store.snapshot();
        let patch: DosingPatch =
            serde_json::from_str(r#"{"enabled":true,"targets":{"ec":{"tolerance":-1}}}"#).unwrap();
        assert!(store.update_config(&patch).is_err());
        assert_eq!(*store.snapshot(), *before);
    }

    #[test]
    fn write_failure_keeps_memory_authoritative() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes every rename fail.
        let path = dir.path().join("state.json");
        std::fs::create_dir(&path).unwrap();
        let store = DosingStore::with_state(&path, DosingState::default_for(ROLES));

        store.set_enabled(true);
        assert!(store.is_enabled());
        assert!(store.persist().is_err());
    }

    #[tokio::test]
    async fn blocking_updates_run_off_the_caller_thread() {
        let (_dir, store) = tmp_store();
        let store = Arc::new(store);
        let caller = std::thread::current().id();

        let (state, writer) = store
            .blocking(|s| (s.set_enabled(true), std::thread::current().id()))
            .await;
        assert_ne!(writer, caller);
        assert!(state.enabled);

        let on_disk: DosingState =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert!(on_disk.enabled);
    }

    #[test]
    fn new_roles_are_added_to_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dosing_state.json");
        drop(DosingStore::open(&path, &[ActuatorRole::PhUp]));

        let store = DosingStore::open(&path, ROLES);
        assert_eq!(store.snapshot().actuators.len(), ROLES.len());
    }

    #[test]
    fn persisted_json_uses_documented_keys() {
        let (_dir, store) = tmp_store();
        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(store.path()).unwrap()).unwrap();
        assert!(raw["enabled"].is_boolean());
        assert!(raw["targets"]["ph"]["tolerance"].is_number());
        assert!(raw["actuators"]["ph_up"]["doseVolumeMl"].is_number());
        assert!(raw["actuators"]["nutrient_1"]["minIntervalSec"].is_number());
        assert!(raw["lastDose"]["ph_down"].is_null());
    }
}
