//! Active plant profile: which product each pump channel carries. Profile
//! management lives in the dashboard; the hub only reads the active one.

use async_trait::async_trait;
use serde::Deserialize;
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::role::ActuatorRole;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PumpAssignment {
    pub role: ActuatorRole,
    pub pump_name: String,
    #[serde(default)]
    pub product_name: Option<String>,
    /// Suggested dose from the product catalogue. Informational only; the
    /// dose actually delivered comes from the dosing state.
    #[serde(default, rename = "dosage")]
    pub dosage_ml: Option<f64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActiveProfile {
    name: String,
    #[serde(default)]
    pump_assignments: Vec<PumpAssignment>,
}

#[async_trait]
pub trait ProfileProvider: Send + Sync {
    /// `None` when there is no usable active profile. Callers keep their
    /// previous mapping in that case.
    async fn active_assignments(&self) -> Option<Vec<PumpAssignment>>;
}

/// Reads the active profile the dashboard exports as JSON.
pub struct FileProfileProvider {
    path: PathBuf,
}

impl FileProfileProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ProfileProvider for FileProfileProvider {
    async fn active_assignments(&self) -> Option<Vec<PumpAssignment>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no active profile");
                return None;
            }
            Err(e) => {
                warn!(path = %self.path.display(), "failed to read active profile: {e}");
                return None;
            }
        };
        match serde_json::from_str::<ActiveProfile>(&contents) {
            Ok(p) if p.pump_assignments.is_empty() => {
                warn!(profile = %p.name, "active profile has no pump assignments");
                None
            }
            Ok(p) => {
                debug!(profile = %p.name, pumps = p.pump_assignments.len(), "active profile read");
                Some(p.pump_assignments)
            }
            Err(e) => {
                warn!(path = %self.path.display(), "bad active profile json: {e}");
                None
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
