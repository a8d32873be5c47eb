use serde::Deserialize;
use time::OffsetDateTime;

use crate::sensor::SensorSnapshot;

/// Topic filter for chemistry telemetry from probe nodes.
pub(crate) const CHEM_TOPIC_FILTER: &str = "tele/+/chem";

/// Topic that switches auto dosing on or off.
pub(crate) const AUTO_DOSING_TOPIC: &str = "dosing/auto/set";

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct ChemMsg {
    /// Unix seconds at the node.
    pub(crate) ts: i64,
    pub(crate) ph: f64,
    pub(crate) ec: f64,
    pub(crate) water_temp: f64,
}

impl ChemMsg {
    pub(crate) fn into_snapshot(self) -> Result<SensorSnapshot, String> {
        let captured_at = OffsetDateTime::from_unix_timestamp(self.ts)
            .map_err(|e| format!("bad telemetry timestamp {}: {e}", self.ts))?;
        Ok(SensorSnapshot {
            ph: self.ph,
            ec: self.ec,
            water_temp: self.water_temp,
            captured_at,
        })
    }
}

/// A decoded inbound message.
#[derive(Debug)]
pub(crate) enum Inbound<'a> {
    Chem {
        node_id: &'a str,
        snapshot: SensorSnapshot,
    },
    AutoDosing(bool),
}

// ---------------------------------------------------------------------------
// Topic / payload helpers
// ---------------------------------------------------------------------------

/// Extract node_id from "tele/<node_id>/chem".
pub(crate) fn extract_node_id(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "tele" && parts[2] == "chem" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

/// Parse an "ON"/"OFF" payload into a bool (case-insensitive, trims whitespace).
pub(crate) fn parse_switch_command(payload: &[u8]) -> Result<bool, String> {
    let s = String::from_utf8_lossy(payload).trim().to_uppercase();
    match s.as_str() {
        "ON" => Ok(true),
        "OFF" => Ok(false),
        _ => Err(format!("unknown auto dosing command '{s}'")),
    }
}

/// Decode a publish. `Ok(None)` for topics the hub does not handle.
pub(crate) fn decode<'a>(topic: &'a str, payload: &[u8]) -> Result<Option<Inbound<'a>>, String> {
    if let Some(node_id) = extract_node_id(topic) {
        let msg: ChemMsg = serde_json::from_slice(payload)
            .map_err(|e| format!("bad telemetry json from {node_id}: {e}"))?;
        return Ok(Some(Inbound::Chem {
            node_id,
            snapshot: msg.into_snapshot()?,
        }));
    }
    if topic == AUTO_DOSING_TOPIC {
        return parse_switch_command(payload).map(|on| Some(Inbound::AutoDosing(on)));
    }
    Ok(None)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- extract_node_id ----------------------------------------------------

    #[test]
    fn extract_node_id_valid_topic() {
        assert_eq!(extract_node_id("tele/reservoir-1/chem"), Some("reservoir-1"));
    }

    #[test]
    fn extract_node_id_rejects_other_shapes() {
        assert_eq!(extract_node_id("foo/node-a/chem"), None);
        assert_eq!(extract_node_id("tele/node-a/reading"), None);
        assert_eq!(extract_node_id("tele/chem"), None);
        assert_eq!(extract_node_id("tele//chem"), None);
        assert_eq!(extract_node_id("tele/node-a/sub/chem"), None);
        assert_eq!(extract_node_id(""), None);
    }

    // -- parse_switch_command -----------------------------------------------

    #[test]
    fn parse_switch_command_accepts_on_off_any_case() {
        assert_eq!(parse_switch_command(b"ON"), Ok(true));
        assert_eq!(parse_switch_command(b"off"), Ok(false));
        assert_eq!(parse_switch_command(b"  On \n"), Ok(true));
    }

    #[test]
    fn parse_switch_command_garbage() {
        assert!(parse_switch_command(b"TOGGLE").is_err());
        assert!(parse_switch_command(b"").is_err());
    }

    // -- decode --------------------------------------------------------------

    #[test]
    fn decode_chem_telemetry() {
        let payload = br#"{"ts":1767268800,"ph":5.92,"ec":1.31,"water_temp":20.4,"extra":"ignored"}"#;
        let Some(Inbound::Chem { node_id, snapshot }) = decode("tele/res-a/chem", payload).unwrap()
        else {
            panic!("expected chem telemetry");
        };
        assert_eq!(node_id, "res-a");
        assert_eq!(snapshot.ph, 5.92);
        assert_eq!(snapshot.ec, 1.31);
        assert_eq!(snapshot.captured_at.unix_timestamp(), 1767268800);
    }

    #[test]
    fn decode_chem_missing_field_fails() {
        assert!(decode("tele/res-a/chem", br#"{"ts":1,"ph":6.0}"#).is_err());
    }

    #[test]
    fn decode_auto_dosing_switch() {
        assert!(matches!(
            decode(AUTO_DOSING_TOPIC, b"OFF"),
            Ok(Some(Inbound::AutoDosing(false)))
        ));
        assert!(decode(AUTO_DOSING_TOPIC, b"maybe").is_err());
    }

    #[test]
    fn decode_ignores_other_topics() {
        assert!(matches!(decode("tele/res-a/status", b"online"), Ok(None)));
    }
}
