//! The irrigation ledger: one JSON document holding every zone's parameters
//! and its most recent irrigation (date and gallons).
//!
//! ```json
//! { "Data": [ { "Name": "Tomatoes", "PF": "0.8", "LA": 96, "Relay": 2,
//!               "Controller": 1, "Date": "2024-07-14 06:00:00", "Gallons": "18.4" } ] }
//! ```
//!
//! The raw document is kept alongside the typed view so fields this crate does
//! not know about survive the rewrite.

use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use time::macros::format_description;
use time::PrimitiveDateTime;
use tracing::{debug, info};

use crate::error::{RunError, RunResult};

const DATE_FORMAT: &[time::format_description::BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Static zone parameters. Relay or controller number 0 marks the zone offline.
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneConfig {
    pub name: String,
    pub plant_factor: f64,
    pub landscape_area_sq_ft: f64,
    pub relay_number: u32,
    pub controller_number: u32,
}

impl ZoneConfig {
    pub fn reachable(&self) -> bool {
        self.relay_number > 0 && self.controller_number > 0
    }
}

/// Per-run mutable state of a zone.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ZoneState {
    pub days_since_irrigation: f64,
    pub last_gallons_applied: f64,
    pub computed_demand_gallons: f64,
    pub dispatched: bool,
    pub acknowledged: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Zone {
    pub config: ZoneConfig,
    pub state: ZoneState,
}

impl Zone {
    pub fn eligible(&self) -> bool {
        self.config.reachable() && self.state.computed_demand_gallons > 0.0
    }
}

#[derive(Debug, Clone)]
struct Entry {
    config: ZoneConfig,
    last_irrigated: PrimitiveDateTime,
    last_gallons: f64,
}

pub struct Ledger {
    path: PathBuf,
    doc: Value,
    entries: Vec<Entry>,
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

impl Ledger {
    /// Read and validate the whole ledger. Every malformed entry is reported
    /// in a single `DataIntegrity` error.
    pub fn load(path: impl AsRef<Path>) -> RunResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| {
            RunError::DataIntegrity(format!("cannot read ledger {}: {e}", path.display()))
        })?;
        let doc: Value = serde_json::from_str(&contents).map_err(|e| {
            RunError::DataIntegrity(format!("cannot parse ledger {}: {e}", path.display()))
        })?;
        Self::from_document(path, doc)
    }

    fn from_document(path: &Path, doc: Value) -> RunResult<Self> {
        let Some(data) = doc.get("Data").and_then(Value::as_array) else {
            return Err(RunError::DataIntegrity(format!(
                "ledger {}: Data is not an array",
                path.display()
            )));
        };

        let mut errors: Vec<String> = Vec::new();
        let mut entries = Vec::with_capacity(data.len());
        for (i, item) in data.iter().enumerate() {
            match parse_entry(item) {
                Ok(e) => entries.push(e),
                Err(msg) => errors.push(format!("Data[{i}]: {msg}")),
            }
        }

        if !errors.is_empty() {
            return Err(RunError::DataIntegrity(format!(
                "ledger {} has {} invalid entr{}:\n  - {}",
                path.display(),
                errors.len(),
                if errors.len() == 1 { "y" } else { "ies" },
                errors.join("\n  - ")
            )));
        }

        debug!(path = %path.display(), zones = entries.len(), "ledger loaded");
        Ok(Self {
            path: path.to_path_buf(),
            doc,
            entries,
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Build the run's zone list, in ledger order.
    ///
    /// Irrigation older than `credit_window_days` (or dated in the future) is
    /// not trusted: the zone starts as if never irrigated this cycle.
    pub fn zones(&self, run_at: PrimitiveDateTime, credit_window_days: f64) -> Vec<Zone> {
        self.entries
            .iter()
            .map(|e| {
                let days = (run_at - e.last_irrigated).as_seconds_f64() / 86_400.0;
                let state = if (0.0..=credit_window_days).contains(&days) {
                    ZoneState {
                        days_since_irrigation: days,
                        last_gallons_applied: e.last_gallons,
                        ..ZoneState::default()
                    }
                } else {
                    ZoneState::default()
                };
                Zone {
                    config: e.config.clone(),
                    state,
                }
            })
            .collect()
    }

    // -----------------------------------------------------------------------
    // Commit
    // -----------------------------------------------------------------------

    /// Record `{Date: run_at, Gallons: demand}` for every zone that was
    /// actually commanded, then atomically rewrite the file. `zones` must be
    /// the list returned by [`Ledger::zones`]. Returns how many entries moved.
    pub fn commit(&mut self, zones: &[Zone], run_at: PrimitiveDateTime) -> RunResult<usize> {
        let date = run_at
            .format(DATE_FORMAT)
            .map_err(|e| RunError::LedgerWrite(format!("cannot format run date: {e}")))?;

        let mut advanced = 0;
        if let Some(data) = self.doc.get_mut("Data").and_then(Value::as_array_mut) {
            for (i, zone) in zones.iter().enumerate() {
                if !zone.state.dispatched || !zone.config.reachable() {
                    continue;
                }
                let (Some(item), Some(entry)) = (
                    data.get_mut(i).and_then(Value::as_object_mut),
                    self.entries.get_mut(i),
                ) else {
                    continue;
                };
                let gallons = zone.state.computed_demand_gallons;
                let stored = gallons_value(item, gallons);
                item.insert("Date".into(), Value::String(date.clone()));
                item.insert("Gallons".into(), stored);
                entry.last_irrigated = run_at;
                entry.last_gallons = gallons;
                advanced += 1;
            }
        }

        self.persist()?;
        info!(path = %self.path.display(), advanced, "ledger committed");
        Ok(advanced)
    }

    fn persist(&self) -> RunResult<()> {
        let body = serde_json::to_string_pretty(&self.doc)
            .map_err(|e| RunError::LedgerWrite(format!("cannot encode ledger: {e}")))?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "ledger.json".to_string());
        let tmp = self.path.with_file_name(format!("{file_name}.tmp"));

        fs::write(&tmp, body)
            .map_err(|e| RunError::LedgerWrite(format!("{}: {e}", tmp.display())))?;
        fs::rename(&tmp, &self.path)
            .map_err(|e| RunError::LedgerWrite(format!("{}: {e}", self.path.display())))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn parse_entry(item: &Value) -> Result<Entry, String> {
    let obj = item.as_object().ok_or("entry is not an object")?;

    let name = obj
        .get("Name")
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
        .ok_or("Name missing or empty")?
        .to_string();

    let plant_factor = number(obj, "PF")?.ok_or("PF missing")?;
    let landscape_area_sq_ft = number(obj, "LA")?.ok_or("LA missing")?;
    if plant_factor < 0.0 || landscape_area_sq_ft < 0.0 {
        return Err(format!("{name}: PF and LA must not be negative"));
    }

    // Missing identifiers read as 0, i.e. an offline zone.
    let relay_number = identifier(obj, "Relay")?;
    let controller_number = identifier(obj, "Controller")?;

    let date = obj
        .get("Date")
        .and_then(Value::as_str)
        .ok_or("Date missing")?;
    let last_irrigated = PrimitiveDateTime::parse(date, DATE_FORMAT)
        .map_err(|e| format!("Date '{date}' is not YYYY-MM-DD HH:MM:SS: {e}"))?;

    let last_gallons = number(obj, "Gallons")?.unwrap_or(0.0);

    Ok(Entry {
        config: ZoneConfig {
            name,
            plant_factor,
            landscape_area_sq_ft,
            relay_number,
            controller_number,
        },
        last_irrigated,
        last_gallons,
    })
}

/// A JSON number or a decimal string. `Ok(None)` when absent or null.
fn number(obj: &Map<String, Value>, key: &str) -> Result<Option<f64>, String> {
    let v = match obj.get(key) {
        None | Some(Value::Null) => return Ok(None),
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        Some(_) => None,
    };
    match v {
        Some(v) if v.is_finite() => Ok(Some(v)),
        _ => Err(format!("{key} is not a number")),
    }
}

fn identifier(obj: &Map<String, Value>, key: &str) -> Result<u32, String> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(0),
        Some(Value::Number(n)) => n
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .ok_or_else(|| format!("{key} must be a non-negative integer")),
        Some(Value::String(s)) => s
            .trim()
            .parse::<u32>()
            .map_err(|_| format!("{key} must be a non-negative integer")),
        Some(_) => Err(format!("{key} must be a non-negative integer")),
    }
}

/// Keep `Gallons` in the representation it was stored in.
fn gallons_value(item: &Map<String, Value>, gallons: f64) -> Value {
    match item.get("Gallons") {
        Some(Value::Number(_)) => serde_json::Number::from_f64(gallons)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        _ => Value::String(format!("{gallons:.6}")),
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;
    use time::macros::datetime;

    const RUN_AT: PrimitiveDateTime = datetime!(2024-07-15 06:00:00);

    fn write_ledger(dir: &TempDir, doc: &Value) -> PathBuf {
        let path = dir.path().join("irrigation.json");
        fs::write(&path, serde_json::to_string_pretty(doc).unwrap()).unwrap();
        path
    }

    fn sample() -> Value {
        json!({ "Data": [
            { "Name": "Tomatoes", "PF": "0.8", "LA": 96, "Relay": 2, "Controller": 1,
              "Date": "2024-07-13 06:00:00", "Gallons": "40.000000", "Notes": "raised bed" },
            { "Name": "Lawn", "PF": 1.0, "LA": 400, "Relay": 0, "Controller": 0,
              "Date": "2024-07-01 06:00:00", "Gallons": 12.5 },
            { "Name": "Roses", "PF": "0.5", "LA": "30", "Relay": "3", "Controller": "1",
              "Date": "2024-07-01 06:00:00", "Gallons": "90.0" },
        ]})
    }

    // -- load ---------------------------------------------------------------

    #[test]
    fn load_parses_mixed_representations() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::load(write_ledger(&dir, &sample())).unwrap();
        assert_eq!(ledger.len(), 3);

        let zones = ledger.zones(RUN_AT, 7.0);
        assert_eq!(zones[0].config.name, "Tomatoes");
        assert!((zones[0].config.plant_factor - 0.8).abs() < 1e-9);
        assert_eq!(zones[2].config.relay_number, 3);
        assert!((zones[2].config.landscape_area_sq_ft - 30.0).abs() < 1e-9);
        assert!(!zones[1].config.reachable());
    }

    #[test]
    fn load_missing_file_is_data_integrity_error() {
        let dir = TempDir::new().unwrap();
        let err = Ledger::load(dir.path().join("nope.json")).err().unwrap();
        assert!(matches!(err, RunError::DataIntegrity(_)));
    }

    #[test]
    fn load_invalid_json_is_data_integrity_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("irrigation.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(Ledger::load(&path), Err(RunError::DataIntegrity(_))));
    }

    #[test]
    fn load_data_not_array_rejected() {
        let dir = TempDir::new().unwrap();
        let path = write_ledger(&dir, &json!({ "Data": {} }));
        let err = Ledger::load(path).err().unwrap();
        assert!(err.to_string().contains("Data is not an array"));
    }

    #[test]
    fn load_collects_every_bad_entry() {
        let dir = TempDir::new().unwrap();
        let doc = json!({ "Data": [
            { "Name": "", "PF": "0.8", "LA": 1, "Date": "2024-07-13 06:00:00" },
            { "Name": "B", "PF": "x", "LA": 1, "Date": "2024-07-13 06:00:00" },
            { "Name": "C", "PF": "1", "LA": 1, "Date": "13/07/2024" },
            { "Name": "D", "PF": "1", "LA": 1, "Relay": -1, "Date": "2024-07-13 06:00:00" },
        ]});
        let msg = Ledger::load(write_ledger(&dir, &doc)).err().unwrap().to_string();
        assert!(msg.contains("4 invalid entries"), "{msg}");
        assert!(msg.contains("Name missing"), "{msg}");
        assert!(msg.contains("PF is not a number"), "{msg}");
        assert!(msg.contains("is not YYYY-MM-DD HH:MM:SS"), "{msg}");
        assert!(msg.contains("Relay must be a non-negative integer"), "{msg}");
    }

    #[test]
    fn missing_identifiers_mean_offline() {
        let dir = TempDir::new().unwrap();
        let doc = json!({ "Data": [
            { "Name": "A", "PF": "1", "LA": 1, "Date": "2024-07-13 06:00:00" },
        ]});
        let ledger = Ledger::load(write_ledger(&dir, &doc)).unwrap();
        let zones = ledger.zones(RUN_AT, 7.0);
        assert_eq!(zones[0].config.relay_number, 0);
        assert_eq!(zones[0].config.controller_number, 0);
        assert_eq!(zones[0].state.last_gallons_applied, 0.0);
    }

    // -- zone state ---------------------------------------------------------

    #[test]
    fn recent_history_is_carried() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::load(write_ledger(&dir, &sample())).unwrap();
        let zones = ledger.zones(RUN_AT, 7.0);
        assert!((zones[0].state.days_since_irrigation - 2.0).abs() < 1e-9);
        assert!((zones[0].state.last_gallons_applied - 40.0).abs() < 1e-9);
    }

    #[test]
    fn stale_history_is_discarded() {
        let dir = TempDir::new().unwrap();
        let ledger = Ledger::load(write_ledger(&dir, &sample())).unwrap();
        let zones = ledger.zones(RUN_AT, 7.0);
        // Roses were last watered 14 days before the run.
        assert_eq!(zones[2].state, ZoneState::default());
    }

    #[test]
    fn future_dated_history_is_discarded() {
        let dir = TempDir::new().unwrap();
        let doc = json!({ "Data": [
            { "Name": "A", "PF": "1", "LA": 1, "Date": "2024-08-01 00:00:00", "Gallons": "5" },
        ]});
        let ledger = Ledger::load(write_ledger(&dir, &doc)).unwrap();
        assert_eq!(ledger.zones(RUN_AT, 7.0)[0].state, ZoneState::default());
    }

    // -- commit -------------------------------------------------------------

    #[test]
    fn commit_advances_only_dispatched_reachable_zones() {
        let dir = TempDir::new().unwrap();
        let path = write_ledger(&dir, &sample());
        let mut ledger = Ledger::load(&path).unwrap();
        let mut zones = ledger.zones(RUN_AT, 7.0);

        zones[0].state.computed_demand_gallons = 18.417;
        zones[0].state.dispatched = true;
        // Offline zone: flagged dispatched must still be ignored.
        zones[1].state.computed_demand_gallons = 50.0;
        zones[1].state.dispatched = true;
        // Reachable but nothing commanded.
        zones[2].state.computed_demand_gallons = 0.0;

        assert_eq!(ledger.commit(&zones, RUN_AT).unwrap(), 1);

        let written: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let data = written["Data"].as_array().unwrap();
        assert_eq!(data[0]["Date"], "2024-07-15 06:00:00");
        assert_eq!(data[0]["Gallons"], "18.417000");
        assert_eq!(data[0]["Notes"], "raised bed");
        assert_eq!(data[1], sample()["Data"][1]);
        assert_eq!(data[2], sample()["Data"][2]);
    }

    #[test]
    fn commit_keeps_numeric_gallons_numeric() {
        let dir = TempDir::new().unwrap();
        let doc = json!({ "Data": [
            { "Name": "A", "PF": 1.0, "LA": 10, "Relay": 1, "Controller": 1,
              "Date": "2024-07-13 06:00:00", "Gallons": 3.0 },
        ]});
        let path = write_ledger(&dir, &doc);
        let mut ledger = Ledger::load(&path).unwrap();
        let mut zones = ledger.zones(RUN_AT, 7.0);
        zones[0].state.computed_demand_gallons = 2.5;
        zones[0].state.dispatched = true;
        ledger.commit(&zones, RUN_AT).unwrap();

        let written: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(written["Data"][0]["Gallons"], json!(2.5));
    }

    #[test]
    fn commit_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let path = write_ledger(&dir, &sample());
        let mut ledger = Ledger::load(&path).unwrap();
        let zones = ledger.zones(RUN_AT, 7.0);
        ledger.commit(&zones, RUN_AT).unwrap();
        assert!(!dir.path().join("irrigation.json.tmp").exists());
    }

    #[test]
    fn committed_ledger_reloads_with_fresh_history() {
        let dir = TempDir::new().unwrap();
        let path = write_ledger(&dir, &sample());
        let mut ledger = Ledger::load(&path).unwrap();
        let mut zones = ledger.zones(RUN_AT, 7.0);
        zones[2].state.computed_demand_gallons = 12.0;
        zones[2].state.dispatched = true;
        ledger.commit(&zones, RUN_AT).unwrap();

        let next_day = datetime!(2024-07-16 06:00:00);
        let reloaded = Ledger::load(&path).unwrap().zones(next_day, 7.0);
        assert!((reloaded[2].state.days_since_irrigation - 1.0).abs() < 1e-9);
        assert!((reloaded[2].state.last_gallons_applied - 12.0).abs() < 1e-9);
    }

    #[test]
    fn commit_to_missing_directory_is_write_error() {
        let dir = TempDir::new().unwrap();
        let path = write_ledger(&dir, &sample());
        let mut ledger = Ledger::load(&path).unwrap();
        ledger.path = dir.path().join("gone").join("irrigation.json");
        let zones = ledger.zones(RUN_AT, 7.0);
        assert!(matches!(
            ledger.commit(&zones, RUN_AT),
            Err(RunError::LedgerWrite(_))
        ));
    }
}
