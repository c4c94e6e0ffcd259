//! Reduces a multi-day station report into total reference evapotranspiration
//! and total precipitation for the run.
//!
//! The station report is nested as `Data.Providers[0].Records[]`, each record
//! carrying `DayAsceEto.Value` and `DayPrecip.Value` as decimal strings.
//! Structural problems are *counted*, not returned early, so a single pass
//! reports everything wrong with the document. Any non-zero count is fatal
//! for the caller.

use serde_json::Value;
use tracing::{debug, warn};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Totals over the weather window, in inches.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct WeatherSummary {
    pub total_eto: f64,
    pub total_precip: f64,
}

/// One day of the station report, before any validation of its fields.
#[derive(Debug, Clone, PartialEq)]
pub struct RawDayRecord {
    pub date: Option<String>,
    pub eto: Option<Value>,
    pub precip: Option<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Aggregate {
    pub summary: WeatherSummary,
    pub error_count: usize,
}

// ---------------------------------------------------------------------------
// Envelope
// ---------------------------------------------------------------------------

/// Walk the report envelope down to its day records.
///
/// Returns the records that could be located along with the number of
/// envelope violations (missing or wrongly-typed `Data`, `Providers`,
/// provider, `Records`, or a record that is not an object).
pub fn decode_records(doc: &Value) -> (Vec<RawDayRecord>, usize) {
    let mut errors = 0;

    let data = doc.get("Data");
    if !data.is_some_and(Value::is_object) {
        warn!("weather: Data is not an object");
        errors += 1;
    }

    let providers = data.and_then(|d| d.get("Providers"));
    if !providers.is_some_and(Value::is_array) {
        warn!("weather: Providers is not an array");
        errors += 1;
    }

    let provider = providers.and_then(|p| p.get(0));
    if !provider.is_some_and(Value::is_object) {
        warn!("weather: first provider is not an object");
        errors += 1;
    }

    let records = provider
        .and_then(|p| p.get("Records"))
        .and_then(Value::as_array);
    let Some(records) = records else {
        warn!("weather: Records is not an array");
        return (Vec::new(), errors + 1);
    };

    let mut out = Vec::with_capacity(records.len());
    for (i, r) in records.iter().enumerate() {
        match r.as_object() {
            Some(obj) => out.push(RawDayRecord {
                date: obj.get("Date").and_then(Value::as_str).map(str::to_owned),
                eto: obj.get("DayAsceEto").cloned(),
                precip: obj.get("DayPrecip").cloned(),
            }),
            None => {
                warn!(index = i, "weather: record is not an object");
                errors += 1;
            }
        }
    }

    (out, errors)
}

// ---------------------------------------------------------------------------
// Aggregation
// ---------------------------------------------------------------------------

/// Sum ETo and precipitation across the window.
///
/// ETo is required on every day. A `null` precipitation value is expected for
/// the newest day (the station has not finalised it) and contributes zero
/// without being an error.
pub fn aggregate(records: &[RawDayRecord]) -> Aggregate {
    let mut summary = WeatherSummary::default();
    let mut error_count = 0;

    for r in records {
        let day = r.date.as_deref().unwrap_or("?");

        match field_value(r.eto.as_ref()) {
            Field::Number(v) => summary.total_eto += v,
            Field::Null | Field::Malformed => {
                warn!(day, "weather: ETo missing or malformed");
                error_count += 1;
            }
        }

        match field_value(r.precip.as_ref()) {
            Field::Number(v) => summary.total_precip += v,
            Field::Null => debug!(day, "weather: precipitation is null, counted as zero"),
            Field::Malformed => {
                warn!(day, "weather: precipitation malformed");
                error_count += 1;
            }
        }
    }

    Aggregate {
        summary,
        error_count,
    }
}

enum Field {
    Number(f64),
    Null,
    Malformed,
}

/// Read `{"Value": "<decimal>"}`. The wrapper object must be present and
/// `Value` must be an explicit null or a parseable decimal string.
fn field_value(wrapper: Option<&Value>) -> Field {
    let Some(obj) = wrapper.and_then(Value::as_object) else {
        return Field::Malformed;
    };
    match obj.get("Value") {
        Some(Value::Null) => Field::Null,
        Some(Value::String(s)) => match s.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => Field::Number(v),
            _ => Field::Malformed,
        },
        _ => Field::Malformed,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
