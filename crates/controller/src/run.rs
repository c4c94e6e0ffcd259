//! One end-to-end irrigation run: weather → demand → dispatch → ledger.

use std::future::Future;

use serde_json::Value;
use time::PrimitiveDateTime;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::demand::Coefficients;
use crate::dispatch::{run_dispatch, DispatchOutcome, DispatchSettings, RelayBus, ZoneOutcome};
use crate::error::{RunError, RunResult};
use crate::ledger::{Ledger, Zone};
use crate::mqtt::{Completion, MqttBus};
use crate::source::{WeatherClient, WeatherWindow};
use crate::weather::{aggregate, decode_records};

#[derive(Debug, Default)]
pub struct RunReport {
    pub outcomes: Vec<ZoneOutcome>,
    /// Zones whose ledger entry was advanced.
    pub watered: usize,
    /// False when the ledger could not be rewritten after watering.
    pub ledger_persisted: bool,
}

impl RunReport {
    pub fn acknowledged(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.outcome == DispatchOutcome::Acknowledged)
            .count()
    }

    pub fn timed_out(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.outcome == DispatchOutcome::TimedOut)
            .count()
    }
}

/// Run once against live services. `run_at` is the local wall-clock time of
/// the run; it dates the weather window and the ledger entries.
pub async fn run_once(cfg: &Config, run_at: PrimitiveDateTime) -> RunResult<RunReport> {
    let window = WeatherWindow::ending_before(run_at.date(), cfg.weather.window_days);
    let report = WeatherClient::new(&cfg.weather)?
        .fetch_or_load(&window)
        .await?;

    let mut ledger = Ledger::load(&cfg.ledger.path)?;
    info!(path = %cfg.ledger.path.display(), zones = ledger.len(), "ledger loaded");
    let zones = plan(&report, &ledger, run_at, &cfg.demand)?;

    let settings = DispatchSettings::new(&cfg.dispatch, &cfg.mqtt);
    execute(zones, &mut ledger, run_at, &settings, || MqttBus::connect(&cfg.mqtt)).await
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// Aggregate the weather report and compute every zone's demand. Any weather
/// error aborts the run before a single relay is touched.
pub(crate) fn plan(
    report: &Value,
    ledger: &Ledger,
    run_at: PrimitiveDateTime,
    coefficients: &Coefficients,
) -> RunResult<Vec<Zone>> {
    let (records, envelope_errors) = decode_records(report);
    let agg = aggregate(&records);
    let errors = envelope_errors + agg.error_count;
    if errors > 0 {
        return Err(RunError::DataIntegrity(format!(
            "weather report has {errors} error{}",
            if errors == 1 { "" } else { "s" }
        )));
    }

    let summary = agg.summary;
    info!(
        days = records.len(),
        eto = format!("{:.2}", summary.total_eto),
        precip = format!("{:.2}", summary.total_precip),
        effective_precip_gal = format!("{:.3}", coefficients.effective_precip(&summary)),
        "weather aggregated"
    );

    let mut zones = ledger.zones(run_at, coefficients.credit_window_days);
    for zone in &mut zones {
        zone.state.computed_demand_gallons =
            coefficients.compute_demand(&summary, &zone.config, &zone.state);
        info!(
            zone = %zone.config.name,
            pf = zone.config.plant_factor,
            la = zone.config.landscape_area_sq_ft,
            days_since = format!("{:.2}", zone.state.days_since_irrigation),
            credit_gal = format!("{:.3}", coefficients.effective_irrigation(&zone.state)),
            demand_gal = format!("{:.3}", zone.state.computed_demand_gallons),
            online = zone.config.reachable(),
            "zone demand"
        );
    }
    Ok(zones)
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Connect (only when something needs water), dispatch, disconnect, and
/// commit. A publish failure part-way through still commits the zones that
/// were already commanded before the error is returned.
pub(crate) async fn execute<B, C, Fut>(
    mut zones: Vec<Zone>,
    ledger: &mut Ledger,
    run_at: PrimitiveDateTime,
    settings: &DispatchSettings,
    connect: C,
) -> RunResult<RunReport>
where
    B: RelayBus,
    C: FnOnce() -> Fut,
    Fut: Future<Output = RunResult<(B, mpsc::Receiver<Completion>)>>,
{
    if !zones.iter().any(Zone::eligible) {
        info!("no zone needs water today, not connecting");
        return Ok(RunReport {
            ledger_persisted: true,
            ..RunReport::default()
        });
    }

    let (bus, mut acks) = connect().await?;
    let dispatched = run_dispatch(&mut zones, &bus, &mut acks, settings).await;
    bus.shutdown().await;

    let (watered, ledger_persisted) = match ledger.commit(&zones, run_at) {
        Ok(n) => (n, true),
        Err(e) => {
            error!("{e}");
            (0, false)
        }
    };

    let outcomes = match dispatched {
        Ok(outcomes) => outcomes,
        Err(e) => {
            warn!(watered, "dispatch aborted after committing watered zones");
            return Err(e);
        }
    };

    let report = RunReport {
        outcomes,
        watered,
        ledger_persisted,
    };
    info!(
        zones = report.outcomes.len(),
        acknowledged = report.acknowledged(),
        timed_out = report.timed_out(),
        watered = report.watered,
        "run complete"
    );
    Ok(report)
}

// ===========================================================================
// Tests
// ===========================================================================
