mod config;
mod demand;
mod dispatch;
mod error;
mod ledger;
mod mqtt;
mod run;
mod source;
mod weather;

use std::env;
use std::process::ExitCode;

use time::{OffsetDateTime, PrimitiveDateTime};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ── Config file ─────────────────────────────────────────────────
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "irrigation.toml".to_string());
    let cfg = match config::load(&config_path) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::FAILURE;
        }
    };

    // ── Run date ────────────────────────────────────────────────────
    // The local offset can only be read soundly while the process is
    // single-threaded, so it is captured before the runtime starts.
    let now = OffsetDateTime::now_local().unwrap_or_else(|e| {
        warn!("local offset unavailable ({e}), dating the run in UTC");
        OffsetDateTime::now_utc()
    });
    let run_at = PrimitiveDateTime::new(now.date(), now.time()).replace_nanosecond(0);
    let run_at = match run_at {
        Ok(t) => t,
        Err(e) => {
            error!("cannot truncate run time: {e}");
            return ExitCode::FAILURE;
        }
    };

    // ── Run ─────────────────────────────────────────────────────────
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!("failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    info!(%run_at, "irrigation run starting");
    match runtime.block_on(run::run_once(&cfg, run_at)) {
        Ok(report) if report.ledger_persisted => {
            info!(watered = report.watered, "irrigation run finished");
            ExitCode::SUCCESS
        }
        Ok(report) => {
            error!(
                watered = report.acknowledged() + report.timed_out(),
                "watering done, ledger not persisted"
            );
            ExitCode::FAILURE
        }
        Err(e) if e.aborted_before_dispatch() => {
            error!("run aborted, no relay was commanded: {e}");
            ExitCode::FAILURE
        }
        Err(e) => {
            error!("run failed during dispatch: {e}");
            ExitCode::FAILURE
        }
    }
}
