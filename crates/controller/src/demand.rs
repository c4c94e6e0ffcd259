//! Per-zone water deficit, in gallons.
//!
//! ```text
//! effective_precip     = total_precip * precip_effectiveness * inches_to_gallons
//! effective_irrigation = last_gallons * irrigation_efficiency   (within credit window, else 0)
//! demand               = max(total_eto * PF * LA * inches_to_gallons
//!                            - effective_precip - effective_irrigation, 0)
//! ```

use serde::Deserialize;

use crate::ledger::{ZoneConfig, ZoneState};
use crate::weather::WeatherSummary;

/// Domain constants of the deficit formula. Fixed in production, but kept as
/// data so tests and sites with different hardware can override them.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct Coefficients {
    /// Inches of water over one square foot, in gallons.
    pub inches_to_gallons: f64,
    /// Fraction of rainfall the plants actually get (runoff/evaporation derate).
    pub precip_effectiveness: f64,
    /// Drip delivery efficiency applied to the previous irrigation.
    pub irrigation_efficiency: f64,
    /// Irrigation older than this many days earns no credit.
    pub credit_window_days: f64,
}

impl Default for Coefficients {
    fn default() -> Self {
        Self {
            inches_to_gallons: 0.623,
            precip_effectiveness: 0.5,
            irrigation_efficiency: 0.7,
            credit_window_days: 7.0,
        }
    }
}

impl Coefficients {
    pub fn effective_precip(&self, summary: &WeatherSummary) -> f64 {
        summary.total_precip * self.precip_effectiveness * self.inches_to_gallons
    }

    pub fn effective_irrigation(&self, state: &ZoneState) -> f64 {
        if state.days_since_irrigation <= self.credit_window_days {
            state.last_gallons_applied * self.irrigation_efficiency
        } else {
            0.0
        }
    }

    /// Gallons the zone needs today. Never negative: zero means no watering.
    pub fn compute_demand(
        &self,
        summary: &WeatherSummary,
        zone: &ZoneConfig,
        state: &ZoneState,
    ) -> f64 {
        let raw = summary.total_eto * zone.plant_factor * zone.landscape_area_sq_ft
            * self.inches_to_gallons
            - self.effective_precip(summary)
            - self.effective_irrigation(state);

        if raw > 0.0 {
            raw
        } else {
            0.0
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
