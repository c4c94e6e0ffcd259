//! Relay outputs via GPIO. The `gpio` feature gates the real rppal driver;
//! without it, a mock implementation only logs state changes.

use anyhow::Result;
use std::collections::BTreeMap;

#[cfg(feature = "gpio")]
use anyhow::Context;
#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

// ---------------------------------------------------------------------------
// Real GPIO relay board (requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub(crate) struct RelayBoard {
    pins: BTreeMap<u32, OutputPin>, // relay number -> GPIO pin
    active_low: bool,
}

#[cfg(feature = "gpio")]
impl RelayBoard {
    pub(crate) fn new(lines: &[(u32, u8)], active_low: bool) -> Result<Self> {
        let gpio = Gpio::new().context("opening GPIO")?;
        let mut pins = BTreeMap::new();

        for &(relay, pin_num) in lines {
            let mut pin = gpio
                .get(pin_num)
                .with_context(|| format!("relay {relay}: gpio {pin_num}"))?
                .into_output();

            // Start with every line off.
            if active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }
            pins.insert(relay, pin);
        }

        tracing::info!(lines = pins.len(), active_low, "relay board initialised");
        Ok(Self { pins, active_low })
    }

    pub(crate) fn has(&self, relay: u32) -> bool {
        self.pins.contains_key(&relay)
    }

    pub(crate) fn set(&mut self, relay: u32, on: bool) {
        let Some(pin) = self.pins.get_mut(&relay) else {
            tracing::warn!(relay, "unknown relay line");
            return;
        };
        // active-low: LOW = ON, HIGH = OFF
        if on != self.active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        tracing::info!(relay, "relay set {}", if on { "ON" } else { "OFF" });
    }

    pub(crate) fn all_off(&mut self) {
        let relays: Vec<u32> = self.pins.keys().copied().collect();
        for r in relays {
            self.set(r, false);
        }
    }
}

// ---------------------------------------------------------------------------
// Mock relay board (development: no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub(crate) struct RelayBoard {
    pub(super) lines: BTreeMap<u32, bool>, // relay number -> on/off
}

#[cfg(not(feature = "gpio"))]
impl RelayBoard {
    pub(crate) fn new(lines: &[(u32, u8)], _active_low: bool) -> Result<Self> {
        let mut map = BTreeMap::new();
        for &(relay, pin_num) in lines {
            tracing::info!(relay, gpio = pin_num, "[mock-gpio] registered relay (not wired)");
            map.insert(relay, false);
        }
        tracing::info!("[mock-gpio] relay board initialised (no hardware)");
        Ok(Self { lines: map })
    }

    pub(crate) fn has(&self, relay: u32) -> bool {
        self.lines.contains_key(&relay)
    }

    pub(crate) fn set(&mut self, relay: u32, on: bool) {
        if let Some(state) = self.lines.get_mut(&relay) {
            *state = on;
            tracing::info!(relay, "[mock-gpio] relay set {}", if on { "ON" } else { "OFF" });
        } else {
            tracing::warn!(relay, "[mock-gpio] unknown relay line");
        }
    }

    pub(crate) fn all_off(&mut self) {
        for state in self.lines.values_mut() {
            *state = false;
        }
        tracing::info!("[mock-gpio] all relays OFF");
    }
}

/// Parse `RELAY_PINS`: comma-separated `relay:gpio` pairs, e.g. `"1:14,2:13,3:12"`.
pub(crate) fn parse_pin_map(pins: &str) -> Result<Vec<(u32, u8)>> {
    let mut lines = Vec::new();
    for pair in pins.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let Some((relay, pin)) = pair.split_once(':') else {
            anyhow::bail!("bad relay pin entry '{pair}', expected relay:gpio");
        };
        let relay: u32 = relay
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("bad relay number in '{pair}'"))?;
        let pin: u8 = pin
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("bad gpio number in '{pair}'"))?;
        if relay == 0 {
            anyhow::bail!("relay 0 is reserved for offline zones ('{pair}')");
        }
        if lines.iter().any(|&(r, _)| r == relay) {
            anyhow::bail!("relay {relay} mapped twice");
        }
        lines.push((relay, pin));
    }
    if lines.is_empty() {
        anyhow::bail!("no relay lines configured");
    }
    Ok(lines)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- parse_pin_map ------------------------------------------------------

    #[test]
    fn pin_map_parses_pairs() {
        assert_eq!(
            parse_pin_map("1:14, 2:13,3:12").unwrap(),
            vec![(1, 14), (2, 13), (3, 12)]
        );
    }

    #[test]
    fn pin_map_rejects_relay_zero() {
        assert!(parse_pin_map("0:14").is_err());
    }

    #[test]
    fn pin_map_rejects_duplicates() {
        let err = parse_pin_map("1:14,1:13").unwrap_err();
        assert!(err.to_string().contains("mapped twice"));
    }

    #[test]
    fn pin_map_rejects_garbage() {
        assert!(parse_pin_map("1-14").is_err());
        assert!(parse_pin_map("x:14").is_err());
        assert!(parse_pin_map("1:300").is_err());
        assert!(parse_pin_map("").is_err());
    }

    // -- RelayBoard (mock) --------------------------------------------------

    #[cfg(not(feature = "gpio"))]
    #[test]
    fn board_starts_all_off() {
        let board = RelayBoard::new(&[(1, 14), (2, 13)], true).unwrap();
        assert_eq!(board.lines.len(), 2);
        assert!(board.lines.values().all(|on| !on));
    }

    #[cfg(not(feature = "gpio"))]
    #[test]
    fn board_set_and_all_off() {
        let mut board = RelayBoard::new(&[(1, 14), (2, 13)], true).unwrap();
        board.set(2, true);
        assert!(board.lines[&2]);
        assert!(!board.lines[&1]);
        board.all_off();
        assert!(!board.lines[&2]);
    }

    #[cfg(not(feature = "gpio"))]
    #[test]
    fn board_unknown_relay_is_ignored() {
        let mut board = RelayBoard::new(&[(1, 14)], true).unwrap();
        board.set(7, true);
        assert!(!board.has(7));
        assert_eq!(board.lines.len(), 1);
    }
}
