//! Relay line state machine: at most one line is ever on.
//!
//! ```text
//! Off ──[command r, ms]──▶ On { r, until } ──[until reached]──▶ Off (publish "<controller><r>")
//!                           │  ▲
//!                           └──┘ [command r again: timer restarts]
//! ```
//!
//! A command for another line while one is on is rejected.

use std::time::Duration;

use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LineState {
    Off,
    On { relay: u32, until: Instant },
}

/// Activation command `"<relay> <duration_ms>"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Command {
    pub(crate) relay: u32,
    pub(crate) duration: Duration,
}

pub(crate) fn parse_command(payload: &[u8]) -> Option<Command> {
    let s = std::str::from_utf8(payload).ok()?.trim();
    let (relay, ms) = s.split_once(' ')?;
    let relay: u32 = relay.parse().ok()?;
    let ms: u64 = ms.trim().parse().ok()?;
    (relay > 0).then(|| Command {
        relay,
        duration: Duration::from_millis(ms),
    })
}

/// Completion payload: controller digit followed by the relay number.
pub(crate) fn format_completion(controller: u32, relay: u32) -> String {
    format!("{controller}{relay}")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Rejected {
    /// Another line is still watering.
    Busy { active: u32 },
    /// The relay number has no output on this board.
    Unwired,
}

#[derive(Debug)]
pub(crate) struct Lines {
    state: LineState,
}

impl Lines {
    pub(crate) fn new() -> Self {
        Self {
            state: LineState::Off,
        }
    }

    pub(crate) fn state(&self) -> LineState {
        self.state
    }

    /// Apply a command at `now`. `wired` tells whether the board has the line.
    pub(crate) fn handle_command(
        &mut self,
        cmd: Command,
        wired: bool,
        now: Instant,
    ) -> Result<LineState, Rejected> {
        if !wired {
            return Err(Rejected::Unwired);
        }
        match self.state {
            LineState::On { relay, .. } if relay != cmd.relay => {
                Err(Rejected::Busy { active: relay })
            }
            LineState::Off | LineState::On { .. } => {
                self.state = LineState::On {
                    relay: cmd.relay,
                    until: now + cmd.duration,
                };
                Ok(self.state)
            }
        }
    }

    /// When the active line is due to switch off.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        match self.state {
            LineState::On { until, .. } => Some(until),
            LineState::Off => None,
        }
    }

    /// Switch off the active line if its time is up, returning its number.
    pub(crate) fn handle_expiry(&mut self, now: Instant) -> Option<u32> {
        match self.state {
            LineState::On { relay, until } if now >= until => {
                self.state = LineState::Off;
                Some(relay)
            }
            _ => None,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
