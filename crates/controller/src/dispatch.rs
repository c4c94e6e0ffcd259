//! Dispatch sequencer: waters eligible zones one at a time.
//!
//! Each zone walks its own small state machine. Zones are processed strictly
//! in ledger order and the next zone is never commanded before the previous
//! zone's full wait has elapsed, so at most one relay is ever on.
//!
//! ```text
//! Idle ──[eligible]──▶ Commanding ──[published]──▶ Waiting ──[deadline]──▶ Acknowledged
//!  │                                                                   └──▶ TimedOut
//!  └──[no demand / offline / no topic]──▶ Skipped
//! ```
//!
//! The wait is always the full `duration_ms / 1000 + margin` seconds, even when
//! the completion arrives early. Completions are received over a channel fed
//! by the transport listener while the sequencer waits.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::config::{DispatchConfig, MqttConfig};
use crate::error::RunResult;
use crate::ledger::Zone;
use crate::mqtt::{format_command, Completion};

// ---------------------------------------------------------------------------
// Transport seam
// ---------------------------------------------------------------------------

/// Outbound half of the messaging channel. Inbound completions arrive on the
/// `mpsc::Receiver<Completion>` handed out when the transport connects.
pub(crate) trait RelayBus {
    async fn publish(&self, topic: &str, payload: &str) -> RunResult<()>;

    /// Disconnect and stop the background listener.
    async fn shutdown(self);
}

// ---------------------------------------------------------------------------
// Settings and outcomes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub(crate) struct DispatchSettings {
    pub(crate) flow_rate_ms_per_gallon: f64,
    pub(crate) wait_margin: Duration,
    /// Controller number → publish topic.
    pub(crate) topics: HashMap<u32, String>,
}

impl DispatchSettings {
    pub(crate) fn new(dispatch: &DispatchConfig, mqtt: &MqttConfig) -> Self {
        Self {
            flow_rate_ms_per_gallon: dispatch.flow_rate_ms_per_gallon,
            wait_margin: Duration::from_secs(dispatch.wait_margin_secs),
            topics: mqtt
                .controllers
                .iter()
                .map(|c| (c.number, c.topic.clone()))
                .collect(),
        }
    }

    /// Relay on-time for `gallons`, truncated to whole milliseconds.
    pub(crate) fn duration_ms(&self, gallons: f64) -> u64 {
        (gallons * self.flow_rate_ms_per_gallon) as u64
    }

    /// How long the sequencer holds before checking for a completion.
    pub(crate) fn wait_for(&self, duration_ms: u64) -> Duration {
        Duration::from_secs(duration_ms / 1000) + self.wait_margin
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoDemand,
    Offline,
    NoTopic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Acknowledged,
    TimedOut,
    Skipped(SkipReason),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ZoneOutcome {
    pub zone: String,
    pub outcome: DispatchOutcome,
}

// ---------------------------------------------------------------------------
// Per-zone state machine
// ---------------------------------------------------------------------------

enum Phase {
    Idle,
    Commanding { topic: String, duration_ms: u64 },
    Waiting { deadline: Instant, acked: bool },
    Done(DispatchOutcome),
}

/// Dispatch every eligible zone in order. Zone states are updated in place
/// (`dispatched`, `acknowledged`) so a caller can still commit what was
/// watered if a publish fails part-way through.
pub(crate) async fn run_dispatch<B: RelayBus>(
    zones: &mut [Zone],
    bus: &B,
    acks: &mut mpsc::Receiver<Completion>,
    settings: &DispatchSettings,
) -> RunResult<Vec<ZoneOutcome>> {
    let mut outcomes = Vec::with_capacity(zones.len());

    for zone in zones.iter_mut() {
        let mut phase = Phase::Idle;
        let outcome = loop {
            phase = match phase {
                Phase::Idle => handle_idle(zone, settings),
                Phase::Commanding { topic, duration_ms } => {
                    handle_commanding(zone, &topic, duration_ms, bus, acks, settings).await?
                }
                Phase::Waiting { deadline, acked } => {
                    handle_waiting(zone, deadline, acked, acks).await
                }
                Phase::Done(outcome) => break outcome,
            };
        };

        outcomes.push(ZoneOutcome {
            zone: zone.config.name.clone(),
            outcome,
        });
    }

    Ok(outcomes)
}

/// Idle: decide whether the zone is commanded at all.
fn handle_idle(zone: &Zone, settings: &DispatchSettings) -> Phase {
    let name = &zone.config.name;
    if !zone.config.reachable() {
        debug!(zone = %name, "dispatch: controller or relay offline, skipping");
        return Phase::Done(DispatchOutcome::Skipped(SkipReason::Offline));
    }
    if !zone.eligible() {
        debug!(zone = %name, "dispatch: no demand, skipping");
        return Phase::Done(DispatchOutcome::Skipped(SkipReason::NoDemand));
    }
    let Some(topic) = settings.topics.get(&zone.config.controller_number) else {
        warn!(
            zone = %name,
            controller = zone.config.controller_number,
            "dispatch: no topic configured for controller, skipping"
        );
        return Phase::Done(DispatchOutcome::Skipped(SkipReason::NoTopic));
    };

    let duration_ms = settings.duration_ms(zone.state.computed_demand_gallons);
    if duration_ms == 0 {
        // Still commanded and recorded; the relay pulses on and straight off.
        debug!(
            zone = %name,
            gallons = zone.state.computed_demand_gallons,
            "dispatch: demand below one millisecond of flow, commanding 0 ms"
        );
    }
    Phase::Commanding {
        topic: topic.clone(),
        duration_ms,
    }
}

/// Commanding: publish the activation and start the wait window.
async fn handle_commanding<B: RelayBus>(
    zone: &mut Zone,
    topic: &str,
    duration_ms: u64,
    bus: &B,
    acks: &mut mpsc::Receiver<Completion>,
    settings: &DispatchSettings,
) -> RunResult<Phase> {
    // Anything already queued belongs to an earlier window.
    while let Ok(stale) = acks.try_recv() {
        debug!(
            controller = stale.controller,
            relay = stale.relay,
            "dispatch: discarding stale completion"
        );
    }

    let payload = format_command(zone.config.relay_number, duration_ms);
    bus.publish(topic, &payload).await?;
    zone.state.dispatched = true;

    let wait = settings.wait_for(duration_ms);
    info!(
        zone = %zone.config.name,
        relay = zone.config.relay_number,
        %topic,
        gallons = format!("{:.3}", zone.state.computed_demand_gallons),
        duration_ms,
        wait_secs = wait.as_secs(),
        "dispatch: relay commanded ON"
    );

    Ok(Phase::Waiting {
        deadline: Instant::now() + wait,
        acked: false,
    })
}

/// Waiting: collect completions until the deadline, then settle the outcome.
async fn handle_waiting(
    zone: &mut Zone,
    deadline: Instant,
    mut acked: bool,
    acks: &mut mpsc::Receiver<Completion>,
) -> Phase {
    let is_ours = |c: &Completion| {
        c.controller == zone.config.controller_number && c.relay == zone.config.relay_number
    };

    let mut channel_open = true;
    while channel_open {
        tokio::select! {
            biased;
            msg = acks.recv() => match msg {
                Some(c) if is_ours(&c) => acked = true,
                Some(c) => debug!(
                    controller = c.controller,
                    relay = c.relay,
                    "dispatch: completion for another zone ignored"
                ),
                None => channel_open = false,
            },
            _ = sleep_until(deadline) => break,
        }
    }
    if !channel_open {
        sleep_until(deadline).await;
    }
    while let Ok(c) = acks.try_recv() {
        acked |= is_ours(&c);
    }

    zone.state.acknowledged = acked;
    if acked {
        info!(zone = %zone.config.name, "dispatch: zone watered, completion received");
        Phase::Done(DispatchOutcome::Acknowledged)
    } else {
        warn!(
            zone = %zone.config.name,
            controller = zone.config.controller_number,
            relay = zone.config.relay_number,
            "dispatch: no completion before deadline (controller offline?)"
        );
        Phase::Done(DispatchOutcome::TimedOut)
    }
}

// ===========================================================================
// Tests
// ===========================================================================
