mod board;
mod line;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use std::{env, time::Duration};
use tokio::sync::mpsc;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use board::{parse_pin_map, RelayBoard};
use line::{format_completion, parse_command, Command, Lines, Rejected};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Env config
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env::var("MQTT_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1883);
    let controller: u32 = env::var("CONTROLLER_NUMBER")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1);
    let topic = env::var("CONTROLLER_TOPIC").unwrap_or_else(|_| "/back_yard".to_string());
    let ack_topic = env::var("ACK_TOPIC").unwrap_or_else(|_| "/relay_done".to_string());
    let pins = env::var("RELAY_PINS").unwrap_or_else(|_| "1:14,2:13,3:12".to_string());
    // Many common relay boards are active-low. If yours is active-high, set false.
    let active_low = env::var("RELAY_ACTIVE_LOW")
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);

    if !(1..=9).contains(&controller) {
        anyhow::bail!("CONTROLLER_NUMBER must be a single digit 1-9, got {controller}");
    }

    let lines = parse_pin_map(&pins).context("RELAY_PINS")?;
    let mut board = RelayBoard::new(&lines, active_low)?;
    board.all_off();

    let mut mqttoptions = MqttOptions::new(format!("irrigation-relay-{controller}"), broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));
    if let Ok(username) = env::var("MQTT_USERNAME") {
        mqttoptions.set_credentials(username, env::var("MQTT_PASSWORD").unwrap_or_default());
    }

    let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);
    let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(8);
    let (done_tx, mut done_rx) = mpsc::channel::<u32>(8);

    // Event loop: (re)subscribe on every CONNACK and forward commands.
    let subscriber = client.clone();
    let command_topic = topic.clone();
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(topic = %command_topic, "relay connected to mqtt");
                    if let Err(e) = subscriber.try_subscribe(command_topic.clone(), QoS::AtLeastOnce) {
                        warn!("subscribe failed: {e}");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(p))) if p.topic == command_topic => {
                    match parse_command(&p.payload) {
                        Some(cmd) => {
                            if cmd_tx.send(cmd).await.is_err() {
                                break;
                            }
                        }
                        None => warn!(
                            payload = %String::from_utf8_lossy(&p.payload),
                            "malformed relay command"
                        ),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("mqtt error: {e}. retrying...");
                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });

    // Completion publisher.
    let publisher = client.clone();
    tokio::spawn(async move {
        while let Some(relay) = done_rx.recv().await {
            let payload = format_completion(controller, relay);
            match publisher
                .publish(&ack_topic, QoS::AtLeastOnce, false, payload.clone())
                .await
            {
                Ok(()) => info!(relay, %payload, "completion published"),
                Err(e) => warn!(relay, "completion publish failed: {e}"),
            }
        }
    });

    info!(controller, %topic, lines = lines.len(), "relay controller ready");
    drive(cmd_rx, done_tx, &mut board).await;
    board.all_off();
    Ok(())
}

/// Apply commands to the board and report each line as it switches off.
/// Returns when the command channel closes.
async fn drive(
    mut commands: mpsc::Receiver<Command>,
    done: mpsc::Sender<u32>,
    board: &mut RelayBoard,
) {
    let mut lines = Lines::new();

    loop {
        let deadline = lines.deadline();
        tokio::select! {
            cmd = commands.recv() => {
                let Some(cmd) = cmd else { break };
                match lines.handle_command(cmd, board.has(cmd.relay), Instant::now()) {
                    Ok(_) => {
                        board.set(cmd.relay, true);
                        info!(relay = cmd.relay, duration_ms = cmd.duration.as_millis() as u64, "watering");
                    }
                    Err(Rejected::Busy { active }) => warn!(
                        relay = cmd.relay,
                        active,
                        "command rejected: another line is on"
                    ),
                    Err(Rejected::Unwired) => warn!(relay = cmd.relay, "command rejected: relay not wired"),
                }
            }
            _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                if let Some(relay) = lines.handle_expiry(Instant::now()) {
                    board.set(relay, false);
                    debug!(relay, "line off");
                    if done.send(relay).await.is_err() {
                        warn!(relay, "completion channel closed");
                    }
                }
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
