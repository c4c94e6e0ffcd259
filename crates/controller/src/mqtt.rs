use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::config::MqttConfig;
use crate::dispatch::RelayBus;
use crate::error::{RunError, RunResult};

/// Capacity of the completion channel between the listener and the sequencer.
const ACK_CHANNEL_CAPACITY: usize = 16;

// ---------------------------------------------------------------------------
// Wire format
// ---------------------------------------------------------------------------

/// A relay controller reporting that one of its lines has switched off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Completion {
    pub(crate) controller: u32,
    pub(crate) relay: u32,
}

/// Activation command payload: `"<relay> <duration_ms>"`.
pub(crate) fn format_command(relay: u32, duration_ms: u64) -> String {
    format!("{relay} {duration_ms}")
}

/// Parse a completion payload `"<controller><relay>"`: the first digit is the
/// controller, the remaining digits the relay (e.g. `"12"` → controller 1,
/// relay 2). Trims whitespace.
pub(crate) fn parse_completion(payload: &[u8]) -> Option<Completion> {
    let s = std::str::from_utf8(payload).ok()?.trim();
    if s.len() < 2 || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let controller = s[..1].parse().ok()?;
    let relay = s[1..].parse().ok()?;
    Some(Completion { controller, relay })
}

// ---------------------------------------------------------------------------
// Broker link
// ---------------------------------------------------------------------------

/// Live broker connection. Publishing happens on the run's task; a background
/// listener owns the event loop and forwards completions over a channel.
pub(crate) struct MqttBus {
    client: AsyncClient,
    listener: JoinHandle<()>,
}

impl MqttBus {
    /// Connect, wait for the broker's CONNACK (retrying with backoff), and
    /// subscribe to the acknowledgment topic.
    pub(crate) async fn connect(
        cfg: &MqttConfig,
    ) -> RunResult<(Self, mpsc::Receiver<Completion>)> {
        let mut opts = MqttOptions::new(cfg.client_id.clone(), cfg.host.clone(), cfg.port);
        opts.set_keep_alive(Duration::from_secs(cfg.keep_alive_secs));
        if let Some(username) = &cfg.username {
            opts.set_credentials(username.clone(), cfg.password.clone().unwrap_or_default());
        }

        let (client, mut eventloop) = AsyncClient::new(opts, 20);

        let mut delay = Duration::from_millis(500);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let wait = timeout(
                Duration::from_secs(cfg.connect_timeout_secs),
                wait_for_connack(&mut eventloop),
            )
            .await;
            let reason = match wait {
                Ok(Ok(())) => break,
                Ok(Err(e)) => e,
                Err(_) => "timed out waiting for CONNACK".to_string(),
            };
            if attempt >= cfg.connect_attempts {
                return Err(RunError::TransportConnect(format!(
                    "{}:{} after {attempt} attempt(s): {reason}",
                    cfg.host, cfg.port
                )));
            }
            warn!(
                host = %cfg.host,
                attempt,
                max = cfg.connect_attempts,
                "mqtt connect failed: {reason}. retrying in {delay:?}"
            );
            sleep(delay).await;
            delay *= 2;
        }
        info!(host = %cfg.host, port = cfg.port, "mqtt connected");

        client
            .subscribe(cfg.ack_topic.clone(), QoS::AtLeastOnce)
            .await
            .map_err(|e| RunError::TransportConnect(format!("subscribe {}: {e}", cfg.ack_topic)))?;
        info!(topic = %cfg.ack_topic, "subscribed to relay completions");

        let (tx, rx) = mpsc::channel(ACK_CHANNEL_CAPACITY);
        let listener = tokio::spawn(listen(
            eventloop,
            client.clone(),
            cfg.ack_topic.clone(),
            tx,
        ));

        Ok((Self { client, listener }, rx))
    }
}

impl RelayBus for MqttBus {
    async fn publish(&self, topic: &str, payload: &str) -> RunResult<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload.as_bytes().to_vec())
            .await
            .map_err(|e| RunError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn shutdown(self) {
        if let Err(e) = self.client.disconnect().await {
            warn!("mqtt disconnect request failed: {e}");
        }
        let abort = self.listener.abort_handle();
        if timeout(Duration::from_secs(2), self.listener).await.is_err() {
            abort.abort();
        }
        info!("mqtt disconnected");
    }
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), String> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => return Ok(()),
            Ok(_) => {}
            Err(e) => return Err(e.to_string()),
        }
    }
}

/// Drive the event loop until the client disconnects, forwarding every
/// well-formed completion on `ack_topic`. The session is clean, so the
/// subscription is renewed on every reconnect.
async fn listen(
    mut eventloop: EventLoop,
    client: AsyncClient,
    ack_topic: String,
    tx: mpsc::Sender<Completion>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(topic = %ack_topic, "mqtt reconnected, renewing subscription");
                if let Err(e) = client.try_subscribe(ack_topic.clone(), QoS::AtLeastOnce) {
                    warn!("resubscribe to {ack_topic} failed: {e}");
                }
            }
            Ok(Event::Incoming(Packet::Publish(p))) if p.topic == ack_topic => {
                match parse_completion(&p.payload) {
                    Some(c) => {
                        debug!(controller = c.controller, relay = c.relay, "relay completion received");
                        if let Err(e) = tx.try_send(c) {
                            warn!("dropping relay completion: {e}");
                        }
                    }
                    None => warn!(
                        payload = %String::from_utf8_lossy(&p.payload),
                        "malformed relay completion"
                    ),
                }
            }
            Ok(Event::Incoming(Packet::Publish(p))) => {
                debug!(topic = %p.topic, "unhandled topic");
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt error: {e}. reconnecting...");
                sleep(Duration::from_secs(2)).await;
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    // -- format_command -------------------------------------------------------

    #[test]
    fn command_is_relay_space_millis() {
        assert_eq!(format_command(2, 18417), "2 18417");
    }

    #[test]
    fn command_zero_duration() {
        assert_eq!(format_command(1, 0), "1 0");
    }

    // -- parse_completion -----------------------------------------------------

    #[test]
    fn completion_two_digits() {
        assert_eq!(
            parse_completion(b"12"),
            Some(Completion {
                controller: 1,
                relay: 2
            })
        );
    }

    #[test]
    fn completion_multi_digit_relay() {
        assert_eq!(
            parse_completion(b"310"),
            Some(Completion {
                controller: 3,
                relay: 10
            })
        );
    }

    #[test]
    fn completion_with_whitespace() {
        assert_eq!(
            parse_completion(b" 14\n"),
            Some(Completion {
                controller: 1,
                relay: 4
            })
        );
    }

    #[test]
    fn completion_single_digit_rejected() {
        assert_eq!(parse_completion(b"4"), None);
    }

    #[test]
    fn completion_non_numeric_rejected() {
        assert_eq!(parse_completion(b"1a"), None);
        assert_eq!(parse_completion(b"done"), None);
    }

    #[test]
    fn completion_empty_rejected() {
        assert_eq!(parse_completion(b""), None);
    }

    #[test]
    fn completion_invalid_utf8_rejected() {
        assert_eq!(parse_completion(&[0xff, 0xfe]), None);
    }

    // -- connect --------------------------------------------------------------

    /// Read one MQTT control packet: (first header byte, body).
    async fn read_packet(stream: &mut TcpStream) -> Option<(u8, Vec<u8>)> {
        let header = stream.read_u8().await.ok()?;
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let b = stream.read_u8().await.ok()?;
            len |= usize::from(b & 0x7f) << shift;
            if b & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await.ok()?;
        Some((header, body))
    }

    const CONNACK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];
    const SUBSCRIBE: u8 = 0x82;

    /// Wait for a SUBSCRIBE, skipping pings and anything else.
    async fn next_subscribe(stream: &mut TcpStream) -> Option<Vec<u8>> {
        loop {
            let (header, body) = read_packet(stream).await?;
            if header == SUBSCRIBE {
                return Some(body);
            }
        }
    }

    #[tokio::test]
    async fn ack_topic_resubscribed_after_reconnect() {
        let broker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = broker.local_addr().unwrap().port();

        let fake_broker = tokio::spawn(async move {
            // First session: accept, acknowledge the subscription, then drop.
            let (mut stream, _) = broker.accept().await.unwrap();
            read_packet(&mut stream).await.unwrap();
            stream.write_all(&CONNACK).await.unwrap();
            let body = next_subscribe(&mut stream).await.unwrap();
            stream
                .write_all(&[0x90, 0x03, body[0], body[1], 0x01])
                .await
                .unwrap();
            drop(stream);

            // Second session: the client must subscribe again on its own.
            let (mut stream, _) = broker.accept().await.unwrap();
            read_packet(&mut stream).await.unwrap();
            stream.write_all(&CONNACK).await.unwrap();
            let resubscribed = timeout(Duration::from_secs(5), next_subscribe(&mut stream))
                .await
                .ok()
                .flatten();
            String::from_utf8_lossy(&resubscribed.unwrap_or_default()).into_owned()
        });

        let cfg = MqttConfig {
            host: "127.0.0.1".into(),
            port,
            connect_attempts: 1,
            connect_timeout_secs: 5,
            ..MqttConfig::default()
        };
        let (bus, _acks) = MqttBus::connect(&cfg).await.unwrap();

        let second_session = timeout(Duration::from_secs(15), fake_broker)
            .await
            .unwrap()
            .unwrap();
        assert!(
            second_session.contains("/relay_done"),
            "no SUBSCRIBE to the ack topic after reconnect"
        );
        bus.listener.abort();
    }

    #[tokio::test]
    async fn connect_to_unreachable_broker_fails() {
        let cfg = MqttConfig {
            host: "127.0.0.1".into(),
            port: 9,
            connect_attempts: 1,
            connect_timeout_secs: 2,
            ..MqttConfig::default()
        };
        let err = MqttBus::connect(&cfg).await.err().unwrap();
        assert!(matches!(err, RunError::TransportConnect(_)), "{err}");
    }
}
