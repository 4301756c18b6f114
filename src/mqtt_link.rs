//! MQTT transport adapter for the BLE bridge.
//!
//! The bridge shunts opaque sensor frames over one topic pair and encodes
//! every payload as the frame's bytes rendered in decimal and joined with
//! commas (e.g. `"4,0,17,0,16,0,4,0,64,0,17,0"`). Wasteful, but it is the
//! bridge's wire format; the codec only ever sees raw bytes.
//!
//! Topics are configuration, not semantics: the device MAC and the
//! service/characteristic UUIDs come from the environment with the known
//! bridge defaults.
use std::env;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tracing::{debug, error, info, warn};

use crate::coordinator::{AppState, FrameSink};
use crate::error::GatewayError;

const DEFAULT_DEVICE: &str = "cb:6f:0f:38:a5:24";
const DEFAULT_SERVICE_UUID: &str = "383f0000-7947-d815-7830-14f1584109c5";
const DEFAULT_CHAR_TX: &str = "383f0001-7947-d815-7830-14f1584109c5";
const DEFAULT_CHAR_RX: &str = "383f0002-7947-d815-7830-14f1584109c5";

#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub device: String,
    pub service_uuid: String,
    pub char_tx: String,
    pub char_rx: String,
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

impl MqttConfig {
    pub fn from_env() -> Self {
        let port = env::var("MQTT_PORT")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(1883);
        Self {
            host: env_or("MQTT_HOST", "localhost"),
            port,
            device: env_or("FPC2534_DEVICE", DEFAULT_DEVICE),
            service_uuid: env_or("FPC2534_SERVICE_UUID", DEFAULT_SERVICE_UUID),
            char_tx: env_or("FPC2534_CHAR_TX", DEFAULT_CHAR_TX),
            char_rx: env_or("FPC2534_CHAR_RX", DEFAULT_CHAR_RX),
        }
    }

    /// Topic the bridge forwards to the sensor's TX characteristic.
    pub fn tx_topic(&self) -> String {
        format!(
            "ble_devices/{}/{}/{}/Set",
            self.device, self.service_uuid, self.char_tx
        )
    }

    /// Topic the bridge publishes sensor notifications on.
    pub fn rx_topic(&self) -> String {
        format!(
            "ble_devices/{}/{}/{}",
            self.device, self.service_uuid, self.char_rx
        )
    }
}

/// Render frame bytes in the bridge's comma-separated-decimal form.
pub fn encode_decimal(frame: &[u8]) -> String {
    frame
        .iter()
        .map(u8::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Parse a bridge payload back into bytes. `None` on any malformed token.
pub fn decode_decimal(payload: &[u8]) -> Option<Vec<u8>> {
    let text = std::str::from_utf8(payload).ok()?;
    text.split(',')
        .map(|token| token.trim().parse::<u8>().ok())
        .collect()
}

/// Cloneable handle for publishing frames towards the sensor.
#[derive(Clone)]
pub struct MqttLink {
    client: AsyncClient,
    tx_topic: String,
}

impl MqttLink {
    async fn subscribe(&self, topic: &str) -> Result<(), GatewayError> {
        self.client.subscribe(topic, QoS::AtMostOnce).await?;
        Ok(())
    }
}

#[async_trait]
impl FrameSink for MqttLink {
    async fn publish_frame(&self, frame: Vec<u8>) -> Result<(), GatewayError> {
        debug!(bytes = frame.len(), "frame out");
        counter!("fpc.mqtt.tx").increment(1);
        self.client
            .publish(
                &self.tx_topic,
                QoS::AtLeastOnce,
                false,
                encode_decimal(&frame),
            )
            .await?;
        Ok(())
    }
}

/// Connect to the broker. The returned event loop must be driven by
/// [`inbound_loop`] for anything to flow.
pub fn connect(config: &MqttConfig) -> (MqttLink, EventLoop) {
    let mut options = MqttOptions::new("fpc2534-gateway", &config.host, config.port);
    options.set_keep_alive(Duration::from_secs(30));
    let (client, event_loop) = AsyncClient::new(options, 64);
    (
        MqttLink {
            client,
            tx_topic: config.tx_topic(),
        },
        event_loop,
    )
}

/// Drive the MQTT event loop forever: (re)subscribe on every ConnAck so
/// reconnects keep working, decode each inbound bridge payload and hand the
/// typed response to the coordinator.
pub async fn inbound_loop(mut event_loop: EventLoop, link: MqttLink, rx_topic: String, state: AppState) {
    loop {
        match event_loop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(topic = %rx_topic, "mqtt connected, subscribing");
                if let Err(error) = link.subscribe(&rx_topic).await {
                    error!(%error, "inbound subscribe failed");
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                counter!("fpc.mqtt.rx").increment(1);
                let Some(bytes) = decode_decimal(&publish.payload) else {
                    counter!("fpc.mqtt.rx.garbage").increment(1);
                    warn!(topic = %publish.topic, "undecodable bridge payload");
                    continue;
                };
                match state.decode(&bytes) {
                    Ok(response) => {
                        debug!(?response, "frame in");
                        state.coordinator.route(response);
                    }
                    Err(error) => {
                        counter!("fpc.decode.err").increment(1);
                        error!(%error, "frame decode failed");
                    }
                }
            }
            Ok(_) => {}
            Err(error) => {
                counter!("fpc.mqtt.conn.err").increment(1);
                error!(%error, "mqtt event loop error, retrying");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_encoding_matches_bridge_format() {
        let frame = [4u8, 0, 17, 0, 16, 0, 4, 0, 64, 0, 17, 0];
        assert_eq!(encode_decimal(&frame), "4,0,17,0,16,0,4,0,64,0,17,0");
    }

    #[test]
    fn decimal_round_trip() {
        let frame: Vec<u8> = (0..=255).collect();
        let decoded = decode_decimal(encode_decimal(&frame).as_bytes()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn decimal_decode_tolerates_whitespace() {
        assert_eq!(decode_decimal(b"1, 2 ,3"), Some(vec![1, 2, 3]));
    }

    #[test]
    fn decimal_decode_rejects_garbage() {
        assert_eq!(decode_decimal(b"1,2,256"), None);
        assert_eq!(decode_decimal(b"1,,3"), None);
        assert_eq!(decode_decimal(b"1,-2,3"), None);
        assert_eq!(decode_decimal(&[0xFF, 0xFE]), None);
    }

    #[test]
    fn topics_follow_bridge_layout() {
        let config = MqttConfig {
            host: "localhost".into(),
            port: 1883,
            device: "aa:bb".into(),
            service_uuid: "svc".into(),
            char_tx: "tx".into(),
            char_rx: "rx".into(),
        };
        assert_eq!(config.tx_topic(), "ble_devices/aa:bb/svc/tx/Set");
        assert_eq!(config.rx_topic(), "ble_devices/aa:bb/svc/rx");
    }
}
