//! FPC2534 fingerprint sensor gateway.
//!
//! Bridges the sensor, reachable only through a BLE bridge that shunts
//! opaque frames over an MQTT topic pair, to an HTTP + WebSocket API.
//! Startup wires four pieces together: the codec (with the optional AES-GCM
//! key from the environment), the MQTT link and its inbound pump, the
//! session coordinator, and the identify loop; then serves the routes.
mod coordinator;
mod error;
mod fpc_codec;
mod identify_stream;
mod mqtt_link;
mod sensor_ops;
mod sensor_routes;

use std::env;
use std::io;
use std::sync::Arc;

use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::coordinator::{AppState, Coordinator};
use crate::fpc_codec::Fpc2534;
use crate::mqtt_link::MqttConfig;

/// Mirrors the bridge-side cap; template uploads are 18 kB, everything else
/// far smaller.
const MAX_CONTENT_LENGTH: usize = 640_000;

fn key_from_env() -> io::Result<Option<Vec<u8>>> {
    match env::var("FPC2534_KEY") {
        Err(_) => Ok(None),
        Ok(raw) => {
            let key = hex::decode(raw.trim())
                .map_err(|e| io::Error::other(format!("FPC2534_KEY is not valid hex: {e}")))?;
            Ok(Some(key))
        }
    }
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], 9090))
        .install()
        .map_err(io::Error::other)?;

    let key = key_from_env()?;
    let codec = Fpc2534::new(key.as_deref())
        .map_err(|e| io::Error::other(format!("bad FPC2534_KEY: {e}")))?;
    info!(secure = key.is_some(), "codec ready");

    let mqtt_config = MqttConfig::from_env();
    let (link, event_loop) = mqtt_link::connect(&mqtt_config);
    let (coordinator, infinite_rx) = Coordinator::new();
    let state = AppState::new(codec, coordinator, Arc::new(link.clone()));

    tokio::spawn(mqtt_link::inbound_loop(
        event_loop,
        link,
        mqtt_config.rx_topic(),
        state.clone(),
    ));
    tokio::spawn(identify_stream::identify_loop(state.clone(), infinite_rx));
    info!(host = %mqtt_config.host, port = mqtt_config.port, "gateway starting");

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header();

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(web::Data::new(state.clone()))
            .app_data(web::PayloadConfig::new(MAX_CONTENT_LENGTH))
            .configure(sensor_routes::config)
            .configure(identify_stream::config)
    })
    .bind(("0.0.0.0", 8080))?
    .run()
    .await
}
