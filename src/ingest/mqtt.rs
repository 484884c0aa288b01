//! MQTT ingestor (C3): subscribe to every mqtt sensor's topic, feed
//! incoming payloads through the registry's codec.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use log::{debug, info, warn};
use rumqttc::{Client, Event, MqttOptions, Packet, QoS};

use crate::codec::RawPayload;
use crate::config::MqttConfig;
use crate::sensor::{Registry, SensorVariant};

/// Connect, subscribe to every mqtt sensor route present at connection
/// time, and feed messages into the registry until `stop` is set.
/// Reconnection is handled entirely by `rumqttc`'s event loop; no
/// app-level backoff is added on top of it.
pub fn run(mqtt_cfg: &MqttConfig, registry: &RwLock<Registry>, stop: &AtomicBool) {
    let client_id = format!("eplumber-{}", std::process::id());
    let mut opts = MqttOptions::new(client_id, mqtt_cfg.host.clone(), mqtt_cfg.port);
    opts.set_keep_alive(Duration::from_secs(5));
    if !mqtt_cfg.username.is_empty() {
        opts.set_credentials(mqtt_cfg.username.clone(), mqtt_cfg.password.clone());
    }

    let (client, mut connection) = Client::new(opts, 64);

    let topics: Vec<String> = {
        let reg = registry.read().unwrap();
        reg.sensors_of(SensorVariant::Mqtt)
            .into_iter()
            .map(|s| s.route.clone())
            .collect()
    };
    for topic in &topics {
        if let Err(e) = client.subscribe(topic, QoS::AtMostOnce) {
            warn!("failed to subscribe to {topic:?}: {e}");
        }
    }
    info!("mqtt ingestor subscribed to {} topic(s)", topics.len());

    for notification in connection.iter() {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        match notification {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!("mqtt message on {:?}", publish.topic);
                let reg = registry.read().unwrap();
                if let Err(e) = reg.append(&publish.topic, RawPayload::Bytes(publish.payload.to_vec())) {
                    warn!("failed to process mqtt message on {:?}: {e}", publish.topic);
                }
            }
            Ok(_) => {}
            Err(e) => {
                warn!("mqtt connection error: {e}");
            }
        }
    }
    info!("mqtt ingestor stopped");
}
