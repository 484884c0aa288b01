//! HTTP poll ingestor (C4): one ticker shared by every http sensor, polled
//! sequentially to bound concurrent outbound load.

use std::sync::atomic::AtomicBool;
use std::sync::RwLock;
use std::time::Duration;

use log::{debug, warn};

use crate::codec::RawPayload;
use crate::sensor::{Registry, SensorVariant};
use crate::util::interruptible_sleep;

const POLL_INTERVAL: Duration = Duration::from_secs(10);
const POLL_TIMEOUT: Duration = Duration::from_secs(10);

/// Runs until `stop` is set. Missed ticks are coalesced: a slow round
/// simply means the next tick runs the full set once more, it never
/// queues up extra rounds.
pub fn run(registry: &RwLock<Registry>, stop: &AtomicBool) {
    let client = reqwest::blocking::Client::builder()
        .timeout(POLL_TIMEOUT)
        .build()
        .expect("failed to build HTTP client");

    while !stop.load(std::sync::atomic::Ordering::SeqCst) {
        let sensors = {
            let reg = registry.read().unwrap();
            reg.sensors_of(SensorVariant::Http)
        };

        for sensor in &sensors {
            if stop.load(std::sync::atomic::Ordering::SeqCst) {
                break;
            }
            match client.get(&sensor.route).send() {
                Ok(resp) if resp.status().is_success() => match resp.json::<serde_json::Value>() {
                    Ok(json) => {
                        if let Err(e) = sensor.append(RawPayload::Json(json)) {
                            warn!("sensor {:?}: failed to decode poll response: {e}", sensor.name);
                        } else {
                            debug!("polled {:?} successfully", sensor.name);
                        }
                    }
                    Err(e) => {
                        warn!("sensor {:?}: response body was not valid JSON: {e}", sensor.name);
                        sensor.mark_disconnected();
                    }
                },
                Ok(resp) => {
                    warn!("sensor {:?}: poll returned status {}", sensor.name, resp.status());
                    sensor.mark_disconnected();
                }
                Err(e) => {
                    warn!("sensor {:?}: poll failed: {e}", sensor.name);
                    sensor.mark_disconnected();
                }
            }
        }

        interruptible_sleep(POLL_INTERVAL, stop);
    }
}
