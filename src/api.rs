//! Read-only HTTP API (C8), plus the config read/write endpoints and the
//! static dashboard stubs. Built directly on `tiny_http`'s request loop.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{info, warn};
use tiny_http::{Header, Method, Response, Server};

use crate::codec::ScalarValue;
use crate::config::ConfigStore;
use crate::orchestrator::{validate_and_build, AppState};
use crate::sensor::SensorSnapshot;

const STATIC_INDEX: &str = "<!doctype html><title>eplumber</title><p>eplumber is running.</p>";
const STATIC_CONFIG_HTML: &str = "<!doctype html><title>eplumber config</title><p>config editor not bundled in this build.</p>";

fn no_cache_headers() -> Vec<Header> {
    vec![
        Header::from_bytes(&b"Cache-Control"[..], &b"no-store, no-cache, must-revalidate"[..]).unwrap(),
        Header::from_bytes(&b"Pragma"[..], &b"no-cache"[..]).unwrap(),
        Header::from_bytes(&b"Expires"[..], &b"0"[..]).unwrap(),
    ]
}

fn json_header() -> Header {
    Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).unwrap()
}

fn static_html_response(body: &'static str) -> Response<std::io::Cursor<Vec<u8>>> {
    let mut response = Response::from_string(body)
        .with_header(Header::from_bytes(&b"Content-Type"[..], &b"text/html"[..]).unwrap());
    for header in no_cache_headers() {
        response = response.with_header(header);
    }
    response
}

fn json_response(status: u16, body: serde_json::Value) -> Response<std::io::Cursor<Vec<u8>>> {
    let text = serde_json::to_string(&body).unwrap_or_else(|_| "{}".to_string());
    Response::from_string(text)
        .with_status_code(status)
        .with_header(json_header())
}

/// Like `json_response`, but 2-space-indented, matching the file format
/// `ConfigStore::save` writes to disk.
fn pretty_json_response(status: u16, body: &serde_json::Value) -> Response<std::io::Cursor<Vec<u8>>> {
    let text = serde_json::to_vec_pretty(body)
        .ok()
        .and_then(|bytes| String::from_utf8(bytes).ok())
        .unwrap_or_else(|| "{}".to_string());
    Response::from_string(text)
        .with_status_code(status)
        .with_header(json_header())
}

fn error_response(status: u16, message: impl std::fmt::Display) -> Response<std::io::Cursor<Vec<u8>>> {
    json_response(status, serde_json::json!({ "error": message.to_string() }))
}

fn round_scalar(value: &ScalarValue) -> serde_json::Value {
    match value {
        ScalarValue::Float(f) => serde_json::json!(round2(*f)),
        ScalarValue::Int(i) => serde_json::json!(i),
        ScalarValue::Bool(b) => serde_json::json!(b),
        ScalarValue::Str(s) => serde_json::json!(s),
    }
}

fn round2(f: f64) -> f64 {
    (f * 100.0).round() / 100.0
}

fn sensor_json(s: &SensorSnapshot) -> serde_json::Value {
    serde_json::json!({
        "name": s.name,
        "route": s.route,
        "type": s.variant,
        "return_type": s.return_type,
        "connected": s.connected,
        "ready": s.ready,
        "mean": s.mean.as_ref().map(round_scalar),
        "last": s.last.as_ref().map(round_scalar),
        "values": s.values.iter().map(round_scalar).collect::<Vec<_>>(),
        "value_count": s.value_count,
    })
}

/// Serves the HTTP API until `stop` is set. `tiny_http`'s `recv_timeout`
/// gives us a cancellable accept loop without pulling in an async runtime.
pub fn serve(state: Arc<AppState>, bind_addr: &str, stop: &AtomicBool) -> Result<(), String> {
    let server = Server::http(bind_addr).map_err(|e| format!("failed to bind {bind_addr}: {e}"))?;
    info!("http api listening on {bind_addr}");

    while !stop.load(Ordering::SeqCst) {
        let request = match server.recv_timeout(Duration::from_millis(200)) {
            Ok(Some(r)) => r,
            Ok(None) => continue,
            Err(e) => {
                warn!("http server accept error: {e}");
                continue;
            }
        };
        handle(&state, request);
    }
    info!("http api stopped");
    Ok(())
}

fn handle(state: &Arc<AppState>, mut request: tiny_http::Request) {
    let method = request.method().clone();
    let url = request.url().to_string();

    let response = match (&method, url.as_str()) {
        (Method::Get, "/api/sensors") => get_sensors(state),
        (Method::Get, "/api/rules") => get_rules(state),
        (Method::Get, "/api/actions/history") => get_history(state),
        (Method::Get, "/api/config") => get_config(state),
        (Method::Put, "/api/config") => {
            let mut body = String::new();
            let _ = request.as_reader().read_to_string(&mut body);
            put_config(state, &body)
        }
        (Method::Get, "/api/status") => get_status(state),
        (Method::Get, "/") => static_html_response(STATIC_INDEX),
        (Method::Get, "/config.html") => static_html_response(STATIC_CONFIG_HTML),
        (Method::Get, path) if path.starts_with("/api/sensors/") => {
            let name = &path["/api/sensors/".len()..];
            get_sensor_by_name(state, name)
        }
        _ => error_response(404, "not found"),
    };

    if let Err(e) = request.respond(response) {
        warn!("failed to respond to {url:?}: {e}");
    }
}

fn get_sensors(state: &Arc<AppState>) -> Response<std::io::Cursor<Vec<u8>>> {
    let snapshots: Vec<serde_json::Value> = state
        .registry
        .read()
        .unwrap()
        .snapshot()
        .iter()
        .map(sensor_json)
        .collect();
    json_response(200, serde_json::json!(snapshots))
}

fn get_sensor_by_name(state: &Arc<AppState>, name: &str) -> Response<std::io::Cursor<Vec<u8>>> {
    let registry = state.registry.read().unwrap();
    match registry.lookup_by_name(name) {
        Some(sensor) => json_response(200, sensor_json(&sensor.snapshot())),
        None => error_response(404, format!("unknown sensor: {name}")),
    }
}

fn get_rules(state: &Arc<AppState>) -> Response<std::io::Cursor<Vec<u8>>> {
    let snapshot = state.rule_snapshot.read().unwrap();
    json_response(200, serde_json::json!(*snapshot))
}

fn get_history(state: &Arc<AppState>) -> Response<std::io::Cursor<Vec<u8>>> {
    json_response(200, serde_json::json!(state.history.snapshot()))
}

fn get_config(state: &Arc<AppState>) -> Response<std::io::Cursor<Vec<u8>>> {
    let guard = state.config.read().unwrap();
    pretty_json_response(200, &serde_json::json!(guard.0))
}

fn get_status(state: &Arc<AppState>) -> Response<std::io::Cursor<Vec<u8>>> {
    let sensors = state.registry.read().unwrap().snapshot().len();
    let rules = state.rule_snapshot.read().unwrap().len();
    json_response(
        200,
        serde_json::json!({ "status": "ok", "sensors": sensors, "rules": rules }),
    )
}

/// Validate `body` (`{"config": <object>}`) by reconstructing a full
/// `Configuration` value and resolving its sensor/action/operator
/// references, persist it on success, and update the in-memory config
/// copy served by `GET /api/config`. Never touches the live registry or
/// rule list — reload is deferred to a restart.
fn put_config(state: &Arc<AppState>, body: &str) -> Response<std::io::Cursor<Vec<u8>>> {
    let envelope: serde_json::Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(e) => return error_response(400, format!("invalid JSON body: {e}")),
    };
    let Some(inner) = envelope.get("config") else {
        return error_response(400, "missing \"config\" field");
    };
    let config: crate::config::Configuration = match serde_json::from_value(inner.clone()) {
        Ok(c) => c,
        Err(e) => return error_response(400, format!("invalid configuration: {e}")),
    };
    if let Err(e) = validate_and_build(&config) {
        return error_response(400, e);
    }

    let path = state.config.read().unwrap().1.clone();
    if let Err(e) = ConfigStore::save(&config, &path) {
        return error_response(500, e);
    }

    *state.config.write().unwrap() = (config, path);
    json_response(200, serde_json::json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round2_rounds_to_two_decimals() {
        assert_eq!(round2(26.0 / 1.0), 26.0);
        assert_eq!(round2(0.42499), 0.42);
        assert_eq!(round2(1.0 / 3.0), 0.33);
    }
}
