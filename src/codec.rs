//! Value codec (C1): coerce an inbound raw payload to a sensor's declared type.

use serde::Serialize;
use serde_json::Value;

use crate::error::DecodeError;

/// The declared scalar type of a sensor, as carried in its configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnType {
    Float,
    Int,
    Bool,
    Str,
}

/// A decoded sensor reading.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Float(f64),
    Int(i64),
    Bool(bool),
    Str(String),
}

impl ScalarValue {
    /// The real-number view used for numeric comparisons and window means.
    /// `None` for `Str`, which is never compared numerically.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ScalarValue::Float(f) => Some(*f),
            ScalarValue::Int(i) => Some(*i as f64),
            ScalarValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            ScalarValue::Str(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            ScalarValue::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

/// A raw inbound payload, before type coercion.
pub enum RawPayload {
    Bytes(Vec<u8>),
    Text(String),
    Json(Value),
}

impl RawPayload {
    fn preview(&self) -> String {
        const MAX: usize = 120;
        let s = match self {
            RawPayload::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            RawPayload::Text(t) => t.clone(),
            RawPayload::Json(v) => v.to_string(),
        };
        if s.len() > MAX {
            format!("{}…", &s[..MAX])
        } else {
            s
        }
    }

    fn into_json_source(self) -> Result<Value, (serde_json::Error, String)> {
        match self {
            RawPayload::Json(v) => Ok(v),
            RawPayload::Text(t) => serde_json::from_str(&t).map_err(|e| (e, t)),
            RawPayload::Bytes(b) => {
                let preview = String::from_utf8_lossy(&b).into_owned();
                serde_json::from_slice(&b).map_err(|e| (e, preview))
            }
        }
    }
}

/// Decode `payload` into the sensor's declared type.
///
/// Returns `Ok(None)` for a "no-value" outcome (a `json_path` miss) rather
/// than an error, per spec: a JSONPath miss is logged by the caller and
/// simply yields nothing to append, it does not poison the sensor.
pub fn decode(
    payload: RawPayload,
    return_type: ReturnType,
    json_path: Option<&str>,
    sensor_name: &str,
) -> Result<Option<ScalarValue>, DecodeError> {
    let preview = payload.preview();

    let value: Value = if let Some(path) = json_path {
        let json = payload.into_json_source().map_err(|(source, _)| DecodeError::NotJson {
            sensor: sensor_name.to_string(),
            source,
        })?;
        let matches = jsonpath_lib::select(&json, path).map_err(|e| DecodeError::CoercionFailed {
            sensor: sensor_name.to_string(),
            reason: format!("invalid json_path {path:?}: {e}"),
            preview: preview.clone(),
        })?;
        match matches.into_iter().next() {
            Some(v) => v.clone(),
            None => {
                return Err(DecodeError::NoMatch {
                    sensor: sensor_name.to_string(),
                    path: path.to_string(),
                })
            }
        }
    } else {
        match payload {
            RawPayload::Json(v) => v,
            RawPayload::Text(t) => Value::String(t),
            RawPayload::Bytes(b) => Value::String(String::from_utf8_lossy(&b).into_owned()),
        }
    };

    coerce(&value, return_type, sensor_name, &preview).map(Some)
}

fn coerce(
    v: &Value,
    return_type: ReturnType,
    sensor_name: &str,
    preview: &str,
) -> Result<ScalarValue, DecodeError> {
    let fail = |reason: &str| DecodeError::CoercionFailed {
        sensor: sensor_name.to_string(),
        reason: reason.to_string(),
        preview: preview.to_string(),
    };

    match return_type {
        ReturnType::Bool => Ok(ScalarValue::Bool(coerce_bool(v))),
        ReturnType::Int => {
            let f = coerce_f64(v).ok_or_else(|| fail("expected a number-like value"))?;
            Ok(ScalarValue::Int(f.trunc() as i64))
        }
        ReturnType::Float => {
            let f = coerce_f64(v).ok_or_else(|| fail("expected a number-like value"))?;
            Ok(ScalarValue::Float(f))
        }
        ReturnType::Str => Ok(ScalarValue::Str(coerce_str(v))),
    }
}

fn coerce_bool(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => matches!(s.to_lowercase().as_str(), "true" | "1" | "on" | "yes"),
        _ => false,
    }
}

fn coerce_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        _ => None,
    }
}

fn coerce_str(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coerces_float_from_text() {
        let got = decode(RawPayload::Text("24".into()), ReturnType::Float, None, "temp").unwrap();
        assert_eq!(got, Some(ScalarValue::Float(24.0)));
    }

    #[test]
    fn coerces_int_truncates_toward_zero() {
        let got = decode(RawPayload::Text("-3.9".into()), ReturnType::Int, None, "x").unwrap();
        assert_eq!(got, Some(ScalarValue::Int(-3)));
    }

    #[test]
    fn bool_text_variants() {
        for (text, expected) in [
            ("true", true),
            ("YES", true),
            ("on", true),
            ("1", true),
            ("0", false),
            ("nope", false),
        ] {
            let got = decode(RawPayload::Text(text.into()), ReturnType::Bool, None, "b").unwrap();
            assert_eq!(got, Some(ScalarValue::Bool(expected)), "input {text:?}");
        }
    }

    #[test]
    fn json_path_extracts_nested_field() {
        let json = serde_json::json!({"cpu": {"pct": 0.42}});
        let got = decode(
            RawPayload::Json(json),
            ReturnType::Float,
            Some("$.cpu.pct"),
            "load",
        )
        .unwrap();
        assert_eq!(got, Some(ScalarValue::Float(0.42)));
    }

    #[test]
    fn json_path_miss_is_error() {
        let json = serde_json::json!({"cpu": {"pct": 0.42}});
        let err = decode(
            RawPayload::Json(json),
            ReturnType::Float,
            Some("$.mem.pct"),
            "load",
        )
        .unwrap_err();
        assert!(matches!(err, DecodeError::NoMatch { .. }));
    }

    #[test]
    fn str_coercion_is_string_form() {
        let got = decode(
            RawPayload::Json(serde_json::json!(42)),
            ReturnType::Str,
            None,
            "s",
        )
        .unwrap();
        assert_eq!(got, Some(ScalarValue::Str("42".to_string())));
    }

    #[test]
    fn bad_number_fails() {
        let err = decode(
            RawPayload::Text("not-a-number".into()),
            ReturnType::Float,
            None,
            "temp",
        )
        .unwrap_err();
        assert!(matches!(err, DecodeError::CoercionFailed { .. }));
    }
}
