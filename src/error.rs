use thiserror::Error;

/// One bad payload on one sensor. Logged and dropped; the sensor keeps going.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("sensor {sensor}: could not coerce payload to the declared type ({reason}); payload preview: {preview}")]
    CoercionFailed {
        sensor: String,
        reason: String,
        preview: String,
    },
    #[error("sensor {sensor}: json_path {path:?} had no match in payload")]
    NoMatch { sensor: String, path: String },
    #[error("sensor {sensor}: payload was not valid JSON and json_path is set: {source}")]
    NotJson {
        sensor: String,
        #[source]
        source: serde_json::Error,
    },
}

/// A rule references a sensor key that does not exist in the registry.
#[derive(Debug, Error)]
#[error("unknown sensor: {0}")]
pub struct UnknownSensor(pub String);

/// A test was configured with an operator string outside the closed enumeration.
#[derive(Debug, Error)]
#[error("unknown operator: {0:?}")]
pub struct UnknownOperator(pub String);

/// Transient network failure: an HTTP poll, an action GET, or an SMTP send.
#[derive(Debug, Error)]
#[error("network error: {0}")]
pub struct NetworkError(pub String);

/// Structural or semantic problems in a configuration value. Fatal at startup;
/// reported as a 400 from `PUT /api/config`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("sensor {name:?} has unknown type {kind:?}")]
    UnknownSensorType { name: String, kind: String },

    #[error("duplicate sensor name: {0:?}")]
    DuplicateSensor(String),

    #[error("duplicate action name: {0:?}")]
    DuplicateAction(String),

    #[error("rule {0:?} has no tests")]
    EmptyTests(String),

    #[error("rule {rule:?} references unknown action {action:?}")]
    UnknownAction { rule: String, action: String },

    #[error(transparent)]
    UnknownSensor(#[from] UnknownSensor),

    #[error(transparent)]
    UnknownOperator(#[from] UnknownOperator),

    #[error("no configuration file found in the working directory or user config directory")]
    NotFound,

    #[error("failed to read configuration file {path:?}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration JSON: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Umbrella error for code paths that can fail for more than one reason
/// (the registry's `Append`, the dispatcher, the API's config validator).
#[derive(Debug, Error)]
pub enum EplumberError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    UnknownSensor(#[from] UnknownSensor),
    #[error(transparent)]
    Network(#[from] NetworkError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}
