//! Orchestrator (C9): load configuration, wire the registry/rules/actions,
//! start the background workers, and serve the HTTP API.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread;

use anyhow::{Context, Result};
use log::{debug, info, warn};

use crate::action::{
    ActionDispatcher, ActionRecord, History, Notifier, SmtpNotifier, HISTORY_CAPACITY,
};
use crate::api;
use crate::config::{ConfigStore, Configuration};
use crate::error::ConfigError;
use crate::ingest::{http_poll, mqtt};
use crate::rules::{build_rules, Evaluator, Rule, RuleSnapshot};
use crate::sensor::Registry;

/// Everything the HTTP API reads; everything else (ingestors, evaluator)
/// holds the same `Arc` and mutates through its own lock.
pub struct AppState {
    pub registry: RwLock<Registry>,
    pub rule_snapshot: Arc<RwLock<RuleSnapshot>>,
    pub history: Arc<History>,
    pub config: RwLock<(Configuration, PathBuf)>,
}

/// Build a registry, action list and rule list from a configuration value,
/// failing on any structural problem: unknown sensor type, duplicate
/// sensor/action name, unknown operator, unknown sensor/action reference,
/// or an empty test list. Used both at startup and to validate
/// `PUT /api/config` bodies without touching the live state.
pub fn validate_and_build(
    cfg: &Configuration,
) -> Result<(Registry, Vec<Arc<ActionRecord>>, Vec<Rule>), ConfigError> {
    let mut registry = Registry::new();
    for desc in &cfg.sensors {
        registry.add(desc)?;
    }

    let mut seen = HashSet::new();
    let mut actions = Vec::with_capacity(cfg.actions.len());
    for a in &cfg.actions {
        if !seen.insert(a.name.clone()) {
            return Err(ConfigError::DuplicateAction(a.name.clone()));
        }
        actions.push(Arc::new(ActionRecord {
            name: a.name.clone(),
            route: a.route.clone(),
        }));
    }

    let rules = build_rules(&cfg.rules, &registry, &actions)?;

    Ok((registry, actions, rules))
}

pub struct Args {
    pub config_override: Option<PathBuf>,
    pub bind: String,
}

/// Load configuration, build the pipeline and run until a shutdown signal
/// arrives. On missing configuration, logs and returns an error rather
/// than panicking — `main` turns that into a quiet non-zero exit.
pub fn run(args: Args) -> Result<()> {
    let store = ConfigStore::new(args.config_override.clone());
    let (config, path) = store.load().context("loading configuration")?;
    info!("loaded configuration from {}", path.display());

    let (registry, _actions, rules) =
        validate_and_build(&config).context("validating configuration")?;
    info!(
        "registry has {} sensor(s), {} rule(s)",
        registry.snapshot().len(),
        rules.len()
    );

    let history = Arc::new(History::new(HISTORY_CAPACITY));
    let notifier: Arc<dyn Notifier> = Arc::new(SmtpNotifier::default());
    if config.global.recipients.is_empty() {
        debug!("no recipients configured, skipping startup notification");
    } else if let Err(e) = notifier.send(
        "Eplumber Started",
        "eplumber has finished loading its configuration and is starting up.",
        &config.global.recipients,
    ) {
        warn!("failed to send startup notification: {e}");
    }
    let dispatcher = Arc::new(ActionDispatcher::new(
        history.clone(),
        notifier,
        config.global.recipients.clone(),
    ));

    let evaluator = Arc::new(Evaluator::new(rules, dispatcher));
    let rule_snapshot = evaluator.snapshot_handle();

    let state = Arc::new(AppState {
        registry: RwLock::new(registry),
        rule_snapshot,
        history,
        config: RwLock::new((config.clone(), path)),
    });

    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            info!("received shutdown signal");
            stop.store(true, Ordering::SeqCst);
        })
        .context("installing signal handler")?;
    }

    let mut handles = Vec::new();

    {
        let state = state.clone();
        let stop = stop.clone();
        let mqtt_cfg = config.mqtt.clone();
        handles.push(thread::spawn(move || {
            mqtt::run(&mqtt_cfg, &state.registry, &stop);
        }));
    }

    {
        let state = state.clone();
        let stop = stop.clone();
        handles.push(thread::spawn(move || {
            http_poll::run(&state.registry, &stop);
        }));
    }

    {
        let evaluator = evaluator.clone();
        let stop = stop.clone();
        handles.push(thread::spawn(move || {
            evaluator.run(&stop);
        }));
    }

    api::serve(state, &args.bind, &stop).map_err(anyhow::Error::msg)?;

    for handle in handles {
        let _ = handle.join();
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ActionDescriptor, MqttConfig, RuleDescriptor};

    fn base_config() -> Configuration {
        Configuration {
            global: Default::default(),
            mqtt: MqttConfig {
                host: "localhost".into(),
                port: 1883,
                username: String::new(),
                password: String::new(),
            },
            sensors: vec![],
            actions: vec![],
            rules: vec![],
        }
    }

    #[test]
    fn validates_clean_config() {
        let mut cfg = base_config();
        cfg.sensors.push(crate::config::RawSensorDescriptor {
            r#type: "mqtt".into(),
            name: "temp".into(),
            route: "temp/topic".into(),
            return_type: crate::codec::ReturnType::Float,
            json_path: None,
            value_list_length: 3,
        });
        cfg.actions.push(ActionDescriptor {
            name: "cool".into(),
            route: "http://x/on".into(),
        });
        cfg.rules.push(RuleDescriptor {
            name: "r1".into(),
            tests: vec![("temp".into(), ">".into(), serde_json::json!(25))],
            action: "cool".into(),
            active: true,
        });
        let (registry, actions, rules) = validate_and_build(&cfg).unwrap();
        assert_eq!(registry.snapshot().len(), 2); // time + temp
        assert_eq!(actions.len(), 1);
        assert_eq!(rules.len(), 1);
    }

    #[test]
    fn rejects_rule_with_undefined_sensor() {
        let mut cfg = base_config();
        cfg.actions.push(ActionDescriptor {
            name: "a".into(),
            route: "http://x".into(),
        });
        cfg.rules.push(RuleDescriptor {
            name: "r".into(),
            tests: vec![("ghost".into(), ">".into(), serde_json::json!(1))],
            action: "a".into(),
            active: true,
        });
        let err = validate_and_build(&cfg).unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn rejects_duplicate_action_names() {
        let mut cfg = base_config();
        cfg.actions.push(ActionDescriptor {
            name: "a".into(),
            route: "http://x".into(),
        });
        cfg.actions.push(ActionDescriptor {
            name: "a".into(),
            route: "http://y".into(),
        });
        let err = validate_and_build(&cfg).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateAction(_)));
    }
}
