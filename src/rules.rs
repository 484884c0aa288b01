//! Rule evaluator (C6): a conjunction of sensor-comparison tests per rule,
//! evaluated on a fixed cycle with a post-fire suppression window.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Serialize, Serializer};

use crate::action::{ActionDispatcher, ActionRecord};
use crate::codec::ScalarValue;
use crate::error::{ConfigError, UnknownOperator};
use crate::sensor::{Registry, SensorRecord};
use crate::util::interruptible_sleep;

const CYCLE_PERIOD: Duration = Duration::from_secs(1);
const SUPPRESSION_WINDOW: Duration = Duration::from_secs(5);

/// The closed set of comparison operators. A validated enumeration rather
/// than a lookup table of closures, so the compiler enforces exhaustiveness
/// in `Op::eval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Op {
    fn symbol(self) -> &'static str {
        match self {
            Op::Lt => "<",
            Op::Le => "<=",
            Op::Gt => ">",
            Op::Ge => ">=",
            Op::Eq => "==",
            Op::Ne => "!=",
        }
    }
}

impl std::fmt::Display for Op {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Serializes as the operator symbol (`"<"`, `">="`, ...), the inverse of
/// `FromStr`, so the published rule snapshot matches the configuration
/// file's own notation.
impl Serialize for Op {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.symbol())
    }
}

impl std::str::FromStr for Op {
    type Err = UnknownOperator;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "<" => Ok(Op::Lt),
            "<=" => Ok(Op::Le),
            ">" => Ok(Op::Gt),
            ">=" => Ok(Op::Ge),
            "==" => Ok(Op::Eq),
            "!=" => Ok(Op::Ne),
            other => Err(UnknownOperator(other.to_string())),
        }
    }
}

impl Op {
    fn eval_numeric(self, current: f64, literal: f64) -> bool {
        match self {
            Op::Lt => current < literal,
            Op::Le => current <= literal,
            Op::Gt => current > literal,
            Op::Ge => current >= literal,
            Op::Eq => (current - literal).abs() < f64::EPSILON,
            Op::Ne => (current - literal).abs() >= f64::EPSILON,
        }
    }

    fn eval_str(self, current: &str, literal: &str) -> bool {
        match self {
            Op::Lt => current < literal,
            Op::Le => current <= literal,
            Op::Gt => current > literal,
            Op::Ge => current >= literal,
            Op::Eq => current == literal,
            Op::Ne => current != literal,
        }
    }
}

/// One binary comparison of a sensor's current value against a literal.
pub struct Test {
    pub sensor_name: String,
    pub sensor: Arc<SensorRecord>,
    pub op: Op,
    pub value: serde_json::Value,
}

impl Test {
    /// Evaluate against the sensor's current `mean`. Per spec, a no-value
    /// sensor or a type/operator mismatch yields `false` rather than an
    /// error, so a single bad test can never cause a spurious firing.
    fn evaluate(&self) -> (Option<ScalarValue>, bool) {
        let current = self.sensor.mean();
        let passes = match &current {
            None => false,
            Some(ScalarValue::Str(s)) => self
                .value
                .as_str()
                .map(|lit| self.op.eval_str(s, lit))
                .unwrap_or(false),
            Some(other) => match (other.as_f64(), self.value.as_f64()) {
                (Some(c), Some(l)) => self.op.eval_numeric(c, l),
                _ => false,
            },
        };
        (current, passes)
    }
}

/// A conjunction of tests bound to an action and an active flag.
pub struct Rule {
    pub name: String,
    pub tests: Vec<Test>,
    pub action: Arc<ActionRecord>,
    pub active: bool,
}

/// Build the runtime rule list from config, resolving sensor/action names
/// against the freshly-built registry. Fatal (`ConfigError`) on any
/// unknown reference or unknown operator.
pub fn build_rules(
    descriptors: &[crate::config::RuleDescriptor],
    registry: &Registry,
    actions: &[Arc<ActionRecord>],
) -> Result<Vec<Rule>, ConfigError> {
    let mut rules = Vec::with_capacity(descriptors.len());
    for desc in descriptors {
        if desc.tests.is_empty() {
            return Err(ConfigError::EmptyTests(desc.name.clone()));
        }
        let mut tests = Vec::with_capacity(desc.tests.len());
        for (sensor_name, op_str, value) in &desc.tests {
            let sensor = registry.lookup(sensor_name).map_err(ConfigError::from)?;
            let op: Op = op_str.parse().map_err(ConfigError::from)?;
            tests.push(Test {
                sensor_name: sensor_name.clone(),
                sensor,
                op,
                value: value.clone(),
            });
        }
        let action = actions
            .iter()
            .find(|a| a.name == desc.action)
            .cloned()
            .ok_or_else(|| ConfigError::UnknownAction {
                rule: desc.name.clone(),
                action: desc.action.clone(),
            })?;
        rules.push(Rule {
            name: desc.name.clone(),
            tests,
            action,
            active: desc.active,
        });
    }
    Ok(rules)
}

/// One test's recorded outcome in a published snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct TestRecord {
    pub sensor_name: String,
    pub op: Op,
    pub value: serde_json::Value,
    pub current: Option<ScalarValue>,
    pub passes: bool,
}

/// One rule's recorded outcome for a single cycle.
#[derive(Debug, Clone, Serialize)]
pub struct RuleRecord {
    pub name: String,
    pub action_name: String,
    pub tests: Vec<TestRecord>,
    pub all_pass: bool,
    pub active: bool,
}

pub type RuleSnapshot = Vec<RuleRecord>;

/// Runs the evaluation cycle on its own thread: read-only against the
/// registry and rule list, single-writer against the published snapshot.
pub struct Evaluator {
    rules: Vec<Rule>,
    dispatcher: Arc<ActionDispatcher>,
    snapshot: Arc<RwLock<RuleSnapshot>>,
}

impl Evaluator {
    pub fn new(rules: Vec<Rule>, dispatcher: Arc<ActionDispatcher>) -> Self {
        Self {
            rules,
            dispatcher,
            snapshot: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn snapshot_handle(&self) -> Arc<RwLock<RuleSnapshot>> {
        self.snapshot.clone()
    }

    /// Runs until `stop` is set. One cycle per second; firing a rule blocks
    /// the loop for the 5s suppression window before the next rule in the
    /// same cycle is considered (a deliberate serial model).
    pub fn run(&self, stop: &AtomicBool) {
        info!("rule evaluator starting ({} rules)", self.rules.len());
        while !stop.load(std::sync::atomic::Ordering::SeqCst) {
            let mut cycle = Vec::with_capacity(self.rules.len());
            for rule in &self.rules {
                let mut test_records = Vec::with_capacity(rule.tests.len());
                let mut all_pass = true;
                for test in &rule.tests {
                    let (current, passes) = test.evaluate();
                    all_pass &= passes;
                    test_records.push(TestRecord {
                        sensor_name: test.sensor_name.clone(),
                        op: test.op,
                        value: test.value.clone(),
                        current,
                        passes,
                    });
                }

                if all_pass && rule.active {
                    info!("rule {:?} fired, dispatching action {:?}", rule.name, rule.action.name);
                    self.dispatcher.dispatch(&rule.name, &rule.action, &test_records);
                    interruptible_sleep(SUPPRESSION_WINDOW, stop);
                } else {
                    debug!("rule {:?} did not fire (all_pass={all_pass}, active={})", rule.name, rule.active);
                }

                cycle.push(RuleRecord {
                    name: rule.name.clone(),
                    action_name: rule.action.name.clone(),
                    tests: test_records,
                    all_pass,
                    active: rule.active,
                });
            }

            // Whole-buffer replacement: the API never observes a partially
            // updated cycle.
            *self.snapshot.write().unwrap() = cycle;

            if stop.load(std::sync::atomic::Ordering::SeqCst) {
                break;
            }
            interruptible_sleep(CYCLE_PERIOD, stop);
        }
        warn!("rule evaluator stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{ActionDispatcher, ActionRecord, History, NoopNotifier};
    use crate::codec::{RawPayload, ReturnType};
    use crate::config::RuleDescriptor;

    fn make_registry_with_temp() -> Registry {
        let mut reg = Registry::new();
        reg.add(&crate::config::RawSensorDescriptor {
            r#type: "mqtt".into(),
            name: "temp".into(),
            route: "temp/topic".into(),
            return_type: ReturnType::Float,
            json_path: None,
            value_list_length: 3,
        })
        .unwrap();
        reg
    }

    fn dispatcher() -> Arc<ActionDispatcher> {
        Arc::new(ActionDispatcher::new(
            Arc::new(History::new(100)),
            Arc::new(NoopNotifier),
            Vec::new(),
        ))
    }

    #[test]
    fn unknown_operator_is_rejected_at_build_time() {
        let reg = make_registry_with_temp();
        let actions = vec![Arc::new(ActionRecord {
            name: "a".into(),
            route: "http://x".into(),
        })];
        let descs = vec![RuleDescriptor {
            name: "r".into(),
            tests: vec![("temp".into(), "=~".into(), serde_json::json!(1))],
            action: "a".into(),
            active: true,
        }];
        let err = build_rules(&descs, &reg, &actions).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownOperator(_)));
    }

    #[test]
    fn unknown_sensor_reference_is_rejected() {
        let reg = make_registry_with_temp();
        let actions = vec![Arc::new(ActionRecord {
            name: "a".into(),
            route: "http://x".into(),
        })];
        let descs = vec![RuleDescriptor {
            name: "r".into(),
            tests: vec![("ghost".into(), ">".into(), serde_json::json!(1))],
            action: "a".into(),
            active: true,
        }];
        let err = build_rules(&descs, &reg, &actions).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownSensor(_)));
    }

    #[test]
    fn conjunction_requires_all_tests_true() {
        let reg = make_registry_with_temp();
        reg.append("temp", RawPayload::Text("22".into())).unwrap();
        let actions = vec![Arc::new(ActionRecord {
            name: "a".into(),
            route: "http://x".into(),
        })];
        let descs = vec![RuleDescriptor {
            name: "r".into(),
            tests: vec![
                ("temp".into(), ">".into(), serde_json::json!(20)),
                ("temp".into(), "<".into(), serde_json::json!(10)),
            ],
            action: "a".into(),
            active: true,
        }];
        let rules = build_rules(&descs, &reg, &actions).unwrap();
        let (_, all_pass) = {
            let mut ok = true;
            let mut last = None;
            for t in &rules[0].tests {
                let (c, p) = t.evaluate();
                ok &= p;
                last = c;
            }
            (last, ok)
        };
        assert!(!all_pass);
    }

    #[test]
    fn empty_tests_rejected() {
        let reg = make_registry_with_temp();
        let actions: Vec<Arc<ActionRecord>> = Vec::new();
        let descs = vec![RuleDescriptor {
            name: "r".into(),
            tests: vec![],
            action: "a".into(),
            active: true,
        }];
        let err = build_rules(&descs, &reg, &actions).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyTests(_)));
    }

    #[test]
    fn no_value_sensor_fails_test_safely() {
        let reg = make_registry_with_temp();
        let actions = vec![Arc::new(ActionRecord {
            name: "a".into(),
            route: "http://x".into(),
        })];
        let descs = vec![RuleDescriptor {
            name: "r".into(),
            tests: vec![("temp".into(), ">".into(), serde_json::json!(1))],
            action: "a".into(),
            active: true,
        }];
        let rules = build_rules(&descs, &reg, &actions).unwrap();
        let (current, passes) = rules[0].tests[0].evaluate();
        assert_eq!(current, None);
        assert!(!passes);
    }
}
