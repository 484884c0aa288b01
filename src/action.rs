//! Action dispatcher (C7): fire an HTTP GET, record history, notify.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::Serialize;

use crate::error::NetworkError;
use crate::rules::TestRecord;

const ACTION_TIMEOUT: Duration = Duration::from_secs(10);
pub const HISTORY_CAPACITY: usize = 100;

/// A named HTTP GET target. Kept a pure data record: the dispatcher, not
/// the action, owns the notifier and recipients (see design note on
/// notifier coupling).
#[derive(Debug, Clone, Serialize)]
pub struct ActionRecord {
    pub name: String,
    pub route: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub route: String,
}

/// Fixed-capacity history of fired actions, oldest evicted first.
pub struct History {
    capacity: usize,
    entries: Mutex<VecDeque<HistoryEntry>>,
}

impl History {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    fn push(&self, entry: HistoryEntry) {
        let mut entries = self.entries.lock().unwrap();
        if entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Most recent `capacity` entries, oldest first.
    pub fn snapshot(&self) -> Vec<HistoryEntry> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }
}

/// Outbound notification collaborator, treated as an opaque
/// `Notifier.send(subject, body, recipients)`; this trait is that seam,
/// with a real blocking SMTP transport as the default implementation so
/// the binary has something to run.
pub trait Notifier: Send + Sync {
    fn send(&self, subject: &str, body: &str, recipients: &[String]) -> Result<(), NetworkError>;
}

/// SMTP relay on `localhost:25`, envelope from `eplumber@localhost`.
pub struct SmtpNotifier {
    relay_host: String,
}

impl SmtpNotifier {
    pub fn new(relay_host: impl Into<String>) -> Self {
        Self {
            relay_host: relay_host.into(),
        }
    }
}

impl Default for SmtpNotifier {
    fn default() -> Self {
        Self::new("localhost")
    }
}

impl Notifier for SmtpNotifier {
    fn send(&self, subject: &str, body: &str, recipients: &[String]) -> Result<(), NetworkError> {
        if recipients.is_empty() {
            debug!("no recipients configured, skipping notification {subject:?}");
            return Ok(());
        }

        use lettre::message::Mailbox;
        use lettre::{Message, SmtpTransport, Transport};

        let mut builder = Message::builder()
            .from(
                "eplumber@localhost"
                    .parse::<Mailbox>()
                    .map_err(|e| NetworkError(e.to_string()))?,
            )
            .subject(subject);
        for r in recipients {
            let mailbox = r.parse::<Mailbox>().map_err(|e| NetworkError(e.to_string()))?;
            builder = builder.to(mailbox);
        }
        let email = builder
            .body(body.to_string())
            .map_err(|e| NetworkError(e.to_string()))?;

        let mailer = SmtpTransport::builder_dangerous(&self.relay_host)
            .port(25)
            .timeout(Some(ACTION_TIMEOUT))
            .build();

        mailer.send(&email).map_err(|e| NetworkError(e.to_string()))?;
        Ok(())
    }
}

/// A notifier that does nothing; used in tests and wherever recipients are
/// configured but SMTP delivery should not be attempted for real.
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn send(&self, _subject: &str, _body: &str, _recipients: &[String]) -> Result<(), NetworkError> {
        Ok(())
    }
}

pub struct ActionDispatcher {
    client: reqwest::blocking::Client,
    history: Arc<History>,
    notifier: Arc<dyn Notifier>,
    recipients: Vec<String>,
}

impl ActionDispatcher {
    pub fn new(history: Arc<History>, notifier: Arc<dyn Notifier>, recipients: Vec<String>) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(ACTION_TIMEOUT)
            .build()
            .expect("failed to build HTTP client");
        Self {
            client,
            history,
            notifier,
            recipients,
        }
    }

    pub fn history(&self) -> Arc<History> {
        self.history.clone()
    }

    /// Execute one action firing: GET the action's route (fire-and-forget),
    /// record history, and notify. Failures in either step are logged and
    /// never propagate — the evaluator loop must keep going.
    pub fn dispatch(&self, rule_name: &str, action: &ActionRecord, tests: &[TestRecord]) {
        info!("firing action {:?} for rule {:?}", action.name, rule_name);

        match self.client.get(&action.route).send() {
            Ok(resp) => debug!("action {:?} GET returned {}", action.name, resp.status()),
            Err(e) => warn!("action {:?} GET {:?} failed: {e}", action.name, action.route),
        }

        self.history.push(HistoryEntry {
            timestamp: Utc::now(),
            name: action.name.clone(),
            route: action.route.clone(),
        });

        let subject = format!("Eplumber Action: {}", action.name);
        let body = render_body(rule_name, tests);
        if let Err(e) = self.notifier.send(&subject, &body, &self.recipients) {
            warn!("notification for action {:?} failed: {e}", action.name);
        }
    }
}

fn render_body(rule_name: &str, tests: &[TestRecord]) -> String {
    let mut body = format!(
        "Rule {rule_name:?} fired at {}\n\n",
        Utc::now().to_rfc3339()
    );
    for t in tests {
        let verdict = if t.passes { "PASS" } else { "FAIL" };
        body.push_str(&format!(
            "{verdict}: {} {} {} (observed {:?})\n",
            t.sensor_name, t.op, t.value, t.current
        ));
    }
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::Op;

    #[test]
    fn history_evicts_oldest_past_capacity() {
        let history = History::new(2);
        for i in 0..3 {
            history.push(HistoryEntry {
                timestamp: Utc::now(),
                name: format!("a{i}"),
                route: "http://x".into(),
            });
        }
        let snap = history.snapshot();
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[0].name, "a1");
        assert_eq!(snap[1].name, "a2");
    }

    #[test]
    fn render_body_includes_pass_fail_lines() {
        let tests = vec![TestRecord {
            sensor_name: "temp".into(),
            op: Op::Gt,
            value: serde_json::json!(25),
            current: Some(crate::codec::ScalarValue::Float(26.0)),
            passes: true,
        }];
        let body = render_body("r1", &tests);
        assert!(body.contains("PASS"));
        assert!(body.contains("temp"));
    }
}
