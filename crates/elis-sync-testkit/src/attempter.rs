//! A delivery attempter driven by a script.
//!
//! Steps are consumed in call order; once the script runs out the default
//! step applies. Payload rules take precedence over the script, which lets a
//! test fail one particular subject no matter when it is attempted.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use elis_sync_core::EventType;
use elis_sync_delivery::{Delivered, DeliveryAttempter, DeliveryFailure, Result};

/// What one attempt does.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Succeed,
    Fail(DeliveryFailure),
    /// Panic inside the attempt.
    Panic,
    /// Sleep, then succeed. Used to trip the attempt timeout.
    Hang(Duration),
}

/// One recorded call.
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub event_type: EventType,
    pub payload: Value,
}

struct PayloadRule {
    field: String,
    value: Value,
    step: Step,
}

struct Script {
    steps: VecDeque<Step>,
    rules: Vec<PayloadRule>,
    default: Step,
    calls: Vec<Call>,
}

/// Scripted [`DeliveryAttempter`]. Clones share the script and call log.
#[derive(Clone)]
pub struct ScriptedAttempter {
    script: Arc<Mutex<Script>>,
}

impl ScriptedAttempter {
    /// An attempter that succeeds unless scripted otherwise.
    pub fn new() -> Self {
        Self::with_default(Step::Succeed)
    }

    /// An attempter whose unscripted calls perform `step`.
    pub fn with_default(step: Step) -> Self {
        Self {
            script: Arc::new(Mutex::new(Script {
                steps: VecDeque::new(),
                rules: Vec::new(),
                default: step,
                calls: Vec::new(),
            })),
        }
    }

    /// An attempter that always fails with `failure`.
    pub fn failing(failure: DeliveryFailure) -> Self {
        Self::with_default(Step::Fail(failure))
    }

    /// Queue the next step.
    pub fn push(&self, step: Step) -> &Self {
        self.script.lock().unwrap().steps.push_back(step);
        self
    }

    pub fn then_succeed(&self) -> &Self {
        self.push(Step::Succeed)
    }

    pub fn then_fail(&self, failure: DeliveryFailure) -> &Self {
        self.push(Step::Fail(failure))
    }

    /// Perform `step` for every payload whose `field` equals `value`.
    pub fn on_payload(&self, field: &str, value: Value, step: Step) -> &Self {
        self.script.lock().unwrap().rules.push(PayloadRule {
            field: field.to_string(),
            value,
            step,
        });
        self
    }

    /// Every call so far, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.script.lock().unwrap().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.script.lock().unwrap().calls.len()
    }

    /// Values of `field` across all calls, in order.
    pub fn called_with(&self, field: &str) -> Vec<Value> {
        self.calls()
            .into_iter()
            .map(|c| c.payload.get(field).cloned().unwrap_or(Value::Null))
            .collect()
    }

    fn next_step(&self, event_type: EventType, payload: &Value) -> Step {
        let mut script = self.script.lock().unwrap();
        script.calls.push(Call {
            event_type,
            payload: payload.clone(),
        });

        let ruled = script
            .rules
            .iter()
            .find(|r| payload.get(&r.field) == Some(&r.value))
            .map(|r| r.step.clone());
        if let Some(step) = ruled {
            return step;
        }

        match script.steps.pop_front() {
            Some(step) => step,
            None => script.default.clone(),
        }
    }
}

impl Default for ScriptedAttempter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeliveryAttempter for ScriptedAttempter {
    async fn attempt(&self, event_type: EventType, payload: &Value) -> Result<Delivered> {
        match self.next_step(event_type, payload) {
            Step::Succeed => Ok(Delivered::with_status(200)),
            Step::Fail(failure) => Err(failure),
            Step::Panic => panic!("scripted attempter panic"),
            Step::Hang(duration) => {
                tokio::time::sleep(duration).await;
                Ok(Delivered::with_status(200))
            }
        }
    }
}
