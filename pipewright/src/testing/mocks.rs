//! Mock agents for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::executor::{Agent, AgentRequest};

/// Records calls and returns a fixed value, or echoes its request.
#[derive(Debug)]
pub struct MockAgent {
    output: Option<Value>,
    requests: Mutex<Vec<AgentRequest>>,
}

impl MockAgent {
    /// Agent returning `value` on every call.
    #[must_use]
    pub fn returning(value: Value) -> Self {
        Self {
            output: Some(value),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Agent returning `{"stage", "config", "inputs"}` from its request.
    #[must_use]
    pub fn echo() -> Self {
        Self {
            output: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Number of invocations.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.requests.lock().len()
    }

    /// Requests received, in order.
    #[must_use]
    pub fn requests(&self) -> Vec<AgentRequest> {
        self.requests.lock().clone()
    }

    /// Stage IDs this agent was invoked for, in order.
    #[must_use]
    pub fn stages(&self) -> Vec<String> {
        self.requests.lock().iter().map(|r| r.stage.clone()).collect()
    }
}

#[async_trait]
impl Agent for MockAgent {
    async fn invoke(&self, request: AgentRequest) -> Result<Value, String> {
        let output = self.output.clone().unwrap_or_else(|| {
            json!({
                "stage": request.stage,
                "config": request.config,
                "inputs": request.inputs,
            })
        });
        self.requests.lock().push(request);
        Ok(output)
    }
}

/// Always fails with the same reason.
#[derive(Debug)]
pub struct FailingAgent {
    reason: String,
    calls: AtomicU32,
}

impl FailingAgent {
    /// Agent failing with `reason`.
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            calls: AtomicU32::new(0),
        }
    }

    /// Number of invocations.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for FailingAgent {
    async fn invoke(&self, _request: AgentRequest) -> Result<Value, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(self.reason.clone())
    }
}

/// Fails a fixed number of times, then succeeds.
#[derive(Debug)]
pub struct FlakyAgent {
    failures: u32,
    output: Value,
    calls: AtomicU32,
}

impl FlakyAgent {
    /// Agent failing `failures` times before returning `output`.
    #[must_use]
    pub fn new(failures: u32, output: Value) -> Self {
        Self {
            failures,
            output,
            calls: AtomicU32::new(0),
        }
    }

    /// Number of invocations.
    #[must_use]
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for FlakyAgent {
    async fn invoke(&self, _request: AgentRequest) -> Result<Value, String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n < self.failures {
            Err(format!("transient failure {}", n + 1))
        } else {
            Ok(self.output.clone())
        }
    }
}

/// Sleeps before returning, and tracks how many calls overlap.
#[derive(Debug)]
pub struct SlowAgent {
    delay: Duration,
    output: Value,
    active: AtomicU32,
    peak: AtomicU32,
}

impl SlowAgent {
    /// Agent sleeping `delay` then returning `output`.
    #[must_use]
    pub fn new(delay: Duration, output: Value) -> Self {
        Self {
            delay,
            output,
            active: AtomicU32::new(0),
            peak: AtomicU32::new(0),
        }
    }

    /// Highest number of concurrent invocations seen.
    #[must_use]
    pub fn peak_concurrency(&self) -> u32 {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Agent for SlowAgent {
    async fn invoke(&self, _request: AgentRequest) -> Result<Value, String> {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok(self.output.clone())
    }
}
