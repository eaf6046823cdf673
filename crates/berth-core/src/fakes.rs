//! In-memory fakes for the process manager and health prober (testing only)

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::probe::{HealthProbe, ProbeResult};
use crate::service::{ServiceManager, ServiceOutput};

/// [`ServiceManager`] that records every request and never touches a real
/// process.
#[derive(Debug, Default)]
pub struct RecordingServiceManager {
    calls: Mutex<Vec<String>>,
    fail_restart: bool,
    fail_stop: bool,
}

impl RecordingServiceManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_failing_restart(mut self) -> Self {
        self.fail_restart = true;
        self
    }

    pub fn with_failing_stop(mut self) -> Self {
        self.fail_stop = true;
        self
    }

    /// Verbs requested so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, verb: &str, fail: bool) -> ServiceOutput {
        self.calls.lock().unwrap().push(verb.to_string());
        if fail {
            ServiceOutput::failed(format!("Job for svc failed ({})", verb))
        } else {
            ServiceOutput::ok("")
        }
    }
}

#[async_trait]
impl ServiceManager for RecordingServiceManager {
    async fn restart(&self) -> ServiceOutput {
        self.record("restart", self.fail_restart)
    }

    async fn stop(&self) -> ServiceOutput {
        self.record("stop", self.fail_stop)
    }

    async fn status(&self) -> ServiceOutput {
        self.record("status", false)
    }
}

/// [`HealthProbe`] answering from a script.
///
/// Queued results are returned in order; once the queue is empty the
/// fallback result is returned forever.
#[derive(Debug)]
pub struct ScriptedProbe {
    queue: Mutex<VecDeque<ProbeResult>>,
    fallback: ProbeResult,
    urls: Mutex<Vec<String>>,
    delay: Duration,
}

impl ScriptedProbe {
    /// Every probe answers 200.
    pub fn healthy() -> Self {
        Self::with_fallback(ProbeResult::passed(200, "ok"))
    }

    /// Every probe fails with `diagnostic` and no HTTP status.
    pub fn failing(diagnostic: &str) -> Self {
        Self::with_fallback(ProbeResult::failed(None, diagnostic))
    }

    pub fn with_fallback(fallback: ProbeResult) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            fallback,
            urls: Mutex::new(Vec::new()),
            delay: Duration::ZERO,
        }
    }

    /// Take `delay` to answer each probe.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Queue a one-off result ahead of the fallback.
    pub fn then(self, result: ProbeResult) -> Self {
        self.queue.lock().unwrap().push_back(result);
        self
    }

    /// URLs probed so far.
    pub fn probed(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self, url: &str, _method: &str, _timeout: Duration) -> ProbeResult {
        self.urls.lock().unwrap().push(url.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.queue
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}
