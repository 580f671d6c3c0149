//! Harness for the live end-to-end scenarios.
//!
//! A [`TestRunner`] connects a real monitor, runs a trigger closure which
//! provokes kernel events (fork, exec, ...), collects everything delivered
//! on every channel for a settle window, and checks the declared
//! expectations against the collected stream. Requires CAP_NET_ADMIN, so
//! these run through the `test-suite` binary rather than `cargo test`.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::mpsc;

use crate::{EventChannels, MonitorConfig, MonitorError, ProcEvent, ProcessMonitor};

/// How long after the trigger we keep collecting before closing the
/// monitor. Connector delivery is fast; the slack covers scheduling.
const SETTLE_TIME: Duration = Duration::from_millis(300);

/// A module's set of live tests.
pub struct TestSuite {
    pub name: &'static str,
    pub tests: Vec<TestCase>,
}

/// A test is an async function which returns a TestReport.
pub struct TestCase {
    pub name: &'static str,
    pub test: Pin<Box<dyn Future<Output = TestReport> + Send>>,
}

impl TestCase {
    pub fn new(name: &'static str, test: impl Future<Output = TestReport> + 'static + Send) -> Self {
        Self {
            name,
            test: Box::pin(test),
        }
    }
}

/// TestReport is the TestCase output.
#[must_use]
pub struct TestReport {
    pub success: bool,
    pub lines: Vec<String>,
}

enum Collected {
    Event(ProcEvent),
    Error(MonitorError),
}

pub struct TestRunner {
    monitor: ProcessMonitor,
    rx: mpsc::UnboundedReceiver<Collected>,
}

impl TestRunner {
    /// Connect a monitor and start collecting everything it delivers.
    pub fn start(config: MonitorConfig) -> anyhow::Result<Self> {
        let mut monitor = ProcessMonitor::connect(config)
            .context("connecting to the process-events connector (CAP_NET_ADMIN required)")?;
        let channels = monitor.listen_events()?;
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(collect(channels, tx));
        Ok(Self { monitor, rx })
    }

    /// Run the triggering code, wait for the kernel events to land, close
    /// the monitor, and return the collected stream for inspection.
    pub async fn run(mut self, trigger: impl FnOnce()) -> TestResult {
        trigger();
        tokio::time::sleep(SETTLE_TIME).await;
        self.monitor.close();
        // Let the collector drain what the listener flushed on shutdown.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut events = Vec::new();
        let mut errors = Vec::new();
        while let Ok(item) = self.rx.try_recv() {
            match item {
                Collected::Event(event) => events.push(event),
                Collected::Error(error) => errors.push(error),
            }
        }
        TestResult {
            events,
            errors,
            expectations: Vec::new(),
        }
    }
}

/// Funnel every per-kind channel back into a single collection stream.
async fn collect(mut channels: EventChannels, tx: mpsc::UnboundedSender<Collected>) {
    loop {
        let item = tokio::select! {
            Some(e) = channels.ack.recv() => Collected::Event(ProcEvent::Ack(e)),
            Some(e) = channels.fork.recv() => Collected::Event(ProcEvent::Fork(e)),
            Some(e) = channels.exec.recv() => Collected::Event(ProcEvent::Exec(e)),
            Some(e) = channels.uid.recv() => Collected::Event(ProcEvent::Uid(e)),
            Some(e) = channels.gid.recv() => Collected::Event(ProcEvent::Gid(e)),
            Some(e) = channels.sid.recv() => Collected::Event(ProcEvent::Sid(e)),
            Some(e) = channels.exit.recv() => Collected::Event(ProcEvent::Exit(e)),
            Some(e) = channels.other.recv() => Collected::Event(ProcEvent::Other(e)),
            Some(e) = channels.error.recv() => Collected::Error(e),
            else => break,
        };
        if tx.send(item).is_err() {
            break;
        }
    }
}

/// Events collected for one scenario, plus the expectations to check.
pub struct TestResult {
    pub events: Vec<ProcEvent>,
    pub errors: Vec<MonitorError>,
    expectations: Vec<Expectation>,
}

struct Expectation {
    description: &'static str,
    exactly: Option<usize>,
    predicate: Box<dyn Fn(&ProcEvent) -> bool + Send>,
}

impl TestResult {
    /// Require at least one collected event to match.
    pub fn expect(
        mut self,
        description: &'static str,
        predicate: impl Fn(&ProcEvent) -> bool + Send + 'static,
    ) -> Self {
        self.expectations.push(Expectation {
            description,
            exactly: None,
            predicate: Box::new(predicate),
        });
        self
    }

    /// Require exactly `count` collected events to match.
    pub fn expect_exactly(
        mut self,
        description: &'static str,
        count: usize,
        predicate: impl Fn(&ProcEvent) -> bool + Send + 'static,
    ) -> Self {
        self.expectations.push(Expectation {
            description,
            exactly: Some(count),
            predicate: Box::new(predicate),
        });
        self
    }

    /// Check every expectation against the collected events. Any error
    /// surfaced on the error channel fails the scenario.
    pub fn report(self) -> TestReport {
        let mut success = true;
        let mut lines = Vec::new();
        lines.push(format!("* {} events collected:", self.events.len()));
        for event in &self.events {
            lines.push(format!("| {event}"));
        }
        for error in &self.errors {
            lines.push(format!("unexpected monitor error: {error:?}"));
            success = false;
        }
        for expectation in &self.expectations {
            let found = self
                .events
                .iter()
                .filter(|e| (expectation.predicate)(e))
                .count();
            let ok = match expectation.exactly {
                Some(count) => found == count,
                None => found > 0,
            };
            if !ok {
                let wanted = match expectation.exactly {
                    Some(count) => format!("exactly {count}"),
                    None => "at least one".to_string(),
                };
                lines.push(format!(
                    "❌ {}: wanted {wanted} matching event, found {found}",
                    expectation.description
                ));
                success = false;
            }
        }
        TestReport { success, lines }
    }
}
