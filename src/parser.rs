//! Line parser for instrumentation output.
//!
//! The on-device instrumentation runner reports progress as a line
//! protocol: `INSTRUMENTATION_STATUS: <key>=<value>` lines accumulate
//! fields of the current test block, `INSTRUMENTATION_STATUS_CODE: <n>`
//! closes a block (or, for positive codes, marks the test started), and
//! bare lines continue the most recent multi-line field. The parser turns
//! that into [`TestRunListener`](crate::reporting::TestRunListener) calls.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::{debug, error, warn};

use crate::reporting::TestRunListener;

pub const CODE_PASSED: i32 = 0;
pub const CODE_ERROR: i32 = -1;
pub const CODE_FAILED: i32 = -2;
pub const CODE_SKIPPED: i32 = -3;
pub const CODE_ASSUMPTION_VIOLATION: i32 = -4;

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error("unknown test status code {code}")]
    UnknownStatusCode { code: i32 },

    #[error("status code received outside of a test execution block")]
    CodeOutsideTest,

    #[error("malformed instrumentation line: '{line}'")]
    Malformed { line: String },
}

/// Marks the start and end of each test's execution, for agents that need
/// positional bookkeeping (log capture offsets, per-test timers).
pub trait ExecutionMarker: Send + Sync {
    fn mark_start(&self, test: &str);
    fn mark_end(&self, test: &str);
}

#[derive(Default)]
struct TestBlock {
    runner: String,
    test_id: String,
    clazz: String,
    stream: String,
    stack: String,
    test_no: i32,
    started_at: Option<Instant>,
}

impl TestBlock {
    fn new() -> Self {
        Self {
            test_no: -1,
            ..Default::default()
        }
    }

    fn full_name(&self) -> String {
        format!("{}.{}", self.clazz, self.test_id)
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), ParseError> {
        let value = value.trim();
        match key {
            "id" => self.runner = value.to_string(),
            "test" => self.test_id = value.to_string(),
            "class" => self.clazz = value.to_string(),
            "current" => {
                self.test_no = value.parse().map_err(|_| ParseError::Malformed {
                    line: format!("current={value}"),
                })?
            }
            "stream" => {
                if !self.stream.is_empty() {
                    self.stream.push('\n');
                }
                self.stream.push_str(value);
            }
            "stack" => {
                if !self.stack.is_empty() {
                    self.stack.push('\n');
                }
                self.stack.push_str(value);
            }
            other => warn!("unrecognized field '{other}', ignoring"),
        }
        Ok(())
    }
}

/// State machine over instrumentation output lines.
pub struct InstrumentationOutputParser {
    listeners: Vec<Arc<dyn TestRunListener>>,
    markers: Vec<Arc<dyn ExecutionMarker>>,
    current: Option<TestBlock>,
    current_key: Option<String>,
    total_test_count: usize,
    execution_time: Option<Duration>,
    return_code: Option<i32>,
}

impl InstrumentationOutputParser {
    pub fn new(listeners: Vec<Arc<dyn TestRunListener>>) -> Self {
        Self {
            listeners,
            markers: Vec::new(),
            current: None,
            current_key: None,
            total_test_count: 0,
            execution_time: None,
            return_code: None,
        }
    }

    /// Attach an agent to be told when each test starts and ends.
    /// Markers can only be added before parsing begins.
    pub fn add_execution_marker(&mut self, marker: Arc<dyn ExecutionMarker>) {
        self.markers.push(marker);
    }

    /// Number of tests the runner said it would execute, once seen.
    pub fn total_test_count(&self) -> usize {
        self.total_test_count
    }

    /// Device-reported execution time for the whole run, once seen.
    pub fn execution_time(&self) -> Option<Duration> {
        self.execution_time
    }

    /// Final instrumentation return code, once seen.
    pub fn return_code(&self) -> Option<i32> {
        self.return_code
    }

    /// Feed one line of instrumentation output through the state machine.
    pub fn parse_line(&mut self, line: &str) -> Result<(), ParseError> {
        if line.is_empty() {
            return Ok(());
        }
        debug!("instrumentation line: {line}");
        if let Some(rest) = line.strip_prefix("INSTRUMENTATION_STATUS_CODE:") {
            let code: i32 = rest.trim().parse().map_err(|_| ParseError::Malformed {
                line: line.to_string(),
            })?;
            return self.process_code(code);
        }
        if let Some(rest) = line.strip_prefix("INSTRUMENTATION_STATUS:") {
            let (key, value) = rest
                .trim()
                .split_once('=')
                .ok_or_else(|| ParseError::Malformed {
                    line: line.to_string(),
                })?;
            if key == "numtests" {
                self.total_test_count = value.trim().parse().map_err(|_| ParseError::Malformed {
                    line: line.to_string(),
                })?;
            } else {
                self.current
                    .get_or_insert_with(TestBlock::new)
                    .set(key, value)?;
                self.current_key = Some(key.to_string());
            }
            return Ok(());
        }
        if let Some(rest) = line.strip_prefix("INSTRUMENTATION_CODE:") {
            self.return_code = Some(rest.trim().parse().map_err(|_| ParseError::Malformed {
                line: line.to_string(),
            })?);
            return Ok(());
        }
        if let Some(rest) = line.strip_prefix("Time:") {
            let cleaned = rest.trim().replace('s', "").replace(',', "");
            match cleaned.parse::<f64>() {
                Ok(secs) if secs >= 0.0 => self.execution_time = Some(Duration::from_secs_f64(secs)),
                _ => error!("could not parse execution time from '{line}'"),
            }
            return Ok(());
        }
        if line.starts_with("OK") {
            debug!("execution completed for {} tests", self.total_test_count);
            if let Some(block) = &self.current {
                error!("incomplete test at end of run: {}", block.test_id);
            }
            self.current = None;
            self.current_key = None;
            return Ok(());
        }
        // A bare line continues the most recently seen key.
        if let Some(key) = self.current_key.clone() {
            if let Some(block) = self.current.as_mut() {
                block.set(&key, line)?;
            }
            return Ok(());
        }
        debug!("ignoring unassociated output line: '{line}'");
        Ok(())
    }

    fn process_code(&mut self, code: i32) -> Result<(), ParseError> {
        if code > 0 {
            // Start marker; the block stays open until a terminal code.
            let (clazz, test_id, name) = {
                let block = self.current.as_mut().ok_or(ParseError::CodeOutsideTest)?;
                block.started_at = Some(Instant::now());
                (block.clazz.clone(), block.test_id.clone(), block.full_name())
            };
            for listener in &self.listeners {
                listener.test_started(&clazz, &test_id);
            }
            for marker in &self.markers {
                marker.mark_start(&name);
            }
            return Ok(());
        }

        let block = self.current.take().ok_or(ParseError::CodeOutsideTest)?;
        self.current_key = None;
        let result = match code {
            CODE_PASSED => {
                let duration = block
                    .started_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                for listener in &self.listeners {
                    listener.test_ended(
                        &block.clazz,
                        &block.test_id,
                        block.test_no,
                        duration,
                        &block.stream,
                    );
                }
                Ok(())
            }
            CODE_ERROR | CODE_FAILED => {
                for listener in &self.listeners {
                    listener.test_failed(
                        &block.clazz,
                        &block.test_id,
                        block.test_no,
                        &block.stream,
                        &block.stack,
                    );
                }
                Ok(())
            }
            CODE_SKIPPED => {
                for listener in &self.listeners {
                    listener.test_ignored(&block.clazz, &block.test_id, block.test_no, &block.stream);
                }
                Ok(())
            }
            CODE_ASSUMPTION_VIOLATION => {
                for listener in &self.listeners {
                    listener.test_assumption_violated(
                        &block.clazz,
                        &block.test_id,
                        block.test_no,
                        &block.stream,
                    );
                }
                Ok(())
            }
            other => Err(ParseError::UnknownStatusCode { code: other }),
        };
        let name = block.full_name();
        for marker in &self.markers {
            marker.mark_end(&name);
        }
        result
    }
}

/// Watchdog for a single test overrunning its time budget.
///
/// Attached to the parser as an [`ExecutionMarker`]; the consumer polls
/// [`overrun`](Self::overrun) between lines and aborts the suite when a
/// test has been running too long.
pub struct TestTimer {
    budget: Duration,
    running: Mutex<Option<(String, Instant)>>,
}

impl TestTimer {
    pub fn new(budget: Duration) -> Self {
        Self {
            budget,
            running: Mutex::new(None),
        }
    }

    /// Name of the test that exceeded its budget, if any is overdue.
    pub fn overrun(&self) -> Option<String> {
        let running = self.running.lock().expect("timer lock poisoned");
        running
            .as_ref()
            .filter(|(_, started)| started.elapsed() > self.budget)
            .map(|(name, _)| name.clone())
    }
}

impl ExecutionMarker for TestTimer {
    fn mark_start(&self, test: &str) {
        *self.running.lock().expect("timer lock poisoned") =
            Some((test.to_string(), Instant::now()));
    }

    fn mark_end(&self, _test: &str) {
        *self.running.lock().expect("timer lock poisoned") = None;
    }
}
