//! Pass/fail classification of test runner output.
//!
//! Two sources feed a [`Verdict`]:
//!
//! 1. The structured status blocks `am instrument -r` prints on Android
//!    ([`InstrumentationReport`]). When present these are authoritative for
//!    the tests they describe.
//! 2. Text heuristics over the raw output (banners, summary counts, crash
//!    markers, exception type names). These are approximate: a harness that
//!    words a failure in a way not listed here is classified as a pass, and
//!    an innocuous log line that names an exception type is classified as a
//!    failure.
//!
//! A run fails when any signal fires.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Why a run was classified as failed, in check order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureSignal {
    /// A test in the structured instrumentation report ended with an error or failure code
    ReportedFailure,
    /// `** TEST FAILED **`, `FAILURES!!!`, ...
    SuiteFailureBanner,
    /// `Tests run: N, Failures: K` with K >= 1
    FailureCount,
    /// `INSTRUMENTATION_FAILED` or a negative status code
    InstrumentationFailed,
    /// `INSTRUMENTATION_RESULT:` mentioning a failure, crash or exception
    ResultMessage,
    /// A generic "test failed" phrase
    TestFailedPhrase,
    /// A fully-qualified exception or error type name
    RuntimeException,
}

/// Classification outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub success: bool,
    pub signals: Vec<FailureSignal>,
}

static SUITE_BANNER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)\*\* TEST (?:EXECUTE |BUILD )?FAILED \*\*|^FAILURES!!!|Test Suite '[^']*' failed").unwrap()
});

static FAILURE_COUNT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"Tests run:\s*\d+,\s*Failures:\s*(\d+)").unwrap());

static INSTRUMENTATION_FAILED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"INSTRUMENTATION_FAILED|INSTRUMENTATION_STATUS_CODE:\s*-[12]\b").unwrap()
});

static RESULT_MESSAGE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?mi)^INSTRUMENTATION_RESULT:.*(?:fail|crash|exception)").unwrap()
});

static TEST_FAILED: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\btests? failed\b").unwrap());

static RUNTIME_EXCEPTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:[a-z][a-z0-9_]*\.)+[A-Z][A-Za-z0-9_$]*(?:Exception|Error)\b").unwrap()
});

/// Whether the raw output describes a passing run.
pub fn classify(raw: &str) -> bool {
    verdict(raw).success
}

/// Full classification with the signals that fired.
pub fn verdict(raw: &str) -> Verdict {
    let mut signals = Vec::new();

    let report = InstrumentationReport::parse(raw);
    if report.has_failures() {
        signals.push(FailureSignal::ReportedFailure);
    }

    if SUITE_BANNER.is_match(raw) {
        signals.push(FailureSignal::SuiteFailureBanner);
    }
    let counted_failure = FAILURE_COUNT
        .captures_iter(raw)
        .any(|c| c[1].parse::<u64>().map(|k| k >= 1).unwrap_or(false));
    if counted_failure {
        signals.push(FailureSignal::FailureCount);
    }
    if INSTRUMENTATION_FAILED.is_match(raw) {
        signals.push(FailureSignal::InstrumentationFailed);
    }
    if RESULT_MESSAGE.is_match(raw) {
        signals.push(FailureSignal::ResultMessage);
    }
    if TEST_FAILED.is_match(raw) {
        signals.push(FailureSignal::TestFailedPhrase);
    }
    if RUNTIME_EXCEPTION.is_match(raw) {
        signals.push(FailureSignal::RuntimeException);
    }

    Verdict {
        success: signals.is_empty(),
        signals,
    }
}

const STACK_MARKER: &str = "INSTRUMENTATION_STATUS: stack=";
const STATUS_CODE_MARKER: &str = "INSTRUMENTATION_STATUS_CODE:";

/// The failure stack block from `am instrument -r` output.
///
/// Runs from the first `INSTRUMENTATION_STATUS: stack=` to the next
/// status line (another `INSTRUMENTATION_STATUS` key or the
/// `INSTRUMENTATION_STATUS_CODE:` closing the block). Empty when there is
/// no such block; callers then show the whole output.
pub fn extract_error_excerpt(raw: &str) -> String {
    let Some(start) = raw.find(STACK_MARKER) else {
        return String::new();
    };
    let block = &raw[start + STACK_MARKER.len()..];
    let end = block.find("\nINSTRUMENTATION_STATUS").unwrap_or(block.len());
    block[..end].trim().to_string()
}

/// Final status of one test in an instrumentation report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestStatus {
    pub class: String,
    pub test: String,
    /// 0 ok, -1 error, -2 failure, -3 ignored, -4 assumption failure
    pub code: i32,
    pub stack: Option<String>,
}

impl TestStatus {
    pub fn failed(&self) -> bool {
        matches!(self.code, -1 | -2)
    }
}

/// Structured view of `am instrument -r` output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstrumentationReport {
    /// Completed tests (status code 1 "started" blocks are folded away)
    pub tests: Vec<TestStatus>,
    /// `INSTRUMENTATION_CODE:` of the whole run, if printed
    pub run_code: Option<i32>,
}

impl InstrumentationReport {
    /// Parse status blocks. Text that is not part of a block is ignored.
    pub fn parse(raw: &str) -> Self {
        let mut report = Self::default();
        let mut class = String::new();
        let mut test = String::new();
        let mut stack: Option<String> = None;
        // Continuation lines of a multi-line `stack=` value.
        let mut in_stack = false;

        for line in raw.lines() {
            if let Some(rest) = line.strip_prefix("INSTRUMENTATION_STATUS: ") {
                in_stack = false;
                if let Some(v) = rest.strip_prefix("class=") {
                    class = v.trim().to_string();
                } else if let Some(v) = rest.strip_prefix("test=") {
                    test = v.trim().to_string();
                } else if let Some(v) = rest.strip_prefix("stack=") {
                    stack = Some(v.to_string());
                    in_stack = true;
                }
            } else if let Some(rest) = line.strip_prefix(STATUS_CODE_MARKER) {
                in_stack = false;
                let code = rest.trim().parse::<i32>().unwrap_or(0);
                // 1 marks a test start; its block is superseded by the final one.
                if code != 1 && !test.is_empty() {
                    report.tests.push(TestStatus {
                        class: class.clone(),
                        test: test.clone(),
                        code,
                        stack: stack.take().map(|s| s.trim_end().to_string()),
                    });
                }
                stack = None;
            } else if let Some(rest) = line.strip_prefix("INSTRUMENTATION_CODE:") {
                in_stack = false;
                report.run_code = rest.trim().parse().ok();
            } else if in_stack {
                if let Some(s) = stack.as_mut() {
                    s.push('\n');
                    s.push_str(line);
                }
            }
        }
        report
    }

    /// Whether the output contained any status blocks at all.
    pub fn is_structured(&self) -> bool {
        !self.tests.is_empty() || self.run_code.is_some()
    }

    pub fn has_failures(&self) -> bool {
        self.tests.iter().any(TestStatus::failed)
    }
}
