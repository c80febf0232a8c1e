//! Test failure analysis
//!
//! Parses runner output (Jest JSON or free-form text) into structured
//! failure records, classifies each failure, and extracts a best-effort
//! source location from the stack trace.

use crate::error::{Error, Result};
use crate::testing::RunOutcome;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Category of a test failure, in persistence-stable snake_case.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AssertionMismatch,
    NullReference,
    MissingImport,
    MockError,
    TypeError,
    Other,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::AssertionMismatch => "assertion_mismatch",
            ErrorKind::NullReference => "null_reference",
            ErrorKind::MissingImport => "missing_import",
            ErrorKind::MockError => "mock_error",
            ErrorKind::TypeError => "type_error",
            ErrorKind::Other => "other",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stack trace line, with location parsed out when it matches the
/// usual `at … (path:line:col)` shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StackFrame {
    pub raw: String,
    pub file: Option<PathBuf>,
    pub line: Option<usize>,
    pub column: Option<usize>,
}

/// A single failed test, as produced by the analyzer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestFailure {
    pub test_name: String,
    pub test_file: Option<PathBuf>,
    pub error_message: String,
    pub error_kind: ErrorKind,
    pub stack_trace: Vec<StackFrame>,
    pub source_file: Option<PathBuf>,
    pub line: Option<usize>,
    pub column: Option<usize>,
    pub suggestion: Option<String>,
}

/// Outcome of one test run, the unit the cache stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestResultSummary {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub failures: Vec<TestFailure>,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl TestResultSummary {
    pub fn all_passed(&self) -> bool {
        self.failed == 0
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  CLASSIFICATION
// ═══════════════════════════════════════════════════════════════════════════

/// Ordered classification table; first match wins. Most specific kinds
/// come first: a "TypeError: Cannot read properties of undefined" must
/// land in null_reference, not type_error.
static CLASSIFIERS: LazyLock<Vec<(Regex, ErrorKind)>> = LazyLock::new(|| {
    let table: &[(&str, ErrorKind)] = &[
        (
            r"(?i)cannot find module|module not found|cannot resolve|err_module_not_found",
            ErrorKind::MissingImport,
        ),
        (
            r"(?i)cannot read propert(y|ies) of (undefined|null)|(undefined|null) is not an object|is not defined",
            ErrorKind::NullReference,
        ),
        (
            r"(?i)jest\.mock|mock function|tohavebeencalled|mockreturnvalue|mockimplementation|is not a mock",
            ErrorKind::MockError,
        ),
        (
            r"(?i)expect\(|expected.*received|received.*expected|\btobe\b|toequal|tostrictequal|tomatch|assertionerror",
            ErrorKind::AssertionMismatch,
        ),
        (
            r"(?i)is not a function|is not a constructor|typeerror|not assignable to",
            ErrorKind::TypeError,
        ),
    ];
    table
        .iter()
        .map(|(pattern, kind)| {
            // Table patterns are static; a bad one is a programming error
            // caught by the classifier tests.
            (Regex::new(pattern).unwrap(), *kind)
        })
        .collect()
});

static ANSI_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1b\[[0-9;]*m").unwrap());

static FRAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*at\s+(?:.*?\()?([^()\s]+):(\d+):(\d+)\)?\s*$").unwrap());

static DURATION_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*\(\d+\s*m?s\)\s*$").unwrap());

static TEXT_COUNT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)\s+(failed|passed|skipped|total)").unwrap());

/// Classify an error message, consulting the stack text only when the
/// message alone matches nothing.
pub fn classify(message: &str, stack_text: &str) -> ErrorKind {
    for (regex, kind) in CLASSIFIERS.iter() {
        if regex.is_match(message) {
            return *kind;
        }
    }
    if !stack_text.is_empty() {
        for (regex, kind) in CLASSIFIERS.iter() {
            if regex.is_match(stack_text) {
                return *kind;
            }
        }
    }
    ErrorKind::Other
}

fn suggestion_for(kind: ErrorKind) -> Option<String> {
    let text = match kind {
        ErrorKind::MissingImport => {
            "Check the import path and installed packages; the module could not be resolved."
        }
        ErrorKind::NullReference => {
            "Guard against undefined/null before the access, or fix the setup that should provide the value."
        }
        ErrorKind::MockError => {
            "Verify the mock is declared with jest.mock() and its expectations match how the code is called."
        }
        ErrorKind::AssertionMismatch => {
            "Update the expected value if the behavior change is intentional; otherwise fix the regression."
        }
        ErrorKind::TypeError => {
            "Check the types being passed; a value does not support the operation performed on it."
        }
        ErrorKind::Other => return None,
    };
    Some(text.to_string())
}

/// Strip ANSI color codes that jest embeds in its messages.
pub fn strip_ansi(text: &str) -> String {
    ANSI_RE.replace_all(text, "").into_owned()
}

/// Parse one stack line. Handles both `at fn (path:1:2)` and bare
/// `at path:1:2` shapes; anything else keeps only the raw text.
pub fn parse_stack_frame(line: &str) -> StackFrame {
    let raw = line.trim_end().to_string();
    if let Some(caps) = FRAME_RE.captures(line) {
        let file = caps.get(1).map(|m| PathBuf::from(m.as_str()));
        let line_no = caps.get(2).and_then(|m| m.as_str().parse().ok());
        let column = caps.get(3).and_then(|m| m.as_str().parse().ok());
        StackFrame {
            raw,
            file,
            line: line_no,
            column,
        }
    } else {
        StackFrame {
            raw,
            file: None,
            line: None,
            column: None,
        }
    }
}

/// First frame that points at application code: not a test file, not
/// node_modules, not a runtime-internal path. Best-effort; returns
/// `None` when every frame is infrastructure.
pub fn source_location(frames: &[StackFrame]) -> Option<(PathBuf, usize, usize)> {
    frames.iter().find_map(|frame| {
        let file = frame.file.as_ref()?;
        let text = file.to_string_lossy();
        if text.contains(".test.") || text.contains(".spec.") {
            return None;
        }
        if text.contains("node_modules") || text.starts_with("internal/") || text.starts_with("node:") {
            return None;
        }
        Some((file.clone(), frame.line?, frame.column.unwrap_or(1)))
    })
}

/// Fill in the derived fields of a failure: kind, source location and a
/// suggestion. Idempotent.
pub fn analyze_failure(failure: &mut TestFailure) {
    let stack_text: String = failure
        .stack_trace
        .iter()
        .map(|f| f.raw.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    failure.error_kind = classify(&failure.error_message, &stack_text);

    if let Some((file, line, column)) = source_location(&failure.stack_trace) {
        failure.source_file = Some(file);
        failure.line = Some(line);
        failure.column = Some(column);
    }

    failure.suggestion = suggestion_for(failure.error_kind);
}

fn base_failure(test_name: String, test_file: Option<&Path>) -> TestFailure {
    TestFailure {
        test_name,
        test_file: test_file.map(|p| p.to_path_buf()),
        error_message: String::new(),
        error_kind: ErrorKind::Other,
        stack_trace: Vec::new(),
        source_file: None,
        line: None,
        column: None,
        suggestion: None,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  JEST JSON OUTPUT
// ═══════════════════════════════════════════════════════════════════════════

// The document produced by `jest --json` (vitest's json reporter mirrors
// it). Every field is defaulted: the shape drifts between versions and a
// missing counter must not fail the parse.

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JestDocument {
    #[serde(default)]
    num_total_tests: usize,
    #[serde(default)]
    num_passed_tests: usize,
    #[serde(default)]
    num_failed_tests: usize,
    #[serde(default)]
    num_pending_tests: usize,
    #[serde(default)]
    test_results: Vec<JestFileResult>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JestFileResult {
    #[serde(default)]
    name: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    assertion_results: Vec<JestAssertion>,
    #[serde(default)]
    start_time: Option<u64>,
    #[serde(default)]
    end_time: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JestAssertion {
    #[serde(default)]
    full_name: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    failure_messages: Vec<String>,
}

/// Parse `jest --json` output into a summary.
///
/// Malformed JSON is a typed `Parse` error, never a silently empty
/// summary; callers that want the text fallback must choose it
/// explicitly.
pub fn parse_jest_output(json: &str) -> Result<TestResultSummary> {
    let doc: JestDocument =
        serde_json::from_str(json.trim()).map_err(|e| Error::parse("jest JSON output", e))?;

    let mut failures = Vec::new();
    let mut duration_ms: u64 = 0;

    for file_result in &doc.test_results {
        if let (Some(start), Some(end)) = (file_result.start_time, file_result.end_time) {
            duration_ms += end.saturating_sub(start);
        }

        let test_file = if file_result.name.is_empty() {
            None
        } else {
            Some(PathBuf::from(&file_result.name))
        };

        for assertion in &file_result.assertion_results {
            if assertion.status != "failed" {
                continue;
            }
            let name = if assertion.full_name.is_empty() {
                assertion.title.clone()
            } else {
                assertion.full_name.clone()
            };

            let message = assertion
                .failure_messages
                .first()
                .map(|m| strip_ansi(m))
                .unwrap_or_else(|| strip_ansi(&file_result.message));

            let mut failure = base_failure(name, test_file.as_deref());
            failure.stack_trace = message
                .lines()
                .filter(|l| l.trim_start().starts_with("at "))
                .map(parse_stack_frame)
                .collect();
            failure.error_message = message;
            analyze_failure(&mut failure);
            failures.push(failure);
        }
    }

    Ok(TestResultSummary {
        total: doc.num_total_tests,
        passed: doc.num_passed_tests,
        failed: doc.num_failed_tests.max(failures.len()),
        skipped: doc.num_pending_tests,
        failures,
        duration_ms,
        timestamp: Utc::now(),
    })
}

// ═══════════════════════════════════════════════════════════════════════════
//  TEXT OUTPUT (fallback)
// ═══════════════════════════════════════════════════════════════════════════

fn strip_failure_marker(line: &str) -> Option<&str> {
    for marker in ['✕', '×', '✗'] {
        if let Some(rest) = line.strip_prefix(marker) {
            return Some(rest.trim());
        }
    }
    None
}

/// Extract failures from free-form runner text.
///
/// Recognizes per-test markers (`✕ × ✗`), jest's `●` detail blocks and
/// bare `FAIL` lines. Unrecognized formats yield an empty list, never an
/// error.
pub fn parse_text_output(text: &str, test_file: Option<&Path>) -> Vec<TestFailure> {
    let clean = strip_ansi(text);
    let lines: Vec<&str> = clean.lines().collect();

    let mut failures: Vec<TestFailure> = Vec::new();
    let mut saw_fail_line = false;

    let mut i = 0;
    while i < lines.len() {
        let trimmed = lines[i].trim_start();

        if let Some(rest) = strip_failure_marker(trimmed) {
            let name = DURATION_SUFFIX_RE.replace(rest, "").trim().to_string();
            if !name.is_empty() && !failures.iter().any(|f| f.test_name == name) {
                failures.push(base_failure(name, test_file));
            }
        } else if let Some(rest) = trimmed.strip_prefix('●') {
            let name = rest.trim().to_string();
            let mut block: Vec<&str> = Vec::new();
            let mut j = i + 1;
            while j < lines.len() {
                let next = lines[j].trim_start();
                if strip_failure_marker(next).is_some()
                    || next.starts_with('●')
                    || next.starts_with("Test Suites:")
                {
                    break;
                }
                block.push(lines[j].trim_end());
                j += 1;
            }
            let message = block.join("\n").trim().to_string();
            let frames: Vec<StackFrame> = block
                .iter()
                .filter(|l| l.trim_start().starts_with("at "))
                .map(|l| parse_stack_frame(l))
                .collect();

            // The summary list repeats each test name after a ● header;
            // attach the detail block to the entry it belongs to.
            if let Some(existing) = failures
                .iter_mut()
                .find(|f| f.test_name == name || name.ends_with(f.test_name.as_str()))
            {
                if existing.error_message.is_empty() {
                    existing.error_message = message;
                    existing.stack_trace = frames;
                }
            } else if !name.is_empty() && !message.is_empty() {
                let mut failure = base_failure(name, test_file);
                failure.error_message = message;
                failure.stack_trace = frames;
                failures.push(failure);
            }
            i = j;
            continue;
        } else if trimmed.starts_with("FAIL") {
            saw_fail_line = true;
        }

        i += 1;
    }

    if failures.is_empty() && saw_fail_line {
        let mut failure = base_failure("test suite failed".to_string(), test_file);
        failure.error_message = crate::util::truncate(clean.trim(), 500);
        failures.push(failure);
    }

    for failure in &mut failures {
        analyze_failure(failure);
    }
    failures
}

/// Build a summary from free-form text plus the process outcome, using
/// the `Tests: 1 failed, 2 passed, 3 total` line when present.
pub fn summarize_text_output(
    text: &str,
    success: bool,
    duration_ms: u64,
    test_file: Option<&Path>,
) -> TestResultSummary {
    let failures = parse_text_output(text, test_file);

    let mut failed = failures.len();
    let mut passed = 0;
    let mut skipped = 0;
    let mut total = 0;
    let clean = strip_ansi(text);
    if let Some(counts_line) = clean.lines().find(|l| l.trim_start().starts_with("Tests:")) {
        for caps in TEXT_COUNT_RE.captures_iter(counts_line) {
            let n: usize = caps[1].parse().unwrap_or(0);
            match &caps[2] {
                "failed" => failed = n,
                "passed" => passed = n,
                "skipped" => skipped = n,
                "total" => total = n,
                _ => {}
            }
        }
    }
    if total == 0 {
        total = failed + passed + skipped;
    }
    if total == 0 {
        // No counts found at all; infer the minimum from the outcome.
        total = 1;
        if success {
            passed = 1;
        } else {
            failed = failed.max(1);
        }
    }

    TestResultSummary {
        total,
        passed,
        failed,
        skipped,
        failures,
        duration_ms,
        timestamp: Utc::now(),
    }
}

/// Interpret a finished run: structured JSON when the runner produced
/// it, text heuristics otherwise. The measured wall-clock duration wins
/// over whatever the runner reports.
pub fn summarize_run(outcome: &RunOutcome, test_file: &Path) -> TestResultSummary {
    match parse_jest_output(&outcome.stdout) {
        Ok(mut summary) => {
            summary.duration_ms = outcome.duration_ms;
            summary
        }
        Err(_) => {
            let mut combined = outcome.stdout.clone();
            if !outcome.stderr.is_empty() {
                combined.push('\n');
                combined.push_str(&outcome.stderr);
            }
            summarize_text_output(
                &combined,
                outcome.success,
                outcome.duration_ms,
                Some(test_file),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_json_is_a_parse_error() {
        let result = parse_jest_output("{not valid json");
        assert!(matches!(result, Err(Error::Parse(_))));
    }

    #[test]
    fn minimal_document_parses_with_defaults() {
        let summary = parse_jest_output("{}").unwrap();
        assert_eq!(summary.total, 0);
        assert!(summary.failures.is_empty());
    }

    #[test]
    fn jest_document_yields_classified_failures() {
        let json = r#"{
            "numTotalTests": 2,
            "numPassedTests": 1,
            "numFailedTests": 1,
            "testResults": [{
                "name": "/proj/src/sum.test.js",
                "startTime": 1000,
                "endTime": 1450,
                "assertionResults": [
                    {"fullName": "sum adds", "status": "passed", "failureMessages": []},
                    {"fullName": "sum carries", "status": "failed", "failureMessages": [
                        "Error: expect(received).toBe(expected)\n\nExpected: 3\nReceived: 2\n    at Object.<anonymous> (/proj/src/sum.test.js:12:19)\n    at /proj/src/sum.js:4:10"
                    ]}
                ]
            }]
        }"#;

        let summary = parse_jest_output(json).unwrap();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.passed, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.duration_ms, 450);
        assert_eq!(summary.failures.len(), 1);

        let failure = &summary.failures[0];
        assert_eq!(failure.test_name, "sum carries");
        assert_eq!(failure.error_kind, ErrorKind::AssertionMismatch);
        assert_eq!(
            failure.test_file.as_deref(),
            Some(Path::new("/proj/src/sum.test.js"))
        );
        // First non-test frame wins.
        assert_eq!(failure.source_file.as_deref(), Some(Path::new("/proj/src/sum.js")));
        assert_eq!(failure.line, Some(4));
        assert!(failure.suggestion.is_some());
    }

    #[test]
    fn classification_order_is_most_specific_first() {
        assert_eq!(
            classify("Cannot find module './missing' from 'src/app.js'", ""),
            ErrorKind::MissingImport
        );
        assert_eq!(
            classify("TypeError: Cannot read properties of undefined (reading 'name')", ""),
            ErrorKind::NullReference
        );
        assert_eq!(
            classify("expect(jest.fn()).toHaveBeenCalledTimes(1)", ""),
            ErrorKind::MockError
        );
        assert_eq!(
            classify("expect(received).toBe(expected)", ""),
            ErrorKind::AssertionMismatch
        );
        assert_eq!(
            classify("TypeError: x.map is not a function", ""),
            ErrorKind::TypeError
        );
        assert_eq!(classify("something novel happened", ""), ErrorKind::Other);
    }

    #[test]
    fn stack_text_is_consulted_when_message_is_opaque() {
        let kind = classify(
            "boom",
            "    at resolveModule (node_modules/jest-resolve/build/index.js:5:3)\nCannot find module 'left-pad'",
        );
        assert_eq!(kind, ErrorKind::MissingImport);
    }

    #[test]
    fn text_markers_produce_failures() {
        let text = "
FAIL src/sum.test.js
  ✕ adds numbers (14 ms)
  ✓ subtracts numbers (2 ms)

  ● adds numbers

    expect(received).toBe(expected)

    Expected: 3
    Received: 2

    at Object.<anonymous> (src/sum.test.js:5:17)
    at src/sum.js:2:10

Test Suites: 1 failed, 1 total
Tests:       1 failed, 1 passed, 2 total
";
        let failures = parse_text_output(text, Some(Path::new("src/sum.test.js")));
        assert_eq!(failures.len(), 1);
        let failure = &failures[0];
        assert_eq!(failure.test_name, "adds numbers");
        assert!(failure.error_message.contains("Expected: 3"));
        assert_eq!(failure.error_kind, ErrorKind::AssertionMismatch);
        assert_eq!(failure.source_file.as_deref(), Some(Path::new("src/sum.js")));
    }

    #[test]
    fn unknown_text_yields_empty_list() {
        let failures = parse_text_output("Compiled successfully in 2.3s", None);
        assert!(failures.is_empty());
    }

    #[test]
    fn bare_fail_line_yields_one_failure() {
        let failures = parse_text_output("FAIL src/app.test.js\nsomething broke", None);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].test_name, "test suite failed");
    }

    #[test]
    fn text_summary_reads_counts_line() {
        let text = "✕ carries\nTests: 1 failed, 3 passed, 4 total\n";
        let summary = summarize_text_output(text, false, 120, None);
        assert_eq!(summary.total, 4);
        assert_eq!(summary.passed, 3);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.duration_ms, 120);
    }

    #[test]
    fn ansi_codes_are_stripped() {
        let message = "\u{1b}[31mexpect(received).toBe(expected)\u{1b}[0m";
        assert_eq!(strip_ansi(message), "expect(received).toBe(expected)");
    }

    #[test]
    fn source_location_skips_infrastructure_frames() {
        let frames = vec![
            parse_stack_frame("    at Object.toBe (node_modules/expect/build/index.js:10:5)"),
            parse_stack_frame("    at Object.<anonymous> (src/app.test.js:9:3)"),
            parse_stack_frame("    at checkout (src/cart.js:40:11)"),
        ];
        let (file, line, column) = source_location(&frames).unwrap();
        assert_eq!(file, PathBuf::from("src/cart.js"));
        assert_eq!(line, 40);
        assert_eq!(column, 11);
    }
}
