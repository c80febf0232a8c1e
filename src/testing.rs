//! Test runner detection and execution
//!
//! Detects the project's JS test runner, discovers test files, and runs
//! a single test file as a bounded child process.

use crate::error::Result;
use crate::imports::Language;
use crate::util::{self, CancelFlag};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, Instant};

/// Directories never scanned for test files.
const SKIP_DIRS: &[&str] = &[
    "node_modules",
    ".git",
    "dist",
    "build",
    "coverage",
    ".next",
    ".recheck",
];

/// Detected test runner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestRunner {
    Jest,
    Vitest,
    /// Fallback: whatever `npm test` is wired to.
    NpmScript,
}

impl TestRunner {
    pub fn name(&self) -> &'static str {
        match self {
            TestRunner::Jest => "jest",
            TestRunner::Vitest => "vitest",
            TestRunner::NpmScript => "npm test",
        }
    }
}

/// Detect the test runner from package.json contents.
///
/// A substring check is deliberate: the runner can appear in
/// devDependencies, scripts, or a jest/vitest config block, and any of
/// those means the project uses it.
pub fn detect_runner(project_root: &Path) -> TestRunner {
    if let Ok(pkg_json) = fs::read_to_string(project_root.join("package.json")) {
        if pkg_json.contains("vitest") {
            return TestRunner::Vitest;
        } else if pkg_json.contains("jest") {
            return TestRunner::Jest;
        }
    }
    TestRunner::NpmScript
}

/// Build the command that runs one test file under the given runner.
///
/// Jest and vitest are asked for JSON output so results can be parsed
/// structurally; the npm fallback produces free-form text only.
pub fn command_for_file(runner: TestRunner, test_file: &Path) -> (String, Vec<String>) {
    let file = test_file.display().to_string();
    match runner {
        TestRunner::Jest => (
            "npx".to_string(),
            vec!["jest".to_string(), file, "--json".to_string()],
        ),
        TestRunner::Vitest => (
            "npx".to_string(),
            vec![
                "vitest".to_string(),
                "run".to_string(),
                file,
                "--reporter=json".to_string(),
            ],
        ),
        TestRunner::NpmScript => ("npm".to_string(), vec!["test".to_string()]),
    }
}

/// Walk up from `start` to the nearest directory containing package.json.
pub fn find_project_root(start: &Path) -> Option<PathBuf> {
    let mut dir = if start.is_file() {
        start.parent()?
    } else {
        start
    };
    loop {
        if dir.join("package.json").is_file() {
            return Some(dir.to_path_buf());
        }
        dir = dir.parent()?;
    }
}

/// True for JS/TS files with a `.test.` or `.spec.` infix.
pub fn is_test_file(path: &Path) -> bool {
    if Language::from_path(path) == Language::Unknown {
        return false;
    }
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    name.contains(".test.") || name.contains(".spec.")
}

/// Find all test files under `root`, sorted for stable output.
pub fn discover_tests(root: &Path) -> Vec<PathBuf> {
    // Depth 0 is the walk root itself: the caller chose it, so the skip
    // list only applies to entries below it.
    let mut tests: Vec<PathBuf> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_skipped(e.path()))
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_file() && is_test_file(e.path()))
        .map(|e| e.path().to_path_buf())
        .collect();
    tests.sort();
    tests
}

fn is_skipped(path: &Path) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    SKIP_DIRS.contains(&name) || name.starts_with('.')
}

/// Captured run of one test file.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

/// Run one test file under the detected runner.
///
/// Bounded by `timeout` and `cancel`; both kill the child and surface as
/// the corresponding typed error. A failing test suite is a normal
/// outcome (`success = false`), not an error.
pub fn run_test_file(
    project_root: &Path,
    runner: TestRunner,
    test_file: &Path,
    timeout: Duration,
    cancel: &CancelFlag,
) -> Result<RunOutcome> {
    let (program, args) = command_for_file(runner, test_file);
    let mut cmd = Command::new(&program);
    cmd.args(&args).current_dir(project_root);

    let start = Instant::now();
    let output = util::run_command_with_deadline(&mut cmd, timeout, cancel)?;
    let duration_ms = start.elapsed().as_millis() as u64;

    Ok(RunOutcome {
        success: output.status.success(),
        stdout: output.stdout,
        stderr: output.stderr,
        duration_ms,
    })
}
