//! Learned fix patterns: which fixes actually worked for which failures.
//!
//! Every recorded attempt is keyed by a normalized error signature, so the
//! same failure seen across machines and reruns accumulates into one
//! [`FixPattern`]. Durability beats batching here: attempts are rare and
//! losing one to a crash would silently skew the statistics, so the full
//! map is rewritten after every mutation and each attempt is also appended
//! to a JSONL audit log.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::analyze::{ErrorKind, TestFailure};
use crate::cache::{self, DATA_DIR};
use crate::error::{Error, Result};
use crate::logging::Logger;
use crate::util;

const PATTERNS_FILE: &str = "patterns.json";
const FEEDBACK_FILE: &str = "feedback.jsonl";

/// Bumped when the document layout changes; older documents are discarded.
const PATTERN_FORMAT_VERSION: u32 = 1;

/// Gates for [`PatternStore::best_fix`]. Below these a pattern is a data
/// point, not advice.
const MIN_RELIABLE_ATTEMPTS: u32 = 3;
const MIN_RELIABLE_RATE: f64 = 0.6;

/// Patterns with fewer attempts than this are surfaced by `needing_data`.
const DATA_SUFFICIENCY_ATTEMPTS: u32 = 5;

/// Signatures are capped so one pathological message can't bloat the keys.
const SIGNATURE_MAX_CHARS: usize = 200;

static RE_PATH: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(/[\w./-]+)+\.\w+").unwrap());

static RE_LINE_COL: LazyLock<Regex> = LazyLock::new(|| Regex::new(r":\d+:\d+").unwrap());

static RE_NUMBERS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d{2,}\b").unwrap());

static RE_HEX: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[0-9a-f]{8,}").unwrap());

static RE_DQUOTE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#""[^"]{20,}""#).unwrap());

static RE_BTICK: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"`[^`]{20,}`").unwrap());

static RE_WS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Collapse the dynamic parts of an error message so reruns of the same
/// failure land on the same pattern key.
///
/// Replaces absolute paths, `:line:col` pairs, multi-digit numbers, hex
/// runs, and long quoted strings with stable placeholders, then lowercases,
/// collapses whitespace, and truncates.
pub fn normalize_message(message: &str) -> String {
    let lowered = message.to_lowercase();
    let n = RE_PATH.replace_all(&lowered, "<path>");
    let n = RE_LINE_COL.replace_all(&n, ":<n>:<n>");
    let n = RE_NUMBERS.replace_all(&n, "<n>");
    let n = RE_HEX.replace_all(&n, "<id>");
    let n = RE_DQUOTE.replace_all(&n, "<str>");
    let n = RE_BTICK.replace_all(&n, "<str>");
    let n = RE_WS.replace_all(&n, " ");
    util::truncate(n.trim(), SIGNATURE_MAX_CHARS)
}

/// Stable lookup key for a failure: `error_kind::normalized_message`.
pub fn signature(kind: ErrorKind, message: &str) -> String {
    format!("{}::{}", kind.as_str(), normalize_message(message))
}

/// Laplace-smoothed reliability estimate.
///
/// Starts at the neutral 0.5 prior with no evidence and converges on the
/// raw success rate as attempts accumulate; always strictly inside (0, 1).
pub fn laplace_confidence(successes: u32, attempts: u32) -> f64 {
    (f64::from(successes) + 1.0) / (f64::from(attempts) + 2.0)
}

/// One learned association between a normalized failure signature and the
/// fixes that have been tried against it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixPattern {
    pub id: Uuid,
    pub error_pattern: String,
    pub error_kind: ErrorKind,
    pub successful_fixes: Vec<String>,
    pub failed_fixes: Vec<String>,
    /// Derived: successes / total_attempts. Recomputed from the lists on
    /// every mutation and on import, never trusted from disk.
    pub success_rate: f64,
    pub total_attempts: u32,
    pub last_updated: DateTime<Utc>,
    /// Derived: smoothed success rate, see [`laplace_confidence`].
    pub confidence: f64,
}

impl FixPattern {
    fn new(signature: String, kind: ErrorKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            error_pattern: signature,
            error_kind: kind,
            successful_fixes: Vec::new(),
            failed_fixes: Vec::new(),
            success_rate: 0.0,
            total_attempts: 0,
            last_updated: Utc::now(),
            confidence: laplace_confidence(0, 0),
        }
    }

    fn recompute_derived(&mut self) {
        let successes = self.successful_fixes.len() as u32;
        let failures = self.failed_fixes.len() as u32;
        self.total_attempts = successes + failures;
        self.success_rate = if self.total_attempts == 0 {
            0.0
        } else {
            f64::from(successes) / f64::from(self.total_attempts)
        };
        self.confidence = laplace_confidence(successes, self.total_attempts);
    }

    /// The fix label that has most often worked for this pattern.
    pub fn top_fix(&self) -> Option<&str> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for fix in &self.successful_fixes {
            *counts.entry(fix.as_str()).or_default() += 1;
        }
        counts
            .into_iter()
            .max_by_key(|(fix, count)| (*count, std::cmp::Reverse(*fix)))
            .map(|(fix, _)| fix)
    }
}

/// Append-only audit record of a single fix attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixFeedback {
    pub id: Uuid,
    pub pattern: String,
    pub fix: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// On-disk layout of `patterns.json`; also the export/import format.
#[derive(Debug, Default, Serialize, Deserialize)]
struct PatternDocument {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    patterns: HashMap<String, FixPattern>,
}

/// Durable store of fix outcomes for one project.
pub struct PatternStore {
    data_dir: PathBuf,
    patterns: HashMap<String, FixPattern>,
    logger: Logger,
}

impl PatternStore {
    /// Open the store for a project. Never fails: a corrupt or missing
    /// patterns file degrades to an empty store with a warning.
    pub fn open(project_root: &Path, logger: Logger) -> Self {
        let data_dir = project_root.join(DATA_DIR);
        let patterns = load_document(&data_dir, &logger).patterns;
        Self {
            data_dir,
            patterns,
            logger,
        }
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }

    /// Record one fix attempt against the failure's pattern and persist.
    ///
    /// Appends the label to the success or failure list, recomputes the
    /// derived statistics, rewrites `patterns.json`, and appends one
    /// [`FixFeedback`] row to the audit log.
    pub fn record_fix_attempt(
        &mut self,
        failure: &TestFailure,
        fix_label: &str,
        success: bool,
        feedback: Option<String>,
        notes: Option<String>,
    ) -> Result<()> {
        let key = signature(failure.error_kind, &failure.error_message);
        let now = Utc::now();

        let pattern = self
            .patterns
            .entry(key.clone())
            .or_insert_with(|| FixPattern::new(key.clone(), failure.error_kind));
        if success {
            pattern.successful_fixes.push(fix_label.to_string());
        } else {
            pattern.failed_fixes.push(fix_label.to_string());
        }
        pattern.recompute_derived();
        pattern.last_updated = now;

        self.persist()?;
        self.logger.debug(&format!(
            "recorded {} for pattern {}",
            if success { "success" } else { "failure" },
            key
        ));
        self.append_feedback(&FixFeedback {
            id: Uuid::new_v4(),
            pattern: key,
            fix: fix_label.to_string(),
            success,
            timestamp: now,
            feedback,
            notes,
        })
    }

    /// Highest-confidence pattern for this failure, or `None` when nothing
    /// recorded so far clears the evidence gates (`total_attempts >= 3` and
    /// `success_rate >= 0.6`). Callers must never present a thin pattern as
    /// reliable advice.
    pub fn best_fix(
        &self,
        error_message: &str,
        error_kind: ErrorKind,
    ) -> Result<Option<&FixPattern>> {
        if error_message.trim().is_empty() {
            return Err(Error::Validation(
                "cannot look up a fix for an empty error message".into(),
            ));
        }
        let key = signature(error_kind, error_message);
        Ok(self.patterns.get(&key).filter(|p| {
            p.total_attempts >= MIN_RELIABLE_ATTEMPTS && p.success_rate >= MIN_RELIABLE_RATE
        }))
    }

    /// Patterns ranked by confidence descending, attempts as tiebreak.
    pub fn most_reliable(&self, limit: usize) -> Vec<&FixPattern> {
        let mut ranked: Vec<&FixPattern> = self.patterns.values().collect();
        ranked.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.total_attempts.cmp(&a.total_attempts))
                .then_with(|| a.error_pattern.cmp(&b.error_pattern))
        });
        ranked.truncate(limit);
        ranked
    }

    /// Patterns without enough attempts to trust, thinnest first, so users
    /// know where feedback is most valuable.
    pub fn needing_data(&self) -> Vec<&FixPattern> {
        let mut thin: Vec<&FixPattern> = self
            .patterns
            .values()
            .filter(|p| p.total_attempts < DATA_SUFFICIENCY_ATTEMPTS)
            .collect();
        thin.sort_by(|a, b| {
            a.total_attempts
                .cmp(&b.total_attempts)
                .then_with(|| a.error_pattern.cmp(&b.error_pattern))
        });
        thin
    }

    /// Write the full pattern document to `path` for sharing or backup.
    /// Same shape as the on-disk persistence format.
    pub fn export(&self, path: &Path) -> Result<()> {
        let doc = PatternDocument {
            version: PATTERN_FORMAT_VERSION,
            patterns: self.patterns.clone(),
        };
        let content =
            serde_json::to_string_pretty(&doc).map_err(|e| Error::parse("patterns export", e))?;
        util::write_atomic(path, &content)
    }

    /// Replace the in-memory map with a previously exported document.
    ///
    /// Validation is strict where startup loading is forgiving: this is a
    /// user-supplied file, so counts that disagree with the lists or rates
    /// outside [0, 1] are an error and the store is left untouched. Derived
    /// fields are recomputed rather than trusted. Returns the number of
    /// imported patterns.
    pub fn import_from(&mut self, path: &Path) -> Result<usize> {
        let content = fs::read_to_string(path).map_err(|e| Error::file_access(path, e))?;
        let doc: PatternDocument = serde_json::from_str(&content)
            .map_err(|e| Error::Validation(format!("malformed patterns document: {}", e)))?;
        if doc.version != PATTERN_FORMAT_VERSION {
            return Err(Error::Validation(format!(
                "unsupported patterns format version {}",
                doc.version
            )));
        }

        let mut imported = HashMap::with_capacity(doc.patterns.len());
        for (key, mut pattern) in doc.patterns {
            let listed = (pattern.successful_fixes.len() + pattern.failed_fixes.len()) as u32;
            if pattern.total_attempts != listed {
                return Err(Error::Validation(format!(
                    "pattern {:?}: total_attempts is {} but {} fixes are listed",
                    key, pattern.total_attempts, listed
                )));
            }
            if !(0.0..=1.0).contains(&pattern.success_rate)
                || !(0.0..=1.0).contains(&pattern.confidence)
            {
                return Err(Error::Validation(format!(
                    "pattern {:?}: success_rate or confidence out of range",
                    key
                )));
            }
            if pattern.error_pattern != key {
                return Err(Error::Validation(format!(
                    "pattern {:?}: key does not match its error_pattern",
                    key
                )));
            }
            pattern.recompute_derived();
            imported.insert(key, pattern);
        }

        let count = imported.len();
        self.patterns = imported;
        self.persist()?;
        self.logger
            .debug(&format!("imported {} fix patterns", count));
        Ok(count)
    }

    fn persist(&self) -> Result<()> {
        cache::ensure_data_dir(&self.data_dir)?;
        let _lock = cache::acquire_lock(&self.data_dir, true)?;
        let doc = PatternDocument {
            version: PATTERN_FORMAT_VERSION,
            patterns: self.patterns.clone(),
        };
        let content =
            serde_json::to_string(&doc).map_err(|e| Error::parse("patterns serialization", e))?;
        util::write_atomic(&self.data_dir.join(PATTERNS_FILE), &content)
    }

    fn append_feedback(&self, record: &FixFeedback) -> Result<()> {
        cache::ensure_data_dir(&self.data_dir)?;
        let _lock = cache::acquire_lock(&self.data_dir, true)?;
        let path = self.data_dir.join(FEEDBACK_FILE);
        let row = serde_json::to_string(record).map_err(|e| Error::parse("feedback record", e))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::file_access(&path, e))?;
        writeln!(file, "{}", row).map_err(|e| Error::file_access(&path, e))?;
        Ok(())
    }
}

fn load_document(data_dir: &Path, logger: &Logger) -> PatternDocument {
    let path = data_dir.join(PATTERNS_FILE);
    if !path.exists() {
        return PatternDocument::default();
    }

    let _lock = cache::acquire_lock(data_dir, false).ok();
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(err) => {
            logger.warn(&format!(
                "patterns file unreadable ({}); starting fresh",
                err
            ));
            return PatternDocument::default();
        }
    };

    match serde_json::from_str::<PatternDocument>(&content) {
        Ok(doc) if doc.version == PATTERN_FORMAT_VERSION => doc,
        Ok(doc) => {
            logger.warn(&format!(
                "patterns format v{} is outdated; starting fresh",
                doc.version
            ));
            PatternDocument::default()
        }
        Err(err) => {
            logger.warn(&format!(
                "patterns file corrupted ({}); starting fresh",
                err
            ));
            PatternDocument::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_failure(message: &str, kind: ErrorKind) -> TestFailure {
        TestFailure {
            test_name: "adds numbers".into(),
            test_file: Some(PathBuf::from("/proj/src/math.test.js")),
            error_message: message.into(),
            error_kind: kind,
            stack_trace: Vec::new(),
            source_file: None,
            line: None,
            column: None,
            suggestion: None,
        }
    }

    #[test]
    fn success_rate_tracks_recorded_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PatternStore::open(dir.path(), Logger::silent());
        let failure = sample_failure("Cannot find module './utils'", ErrorKind::MissingImport);

        for _ in 0..3 {
            store
                .record_fix_attempt(&failure, "fix import path", true, None, None)
                .unwrap();
        }
        store
            .record_fix_attempt(&failure, "fix import path", false, None, None)
            .unwrap();

        let best = store
            .best_fix(&failure.error_message, failure.error_kind)
            .unwrap()
            .expect("pattern clears both gates");
        assert_eq!(best.total_attempts, 4);
        assert!((best.success_rate - 0.75).abs() < 1e-9);
        assert_eq!(best.successful_fixes.len(), 3);
        assert_eq!(best.top_fix(), Some("fix import path"));
    }

    #[test]
    fn best_fix_withholds_unproven_patterns() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PatternStore::open(dir.path(), Logger::silent());
        let failure = sample_failure(
            "expect(received).toBe(expected)",
            ErrorKind::AssertionMismatch,
        );

        // Two successes: too few attempts.
        for _ in 0..2 {
            store
                .record_fix_attempt(&failure, "update literal", true, None, None)
                .unwrap();
        }
        assert!(store
            .best_fix(&failure.error_message, failure.error_kind)
            .unwrap()
            .is_none());

        // Two failures on top: enough attempts, but the rate drops to 0.5.
        for _ in 0..2 {
            store
                .record_fix_attempt(&failure, "update literal", false, None, None)
                .unwrap();
        }
        assert!(store
            .best_fix(&failure.error_message, failure.error_kind)
            .unwrap()
            .is_none());
    }

    #[test]
    fn best_fix_rejects_blank_messages() {
        let dir = tempfile::tempdir().unwrap();
        let store = PatternStore::open(dir.path(), Logger::silent());
        let err = store.best_fix("   ", ErrorKind::Other).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn confidence_smoothing_is_monotonic_and_bounded() {
        // Two successes and one failure land exactly on 0.6.
        assert!((laplace_confidence(2, 3) - 0.6).abs() < 1e-9);
        // Monotonic in successes at fixed attempts.
        assert!(laplace_confidence(3, 4) > laplace_confidence(2, 4));
        // Converges toward the raw rate as evidence accumulates.
        let near = laplace_confidence(80, 100);
        let far = laplace_confidence(8, 10);
        assert!((near - 0.8).abs() < (far - 0.8).abs());
        // Strictly inside (0, 1), with a neutral prior at zero evidence.
        assert!((laplace_confidence(0, 0) - 0.5).abs() < 1e-9);
        assert!(laplace_confidence(50, 50) < 1.0);
        assert!(laplace_confidence(0, 50) > 0.0);
    }

    #[test]
    fn signatures_ignore_paths_and_line_numbers() {
        let a = signature(
            ErrorKind::TypeError,
            "TypeError at /home/alice/proj/src/main.js:10:5",
        );
        let b = signature(
            ErrorKind::TypeError,
            "TypeError at /tmp/elsewhere/lib.js:42:12",
        );
        assert_eq!(a, b);

        let c = signature(ErrorKind::TypeError, "undefined is not a function");
        assert_ne!(a, c);

        // The kind participates in the key.
        assert_ne!(
            signature(ErrorKind::TypeError, "boom"),
            signature(ErrorKind::Other, "boom")
        );
    }

    #[test]
    fn patterns_persist_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let failure = sample_failure("Cannot find module 'lodash'", ErrorKind::MissingImport);
        {
            let mut store = PatternStore::open(dir.path(), Logger::silent());
            store
                .record_fix_attempt(
                    &failure,
                    "install the package",
                    true,
                    Some("worked first try".into()),
                    None,
                )
                .unwrap();
        }

        let store = PatternStore::open(dir.path(), Logger::silent());
        assert_eq!(store.pattern_count(), 1);
        let key = signature(failure.error_kind, &failure.error_message);
        assert!(store.patterns.contains_key(&key));

        let feedback_path = dir.path().join(DATA_DIR).join(FEEDBACK_FILE);
        let feedback = fs::read_to_string(feedback_path).unwrap();
        assert_eq!(feedback.lines().count(), 1);
        let record: FixFeedback = serde_json::from_str(feedback.lines().next().unwrap()).unwrap();
        assert!(record.success);
        assert_eq!(record.feedback.as_deref(), Some("worked first try"));
    }

    #[test]
    fn export_import_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PatternStore::open(dir.path(), Logger::silent());
        let import_fail = sample_failure("Cannot find module './a'", ErrorKind::MissingImport);
        let assert_fail = sample_failure("expected 2, received 3", ErrorKind::AssertionMismatch);
        for _ in 0..3 {
            store
                .record_fix_attempt(&import_fail, "fix path", true, None, None)
                .unwrap();
        }
        store
            .record_fix_attempt(&assert_fail, "update literal", false, None, None)
            .unwrap();

        let export_path = dir.path().join("export.json");
        store.export(&export_path).unwrap();

        let other_dir = tempfile::tempdir().unwrap();
        let mut other = PatternStore::open(other_dir.path(), Logger::silent());
        let imported = other.import_from(&export_path).unwrap();
        assert_eq!(imported, 2);

        for (key, original) in &store.patterns {
            let copied = other.patterns.get(key).expect("imported pattern");
            assert_eq!(copied.success_rate, original.success_rate);
            assert_eq!(copied.confidence, original.confidence);
            assert_eq!(copied.total_attempts, original.total_attempts);
        }
    }

    #[test]
    fn import_rejects_inconsistent_documents() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PatternStore::open(dir.path(), Logger::silent());
        let failure = sample_failure("boom", ErrorKind::Other);
        store
            .record_fix_attempt(&failure, "shrug", true, None, None)
            .unwrap();

        // total_attempts lies about the lists.
        let doc = serde_json::json!({
            "version": 1,
            "patterns": {
                "other::boom": {
                    "id": "00000000-0000-0000-0000-000000000000",
                    "error_pattern": "other::boom",
                    "error_kind": "other",
                    "successful_fixes": ["a"],
                    "failed_fixes": [],
                    "success_rate": 1.0,
                    "total_attempts": 7,
                    "last_updated": "2026-01-01T00:00:00Z",
                    "confidence": 0.5
                }
            }
        });
        let bad_path = dir.path().join("bad.json");
        fs::write(&bad_path, doc.to_string()).unwrap();

        let err = store.import_from(&bad_path).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert_eq!(
            store.pattern_count(),
            1,
            "failed import must not clobber the store"
        );

        // Not JSON at all.
        fs::write(&bad_path, "{definitely not json").unwrap();
        assert!(matches!(
            store.import_from(&bad_path),
            Err(Error::Validation(_))
        ));
    }

    #[test]
    fn ranking_orders_by_confidence_then_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = PatternStore::open(dir.path(), Logger::silent());
        let strong = sample_failure("Cannot find module './a'", ErrorKind::MissingImport);
        let weak = sample_failure("expected 1, received 2", ErrorKind::AssertionMismatch);
        let thin = sample_failure("foo is not a mock", ErrorKind::MockError);

        for _ in 0..6 {
            store
                .record_fix_attempt(&strong, "fix path", true, None, None)
                .unwrap();
        }
        for _ in 0..2 {
            store
                .record_fix_attempt(&weak, "update literal", true, None, None)
                .unwrap();
        }
        store
            .record_fix_attempt(&weak, "update literal", false, None, None)
            .unwrap();
        store
            .record_fix_attempt(&thin, "repoint mock", false, None, None)
            .unwrap();

        // Confidence: strong 7/8, weak 3/5, thin 1/3.
        let ranked = store.most_reliable(10);
        assert_eq!(ranked[0].error_kind, ErrorKind::MissingImport);
        assert_eq!(ranked[1].error_kind, ErrorKind::AssertionMismatch);
        assert_eq!(ranked[2].error_kind, ErrorKind::MockError);
        assert_eq!(store.most_reliable(1).len(), 1);

        // strong has enough data; thin (1 attempt) sorts before weak (3).
        let thin_list = store.needing_data();
        assert_eq!(thin_list.len(), 2);
        assert_eq!(thin_list[0].error_kind, ErrorKind::MockError);
        assert_eq!(thin_list[1].error_kind, ErrorKind::AssertionMismatch);
    }
}
