//! Mechanical fixes for the failure kinds that have one.
//!
//! Rules are deliberately narrow: each inspects the classified failure and
//! the referenced source file, and only proposes an edit when the evidence
//! is unambiguous (an import with exactly one plausible target, an
//! assertion literal that matches exactly one line). Anything murkier is
//! left to the pattern store and the assistant.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use uuid::Uuid;

use crate::analyze::{ErrorKind, TestFailure};
use crate::error::{Error, Result};
use crate::imports::{self, Language};
use crate::logging::Logger;
use crate::util;

/// Fix categories in tie-break priority order: when two fixes share a
/// confidence, the one declared earlier here wins. Derived `Ord` follows
/// declaration order, so sorting ascending by category is sorting by
/// priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FixCategory {
    Import,
    Assertion,
    Mock,
    Type,
    Syntax,
    Other,
}

impl FixCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            FixCategory::Import => "import",
            FixCategory::Assertion => "assertion",
            FixCategory::Mock => "mock",
            FixCategory::Type => "type",
            FixCategory::Syntax => "syntax",
            FixCategory::Other => "other",
        }
    }
}

/// One line-based edit. The closed shape keeps application trivially
/// verifiable: inserts never overwrite, replacements check their target
/// first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextEdit {
    /// Insert `text` as a new line before 1-based `line`; `line == 0`
    /// prepends.
    Insert { line: usize, text: String },
    /// Replace the 1-based `line`, verifying it currently equals `old`.
    Replace {
        line: usize,
        old: String,
        new: String,
    },
}

impl TextEdit {
    fn line(&self) -> usize {
        match self {
            TextEdit::Insert { line, .. } | TextEdit::Replace { line, .. } => *line,
        }
    }
}

/// A proposed repair for one failure. Transient: only the outcome is
/// recorded (by the pattern store), never the fix itself.
#[derive(Debug, Clone)]
pub struct AutoFix {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub file_path: PathBuf,
    pub edits: Vec<TextEdit>,
    pub confidence: f64,
    pub category: FixCategory,
}

/// Decision returned by the confirmation callback for one fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Yes,
    No,
    Skip,
    Cancel,
}

/// A fix that validated or wrote cleanly is `applied`; one whose edits no
/// longer match the file is `failed`. `rejected` and `skipped` mirror the
/// user's answers, and `cancelled` holds everything abandoned when the
/// user bailed out.
#[derive(Debug, Default)]
pub struct FixReport {
    pub applied: Vec<AutoFix>,
    pub failed: Vec<FailedFix>,
    pub rejected: Vec<AutoFix>,
    pub skipped: Vec<AutoFix>,
    pub cancelled: Vec<AutoFix>,
}

#[derive(Debug)]
pub struct FailedFix {
    pub fix: AutoFix,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ApplyOptions {
    /// Validate edits without writing anything.
    pub dry_run: bool,
    /// Ask the confirmation callback before each fix.
    pub confirm: bool,
}

static MODULE_NOT_FOUND_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)cannot (?:find|resolve) module '([^']+)'").unwrap());

static EXPECTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*Expected:\s*(.+?)\s*$").unwrap());

static RECEIVED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*Received:\s*(.+?)\s*$").unwrap());

static JEST_MOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"jest\.mock\(\s*['"]([^'"]+)['"]"#).unwrap());

static MOCK_FN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"([A-Za-z_$][\w$]*)(?:\.[\w$]+)*\.mock(?:ReturnValue|ReturnValueOnce|Implementation|ImplementationOnce|ResolvedValue|RejectedValue)\b",
    )
    .unwrap()
});

static NOT_A_MOCK_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([A-Za-z_$][\w$]*)[.\w$]*\s+is not a mock").unwrap());

/// Literals longer than this are never auto-swapped; big expected values
/// are usually structural, not a typo.
const MAX_LITERAL_CHARS: usize = 60;

/// Generates and applies mechanical fixes inside one project.
pub struct Fixer {
    project_root: PathBuf,
    logger: Logger,
}

impl Fixer {
    pub fn new(project_root: &Path, logger: Logger) -> Self {
        Self {
            project_root: project_root.to_path_buf(),
            logger,
        }
    }

    /// Build the fixes this failure admits, best first: descending
    /// confidence, category priority breaking ties.
    pub fn generate_fixes(&self, failure: &TestFailure) -> Vec<AutoFix> {
        let mut fixes = Vec::new();
        match failure.error_kind {
            ErrorKind::MissingImport => fixes.extend(self.import_path_fix(failure)),
            ErrorKind::AssertionMismatch => fixes.extend(self.assertion_literal_fix(failure)),
            ErrorKind::MockError => {
                fixes.extend(self.mock_path_fix(failure));
                fixes.extend(self.missing_mock_fix(failure));
            }
            // No mechanical rule exists for these; the pattern store and
            // the assistant cover them.
            ErrorKind::NullReference | ErrorKind::TypeError | ErrorKind::Other => {}
        }
        sort_fixes(&mut fixes);
        fixes
    }

    /// Apply fixes in order, asking the callback per fix when confirmation
    /// is on. `Cancel` aborts everything not yet applied; each fix's edits
    /// are all-or-nothing.
    pub fn apply_fixes(
        &self,
        fixes: Vec<AutoFix>,
        options: &ApplyOptions,
        confirm: &mut dyn FnMut(&AutoFix) -> Confirmation,
    ) -> FixReport {
        let mut report = FixReport::default();
        let mut pending = fixes.into_iter();
        while let Some(fix) = pending.next() {
            let decision = if options.confirm {
                confirm(&fix)
            } else {
                Confirmation::Yes
            };
            match decision {
                Confirmation::Cancel => {
                    self.logger.info("fix run cancelled");
                    report.cancelled.push(fix);
                    report.cancelled.extend(pending);
                    break;
                }
                Confirmation::No => report.rejected.push(fix),
                Confirmation::Skip => report.skipped.push(fix),
                Confirmation::Yes => match self.apply_one(&fix, options.dry_run) {
                    Ok(()) => {
                        self.logger.debug(&format!(
                            "{} {} ({})",
                            if options.dry_run {
                                "validated"
                            } else {
                                "applied"
                            },
                            fix.title,
                            fix.file_path.display()
                        ));
                        report.applied.push(fix);
                    }
                    Err(err) => {
                        self.logger
                            .warn(&format!("could not apply '{}': {}", fix.title, err));
                        report.failed.push(FailedFix {
                            fix,
                            reason: err.to_string(),
                        });
                    }
                },
            }
        }
        report
    }

    fn apply_one(&self, fix: &AutoFix, dry_run: bool) -> Result<()> {
        util::confine_to_root(&self.project_root, &fix.file_path)?;
        let content = fs::read_to_string(&fix.file_path)
            .map_err(|e| Error::file_access(&fix.file_path, e))?;
        let updated = apply_edits(&content, &fix.edits)?;
        if dry_run {
            return Ok(());
        }

        // write_atomic tightens permissions for private data files; source
        // files keep whatever mode they had.
        let original_perms = fs::metadata(&fix.file_path).ok().map(|m| m.permissions());
        util::write_atomic(&fix.file_path, &updated)?;
        if let Some(perms) = original_perms {
            let _ = fs::set_permissions(&fix.file_path, perms);
        }
        Ok(())
    }

    /// `Cannot find module './x'` where exactly one sibling file matches
    /// the specifier loosely (case, `-` vs `_`).
    fn import_path_fix(&self, failure: &TestFailure) -> Option<AutoFix> {
        let caps = MODULE_NOT_FOUND_RE.captures(&failure.error_message)?;
        let specifier = caps.get(1)?.as_str();
        if !specifier.starts_with('.') {
            return None; // a missing package is an install, not a text edit
        }

        let importer = failure
            .source_file
            .as_deref()
            .or(failure.test_file.as_deref())?;
        let content = self.read_source(importer)?;
        let (line_no, line) = content
            .lines()
            .enumerate()
            .map(|(i, l)| (i + 1, l))
            .find(|(_, l)| l.contains(specifier))?;

        let corrected = self.probe_sibling(importer, specifier)?;
        let new_line = line.replace(specifier, &corrected);
        Some(AutoFix {
            id: Uuid::new_v4(),
            title: format!("Update import path to '{}'", corrected),
            description: format!(
                "'{}' does not resolve from {}; '{}' is the only nearby candidate",
                specifier,
                importer.display(),
                corrected
            ),
            file_path: importer.to_path_buf(),
            edits: vec![TextEdit::Replace {
                line: line_no,
                old: line.to_string(),
                new: new_line,
            }],
            confidence: 0.8,
            category: FixCategory::Import,
        })
    }

    /// `Expected: X / Received: Y` where exactly one `toBe(X)`/`toEqual(X)`
    /// line exists in the test file.
    fn assertion_literal_fix(&self, failure: &TestFailure) -> Option<AutoFix> {
        let expected = EXPECTED_RE
            .captures(&failure.error_message)?
            .get(1)?
            .as_str()
            .trim()
            .to_string();
        let received = RECEIVED_RE
            .captures(&failure.error_message)?
            .get(1)?
            .as_str()
            .trim()
            .to_string();
        if expected == received
            || expected.len() > MAX_LITERAL_CHARS
            || received.len() > MAX_LITERAL_CHARS
        {
            return None;
        }

        let test_file = failure.test_file.as_deref()?;
        let content = self.read_source(test_file)?;

        let mut variants = vec![(expected.clone(), received.clone())];
        if let (Some(exp), Some(rec)) = (single_quoted(&expected), single_quoted(&received)) {
            variants.push((exp, rec));
        }
        let mut pairs = Vec::new();
        for method in ["toBe", "toEqual"] {
            for (exp, rec) in &variants {
                pairs.push((format!("{}({})", method, exp), format!("{}({})", method, rec)));
            }
        }

        let mut matches = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            for (needle, replacement) in &pairs {
                if line.contains(needle.as_str()) {
                    matches.push((idx + 1, line, needle.clone(), replacement.clone()));
                }
            }
        }
        // Ambiguity means we'd be guessing which assertion to touch.
        if matches.len() != 1 {
            return None;
        }
        let (line_no, line, needle, replacement) = matches.remove(0);

        Some(AutoFix {
            id: Uuid::new_v4(),
            title: format!("Update expected value to {}", received),
            description: format!(
                "The assertion expected {} but the code produced {}; accept only if the new behavior is intended",
                expected, received
            ),
            file_path: test_file.to_path_buf(),
            edits: vec![TextEdit::Replace {
                line: line_no,
                old: line.to_string(),
                new: line.replacen(&needle, &replacement, 1),
            }],
            confidence: 0.6,
            category: FixCategory::Assertion,
        })
    }

    /// `jest.mock('./x')` pointing at a module that doesn't resolve, with
    /// exactly one plausible sibling.
    fn mock_path_fix(&self, failure: &TestFailure) -> Option<AutoFix> {
        let test_file = failure.test_file.as_deref()?;
        let content = self.read_source(test_file)?;

        let mut broken = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            if let Some(caps) = JEST_MOCK_RE.captures(line) {
                let spec = caps.get(1)?.as_str();
                if spec.starts_with('.') && imports::resolve_specifier(test_file, spec).is_none() {
                    broken.push((idx + 1, line, spec));
                }
            }
        }
        if broken.len() != 1 {
            return None;
        }
        let (line_no, line, spec) = broken.remove(0);

        let corrected = self.probe_sibling(test_file, spec)?;
        Some(AutoFix {
            id: Uuid::new_v4(),
            title: format!("Repoint jest.mock to '{}'", corrected),
            description: format!(
                "jest.mock('{}') does not match a module; '{}' is the only nearby candidate",
                spec, corrected
            ),
            file_path: test_file.to_path_buf(),
            edits: vec![TextEdit::Replace {
                line: line_no,
                old: line.to_string(),
                new: line.replace(spec, &corrected),
            }],
            confidence: 0.7,
            category: FixCategory::Mock,
        })
    }

    /// Mock-style calls on a module that was never `jest.mock`ed: insert
    /// the mock next to the import that binds the named identifier.
    fn missing_mock_fix(&self, failure: &TestFailure) -> Option<AutoFix> {
        let identifier = MOCK_FN_RE
            .captures(&failure.error_message)
            .or_else(|| NOT_A_MOCK_RE.captures(&failure.error_message))
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())?;

        let test_file = failure.test_file.as_deref()?;
        let content = self.read_source(test_file)?;
        let imports = match imports::extract_imports(&content, Language::from_path(test_file)) {
            Ok(imports) => imports,
            Err(err) => {
                self.logger.debug(&format!(
                    "import scan failed for {}: {}",
                    test_file.display(),
                    err
                ));
                return None;
            }
        };

        let mocked: HashSet<&str> = JEST_MOCK_RE
            .captures_iter(&content)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str())
            .collect();

        let ident_re = Regex::new(&format!(r"\b{}\b", regex::escape(&identifier))).ok()?;
        let lines: Vec<&str> = content.lines().collect();
        let import = imports.iter().find(|import| {
            !mocked.contains(import.specifier.as_str())
                && lines
                    .get(import.line.saturating_sub(1))
                    .is_some_and(|line| ident_re.is_match(line))
        })?;

        Some(AutoFix {
            id: Uuid::new_v4(),
            title: format!("Add jest.mock('{}')", import.specifier),
            description: format!(
                "'{}' is used with mock calls but never mocked; jest.mock makes the module a mock",
                identifier
            ),
            file_path: test_file.to_path_buf(),
            edits: vec![TextEdit::Insert {
                line: import.line + 1,
                text: format!("jest.mock('{}');", import.specifier),
            }],
            confidence: 0.5,
            category: FixCategory::Mock,
        })
    }

    /// Read a file a rule wants to inspect. On failure the rule is skipped
    /// with a warning, never failing the whole call.
    fn read_source(&self, path: &Path) -> Option<String> {
        match fs::read_to_string(path) {
            Ok(content) => Some(content),
            Err(err) => {
                self.logger.warn(&format!(
                    "skipping fix rule: cannot read {}: {}",
                    path.display(),
                    err
                ));
                None
            }
        }
    }

    /// For a relative specifier that doesn't resolve, look for exactly one
    /// sibling file whose name matches it loosely.
    fn probe_sibling(&self, importer: &Path, specifier: &str) -> Option<String> {
        if imports::resolve_specifier(importer, specifier).is_some() {
            return None; // resolves fine; the message is stale
        }
        let (dir_part, wanted) = specifier.rsplit_once('/')?;
        let target_dir = importer.parent()?.join(dir_part);
        let wanted_key = loose_key(wanted);

        let mut candidates = Vec::new();
        for entry in fs::read_dir(&target_dir).ok()?.flatten() {
            let path = entry.path();
            if !path.is_file() || path == importer {
                continue;
            }
            if Language::from_path(&path) == Language::Unknown {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if stem.contains(".test") || stem.contains(".spec") {
                continue;
            }
            let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            // Extension style follows the original specifier.
            let replacement = if wanted.contains('.') { name } else { stem };
            if replacement != wanted
                && (loose_key(stem) == wanted_key || loose_key(name) == wanted_key)
            {
                candidates.push(replacement.to_string());
            }
        }
        candidates.sort();
        candidates.dedup();
        if candidates.len() != 1 {
            return None;
        }
        Some(format!("{}/{}", dir_part, candidates[0]))
    }
}

/// Descending confidence; category priority breaks ties.
pub fn sort_fixes(fixes: &mut [AutoFix]) {
    fixes.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.category.cmp(&b.category))
    });
}

/// Case-, hyphen-, and underscore-insensitive file name key.
fn loose_key(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '-' && *c != '_')
        .flat_map(char::to_lowercase)
        .collect()
}

fn single_quoted(s: &str) -> Option<String> {
    let inner = s.strip_prefix('"')?.strip_suffix('"')?;
    if inner.contains('\'') {
        return None;
    }
    Some(format!("'{}'", inner))
}

/// Apply all edits to an in-memory copy, or fail without side effects.
/// Edits run in descending line order so earlier ones don't shift the
/// targets of later ones.
fn apply_edits(content: &str, edits: &[TextEdit]) -> Result<String> {
    let mut lines: Vec<String> = content.lines().map(str::to_string).collect();
    let had_trailing_newline = content.ends_with('\n') || content.is_empty();

    let mut ordered: Vec<&TextEdit> = edits.iter().collect();
    ordered.sort_by_key(|e| std::cmp::Reverse(e.line()));

    for edit in ordered {
        match edit {
            TextEdit::Insert { line, text } => {
                let idx = line.saturating_sub(1);
                if idx > lines.len() {
                    return Err(Error::Validation(format!(
                        "cannot insert at line {}: file has {} lines",
                        line,
                        lines.len()
                    )));
                }
                lines.insert(idx, text.clone());
            }
            TextEdit::Replace { line, old, new } => {
                if *line == 0 || *line > lines.len() {
                    return Err(Error::Validation(format!(
                        "cannot replace line {}: file has {} lines",
                        line,
                        lines.len()
                    )));
                }
                if lines[*line - 1] != *old {
                    return Err(Error::Validation(format!(
                        "line {} no longer matches the fix (expected {:?}, found {:?})",
                        line,
                        old,
                        lines[*line - 1]
                    )));
                }
                lines[*line - 1] = new.clone();
            }
        }
    }

    let mut updated = lines.join("\n");
    if had_trailing_newline && !updated.is_empty() {
        updated.push('\n');
    }
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logging::MemorySink;
    use std::sync::Arc;

    fn sample_failure(message: &str, kind: ErrorKind, test_file: Option<PathBuf>) -> TestFailure {
        TestFailure {
            test_name: "works".into(),
            test_file,
            error_message: message.into(),
            error_kind: kind,
            stack_trace: Vec::new(),
            source_file: None,
            line: None,
            column: None,
            suggestion: None,
        }
    }

    fn replace_fix(path: &Path, line: usize, old: &str, new: &str) -> AutoFix {
        AutoFix {
            id: Uuid::new_v4(),
            title: format!("replace line {}", line),
            description: String::new(),
            file_path: path.to_path_buf(),
            edits: vec![TextEdit::Replace {
                line,
                old: old.into(),
                new: new.into(),
            }],
            confidence: 0.9,
            category: FixCategory::Other,
        }
    }

    #[test]
    fn fixes_sort_by_confidence_then_category() {
        let mk = |confidence, category| AutoFix {
            id: Uuid::new_v4(),
            title: String::new(),
            description: String::new(),
            file_path: PathBuf::from("x.js"),
            edits: Vec::new(),
            confidence,
            category,
        };
        let mut fixes = vec![
            mk(0.5, FixCategory::Mock),
            mk(0.9, FixCategory::Other),
            mk(0.5, FixCategory::Import),
        ];
        sort_fixes(&mut fixes);
        assert_eq!(fixes[0].category, FixCategory::Other);
        assert_eq!(fixes[1].category, FixCategory::Import);
        assert_eq!(fixes[2].category, FixCategory::Mock);
    }

    #[test]
    fn edits_apply_in_descending_line_order() {
        let content = "one\ntwo\nthree\n";
        let edits = vec![
            TextEdit::Insert {
                line: 1,
                text: "zero".into(),
            },
            TextEdit::Replace {
                line: 3,
                old: "three".into(),
                new: "THREE".into(),
            },
        ];
        let updated = apply_edits(content, &edits).unwrap();
        assert_eq!(updated, "zero\none\ntwo\nTHREE\n");
    }

    #[test]
    fn insert_at_line_zero_prepends() {
        let updated = apply_edits(
            "a\nb\n",
            &[TextEdit::Insert {
                line: 0,
                text: "x".into(),
            }],
        )
        .unwrap();
        assert_eq!(updated, "x\na\nb\n");
    }

    #[test]
    fn stale_replace_fails_without_touching_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.js");
        fs::write(&path, "line one\n").unwrap();

        let fixer = Fixer::new(dir.path(), Logger::silent());
        let fix = replace_fix(&path, 1, "something else", "nope");
        let report = fixer.apply_fixes(
            vec![fix],
            &ApplyOptions {
                dry_run: false,
                confirm: false,
            },
            &mut |_| Confirmation::Yes,
        );

        assert!(report.applied.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed[0].reason.contains("no longer matches"));
        assert_eq!(fs::read_to_string(&path).unwrap(), "line one\n");
    }

    #[test]
    fn one_bad_edit_fails_the_whole_fix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.js");
        fs::write(&path, "alpha\nbeta\n").unwrap();

        let fixer = Fixer::new(dir.path(), Logger::silent());
        let mut fix = replace_fix(&path, 1, "alpha", "ALPHA");
        fix.edits.push(TextEdit::Replace {
            line: 2,
            old: "wrong".into(),
            new: "BETA".into(),
        });
        let report = fixer.apply_fixes(
            vec![fix],
            &ApplyOptions {
                dry_run: false,
                confirm: false,
            },
            &mut |_| Confirmation::Yes,
        );

        assert_eq!(report.failed.len(), 1);
        assert_eq!(fs::read_to_string(&path).unwrap(), "alpha\nbeta\n");
    }

    #[test]
    fn cancel_keeps_earlier_fixes_and_aborts_the_rest() {
        let dir = tempfile::tempdir().unwrap();
        let paths: Vec<PathBuf> = (0..3).map(|i| dir.path().join(format!("f{}.js", i))).collect();
        for path in &paths {
            fs::write(path, "old\n").unwrap();
        }
        let fixes: Vec<AutoFix> = paths
            .iter()
            .map(|p| replace_fix(p, 1, "old", "new"))
            .collect();

        let mut decisions = vec![Confirmation::Yes, Confirmation::Cancel].into_iter();
        let fixer = Fixer::new(dir.path(), Logger::silent());
        let report = fixer.apply_fixes(
            fixes,
            &ApplyOptions {
                dry_run: false,
                confirm: true,
            },
            &mut |_| decisions.next().unwrap_or(Confirmation::Cancel),
        );

        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.cancelled.len(), 2);
        assert_eq!(fs::read_to_string(&paths[0]).unwrap(), "new\n");
        assert_eq!(fs::read_to_string(&paths[1]).unwrap(), "old\n");
        assert_eq!(fs::read_to_string(&paths[2]).unwrap(), "old\n");
    }

    #[test]
    fn rejected_and_skipped_land_in_their_own_buckets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.js");
        fs::write(&path, "old\n").unwrap();
        let fixes = vec![
            replace_fix(&path, 1, "old", "a"),
            replace_fix(&path, 1, "old", "b"),
        ];

        let mut decisions = vec![Confirmation::No, Confirmation::Skip].into_iter();
        let fixer = Fixer::new(dir.path(), Logger::silent());
        let report = fixer.apply_fixes(
            fixes,
            &ApplyOptions {
                dry_run: false,
                confirm: true,
            },
            &mut |_| decisions.next().unwrap_or(Confirmation::Cancel),
        );

        assert_eq!(report.rejected.len(), 1);
        assert_eq!(report.skipped.len(), 1);
        assert!(report.applied.is_empty());
        assert_eq!(fs::read_to_string(&path).unwrap(), "old\n");
    }

    #[test]
    fn dry_run_validates_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.js");
        fs::write(&path, "old\n").unwrap();

        let fixer = Fixer::new(dir.path(), Logger::silent());
        let report = fixer.apply_fixes(
            vec![replace_fix(&path, 1, "old", "new")],
            &ApplyOptions {
                dry_run: true,
                confirm: false,
            },
            &mut |_| Confirmation::Yes,
        );

        assert_eq!(report.applied.len(), 1);
        assert_eq!(fs::read_to_string(&path).unwrap(), "old\n");
    }

    #[test]
    fn import_fix_repoints_to_the_only_candidate() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(&src).unwrap();
        fs::write(src.join("userService.js"), "exports.load = () => 1;\n").unwrap();
        let test_path = src.join("app.test.js");
        fs::write(
            &test_path,
            "const svc = require('./user-service');\ntest('works', () => {});\n",
        )
        .unwrap();

        let fixer = Fixer::new(dir.path(), Logger::silent());
        let failure = sample_failure(
            "Cannot find module './user-service' from 'src/app.test.js'",
            ErrorKind::MissingImport,
            Some(test_path.clone()),
        );
        let fixes = fixer.generate_fixes(&failure);
        assert_eq!(fixes.len(), 1);
        assert_eq!(fixes[0].category, FixCategory::Import);
        assert_eq!(
            fixes[0].edits,
            vec![TextEdit::Replace {
                line: 1,
                old: "const svc = require('./user-service');".into(),
                new: "const svc = require('./userService');".into(),
            }]
        );
    }

    #[test]
    fn bare_package_imports_get_no_fix() {
        let dir = tempfile::tempdir().unwrap();
        let fixer = Fixer::new(dir.path(), Logger::silent());
        let failure = sample_failure(
            "Cannot find module 'lodash'",
            ErrorKind::MissingImport,
            Some(dir.path().join("a.test.js")),
        );
        assert!(fixer.generate_fixes(&failure).is_empty());
    }

    #[test]
    fn assertion_fix_updates_the_single_matching_literal() {
        let dir = tempfile::tempdir().unwrap();
        let test_path = dir.path().join("math.test.js");
        fs::write(
            &test_path,
            "test('math', () => {\n  expect(add(2, 2)).toBe(5);\n});\n",
        )
        .unwrap();

        let fixer = Fixer::new(dir.path(), Logger::silent());
        let failure = sample_failure(
            "expect(received).toBe(expected)\n\nExpected: 5\nReceived: 4",
            ErrorKind::AssertionMismatch,
            Some(test_path),
        );
        let fixes = fixer.generate_fixes(&failure);
        assert_eq!(fixes.len(), 1);
        match &fixes[0].edits[0] {
            TextEdit::Replace { line, new, .. } => {
                assert_eq!(*line, 2);
                assert_eq!(new, "  expect(add(2, 2)).toBe(4);");
            }
            other => panic!("expected a replace edit, got {:?}", other),
        }
    }

    #[test]
    fn ambiguous_assertions_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let test_path = dir.path().join("math.test.js");
        fs::write(
            &test_path,
            "expect(a).toBe(5);\nexpect(b).toBe(5);\n",
        )
        .unwrap();

        let fixer = Fixer::new(dir.path(), Logger::silent());
        let failure = sample_failure(
            "Expected: 5\nReceived: 4",
            ErrorKind::AssertionMismatch,
            Some(test_path),
        );
        assert!(fixer.generate_fixes(&failure).is_empty());
    }

    #[test]
    fn missing_mock_is_inserted_after_the_import() {
        let dir = tempfile::tempdir().unwrap();
        let test_path = dir.path().join("api.test.js");
        fs::write(
            &test_path,
            "const api = require('./api');\ntest('x', () => { api.fetch.mockReturnValue(1); });\n",
        )
        .unwrap();

        let fixer = Fixer::new(dir.path(), Logger::silent());
        let failure = sample_failure(
            "TypeError: api.fetch.mockReturnValue is not a function",
            ErrorKind::MockError,
            Some(test_path),
        );
        let fixes = fixer.generate_fixes(&failure);
        assert_eq!(fixes.len(), 1);
        assert_eq!(
            fixes[0].edits,
            vec![TextEdit::Insert {
                line: 2,
                text: "jest.mock('./api');".into(),
            }]
        );
    }

    #[test]
    fn already_mocked_modules_are_not_mocked_again() {
        let dir = tempfile::tempdir().unwrap();
        let test_path = dir.path().join("api.test.js");
        fs::write(
            &test_path,
            "const api = require('./api');\njest.mock('./api');\ntest('x', () => { api.fetch.mockReturnValue(1); });\n",
        )
        .unwrap();

        let fixer = Fixer::new(dir.path(), Logger::silent());
        let failure = sample_failure(
            "api.fetch.mockReturnValue is not a function",
            ErrorKind::MockError,
            Some(test_path),
        );
        assert!(fixer.generate_fixes(&failure).is_empty());
    }

    #[test]
    fn unreadable_file_skips_the_rule_with_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(MemorySink::default());
        let fixer = Fixer::new(dir.path(), Logger::with_sink(sink.clone(), false));
        let failure = sample_failure(
            "Cannot find module './gone'",
            ErrorKind::MissingImport,
            Some(dir.path().join("missing.test.js")),
        );
        assert!(fixer.generate_fixes(&failure).is_empty());
        assert!(sink.contains("cannot read"));
    }
}
