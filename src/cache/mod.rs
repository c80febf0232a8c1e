//! Result cache for test runs
//!
//! Persists per-test-file results to the .recheck/ data directory, keyed
//! by content and dependency hashes, so unchanged tests are never re-run.
//!
//! # Error Handling
//!
//! Reads are forgiving: a corrupt or outdated cache document degrades to
//! an empty cache with a warning, because everything in it can be
//! regenerated by re-running tests. A failed persist inside `get_or_run`
//! is logged and the run's result returned anyway; only explicit cache
//! management (`clear`, `invalidate`) reports write errors to the caller,
//! because there the write is the whole operation.

use crate::analyze::TestResultSummary;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::imports::{self, DependencyHash};
use crate::logging::Logger;
use crate::util;
use chrono::{DateTime, Duration, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration as StdDuration, Instant};

pub const DATA_DIR: &str = ".recheck";
const RESULTS_FILE: &str = "results.json";
const LOCK_FILE: &str = "lock";
const LOCK_TIMEOUT_SECS: u64 = 5;
const LOCK_RETRY_MS: u64 = 50;

/// Bumped when the document layout changes; older documents are discarded.
const CACHE_FORMAT_VERSION: u32 = 1;

/// One cached test result and the hashes that guard it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedResult {
    pub test_file: PathBuf,
    pub content_hash: String,
    /// Resolved static imports with their content hashes at run time.
    pub dependencies: Vec<DependencyHash>,
    pub result: TestResultSummary,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    /// Logical clock for LRU ordering; bumped on write and on hit, so
    /// "recently used" means last access or last write, whichever is later.
    pub seq: u64,
    /// Wall-clock cost of the original run; credited to `time_saved_ms`
    /// on every hit.
    pub duration_ms: u64,
}

/// Hit/miss accounting, persisted with the cache so savings accumulate
/// across sessions.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStats {
    pub total_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub time_saved_ms: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.total_requests == 0 {
            0.0
        } else {
            self.cache_hits as f64 / self.total_requests as f64
        }
    }
}

/// On-disk document: entries, stats and the LRU clock.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheDocument {
    version: u32,
    next_seq: u64,
    entries: HashMap<PathBuf, CachedResult>,
    stats: CacheStats,
}

impl Default for CacheDocument {
    fn default() -> Self {
        Self {
            version: CACHE_FORMAT_VERSION,
            next_seq: 0,
            entries: HashMap::new(),
            stats: CacheStats::default(),
        }
    }
}

/// What `get_or_run` hands back: the result plus where it came from.
#[derive(Debug, Clone)]
pub struct CacheOutcome {
    pub result: TestResultSummary,
    pub from_cache: bool,
}

pub(crate) struct CacheLock {
    file: fs::File,
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

/// Acquire the advisory lock on the data directory.
///
/// Exclusive for writes, shared for reads; bounded acquisition with a
/// short retry tick so a hung sibling process can't wedge us forever.
pub(crate) fn acquire_lock(data_dir: &Path, exclusive: bool) -> Result<CacheLock> {
    let lock_path = data_dir.join(LOCK_FILE);
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false) // Lock file content doesn't matter, just the lock
        .open(&lock_path)
        .map_err(|e| Error::file_access(&lock_path, e))?;

    let start = Instant::now();
    loop {
        let result = if exclusive {
            FileExt::try_lock_exclusive(&file)
        } else {
            FileExt::try_lock_shared(&file)
        };
        match result {
            Ok(()) => break,
            Err(err) => {
                if err.kind() != ErrorKind::WouldBlock {
                    return Err(Error::file_access(&lock_path, err));
                }
                if start.elapsed() >= StdDuration::from_secs(LOCK_TIMEOUT_SECS) {
                    return Err(Error::file_access(
                        &lock_path,
                        std::io::Error::new(
                            ErrorKind::WouldBlock,
                            format!("timed out waiting for cache lock ({}s)", LOCK_TIMEOUT_SECS),
                        ),
                    ));
                }
                std::thread::sleep(StdDuration::from_millis(LOCK_RETRY_MS));
            }
        }
    }

    Ok(CacheLock { file })
}

/// The result cache for one project.
pub struct ResultCache {
    data_dir: PathBuf,
    entries: HashMap<PathBuf, CachedResult>,
    stats: CacheStats,
    next_seq: u64,
    max_entries: usize,
    max_age: Duration,
    track_dependencies: bool,
    logger: Logger,
}

impl ResultCache {
    /// Open the cache for a project, loading any persisted state.
    ///
    /// Never fails: a missing, corrupt or outdated document starts an
    /// empty cache (with a warning for the corrupt case).
    pub fn open(project_root: &Path, config: &Config, logger: Logger) -> Self {
        let data_dir = project_root.join(DATA_DIR);
        let doc = load_document(&data_dir, &logger);
        Self {
            data_dir,
            entries: doc.entries,
            stats: doc.stats,
            next_seq: doc.next_seq,
            max_entries: config.max_entries,
            // Out-of-range hour values saturate to "never stale"; the
            // config is user-editable JSON and must not be able to panic.
            max_age: Duration::try_hours(config.max_age_hours).unwrap_or(Duration::MAX),
            track_dependencies: config.track_dependencies,
            logger,
        }
    }

    /// Serve a cached result or invoke `run_fn` exactly once.
    ///
    /// A hit requires the test file's content hash and every dependency
    /// hash to match, and the entry to be younger than `max_age_hours`.
    /// Hits bump the entry's LRU clock and credit its recorded duration
    /// to `time_saved_ms`. `run_fn` errors (spawn failure, timeout,
    /// cancellation) propagate without any cache write. A failed persist
    /// is logged and the outcome returned anyway; an unwritable data
    /// directory only forfeits the reuse, never the result.
    pub fn get_or_run<F>(&mut self, test_file: &Path, run_fn: F) -> Result<CacheOutcome>
    where
        F: FnOnce() -> Result<TestResultSummary>,
    {
        self.stats.total_requests += 1;

        let content_hash = util::hash_file(test_file)?;
        let dependencies = if self.track_dependencies {
            imports::dependency_hashes(test_file, &self.logger)
        } else {
            Vec::new()
        };

        let now = Utc::now();
        let valid = match self.entries.get(test_file) {
            Some(entry) => {
                entry.content_hash == content_hash
                    && entry.dependencies == dependencies
                    && now.signed_duration_since(entry.created_at) < self.max_age
            }
            None => false,
        };

        if valid {
            self.stats.cache_hits += 1;
            self.next_seq += 1;
            let seq = self.next_seq;
            let (result, saved) = match self.entries.get_mut(test_file) {
                Some(entry) => {
                    entry.seq = seq;
                    entry.last_used = now;
                    (entry.result.clone(), entry.duration_ms)
                }
                // Unreachable given `valid`, kept total for safety.
                None => return Err(Error::Validation("cache entry vanished".to_string())),
            };
            self.stats.time_saved_ms += saved;
            if let Err(err) = self.persist() {
                self.logger
                    .warn(&format!("cache write failed ({}); usage stats not updated", err));
            }
            self.logger.debug(&format!(
                "cache hit for {} (saved {}ms)",
                test_file.display(),
                saved
            ));
            return Ok(CacheOutcome {
                result,
                from_cache: true,
            });
        }

        self.stats.cache_misses += 1;
        let result = run_fn()?;

        self.next_seq += 1;
        let entry = CachedResult {
            test_file: test_file.to_path_buf(),
            content_hash,
            dependencies,
            duration_ms: result.duration_ms,
            result: result.clone(),
            created_at: now,
            last_used: now,
            seq: self.next_seq,
        };
        self.entries.insert(test_file.to_path_buf(), entry);
        self.evict_over_capacity();
        if let Err(err) = self.persist() {
            self.logger.warn(&format!(
                "cache write failed ({}); this result will not be reused",
                err
            ));
        }

        Ok(CacheOutcome {
            result,
            from_cache: false,
        })
    }

    /// Drop one entry. Returns whether it existed; removing a missing
    /// entry is not an error.
    pub fn invalidate(&mut self, test_file: &Path) -> Result<bool> {
        let removed = self.entries.remove(test_file).is_some();
        self.persist()?;
        Ok(removed)
    }

    /// Drop every entry whose dependency set contains `source_file`, and
    /// no others. The path must be in the same resolved form the
    /// dependency scanner stores (absolute, `.`/`..` folded).
    pub fn invalidate_dependents(&mut self, source_file: &Path) -> Result<Vec<PathBuf>> {
        let mut removed = Vec::new();
        self.entries.retain(|path, entry| {
            let depends = entry.dependencies.iter().any(|d| d.path == source_file);
            if depends {
                removed.push(path.clone());
            }
            !depends
        });
        removed.sort();
        self.persist()?;
        Ok(removed)
    }

    /// Remove all entries. Statistics survive; idempotent.
    pub fn clear(&mut self) -> Result<()> {
        self.entries.clear();
        self.persist()
    }

    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Entries sorted most recently used first, for display.
    pub fn entries_by_recency(&self) -> Vec<&CachedResult> {
        let mut entries: Vec<&CachedResult> = self.entries.values().collect();
        entries.sort_by(|a, b| b.seq.cmp(&a.seq));
        entries
    }

    /// Evict lowest-seq entries until the map fits `max_entries`.
    fn evict_over_capacity(&mut self) {
        while self.entries.len() > self.max_entries {
            let oldest = self
                .entries
                .values()
                .min_by_key(|e| e.seq)
                .map(|e| e.test_file.clone());
            match oldest {
                Some(path) => {
                    self.entries.remove(&path);
                    self.logger
                        .debug(&format!("evicted {} (least recently used)", path.display()));
                }
                None => break,
            }
        }
    }

    fn persist(&self) -> Result<()> {
        ensure_data_dir(&self.data_dir)?;
        let _lock = acquire_lock(&self.data_dir, true)?;
        let doc = CacheDocument {
            version: CACHE_FORMAT_VERSION,
            next_seq: self.next_seq,
            entries: self.entries.clone(),
            stats: self.stats.clone(),
        };
        let content =
            serde_json::to_string(&doc).map_err(|e| Error::parse("cache serialization", e))?;
        util::write_atomic(&self.data_dir.join(RESULTS_FILE), &content)
    }
}

/// Create the data directory (0700 on Unix) and make sure version control
/// ignores it. Shared by every store that lives under `.recheck/`.
pub(crate) fn ensure_data_dir(data_dir: &Path) -> Result<()> {
    if !data_dir.exists() {
        fs::create_dir_all(data_dir).map_err(|e| Error::file_access(data_dir, e))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(data_dir, fs::Permissions::from_mode(0o700));
        }
    }
    ensure_data_dir_ignored(data_dir);
    Ok(())
}

fn load_document(data_dir: &Path, logger: &Logger) -> CacheDocument {
    let path = data_dir.join(RESULTS_FILE);
    if !path.exists() {
        return CacheDocument::default();
    }

    let _lock = acquire_lock(data_dir, false).ok();
    let content = match fs::read_to_string(&path) {
        Ok(content) => content,
        Err(err) => {
            logger.warn(&format!("cache file unreadable ({}); starting fresh", err));
            return CacheDocument::default();
        }
    };

    match serde_json::from_str::<CacheDocument>(&content) {
        Ok(doc) if doc.version == CACHE_FORMAT_VERSION => doc,
        Ok(doc) => {
            logger.warn(&format!(
                "cache format v{} is outdated; starting fresh",
                doc.version
            ));
            CacheDocument::default()
        }
        Err(err) => {
            logger.warn(&format!("cache file corrupted ({}); starting fresh", err));
            CacheDocument::default()
        }
    }
}

/// Keep `.recheck/` out of version control: append it to the project's
/// .gitignore (or .git/info/exclude) once. Best-effort.
fn ensure_data_dir_ignored(data_dir: &Path) {
    let Some(repo_root) = data_dir.parent() else {
        return;
    };

    let gitignore_path = repo_root.join(".gitignore");
    if gitignore_path.exists() {
        let _ = append_ignore_entry(&gitignore_path, ".recheck/");
        return;
    }

    let git_dir = repo_root.join(".git");
    if git_dir.is_dir() {
        let info_exclude_path = git_dir.join("info").join("exclude");
        if let Some(parent) = info_exclude_path.parent() {
            if fs::create_dir_all(parent).is_ok()
                && append_ignore_entry(&info_exclude_path, ".recheck/").is_ok()
            {
                return;
            }
        }
        let _ = append_ignore_entry(&gitignore_path, ".recheck/");
    }
}

fn append_ignore_entry(path: &Path, entry: &str) -> std::io::Result<()> {
    let content = fs::read_to_string(path).unwrap_or_default();
    let already_present = content.lines().any(|line| {
        let trimmed = line.trim();
        trimmed == entry || trimmed == ".recheck"
    });
    if already_present {
        return Ok(());
    }

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    use std::io::Write;
    if !content.trim().is_empty() && !content.ends_with('\n') {
        writeln!(file)?;
    }
    writeln!(file, "# recheck cache")?;
    writeln!(file, "{}", entry)?;
    Ok(())
}
