//! Shared helpers: content hashing, output truncation, atomic writes and
//! child-process control with deadlines.

use crate::error::{Error, Result};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Poll interval while waiting on a child process.
const CHILD_POLL_MS: u64 = 50;

/// Truncate a string to at most `max` characters, appending an ellipsis
/// when something was cut. Splits on character boundaries, not bytes.
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    if max <= 3 {
        return s.chars().take(max).collect();
    }
    let kept: String = s.chars().take(max - 3).collect();
    format!("{}...", kept)
}

/// FNV-1a 64-bit hash rendered as 16 hex digits.
///
/// Fast, dependency-free and stable across runs, which is all cache
/// invalidation needs. Not cryptographic.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &byte in bytes {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("{:016x}", hash)
}

/// Hash a string's UTF-8 bytes.
pub fn hash_str(s: &str) -> String {
    hash_bytes(s.as_bytes())
}

/// Hash a file's current contents.
pub fn hash_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path).map_err(|e| Error::file_access(path, e))?;
    Ok(hash_bytes(&bytes))
}

/// Cooperative cancellation flag checked by long-running operations.
///
/// Clones share the same underlying flag, so the CLI can hand one copy
/// to a runner and trip it from elsewhere.
#[derive(Clone, Debug, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Captured output of a child process that ran to completion.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Stdout and stderr joined, for parsers that accept either stream.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !out.is_empty() && !out.ends_with('\n') {
                out.push('\n');
            }
            out.push_str(&self.stderr);
        }
        out
    }
}

/// Run a command with a hard deadline and cooperative cancellation.
///
/// Output is drained on reader threads so a chatty child can't fill the
/// pipe and deadlock against our wait loop. On deadline the child is
/// killed and `Error::Timeout` returned; a tripped [`CancelFlag`] kills
/// it and returns `Error::Cancelled`. A non-zero exit is NOT an error
/// here, callers inspect `status` themselves.
pub fn run_command_with_deadline(
    cmd: &mut Command,
    timeout: Duration,
    cancel: &CancelFlag,
) -> Result<CommandOutput> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let program = PathBuf::from(cmd.get_program());
    let mut child = cmd.spawn().map_err(|e| Error::file_access(&program, e))?;

    let stdout_handle = child.stdout.take();
    let stderr_handle = child.stderr.take();

    let stdout_thread = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut handle) = stdout_handle {
            let _ = handle.read_to_end(&mut buf);
        }
        buf
    });
    let stderr_thread = std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut handle) = stderr_handle {
            let _ = handle.read_to_end(&mut buf);
        }
        buf
    });

    let start = Instant::now();
    loop {
        if cancel.is_cancelled() {
            let _ = child.kill();
            let _ = child.wait();
            return Err(Error::Cancelled);
        }

        match child.try_wait() {
            Ok(Some(status)) => {
                let stdout = stdout_thread.join().unwrap_or_default();
                let stderr = stderr_thread.join().unwrap_or_default();
                return Ok(CommandOutput {
                    status,
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                });
            }
            Ok(None) => {
                if start.elapsed() >= timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(Error::Timeout {
                        seconds: timeout.as_secs(),
                    });
                }
                std::thread::sleep(Duration::from_millis(CHILD_POLL_MS));
            }
            Err(e) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::file_access(&program, e));
            }
        }
    }
}

/// Write content atomically by writing to a temp file first, then renaming.
///
/// # Platform Notes
/// - **Unix**: Uses atomic `rename()` which is guaranteed to be atomic by POSIX.
/// - **Windows**: Uses a backup-and-restore pattern since `rename()` can fail if
///   the destination exists. If the process crashes between the backup rename and
///   the final rename, the `.bak` file can be used for recovery.
pub fn write_atomic(path: &Path, content: &str) -> Result<()> {
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, content).map_err(|e| Error::file_access(&tmp_path, e))?;

    // Set restrictive permissions on Unix before renaming
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = fs::Permissions::from_mode(0o600);
        let _ = fs::set_permissions(&tmp_path, perms);
    }

    #[cfg(windows)]
    {
        let backup_path = path.with_extension("bak");
        // Clean up any stale backup from a previous crash
        if backup_path.exists() {
            let _ = fs::remove_file(&backup_path);
        }
        if path.exists() {
            if let Err(err) = fs::rename(path, &backup_path) {
                let _ = fs::remove_file(&tmp_path);
                return Err(Error::file_access(path, err));
            }
        }
        if let Err(err) = fs::rename(&tmp_path, path) {
            if backup_path.exists() {
                let _ = fs::rename(&backup_path, path);
            }
            let _ = fs::remove_file(&tmp_path);
            return Err(Error::file_access(path, err));
        }
        if backup_path.exists() {
            let _ = fs::remove_file(&backup_path);
        }
        return Ok(());
    }

    #[cfg(not(windows))]
    {
        if let Err(err) = fs::rename(&tmp_path, path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(Error::file_access(path, err));
        }
        Ok(())
    }
}

/// Resolve `candidate` against `root` and reject anything that escapes it.
///
/// Paths coming out of runner output are untrusted; everything we edit
/// must stay inside the project. The file must already exist.
pub fn confine_to_root(root: &Path, candidate: &Path) -> Result<PathBuf> {
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        root.join(candidate)
    };

    let canonical_root = root.canonicalize().map_err(|e| Error::file_access(root, e))?;
    let canonical = joined
        .canonicalize()
        .map_err(|e| Error::file_access(&joined, e))?;

    if !canonical.starts_with(&canonical_root) {
        return Err(Error::Validation(format!(
            "path {} escapes project root",
            candidate.display()
        )));
    }
    Ok(canonical)
}
