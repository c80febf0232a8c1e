//! recheck CLI: cache-aware test runs, mechanical fixes, learned patterns.

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use recheck_cli::analyze::{self, TestFailure, TestResultSummary};
use recheck_cli::assistant::{AssistSuggestion, Assistant};
use recheck_cli::cache::{CacheOutcome, ResultCache};
use recheck_cli::config::Config;
use recheck_cli::error::Error;
use recheck_cli::fix::{ApplyOptions, AutoFix, Confirmation, Fixer};
use recheck_cli::learn::{FixPattern, PatternStore};
use recheck_cli::logging::Logger;
use recheck_cli::testing::{self, TestRunner};
use recheck_cli::util::{self, CancelFlag};
use serde::Serialize;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(
    name = "recheck",
    about = "Re-run JS/TS tests with content-aware caching and learned fixes",
    version
)]
struct Cli {
    /// Verbose diagnostics on stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run test files, serving unchanged ones from the cache
    Run(RunArgs),
    /// Propose and apply fixes for failing tests
    Fix(FixArgs),
    /// Show learned fix patterns
    Patterns(PatternsArgs),
    /// Show cache statistics
    Stats(StatsArgs),
    /// Drop every cached result
    Clear,
    /// Drop the cached result for one test file
    Invalidate(InvalidateArgs),
    /// Write learned patterns to a JSON file
    Export(ExportArgs),
    /// Load learned patterns from a JSON file
    Import(ImportArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Test files or directories (default: discover under the current directory)
    paths: Vec<PathBuf>,
    /// Discover tests from the project root instead of the current directory
    #[arg(long)]
    all: bool,
    /// Ignore cached results and skip cache writes
    #[arg(long)]
    no_cache: bool,
    /// Ask the assistant about any failures after the run
    #[arg(long)]
    assist: bool,
    /// Machine-readable JSON on stdout
    #[arg(long)]
    json: bool,
    /// Per-file timeout override in seconds
    #[arg(long)]
    timeout_secs: Option<u64>,
}

#[derive(Args, Debug)]
struct FixArgs {
    /// Test file or directory to fix (default: current directory)
    path: Option<PathBuf>,
    /// Apply every proposed fix without prompting
    #[arg(long)]
    yes: bool,
    /// Validate fixes without writing anything
    #[arg(long)]
    dry_run: bool,
    /// Skip the verification re-run after applying fixes
    #[arg(long)]
    no_rerun: bool,
}

#[derive(Args, Debug)]
struct PatternsArgs {
    /// Only patterns that still need attempts before they are trusted
    #[arg(long)]
    needing_data: bool,
    /// Maximum patterns to list
    #[arg(long, default_value_t = 20)]
    limit: usize,
    /// Machine-readable JSON on stdout
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct StatsArgs {
    /// Machine-readable JSON on stdout
    #[arg(long)]
    json: bool,
}

#[derive(Args, Debug)]
struct InvalidateArgs {
    /// File whose cached result should be dropped
    path: PathBuf,
    /// Also drop every cached entry that imports this file
    #[arg(long)]
    dependents: bool,
}

#[derive(Args, Debug)]
struct ExportArgs {
    /// Destination JSON file
    path: PathBuf,
}

#[derive(Args, Debug)]
struct ImportArgs {
    /// Patterns JSON file to load
    path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
struct FileReport {
    test_file: PathBuf,
    from_cache: bool,
    total: usize,
    passed: usize,
    failed: usize,
    skipped: usize,
    duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    failures: Vec<TestFailure>,
}

#[derive(Debug, Clone, Serialize)]
struct RunReport {
    project_root: PathBuf,
    runner: String,
    total: usize,
    passed: usize,
    failed: usize,
    skipped: usize,
    from_cache: usize,
    time_saved_ms: u64,
    files: Vec<FileReport>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    suggestions: Vec<AssistSuggestion>,
}

#[derive(Debug, Serialize)]
struct StatsReport {
    entry_count: usize,
    total_requests: u64,
    cache_hits: u64,
    cache_misses: u64,
    hit_rate: f64,
    time_saved_ms: u64,
    pattern_count: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run_tests(args, cli.verbose).await,
        Commands::Fix(args) => run_fix(args, cli.verbose).await,
        Commands::Patterns(args) => show_patterns(args, cli.verbose),
        Commands::Stats(args) => show_stats(args, cli.verbose),
        Commands::Clear => clear_cache(cli.verbose),
        Commands::Invalidate(args) => invalidate_entry(args, cli.verbose),
        Commands::Export(args) => export_patterns(args, cli.verbose),
        Commands::Import(args) => import_patterns(args, cli.verbose),
    }
}

async fn run_tests(args: RunArgs, verbose: bool) -> Result<()> {
    let logger = output_logger(args.json, verbose);
    let config = Config::load(&logger);
    let project_root = resolve_project_root(&args.paths)?;
    let tests = select_tests(&project_root, &args.paths, args.all)?;
    let runner = testing::detect_runner(&project_root);

    if tests.is_empty() {
        logger.warn("no test files found");
        if args.json {
            let report = collect_run_report(&project_root, runner, Vec::new(), Vec::new());
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            println!("no test files found");
        }
        return Ok(());
    }

    let timeout = Duration::from_secs(args.timeout_secs.unwrap_or(config.test_timeout_secs));
    let cancel = CancelFlag::new();
    let mut cache = ResultCache::open(&project_root, &config, logger.clone());

    logger.info(&format!(
        "🔍 {} test file(s), runner: {}",
        tests.len(),
        runner.name()
    ));

    let mut files = Vec::new();
    let mut failures: Vec<TestFailure> = Vec::new();
    for test_file in &tests {
        let shown = display_path(&project_root, test_file);
        match run_file(
            &mut cache,
            &project_root,
            runner,
            test_file,
            timeout,
            &cancel,
            args.no_cache,
        ) {
            Ok(outcome) => {
                if !args.json {
                    print_file_line(&shown, &outcome.result, outcome.from_cache);
                }
                failures.extend(outcome.result.failures.clone());
                files.push(FileReport {
                    test_file: test_file.clone(),
                    from_cache: outcome.from_cache,
                    total: outcome.result.total,
                    passed: outcome.result.passed,
                    failed: outcome.result.failed,
                    skipped: outcome.result.skipped,
                    duration_ms: outcome.result.duration_ms,
                    error: None,
                    failures: outcome.result.failures,
                });
            }
            Err(Error::Cancelled) => {
                return Err(Error::Cancelled).context("test run cancelled");
            }
            Err(err) => {
                logger.warn(&format!("{}: {}", shown, err));
                if !args.json {
                    println!("  ⚠ {} — {}", shown, err);
                }
                files.push(FileReport {
                    test_file: test_file.clone(),
                    from_cache: false,
                    total: 0,
                    passed: 0,
                    failed: 0,
                    skipped: 0,
                    duration_ms: 0,
                    error: Some(err.to_string()),
                    failures: Vec::new(),
                });
            }
        }
    }

    let mut suggestions = Vec::new();
    if args.assist && !failures.is_empty() {
        let assistant = Assistant::from_config(&config, logger.clone());
        if assistant.is_available() {
            match assistant.suggest_fixes(&failures).await {
                Ok(parsed) => suggestions = parsed,
                Err(err) => logger.warn(&format!("assistant unavailable: {:#}", err)),
            }
        } else {
            logger.warn(&format!(
                "assistant needs an API key; set OPENROUTER_API_KEY or edit {}",
                Config::config_location()
            ));
        }
    }

    let report = collect_run_report(&project_root, runner, files, suggestions);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_run_summary(&project_root, &report);
    }

    if report.failed > 0 || report.files.iter().any(|f| f.error.is_some()) {
        let _ = io::stdout().flush();
        std::process::exit(1);
    }
    Ok(())
}

async fn run_fix(args: FixArgs, verbose: bool) -> Result<()> {
    let logger = Logger::stderr(verbose);
    let config = Config::load(&logger);
    let selection: Vec<PathBuf> = args.path.clone().into_iter().collect();
    let project_root = resolve_project_root(&selection)?;
    let tests = select_tests(&project_root, &selection, false)?;

    if tests.is_empty() {
        println!("no test files found");
        return Ok(());
    }

    let runner = testing::detect_runner(&project_root);
    let timeout = Duration::from_secs(config.test_timeout_secs);
    let cancel = CancelFlag::new();
    let mut cache = ResultCache::open(&project_root, &config, logger.clone());
    let mut store = PatternStore::open(&project_root, logger.clone());
    let fixer = Fixer::new(&project_root, logger.clone());
    let options = ApplyOptions {
        dry_run: args.dry_run,
        confirm: !args.yes && config.confirm_fixes,
    };
    let mut confirm = prompt_confirmation;

    let mut applied_total = 0usize;
    let mut cancelled = false;

    for test_file in &tests {
        if cancelled {
            break;
        }
        let shown = display_path(&project_root, test_file);
        let outcome = match run_file(
            &mut cache,
            &project_root,
            runner,
            test_file,
            timeout,
            &cancel,
            false,
        ) {
            Ok(outcome) => outcome,
            Err(Error::Cancelled) => return Err(Error::Cancelled).context("fix run cancelled"),
            Err(err) => {
                logger.warn(&format!("{}: {}", shown, err));
                continue;
            }
        };
        if outcome.result.all_passed() {
            logger.debug(&format!("{} already passing", shown));
            continue;
        }

        println!();
        println!("{} — {} failing test(s)", shown, outcome.result.failed);

        // Applied fixes paired with the failure they target, so the
        // verification verdict can be recorded against each.
        let mut attempts: Vec<(TestFailure, AutoFix)> = Vec::new();
        for failure in &outcome.result.failures {
            println!("  ✗ {} [{}]", failure.test_name, failure.error_kind);
            if let Ok(Some(pattern)) = store.best_fix(&failure.error_message, failure.error_kind)
            {
                if let Some(label) = pattern.top_fix() {
                    println!(
                        "    learned: '{}' worked in {:.0}% of {} attempt(s)",
                        label,
                        pattern.success_rate * 100.0,
                        pattern.total_attempts
                    );
                }
            }

            let fixes = fixer.generate_fixes(failure);
            if fixes.is_empty() {
                if let Some(suggestion) = &failure.suggestion {
                    println!("    💡 {}", suggestion);
                }
                continue;
            }

            let report = fixer.apply_fixes(fixes, &options, &mut confirm);
            for fix in &report.applied {
                println!(
                    "    {} {}",
                    if args.dry_run { "would apply:" } else { "applied:" },
                    fix.title
                );
            }
            for failed in &report.failed {
                println!("    failed: {} ({})", failed.fix.title, failed.reason);
            }
            attempts.extend(
                report
                    .applied
                    .into_iter()
                    .map(|fix| (failure.clone(), fix)),
            );
            if !report.cancelled.is_empty() {
                cancelled = true;
                break;
            }
        }

        applied_total += attempts.len();
        if attempts.is_empty() || args.dry_run {
            continue;
        }
        if args.no_rerun {
            logger.info("verification re-run skipped; outcomes not recorded");
            continue;
        }

        // Verify with a fresh run, not through the cache, so the verdict
        // reflects the edited files.
        match testing::run_test_file(&project_root, runner, test_file, timeout, &cancel) {
            Ok(run) => {
                let summary = analyze::summarize_run(&run, test_file);
                let fixed = summary.all_passed();
                println!(
                    "  re-run: {}",
                    if fixed {
                        "✓ all tests pass"
                    } else {
                        "✗ still failing"
                    }
                );
                for (failure, fix) in &attempts {
                    if let Err(err) =
                        store.record_fix_attempt(failure, &fix.title, fixed, None, None)
                    {
                        logger.warn(&format!("fix outcome not recorded: {}", err));
                    }
                }
            }
            Err(err) => logger.warn(&format!("verification run failed: {}", err)),
        }
    }

    println!();
    if applied_total == 0 {
        println!("no fixes applied");
    } else if args.dry_run {
        println!("{} fix(es) validated (dry run)", applied_total);
    } else {
        println!("{} fix(es) applied", applied_total);
    }
    Ok(())
}

fn show_patterns(args: PatternsArgs, verbose: bool) -> Result<()> {
    let logger = output_logger(args.json, verbose);
    let project_root = resolve_project_root(&[])?;
    let store = PatternStore::open(&project_root, logger);
    let patterns: Vec<&FixPattern> = if args.needing_data {
        store.needing_data().into_iter().take(args.limit).collect()
    } else {
        store.most_reliable(args.limit)
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&patterns)?);
        return Ok(());
    }

    if patterns.is_empty() {
        println!("no learned patterns yet; `recheck fix` builds them as fixes are verified");
        return Ok(());
    }

    println!(
        "{} of {} learned pattern(s){}:",
        patterns.len(),
        store.pattern_count(),
        if args.needing_data {
            " still collecting attempts"
        } else {
            ""
        }
    );
    for (index, pattern) in patterns.iter().enumerate() {
        println!();
        println!(
            "{}. [{}] {}",
            index + 1,
            pattern.error_kind,
            pattern.error_pattern
        );
        println!(
            "   {:.0}% success over {} attempt(s), confidence {:.2}",
            pattern.success_rate * 100.0,
            pattern.total_attempts,
            pattern.confidence
        );
        if let Some(best) = pattern.top_fix() {
            println!("   best fix: {}", best);
        }
    }
    Ok(())
}

fn show_stats(args: StatsArgs, verbose: bool) -> Result<()> {
    let logger = output_logger(args.json, verbose);
    let config = Config::load(&logger);
    let project_root = resolve_project_root(&[])?;
    let cache = ResultCache::open(&project_root, &config, logger.clone());
    let store = PatternStore::open(&project_root, logger);

    let stats = cache.stats();
    let report = StatsReport {
        entry_count: cache.entry_count(),
        total_requests: stats.total_requests,
        cache_hits: stats.cache_hits,
        cache_misses: stats.cache_misses,
        hit_rate: stats.hit_rate(),
        time_saved_ms: stats.time_saved_ms,
        pattern_count: store.pattern_count(),
    };

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("cached results: {}", report.entry_count);
    println!(
        "requests: {} ({} hits, {} misses, {:.0}% hit rate)",
        report.total_requests,
        report.cache_hits,
        report.cache_misses,
        report.hit_rate * 100.0
    );
    println!("time saved: {}", format_duration_ms(report.time_saved_ms));
    println!("learned patterns: {}", report.pattern_count);

    let recent = cache.entries_by_recency();
    if !recent.is_empty() {
        println!();
        println!("most recent entries:");
        for entry in recent.iter().take(5) {
            println!(
                "  {} — {} ({})",
                display_path(&project_root, &entry.test_file),
                if entry.result.all_passed() {
                    "passing"
                } else {
                    "failing"
                },
                entry.last_used.format("%Y-%m-%d %H:%M")
            );
        }
    }
    Ok(())
}

fn clear_cache(verbose: bool) -> Result<()> {
    let logger = Logger::stderr(verbose);
    let config = Config::load(&logger);
    let project_root = resolve_project_root(&[])?;
    let mut cache = ResultCache::open(&project_root, &config, logger);
    let had = cache.entry_count();
    cache.clear()?;
    println!("cleared {} cached result(s)", had);
    Ok(())
}

fn invalidate_entry(args: InvalidateArgs, verbose: bool) -> Result<()> {
    let logger = Logger::stderr(verbose);
    let config = Config::load(&logger);
    let resolved = args
        .path
        .canonicalize()
        .with_context(|| format!("cannot resolve '{}'", args.path.display()))?;
    let project_root = resolve_project_root(std::slice::from_ref(&args.path))?;
    let mut cache = ResultCache::open(&project_root, &config, logger);

    let removed = cache.invalidate(&resolved)?;
    if removed {
        println!("invalidated {}", display_path(&project_root, &resolved));
    }
    if args.dependents {
        let dependents = cache.invalidate_dependents(&resolved)?;
        for path in &dependents {
            println!(
                "invalidated dependent {}",
                display_path(&project_root, path)
            );
        }
        if !removed && dependents.is_empty() {
            println!("nothing cached depends on {}", resolved.display());
        }
    } else if !removed {
        println!("nothing cached for {}", resolved.display());
    }
    Ok(())
}

fn export_patterns(args: ExportArgs, verbose: bool) -> Result<()> {
    let logger = Logger::stderr(verbose);
    let project_root = resolve_project_root(&[])?;
    let store = PatternStore::open(&project_root, logger);
    store.export(&args.path)?;
    println!(
        "exported {} pattern(s) to {}",
        store.pattern_count(),
        args.path.display()
    );
    Ok(())
}

fn import_patterns(args: ImportArgs, verbose: bool) -> Result<()> {
    let logger = Logger::stderr(verbose);
    let project_root = resolve_project_root(&[])?;
    let mut store = PatternStore::open(&project_root, logger);
    let count = store.import_from(&args.path)?;
    println!("imported {} pattern(s) from {}", count, args.path.display());
    Ok(())
}

/// Progress goes to stderr unless the command speaks JSON on stdout, in
/// which case stderr stays quiet too.
fn output_logger(json: bool, verbose: bool) -> Logger {
    if json {
        Logger::silent()
    } else {
        Logger::stderr(verbose)
    }
}

fn resolve_project_root(paths: &[PathBuf]) -> Result<PathBuf> {
    let start = match paths.first() {
        Some(path) => path
            .canonicalize()
            .with_context(|| format!("cannot resolve '{}'", path.display()))?,
        None => std::env::current_dir().context("cannot read current directory")?,
    };
    testing::find_project_root(&start)
        .ok_or_else(|| anyhow!("no package.json found above {}", start.display()))
}

/// Expand the positional paths into test files; with none given, discover
/// under the current directory (or the whole project with `--all`).
fn select_tests(project_root: &Path, paths: &[PathBuf], all: bool) -> Result<Vec<PathBuf>> {
    if !paths.is_empty() {
        let mut tests = Vec::new();
        for path in paths {
            let resolved = path
                .canonicalize()
                .with_context(|| format!("cannot resolve '{}'", path.display()))?;
            if resolved.is_dir() {
                tests.extend(testing::discover_tests(&resolved));
            } else if testing::is_test_file(&resolved) {
                tests.push(resolved);
            } else {
                return Err(anyhow!(
                    "'{}' does not look like a test file (expected a .test. or .spec. infix)",
                    path.display()
                ));
            }
        }
        tests.sort();
        tests.dedup();
        return Ok(tests);
    }

    let scan_root = if all {
        project_root.to_path_buf()
    } else {
        std::env::current_dir().context("cannot read current directory")?
    };
    Ok(testing::discover_tests(&scan_root))
}

/// Run one file through the cache, or directly when the cache is bypassed.
fn run_file(
    cache: &mut ResultCache,
    project_root: &Path,
    runner: TestRunner,
    test_file: &Path,
    timeout: Duration,
    cancel: &CancelFlag,
    no_cache: bool,
) -> recheck_cli::error::Result<CacheOutcome> {
    if no_cache {
        let run = testing::run_test_file(project_root, runner, test_file, timeout, cancel)?;
        return Ok(CacheOutcome {
            result: analyze::summarize_run(&run, test_file),
            from_cache: false,
        });
    }
    cache.get_or_run(test_file, || {
        let run = testing::run_test_file(project_root, runner, test_file, timeout, cancel)?;
        Ok(analyze::summarize_run(&run, test_file))
    })
}

fn collect_run_report(
    project_root: &Path,
    runner: TestRunner,
    files: Vec<FileReport>,
    suggestions: Vec<AssistSuggestion>,
) -> RunReport {
    RunReport {
        project_root: project_root.to_path_buf(),
        runner: runner.name().to_string(),
        total: files.iter().map(|f| f.total).sum(),
        passed: files.iter().map(|f| f.passed).sum(),
        failed: files.iter().map(|f| f.failed).sum(),
        skipped: files.iter().map(|f| f.skipped).sum(),
        from_cache: files.iter().filter(|f| f.from_cache).count(),
        time_saved_ms: files
            .iter()
            .filter(|f| f.from_cache)
            .map(|f| f.duration_ms)
            .sum(),
        files,
        suggestions,
    }
}

fn print_file_line(shown: &str, summary: &TestResultSummary, from_cache: bool) {
    let origin = if from_cache {
        format!(" (cached, saved {}ms)", summary.duration_ms)
    } else {
        format!(" ({}ms)", summary.duration_ms)
    };
    if summary.all_passed() {
        println!("  ✓ {}{}", shown, origin);
    } else {
        println!(
            "  ✗ {} — {} of {} failed{}",
            shown, summary.failed, summary.total, origin
        );
    }
}

fn print_run_summary(project_root: &Path, report: &RunReport) {
    println!();
    println!(
        "Tests: {} failed, {} skipped, {} passed, {} total",
        report.failed, report.skipped, report.passed, report.total
    );
    println!(
        "Cache: {} of {} file(s) from cache, {} saved this run",
        report.from_cache,
        report.files.len(),
        format_duration_ms(report.time_saved_ms)
    );

    for file in &report.files {
        let shown = display_path(project_root, &file.test_file);
        for failure in &file.failures {
            println!();
            println!("✗ {} ({})", failure.test_name, shown);
            println!(
                "  [{}] {}",
                failure.error_kind,
                first_line(&failure.error_message)
            );
            if let (Some(source), Some(line)) = (&failure.source_file, failure.line) {
                println!("  at {}:{}", display_path(project_root, source), line);
            }
            if let Some(suggestion) = &failure.suggestion {
                println!("  💡 {}", suggestion);
            }
        }
    }

    if !report.suggestions.is_empty() {
        println!();
        println!("Assistant:");
        for suggestion in &report.suggestions {
            println!();
            if !suggestion.test_name.is_empty() {
                println!("  {}:", suggestion.test_name);
            }
            println!("  {}", suggestion.explanation);
            if let Some(code) = &suggestion.suggested_code {
                for line in code.lines() {
                    println!("      {}", line);
                }
            }
        }
    }
}

/// Terminal prompt for one fix. EOF counts as cancel so piped input can't
/// spin forever.
fn prompt_confirmation(fix: &AutoFix) -> Confirmation {
    println!();
    println!(
        "  {} ({:.0}% confidence, {})",
        fix.title,
        fix.confidence * 100.0,
        fix.category.as_str()
    );
    println!("    {}", fix.description);
    println!("    edits {}", fix.file_path.display());
    loop {
        print!("  apply? [Y]es / [n]o / [s]kip / [c]ancel: ");
        let _ = io::stdout().flush();
        let mut line = String::new();
        match io::stdin().read_line(&mut line) {
            Ok(0) | Err(_) => return Confirmation::Cancel,
            Ok(_) => {}
        }
        match line.trim().to_lowercase().as_str() {
            "" | "y" | "yes" => return Confirmation::Yes,
            "n" | "no" => return Confirmation::No,
            "s" | "skip" => return Confirmation::Skip,
            "c" | "cancel" | "q" => return Confirmation::Cancel,
            _ => println!("  please answer y, n, s or c"),
        }
    }
}

/// Path shown to the user: relative to the project when possible.
fn display_path(project_root: &Path, path: &Path) -> String {
    path.strip_prefix(project_root)
        .unwrap_or(path)
        .display()
        .to_string()
}

fn first_line(message: &str) -> String {
    let line = message.lines().find(|l| !l.trim().is_empty()).unwrap_or("");
    util::truncate(line.trim(), 120)
}

fn format_duration_ms(ms: u64) -> String {
    if ms >= 60_000 {
        format!("{}m {}s", ms / 60_000, (ms % 60_000) / 1000)
    } else if ms >= 1000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{}ms", ms)
    }
}
