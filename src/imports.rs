//! Static import extraction for JS/TS test files.
//!
//! Tree-sitter based. Relative specifiers are resolved to files on disk
//! and content-hashed, so editing a dependency invalidates the cached
//! results of the tests that import it. Bare specifiers (packages) are
//! reported but never hashed.

use crate::error::{Error, Result};
use crate::logging::Logger;
use crate::util;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::cell::RefCell;
use std::path::{Component, Path, PathBuf};
use tree_sitter::Parser;

/// Extension probe order when a specifier has no extension. Matches the
/// default jest `moduleFileExtensions` order (js before ts).
const RESOLVE_EXTENSIONS: &[&str] = &["js", "jsx", "mjs", "cjs", "ts", "tsx", "json"];

/// Source language, chosen by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    JavaScript,
    TypeScript,
    Tsx,
    Unknown,
}

impl Language {
    pub fn from_path(path: &Path) -> Self {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        match ext {
            "js" | "jsx" | "mjs" | "cjs" => Language::JavaScript,
            "ts" | "mts" | "cts" => Language::TypeScript,
            "tsx" => Language::Tsx,
            _ => Language::Unknown,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
//  THREAD-LOCAL PARSER POOL
// ═══════════════════════════════════════════════════════════════════════════
//
// Tree-sitter parsers are expensive to create but can be reused for multiple
// files of the same language. Thread-local storage gives each rayon worker
// thread its own set of pre-configured parsers.

thread_local! {
    static JS_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        // Ignore error here - will be caught at parse time if language fails
        let _ = p.set_language(&tree_sitter_javascript::LANGUAGE.into());
        p
    });

    static TS_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into());
        p
    });

    static TSX_PARSER: RefCell<Parser> = RefCell::new({
        let mut p = Parser::new();
        let _ = p.set_language(&tree_sitter_typescript::LANGUAGE_TSX.into());
        p
    });
}

/// Parse content using a thread-local parser for the given language
fn parse_with_pooled_parser(content: &str, language: Language) -> Result<tree_sitter::Tree> {
    let parse_result = match language {
        Language::JavaScript => JS_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Language::TypeScript => TS_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Language::Tsx => TSX_PARSER.with(|p| p.borrow_mut().parse(content, None)),
        Language::Unknown => {
            return Err(Error::Parse(
                "unsupported file type for import extraction".to_string(),
            ))
        }
    };

    parse_result.ok_or_else(|| Error::Parse("tree-sitter failed to parse file".to_string()))
}

/// One import found in a source file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Import {
    /// The specifier as written, quotes stripped.
    pub specifier: String,
    /// 1-based line of the import.
    pub line: usize,
    /// Bare specifier (a package) rather than a relative/absolute path.
    pub is_external: bool,
}

/// Extract static imports: `import … from`, re-exports with a source,
/// `require(…)` and `jest.mock(…)` calls.
pub fn extract_imports(content: &str, language: Language) -> Result<Vec<Import>> {
    let tree = parse_with_pooled_parser(content, language)?;
    let root = tree.root_node();

    let mut imports = Vec::new();
    let mut cursor = root.walk();

    loop {
        let node = cursor.node();

        match node.kind() {
            // `import x from './y'` and `export { x } from './y'`
            "import_statement" | "export_statement" => {
                if let Some(source) = node.child_by_field_name("source") {
                    push_import(&mut imports, &source, content);
                }
            }
            // `require('./y')` and `jest.mock('./y', …)`
            "call_expression" => {
                let callee = node
                    .child_by_field_name("function")
                    .map(|f| get_node_text(&f, content))
                    .unwrap_or_default();
                if callee == "require" || callee == "jest.mock" || callee == "jest.requireActual"
                {
                    if let Some(args) = node.child_by_field_name("arguments") {
                        if let Some(first) = args.named_child(0) {
                            if first.kind() == "string" {
                                push_import(&mut imports, &first, content);
                            }
                        }
                    }
                }
            }
            _ => {}
        }

        if cursor.goto_first_child() {
            continue;
        }

        while !cursor.goto_next_sibling() {
            if !cursor.goto_parent() {
                return Ok(imports);
            }
        }
    }
}

fn push_import(imports: &mut Vec<Import>, source: &tree_sitter::Node, content: &str) {
    let specifier = get_node_text(source, content)
        .trim_matches(|c| c == '"' || c == '\'' || c == '`')
        .to_string();
    if specifier.is_empty() {
        return;
    }
    let is_external = !specifier.starts_with('.') && !specifier.starts_with('/');
    imports.push(Import {
        specifier,
        line: source.start_position().row + 1,
        is_external,
    });
}

fn get_node_text(node: &tree_sitter::Node, content: &str) -> String {
    let start = node.start_byte();
    let end = node.end_byte();
    content[start..end].to_string()
}

/// Resolve a relative specifier against the importing file's directory.
///
/// Probes the exact path, then each extension in [`RESOLVE_EXTENSIONS`],
/// then `index.*` inside a directory of that name. Returns `None` for
/// bare specifiers and for anything that doesn't exist on disk.
pub fn resolve_specifier(source_file: &Path, specifier: &str) -> Option<PathBuf> {
    if !specifier.starts_with('.') && !specifier.starts_with('/') {
        return None;
    }

    let base = if specifier.starts_with('/') {
        PathBuf::from(specifier)
    } else {
        source_file.parent()?.join(specifier)
    };
    let base = normalize_path(&base);

    if base.is_file() {
        return Some(base);
    }

    // Append rather than replace the extension: `./math.utils` must probe
    // `math.utils.js`, not `math.js`.
    for ext in RESOLVE_EXTENSIONS {
        let mut candidate = base.clone().into_os_string();
        candidate.push(".");
        candidate.push(ext);
        let candidate = PathBuf::from(candidate);
        if candidate.is_file() {
            return Some(candidate);
        }
    }

    if base.is_dir() {
        for ext in RESOLVE_EXTENSIONS {
            let candidate = base.join(format!("index.{}", ext));
            if candidate.is_file() {
                return Some(candidate);
            }
        }
    }

    None
}

/// Fold `.` and `..` components without touching the filesystem, so the
/// paths we store are stable lookup keys.
fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other),
        }
    }
    out
}

/// Content hash of one resolved dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyHash {
    pub path: PathBuf,
    pub hash: String,
}

/// Extract, resolve and hash the static dependencies of `test_file`.
///
/// Best-effort by design: an unparseable file or unresolvable specifier
/// yields fewer dependencies, not an error. The test file's own content
/// hash still guards the cache entry. Results are sorted by path.
pub fn dependency_hashes(test_file: &Path, logger: &Logger) -> Vec<DependencyHash> {
    let content = match std::fs::read_to_string(test_file) {
        Ok(content) => content,
        Err(err) => {
            logger.debug(&format!(
                "skipping dependency scan for {}: {}",
                test_file.display(),
                err
            ));
            return Vec::new();
        }
    };

    let imports = match extract_imports(&content, Language::from_path(test_file)) {
        Ok(imports) => imports,
        Err(err) => {
            logger.debug(&format!(
                "skipping dependency scan for {}: {}",
                test_file.display(),
                err
            ));
            return Vec::new();
        }
    };

    let mut resolved: Vec<PathBuf> = Vec::new();
    for import in imports.iter().filter(|i| !i.is_external) {
        match resolve_specifier(test_file, &import.specifier) {
            Some(path) => {
                if !resolved.contains(&path) {
                    resolved.push(path);
                }
            }
            None => logger.debug(&format!(
                "unresolved import '{}' at {}:{}",
                import.specifier,
                test_file.display(),
                import.line
            )),
        }
    }

    let mut hashes: Vec<DependencyHash> = resolved
        .par_iter()
        .filter_map(|path| match util::hash_file(path) {
            Ok(hash) => Some(DependencyHash {
                path: path.clone(),
                hash,
            }),
            Err(_) => None,
        })
        .collect();
    hashes.sort_by(|a, b| a.path.cmp(&b.path));
    hashes
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn extracts_import_statement_and_require() {
        let content = r#"
import { sum } from './math';
import fs from 'fs';
const helper = require('../helpers/format');
jest.mock('./api');
export { shape } from './shapes';
"#;
        let imports = extract_imports(content, Language::JavaScript).unwrap();
        let specifiers: Vec<&str> = imports.iter().map(|i| i.specifier.as_str()).collect();

        assert!(specifiers.contains(&"./math"));
        assert!(specifiers.contains(&"fs"));
        assert!(specifiers.contains(&"../helpers/format"));
        assert!(specifiers.contains(&"./api"));
        assert!(specifiers.contains(&"./shapes"));

        let fs_import = imports.iter().find(|i| i.specifier == "fs").unwrap();
        assert!(fs_import.is_external);
        let math_import = imports.iter().find(|i| i.specifier == "./math").unwrap();
        assert!(!math_import.is_external);
        assert_eq!(math_import.line, 2);
    }

    #[test]
    fn parses_typescript_and_tsx() {
        let ts = r#"
import type { User } from './types';
interface Props { name: string }
"#;
        let imports = extract_imports(ts, Language::TypeScript).unwrap();
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].specifier, "./types");

        let tsx = r#"
import { Button } from './button';
export const App = () => <Button label="go" />;
"#;
        let imports = extract_imports(tsx, Language::Tsx).unwrap();
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].specifier, "./button");
    }

    #[test]
    fn unknown_language_is_a_parse_error() {
        let result = extract_imports("anything", Language::Unknown);
        assert!(matches!(result, Err(Error::Parse(_))));
    }

    #[test]
    fn resolves_extension_and_index_candidates() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("src/lib")).unwrap();
        fs::write(root.join("src/util.ts"), "export const x = 1;").unwrap();
        fs::write(root.join("src/lib/index.js"), "module.exports = {};").unwrap();
        let test_file = root.join("src/app.test.ts");
        fs::write(&test_file, "").unwrap();

        assert_eq!(
            resolve_specifier(&test_file, "./util"),
            Some(root.join("src/util.ts"))
        );
        assert_eq!(
            resolve_specifier(&test_file, "./lib"),
            Some(root.join("src/lib/index.js"))
        );
        assert_eq!(resolve_specifier(&test_file, "./missing"), None);
        assert_eq!(resolve_specifier(&test_file, "lodash"), None);
    }

    #[test]
    fn dependency_hashes_cover_resolved_locals_only() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("src")).unwrap();
        fs::write(root.join("src/math.js"), "exports.sum = (a, b) => a + b;").unwrap();
        fs::write(root.join("src/api.js"), "exports.get = () => null;").unwrap();
        let test_file = root.join("src/math.test.js");
        fs::write(
            &test_file,
            "const { sum } = require('./math');\nconst api = require('./api');\nconst fs = require('fs');\n",
        )
        .unwrap();

        let hashes = dependency_hashes(&test_file, &Logger::silent());
        assert_eq!(hashes.len(), 2);
        assert!(hashes.windows(2).all(|w| w[0].path < w[1].path));

        let before: Vec<String> = hashes.iter().map(|h| h.hash.clone()).collect();
        fs::write(root.join("src/math.js"), "exports.sum = (a, b) => a - b;").unwrap();
        let after = dependency_hashes(&test_file, &Logger::silent());
        let changed: Vec<String> = after.iter().map(|h| h.hash.clone()).collect();
        assert_ne!(before, changed);
    }

    #[test]
    fn unreadable_test_file_yields_empty_list() {
        let hashes = dependency_hashes(Path::new("/definitely/missing.test.js"), &Logger::silent());
        assert!(hashes.is_empty());
    }

    #[test]
    fn normalize_folds_dot_segments() {
        assert_eq!(
            normalize_path(Path::new("/a/b/../c/./d.js")),
            PathBuf::from("/a/c/d.js")
        );
    }
}
