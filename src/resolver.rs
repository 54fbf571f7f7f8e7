//! Source resolution for failing tests
//!
//! Maps a failing test's imports to the source files likely responsible,
//! scoping what context is sent to the model. Source roots come from build
//! metadata, and third-party/stdlib imports are excluded by an existence
//! test ("does it resolve to a file under a discovered root"), not by a
//! hardcoded name list. Name lists drift, existence does not.

use std::fs;
use std::path::{Path, PathBuf};

use regex::Regex;

/// Discover source roots from build metadata.
///
/// Repo-relative, most specific first; the repository root itself is
/// always the final fallback.
pub fn discover_source_roots(repo_root: &Path) -> Vec<PathBuf> {
    let mut roots: Vec<PathBuf> = Vec::new();

    for root in pyproject_roots(repo_root) {
        push_unique(&mut roots, root);
    }

    // Conventional layouts, kept only if the directory exists.
    for conventional in ["src", "lib"] {
        if repo_root.join(conventional).is_dir() {
            push_unique(&mut roots, PathBuf::from(conventional));
        }
    }

    push_unique(&mut roots, PathBuf::from(""));
    roots
}

/// Source roots declared in pyproject.toml (setuptools package-dir or
/// poetry package tables).
fn pyproject_roots(repo_root: &Path) -> Vec<PathBuf> {
    let content = match fs::read_to_string(repo_root.join("pyproject.toml")) {
        Ok(c) => c,
        Err(_) => return Vec::new(),
    };
    let value: toml::Value = match content.parse() {
        Ok(v) => v,
        Err(_) => return Vec::new(),
    };

    let mut roots = Vec::new();

    // [tool.setuptools] package-dir = { "" = "src" }
    if let Some(dir) = value
        .get("tool")
        .and_then(|t| t.get("setuptools"))
        .and_then(|s| s.get("package-dir"))
        .and_then(|d| d.get(""))
        .and_then(|v| v.as_str())
    {
        roots.push(PathBuf::from(dir));
    }

    // [[tool.poetry.packages]] include = "pkg", from = "src"
    if let Some(packages) = value
        .get("tool")
        .and_then(|t| t.get("poetry"))
        .and_then(|p| p.get("packages"))
        .and_then(|p| p.as_array())
    {
        for package in packages {
            if let Some(from) = package.get("from").and_then(|v| v.as_str()) {
                roots.push(PathBuf::from(from));
            }
        }
    }

    roots
}

fn push_unique(roots: &mut Vec<PathBuf>, root: PathBuf) {
    if !roots.contains(&root) {
        roots.push(root);
    }
}

/// An import statement found in a test file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRef {
    /// Dotted module path, e.g. `mypkg.calc`
    pub module: String,
    /// Names pulled from the module in `from ... import ...` form
    pub names: Vec<String>,
}

/// Parse `import x.y` and `from x.y import a, b` statements.
pub fn parse_imports(content: &str) -> Vec<ImportRef> {
    let import_re = Regex::new(r"^\s*import\s+([\w\.]+)").unwrap();
    let from_re = Regex::new(r"^\s*from\s+([\w\.]+)\s+import\s+(.+)").unwrap();

    let mut imports = Vec::new();
    for line in content.lines() {
        if let Some(caps) = from_re.captures(line) {
            let names = caps[2]
                .trim_matches(|c| c == '(' || c == ')')
                .split(',')
                .map(|n| n.split_whitespace().next().unwrap_or("").to_string())
                .filter(|n| !n.is_empty() && n != "*")
                .collect();
            imports.push(ImportRef {
                module: caps[1].to_string(),
                names,
            });
        } else if let Some(caps) = import_re.captures(line) {
            imports.push(ImportRef {
                module: caps[1].to_string(),
                names: Vec::new(),
            });
        }
    }
    imports
}

/// Resolve a failing test's imports to candidate source files.
///
/// Candidates are repo-relative, ranked: exact module files first, then
/// package `__init__` files. Returns an empty vec (not an error) when
/// nothing resolves; the caller falls back to sending no source context.
pub fn resolve_test_sources(repo_root: &Path, test_file: &Path) -> Vec<PathBuf> {
    let content = match fs::read_to_string(repo_root.join(test_file)) {
        Ok(c) => c,
        Err(_) => return Vec::new(),
    };

    let roots = discover_source_roots(repo_root);
    let imports = parse_imports(&content);

    let mut exact: Vec<PathBuf> = Vec::new();
    let mut packages: Vec<PathBuf> = Vec::new();

    for import in &imports {
        let module_path = import.module.replace('.', "/");

        for root in &roots {
            let module_file = root.join(format!("{}.py", module_path));
            if repo_root.join(&module_file).is_file() {
                push_unique(&mut exact, module_file);
                continue;
            }

            let package_dir = root.join(&module_path);
            // `from pkg import submodule` may name a file, not a symbol.
            let mut found_submodule = false;
            for name in &import.names {
                let submodule = package_dir.join(format!("{}.py", name));
                if repo_root.join(&submodule).is_file() {
                    push_unique(&mut exact, submodule);
                    found_submodule = true;
                }
            }

            let init = package_dir.join("__init__.py");
            if repo_root.join(&init).is_file() && !found_submodule {
                push_unique(&mut packages, init);
            }
        }
    }

    exact.extend(packages);
    exact
}
