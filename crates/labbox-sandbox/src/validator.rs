//! Static screening of submitted source before anything is spawned.
//!
//! The validator is a cheap first filter, not an isolation boundary: it
//! works on source text and can be bypassed by sufficiently creative code.
//! Resource limits and the restricted environment applied by the runner
//! still hold when it is.
//!
//! These checks run over comment-stripped source:
//!
//! - **Imports** must name a module on the language's allow-list, including
//!   imports tucked behind a compound statement head (`try: import x`).
//! - **Denied calls** (dynamic evaluation, reflection, process spawning...)
//!   are rejected wherever they appear as free-standing calls.
//! - **Restricted modules** may be imported, but only the listed members may
//!   be touched (`os.path` is fine, `os.system` is not).
//! - **File access** is confined. Path methods (`write_bytes`, `open("w")`...)
//!   may write under the output directory. Reads, and every builtin `open`,
//!   need the scoped-read relaxation, which also admits staged inputs.
//!
//! Every violation found is reported, not just the first.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::language::Language;

/// Category of a validation failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    /// Import of a module outside the allow-list.
    ForbiddenImport,
    /// A call on the deny-list (dynamic evaluation, process spawning, file escape).
    ForbiddenCall,
    /// Use of a member of a restricted module outside its allow-list.
    ForbiddenModuleOperation,
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ViolationKind::ForbiddenImport => write!(f, "forbidden import"),
            ViolationKind::ForbiddenCall => write!(f, "forbidden call"),
            ViolationKind::ForbiddenModuleOperation => write!(f, "forbidden module operation"),
        }
    }
}

/// A single reason a script was rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationViolation {
    /// What kind of rule was broken.
    pub kind: ViolationKind,
    /// The exact source substring that triggered the rejection.
    pub offending_token: String,
    /// 1-based line number of the first occurrence.
    pub line: usize,
}

impl ValidationViolation {
    fn new(kind: ViolationKind, token: impl Into<String>, line: usize) -> Self {
        Self {
            kind,
            offending_token: token.into(),
            line,
        }
    }
}

impl fmt::Display for ValidationViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "line {}: {} '{}'",
            self.line, self.kind, self.offending_token
        )
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Policies
// ─────────────────────────────────────────────────────────────────────────────

const PYTHON_MODULES: &[&str] = &[
    // Scientific stack
    "numpy", "pandas", "scipy", "matplotlib", "seaborn", "sklearn", "statsmodels",
    "networkx", "sympy", "plotly", "Bio",
    // Standard library utilities
    "math", "cmath", "statistics", "random", "decimal", "fractions", "numbers",
    "json", "csv", "re", "string", "textwrap", "unicodedata",
    "datetime", "time", "calendar", "zoneinfo",
    "collections", "itertools", "functools", "operator", "heapq", "bisect", "array",
    "copy", "pprint", "typing", "dataclasses", "enum", "abc", "warnings",
    "base64", "hashlib", "zlib", "struct", "uuid",
    "io", "os", "sys", "pathlib", "glob",
];

/// Restricted Python modules and the members scripts may use.
const PYTHON_RESTRICTED: &[(&str, &[&str])] = &[
    (
        "os",
        &[
            "path", "listdir", "scandir", "walk", "getcwd", "environ", "getenv",
            "makedirs", "mkdir", "stat", "fspath", "sep", "linesep", "curdir",
            "pardir", "extsep", "cpu_count", "name",
        ],
    ),
    (
        "sys",
        &[
            "stdout", "stderr", "version", "version_info", "platform", "maxsize",
            "float_info", "getsizeof", "getrecursionlimit", "exit", "argv",
        ],
    ),
    ("io", &["StringIO", "BytesIO", "SEEK_SET", "SEEK_CUR", "SEEK_END"]),
];

const PYTHON_DENIED_CALLS: &[&str] = &[
    "eval", "exec", "execfile", "compile", "__import__", "breakpoint", "Popen",
    // Reflection reaches restricted members without naming them.
    "getattr", "setattr", "delattr", "globals", "locals", "vars",
];

/// Path methods that touch file contents or metadata, and how.
const PYTHON_FILE_METHODS: &[(&str, FileAccess)] = &[
    ("open", FileAccess::ByMode),
    ("read_text", FileAccess::Read),
    ("read_bytes", FileAccess::Read),
    ("write_text", FileAccess::Write),
    ("write_bytes", FileAccess::Write),
    ("touch", FileAccess::Write),
    ("unlink", FileAccess::Write),
    ("rmdir", FileAccess::Write),
    ("chmod", FileAccess::Write),
    ("symlink_to", FileAccess::Write),
    ("hardlink_to", FileAccess::Write),
];

/// Names that can move a path expression outside the directory it started in.
const ESCAPING_NAMES: &[&str] = &[
    "parent", "parents", "dirname", "home", "expanduser", "environ", "getenv",
];

/// Attribute names that reach interpreter internals.
const PYTHON_DENIED_ATTRIBUTES: &[&str] = &[
    "__builtins__", "__subclasses__", "__globals__", "__code__", "__loader__",
];

const R_PACKAGES: &[&str] = &[
    "base", "stats", "utils", "graphics", "grDevices", "methods", "datasets",
    "ggplot2", "dplyr", "tidyr", "readr", "tibble", "purrr", "stringr", "forcats",
    "lubridate", "magrittr", "data.table", "jsonlite", "scales", "reshape2",
    "survival", "Matrix", "MASS", "lattice", "broom",
];

const R_DENIED_CALLS: &[&str] = &[
    "system", "system2", "shell", "shell.exec", "eval", "evalq", "parse", "source",
    "sys.source", "do.call", "match.fun", "Sys.setenv", "Sys.chmod", "Sys.umask",
    "download.file", "url", "socketConnection", "pipe", "fifo", "unlink",
    "file.remove", "setwd", "dyn.load", ".Internal", ".Call", ".External",
];

/// How a file method uses the path it is called on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileAccess {
    Read,
    Write,
    /// Read or write depending on the `mode` argument.
    ByMode,
}

/// Allow-lists and deny-lists for one guest language.
#[derive(Debug, Clone)]
pub struct LanguagePolicy {
    language: Language,
    allowed_modules: BTreeSet<String>,
    restricted: HashMap<String, BTreeSet<String>>,
    denied_calls: Vec<String>,
    denied_attributes: Vec<String>,
    open_calls: Vec<String>,
    file_methods: Vec<(String, FileAccess)>,
}

impl LanguagePolicy {
    /// The built-in policy for a language.
    pub fn for_language(language: Language) -> Self {
        match language {
            Language::Python => Self::python(),
            Language::R => Self::r(),
        }
    }

    /// Policy for Python scripts.
    pub fn python() -> Self {
        Self {
            language: Language::Python,
            allowed_modules: to_set(PYTHON_MODULES),
            restricted: PYTHON_RESTRICTED
                .iter()
                .map(|(module, members)| (module.to_string(), to_set(members)))
                .collect(),
            denied_calls: to_vec(PYTHON_DENIED_CALLS),
            denied_attributes: to_vec(PYTHON_DENIED_ATTRIBUTES),
            open_calls: vec!["open".to_string()],
            file_methods: PYTHON_FILE_METHODS
                .iter()
                .map(|(name, access)| (name.to_string(), *access))
                .collect(),
        }
    }

    /// Policy for R scripts.
    pub fn r() -> Self {
        Self {
            language: Language::R,
            allowed_modules: to_set(R_PACKAGES),
            restricted: HashMap::new(),
            denied_calls: to_vec(R_DENIED_CALLS),
            denied_attributes: Vec::new(),
            open_calls: to_vec(&["file", "gzfile", "bzfile"]),
            file_methods: Vec::new(),
        }
    }

    /// Allow additional modules (packages for R).
    pub fn with_extra_modules<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_modules
            .extend(modules.into_iter().map(Into::into));
        self
    }

    /// The language this policy applies to.
    pub fn language(&self) -> Language {
        self.language
    }

    /// Whether a top-level module may be imported.
    pub fn is_module_allowed(&self, module: &str) -> bool {
        self.allowed_modules.contains(module)
    }

    /// Allowed modules, sorted.
    pub fn allowed_modules(&self) -> impl Iterator<Item = &str> {
        self.allowed_modules.iter().map(String::as_str)
    }

    fn member_allowed(&self, module: &str, member: &str) -> bool {
        self.restricted
            .get(module)
            .is_none_or(|members| members.contains(member))
    }
}

fn to_set(items: &[&str]) -> BTreeSet<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn to_vec(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Validator
// ─────────────────────────────────────────────────────────────────────────────

// Imports may follow a compound statement head: `try: import x`.
static PY_IMPORT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:^|:)\s*import\s+(.+)$").expect("valid regex"));
static PY_FROM_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|:)\s*from\s+([\w.]+)\s+import\s+(.+)$").expect("valid regex")
});
static R_LIBRARY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:^|[^\w.])(?:library|require|requireNamespace|loadNamespace)\s*\(\s*["']?([A-Za-z][\w.]*)"#)
        .expect("valid regex")
});
static R_NAMESPACE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[^\w.])([A-Za-z][\w.]*)\s*(:::?)\s*([\w.]+)").expect("valid regex")
});

/// Compiled call matcher: the free-standing call `name(`, not `obj.name(`.
#[derive(Debug, Clone)]
struct CallPattern {
    regex: Regex,
}

impl CallPattern {
    fn new(name: &str) -> Self {
        let pattern = format!(r"(?m)(?:^|[^\w.])({}\s*\()", regex::escape(name));
        Self {
            regex: Regex::new(&pattern).expect("escaped call pattern is valid"),
        }
    }

    /// Byte ranges of the `name(` token for each match.
    fn find_all<'a>(&'a self, text: &'a str) -> impl Iterator<Item = (usize, usize)> + 'a {
        self.regex
            .captures_iter(text)
            .filter_map(|caps| caps.get(1).map(|m| (m.start(), m.end())))
    }
}

/// Compiled method matcher: `.name(` on any receiver.
#[derive(Debug, Clone)]
struct MethodPattern {
    regex: Regex,
    access: FileAccess,
}

impl MethodPattern {
    fn new(name: &str, access: FileAccess) -> Self {
        let pattern = format!(r"\.\s*({}\s*\()", regex::escape(name));
        Self {
            regex: Regex::new(&pattern).expect("escaped method pattern is valid"),
            access,
        }
    }

    /// `(dot, token_start, token_end)` for each match.
    fn find_all<'a>(&'a self, text: &'a str) -> impl Iterator<Item = (usize, usize, usize)> + 'a {
        self.regex.captures_iter(text).filter_map(|caps| {
            let dot = caps.get(0)?.start();
            let token = caps.get(1)?;
            Some((dot, token.start(), token.end()))
        })
    }
}

#[derive(Debug, Clone)]
struct CompiledPolicy {
    policy: LanguagePolicy,
    denied: Vec<CallPattern>,
    attributes: Vec<Regex>,
    opens: Vec<CallPattern>,
    file_methods: Vec<MethodPattern>,
}

impl CompiledPolicy {
    fn new(policy: LanguagePolicy) -> Self {
        let denied = policy.denied_calls.iter().map(|c| CallPattern::new(c)).collect();
        let attributes = policy
            .denied_attributes
            .iter()
            .map(|a| Regex::new(&format!(r"\b{}\b", regex::escape(a))).expect("valid regex"))
            .collect();
        let opens = policy.open_calls.iter().map(|c| CallPattern::new(c)).collect();
        let file_methods = policy
            .file_methods
            .iter()
            .map(|(name, access)| MethodPattern::new(name, *access))
            .collect();
        Self {
            policy,
            denied,
            attributes,
            opens,
            file_methods,
        }
    }
}

/// Static allow-list/deny-list scanner.
///
/// Cheap to clone; share one instance across concurrent executions.
#[derive(Debug, Clone)]
pub struct CodeValidator {
    python: CompiledPolicy,
    r: CompiledPolicy,
    allow_scoped_reads: bool,
    output_dir_var: String,
}

impl Default for CodeValidator {
    fn default() -> Self {
        Self::new(LanguagePolicy::python(), LanguagePolicy::r())
    }
}

impl CodeValidator {
    /// Create a validator from explicit policies.
    pub fn new(python: LanguagePolicy, r: LanguagePolicy) -> Self {
        Self {
            python: CompiledPolicy::new(python),
            r: CompiledPolicy::new(r),
            allow_scoped_reads: false,
            output_dir_var: crate::config::DEFAULT_OUTPUT_DIR_VAR.to_string(),
        }
    }

    /// Permit read-only file opens scoped to the output directory or staged inputs.
    pub fn with_scoped_reads(mut self, allow: bool) -> Self {
        self.allow_scoped_reads = allow;
        self
    }

    /// Name of the variable that holds the output directory inside the guest.
    pub fn with_output_dir_var(mut self, name: impl Into<String>) -> Self {
        self.output_dir_var = name.into();
        self
    }

    /// The policy applied to a language.
    pub fn policy(&self, language: Language) -> &LanguagePolicy {
        &self.compiled(language).policy
    }

    fn compiled(&self, language: Language) -> &CompiledPolicy {
        match language {
            Language::Python => &self.python,
            Language::R => &self.r,
        }
    }

    /// Scan `code` and return every violation found.
    ///
    /// `data_variables` are the names staged input files are bound to; with
    /// scoped reads enabled, opening one of them read-only is allowed.
    pub fn validate(
        &self,
        language: Language,
        code: &str,
        data_variables: &[String],
    ) -> Result<(), Vec<ValidationViolation>> {
        let compiled = self.compiled(language);
        let source = Source::new(code, language);
        let stripped = source.text.as_str();
        let mut violations = Vec::new();

        match language {
            Language::Python => self.scan_python_imports(compiled, &source, &mut violations),
            Language::R => scan_r_imports(compiled, stripped, &mut violations),
        }

        for pattern in &compiled.denied {
            for (start, end) in pattern.find_all(stripped) {
                violations.push(ValidationViolation::new(
                    ViolationKind::ForbiddenCall,
                    &stripped[start..end],
                    line_of(stripped, start),
                ));
            }
        }

        for attribute in &compiled.attributes {
            for m in attribute.find_iter(stripped) {
                violations.push(ValidationViolation::new(
                    ViolationKind::ForbiddenCall,
                    m.as_str(),
                    line_of(stripped, m.start()),
                ));
            }
        }

        for pattern in &compiled.opens {
            for (start, end) in pattern.find_all(stripped) {
                let args = call_arguments(&stripped[end..]);
                if self.allow_scoped_reads && self.is_scoped_read(language, args, data_variables) {
                    continue;
                }
                violations.push(ValidationViolation::new(
                    ViolationKind::ForbiddenCall,
                    &stripped[start..end],
                    line_of(stripped, start),
                ));
            }
        }

        for pattern in &compiled.file_methods {
            for (dot, start, end) in pattern.find_all(stripped) {
                let receiver = receiver_of(&stripped[..dot]);
                let args = call_arguments(&stripped[end..]);
                if self.file_method_allowed(pattern.access, receiver, args, data_variables) {
                    continue;
                }
                violations.push(ValidationViolation::new(
                    ViolationKind::ForbiddenCall,
                    &stripped[start..end],
                    line_of(stripped, start),
                ));
            }
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(dedup(violations))
        }
    }

    fn scan_python_imports(
        &self,
        compiled: &CompiledPolicy,
        source: &Source,
        violations: &mut Vec<ValidationViolation>,
    ) {
        let policy = &compiled.policy;
        let stripped = source.text.as_str();
        // alias -> restricted module it is bound to
        let mut bindings: Vec<(String, String)> = Vec::new();

        for (line, statement) in logical_lines(&source.code) {
            if let Some(caps) = PY_IMPORT.captures(&statement) {
                for item in split_items(&caps[1]) {
                    let (path, alias) = split_alias(item);
                    let root = path.split('.').next().unwrap_or(path);
                    if !policy.is_module_allowed(root) {
                        violations.push(ValidationViolation::new(
                            ViolationKind::ForbiddenImport,
                            root,
                            line,
                        ));
                        continue;
                    }
                    if let Some(sub) = path.split('.').nth(1)
                        && !policy.member_allowed(root, sub)
                    {
                        violations.push(ValidationViolation::new(
                            ViolationKind::ForbiddenModuleOperation,
                            path,
                            line,
                        ));
                    }
                    if policy.restricted.contains_key(root) {
                        // `import os.path` binds `os`; `import os as o` binds `o`.
                        let name = match alias {
                            Some(alias) if !path.contains('.') => alias,
                            Some(_) => continue,
                            None => root,
                        };
                        bindings.push((name.to_string(), root.to_string()));
                    }
                }
            } else if let Some(caps) = PY_FROM_IMPORT.captures(&statement) {
                let path = caps.get(1).map_or("", |m| m.as_str());
                let root = path.split('.').next().unwrap_or(path);
                if path.starts_with('.') || !policy.is_module_allowed(root) {
                    violations.push(ValidationViolation::new(
                        ViolationKind::ForbiddenImport,
                        if root.is_empty() { path } else { root },
                        line,
                    ));
                    continue;
                }
                let members = caps.get(2).map_or("", |m| m.as_str());
                let segments: Vec<&str> = path.split('.').collect();
                if segments.len() > 1 {
                    // `from os.path import join`: only the submodule is restricted.
                    if !policy.member_allowed(root, segments[1]) {
                        violations.push(ValidationViolation::new(
                            ViolationKind::ForbiddenModuleOperation,
                            path,
                            line,
                        ));
                    }
                    continue;
                }
                if !policy.restricted.contains_key(root) {
                    continue;
                }
                for item in split_items(members) {
                    let (member, _) = split_alias(item);
                    if member == "*" || !policy.member_allowed(root, member) {
                        violations.push(ValidationViolation::new(
                            ViolationKind::ForbiddenModuleOperation,
                            format!("{root}.{member}"),
                            line,
                        ));
                    }
                }
            }
        }

        for (alias, module) in &bindings {
            let pattern = format!(r"(?m)(?:^|[^\w.])({}\s*\.\s*(\w+))", regex::escape(alias));
            let Ok(regex) = Regex::new(&pattern) else {
                continue;
            };
            for caps in regex.captures_iter(stripped) {
                let (Some(token), Some(member)) = (caps.get(1), caps.get(2)) else {
                    continue;
                };
                if !policy.member_allowed(module, member.as_str()) {
                    violations.push(ValidationViolation::new(
                        ViolationKind::ForbiddenModuleOperation,
                        token.as_str(),
                        line_of(stripped, token.start()),
                    ));
                }
            }
        }
    }

    /// Whether an open call's arguments read a path under the sandbox.
    fn is_scoped_read(&self, language: Language, args: &str, data_variables: &[String]) -> bool {
        let parts = split_arguments(args);
        let Some(target) = parts.first().map(|s| s.trim()) else {
            return false;
        };
        let mode_key = match language {
            Language::Python => "mode",
            Language::R => "open",
        };
        self.is_confined(target, data_variables) && read_only_mode(&parts, mode_key, 1)
    }

    /// Path methods may write under the output directory; reads follow the
    /// same opt-in as `open`.
    fn file_method_allowed(
        &self,
        access: FileAccess,
        receiver: &str,
        args: &str,
        data_variables: &[String],
    ) -> bool {
        let reads = match access {
            FileAccess::Read => true,
            FileAccess::Write => false,
            FileAccess::ByMode => read_only_mode(&split_arguments(args), "mode", 0),
        };
        if reads {
            self.allow_scoped_reads && self.is_confined(receiver, data_variables)
        } else {
            self.is_confined(receiver, &[])
        }
    }

    /// Whether a path expression provably stays under the output directory
    /// or one of the staged input variables.
    fn is_confined(&self, target: &str, inputs: &[String]) -> bool {
        let anchored = contains_word(target, &self.output_dir_var)
            || inputs.iter().any(|v| contains_word(target, v));
        anchored
            && !target.contains("..")
            && !has_absolute_literal(target)
            && !ESCAPING_NAMES.iter().any(|name| contains_word(target, name))
    }
}

fn scan_r_imports(
    compiled: &CompiledPolicy,
    stripped: &str,
    violations: &mut Vec<ValidationViolation>,
) {
    let policy = &compiled.policy;

    for caps in R_LIBRARY.captures_iter(stripped) {
        let Some(package) = caps.get(1) else {
            continue;
        };
        if !policy.is_module_allowed(package.as_str()) {
            violations.push(ValidationViolation::new(
                ViolationKind::ForbiddenImport,
                package.as_str(),
                line_of(stripped, package.start()),
            ));
        }
    }

    for caps in R_NAMESPACE.captures_iter(stripped) {
        let (Some(package), Some(op), Some(member)) = (caps.get(1), caps.get(2), caps.get(3))
        else {
            continue;
        };
        let line = line_of(stripped, package.start());
        if !policy.is_module_allowed(package.as_str()) {
            violations.push(ValidationViolation::new(
                ViolationKind::ForbiddenImport,
                package.as_str(),
                line,
            ));
        } else if op.as_str() == ":::" || !policy.member_allowed(package.as_str(), member.as_str())
        {
            violations.push(ValidationViolation::new(
                ViolationKind::ForbiddenModuleOperation,
                &stripped[package.start()..member.end()],
                line,
            ));
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Source helpers
// ─────────────────────────────────────────────────────────────────────────────

/// Comment-free views of a script with identical line structure.
struct Source {
    /// Comments removed, string literals intact.
    text: String,
    /// Comments removed and string contents blanked.
    code: String,
}

#[derive(Debug, Clone, Copy)]
enum Quote {
    Single(char),
    Triple(char),
}

impl Source {
    fn new(source: &str, language: Language) -> Self {
        let chars: Vec<char> = source.chars().collect();
        let mut text = String::with_capacity(source.len());
        let mut code = String::with_capacity(source.len());
        let mut quote: Option<Quote> = None;
        let mut in_comment = false;
        let repeated = |i: usize, c: char| chars.get(i) == Some(&c);

        let mut i = 0;
        while i < chars.len() {
            let ch = chars[i];
            if ch == '\n' {
                in_comment = false;
                // Python's single-quoted strings cannot span lines; R's can.
                if matches!(quote, Some(Quote::Single(_))) && language == Language::Python {
                    quote = None;
                }
                text.push('\n');
                code.push('\n');
                i += 1;
                continue;
            }
            if in_comment {
                i += 1;
                continue;
            }
            match quote {
                None => match ch {
                    '#' => in_comment = true,
                    '"' | '\'' => {
                        let width = if language == Language::Python
                            && repeated(i + 1, ch)
                            && repeated(i + 2, ch)
                        {
                            quote = Some(Quote::Triple(ch));
                            3
                        } else {
                            quote = Some(Quote::Single(ch));
                            1
                        };
                        for _ in 0..width {
                            text.push(ch);
                            code.push(ch);
                        }
                        i += width;
                        continue;
                    }
                    _ => {
                        text.push(ch);
                        code.push(ch);
                    }
                },
                Some(_) if ch == '\\' => {
                    text.push(ch);
                    code.push(' ');
                    if let Some(&next) = chars.get(i + 1) {
                        text.push(next);
                        code.push(if next == '\n' { '\n' } else { ' ' });
                    }
                    i += 2;
                    continue;
                }
                Some(Quote::Single(q)) if ch == q => {
                    quote = None;
                    text.push(ch);
                    code.push(ch);
                }
                Some(Quote::Triple(q)) if ch == q && repeated(i + 1, q) && repeated(i + 2, q) => {
                    quote = None;
                    for _ in 0..3 {
                        text.push(q);
                        code.push(q);
                    }
                    i += 3;
                    continue;
                }
                Some(_) => {
                    text.push(ch);
                    code.push(' ');
                }
            }
            i += 1;
        }
        Self { text, code }
    }
}

/// Join continuation lines into statements, split on `;`.
///
/// Expects string contents already blanked. Returns `(first_line, statement)`
/// pairs with the statement trimmed.
fn logical_lines(code: &str) -> Vec<(usize, String)> {
    let mut statements = Vec::new();
    let mut current = String::new();
    let mut start_line = 1;
    let mut depth: i32 = 0;

    for (idx, raw) in code.lines().enumerate() {
        if current.is_empty() {
            start_line = idx + 1;
        }
        let line = raw.trim_end();
        let continued = line.ends_with('\\');
        let body = line.trim_end_matches('\\');
        for ch in body.chars() {
            match ch {
                '(' | '[' | '{' => depth += 1,
                ')' | ']' | '}' => depth = (depth - 1).max(0),
                _ => {}
            }
        }
        if !current.is_empty() {
            current.push(' ');
        }
        current.push_str(body.trim());
        if continued || depth > 0 {
            continue;
        }
        for part in current.split(';') {
            let part = part.trim();
            if !part.is_empty() {
                statements.push((start_line, part.to_string()));
            }
        }
        current.clear();
    }
    if !current.trim().is_empty() {
        statements.push((start_line, current.trim().to_string()));
    }
    statements
}

/// Split `a, b as c, (d, e)` into items without parentheses.
fn split_items(list: &str) -> impl Iterator<Item = &str> {
    list.split(',')
        .map(|s| s.trim().trim_matches(|c| c == '(' || c == ')').trim())
        .filter(|s| !s.is_empty())
}

fn split_alias(item: &str) -> (&str, Option<&str>) {
    match item.split_once(" as ") {
        Some((name, alias)) => (name.trim(), Some(alias.trim())),
        None => (item.trim(), None),
    }
}

/// Text between the call's opening parenthesis (already consumed) and its match.
fn call_arguments(rest: &str) -> &str {
    let mut depth = 1;
    let mut quote: Option<char> = None;
    for (idx, ch) in rest.char_indices() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(ch),
            (None, '(') => depth += 1,
            (None, ')') => {
                depth -= 1;
                if depth == 0 {
                    return &rest[..idx];
                }
            }
            _ => {}
        }
    }
    rest
}

/// Split call arguments on top-level commas.
fn split_arguments(args: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0;
    let mut quote: Option<char> = None;
    let mut start = 0;
    for (idx, ch) in args.char_indices() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(ch),
            (None, '(' | '[' | '{') => depth += 1,
            (None, ')' | ']' | '}') => depth -= 1,
            (None, ',') if depth == 0 => {
                parts.push(&args[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    if !args[start..].trim().is_empty() {
        parts.push(&args[start..]);
    }
    parts
}

/// The expression a method is called on: `Path(a, "b")` in `Path(a, "b").open(`.
fn receiver_of(before: &str) -> &str {
    let before = before.trim_end();
    let mut depth = 0;
    let mut quote: Option<char> = None;
    let mut start = before.len();
    for (idx, ch) in before.char_indices().rev() {
        match (quote, ch) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '"' | '\'') => quote = Some(ch),
            (None, ')' | ']' | '}') => depth += 1,
            (None, '(' | '[' | '{') => {
                if depth == 0 {
                    break;
                }
                depth -= 1;
            }
            (None, c) if depth > 0 || c.is_alphanumeric() || c == '_' || c == '.' => {}
            _ => break,
        }
        start = idx;
    }
    before[start..].trim()
}

/// Whether an open call's mode argument is read-only. A missing mode reads.
fn read_only_mode(parts: &[&str], key: &str, position: usize) -> bool {
    let keyword = parts.iter().find_map(|p| {
        p.trim()
            .strip_prefix(key)
            .and_then(|rest| rest.trim_start().strip_prefix('='))
            .filter(|rest| !rest.starts_with('='))
            .map(str::trim)
    });
    let mode = keyword.or_else(|| {
        parts
            .get(position)
            .map(|p| p.trim())
            .filter(|p| !p.contains('='))
    });
    match mode {
        None => true,
        Some(mode) => string_literal(mode)
            .is_some_and(|m| m.chars().all(|c| matches!(c, 'r' | 'b' | 't'))),
    }
}

fn contains_word(haystack: &str, word: &str) -> bool {
    if word.is_empty() {
        return false;
    }
    haystack.match_indices(word).any(|(idx, _)| {
        let before = haystack[..idx].chars().next_back();
        let after = haystack[idx + word.len()..].chars().next();
        let is_ident = |c: char| c.is_alphanumeric() || c == '_';
        !before.is_some_and(is_ident) && !after.is_some_and(is_ident)
    })
}

/// Whether any string literal in the expression is an absolute path.
fn has_absolute_literal(expr: &str) -> bool {
    let mut chars = expr.char_indices().peekable();
    while let Some((_, ch)) = chars.next() {
        if ch == '"' || ch == '\'' {
            if let Some((_, first)) = chars.peek()
                && (*first == '/' || *first == '\\' || *first == '~')
            {
                return true;
            }
            for (_, c) in chars.by_ref() {
                if c == ch {
                    break;
                }
            }
        }
    }
    false
}

/// The contents of a plain string literal, if `expr` is one.
fn string_literal(expr: &str) -> Option<&str> {
    let expr = expr.trim();
    let quote = expr.chars().next()?;
    if (quote == '"' || quote == '\'') && expr.len() >= 2 && expr.ends_with(quote) {
        Some(&expr[1..expr.len() - 1])
    } else {
        None
    }
}

fn line_of(text: &str, offset: usize) -> usize {
    text[..offset].matches('\n').count() + 1
}

fn dedup(mut violations: Vec<ValidationViolation>) -> Vec<ValidationViolation> {
    violations.sort_by(|a, b| a.line.cmp(&b.line));
    let mut seen = BTreeSet::new();
    violations.retain(|v| seen.insert((v.kind, v.offending_token.clone())));
    violations
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validate_py(code: &str) -> Result<(), Vec<ValidationViolation>> {
        CodeValidator::default().validate(Language::Python, code, &[])
    }

    fn validate_r(code: &str) -> Result<(), Vec<ValidationViolation>> {
        CodeValidator::default().validate(Language::R, code, &[])
    }

    #[test]
    fn test_allowed_imports_pass() {
        let code = "import numpy as np\nimport pandas as pd\nfrom matplotlib import pyplot as plt\nimport os.path\nprint(np.arange(3))\n";
        assert!(validate_py(code).is_ok());
    }

    #[test]
    fn test_denied_import_single_violation() {
        let violations = validate_py("import subprocess\n").unwrap_err();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::ForbiddenImport);
        assert_eq!(violations[0].offending_token, "subprocess");
        assert_eq!(violations[0].line, 1);
    }

    #[test]
    fn test_from_import_of_denied_module() {
        let violations = validate_py("from socket import socket\n").unwrap_err();
        assert_eq!(violations[0].offending_token, "socket");
        assert_eq!(violations[0].kind, ViolationKind::ForbiddenImport);
    }

    #[test]
    fn test_multiple_imports_on_one_line() {
        let violations = validate_py("import json, shutil, ctypes as c\n").unwrap_err();
        let tokens: Vec<_> = violations.iter().map(|v| v.offending_token.as_str()).collect();
        assert_eq!(tokens, vec!["shutil", "ctypes"]);
    }

    #[test]
    fn test_reports_all_violations() {
        let code = "import subprocess\nimport socket\nx = eval('1+1')\nexec('print(1)')\n";
        let violations = validate_py(code).unwrap_err();
        assert_eq!(violations.len(), 4);
        assert_eq!(violations[2].kind, ViolationKind::ForbiddenCall);
        assert_eq!(violations[2].offending_token, "eval(");
        assert_eq!(violations[2].line, 3);
    }

    #[test]
    fn test_method_calls_are_not_denied_calls() {
        let code = "import re\nimport pandas as pd\np = re.compile('a+')\ndf = pd.DataFrame({'a': [1]})\ndf.eval('b = a * 2')\n";
        assert!(validate_py(code).is_ok());
    }

    #[test]
    fn test_comments_are_ignored() {
        let code = "# import subprocess\nx = 1  # eval(x)\nprint('# not a comment')\n";
        assert!(validate_py(code).is_ok());
    }

    #[test]
    fn test_restricted_module_members() {
        let ok = "import os\nfiles = os.listdir(os.environ['OUTPUT_DIR'])\np = os.path.join('a', 'b')\n";
        assert!(validate_py(ok).is_ok());

        let violations = validate_py("import os\nos.system('ls')\n").unwrap_err();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::ForbiddenModuleOperation);
        assert_eq!(violations[0].offending_token, "os.system");
        assert_eq!(violations[0].line, 2);
    }

    #[test]
    fn test_restricted_module_alias_is_tracked() {
        let violations = validate_py("import os as o\no.popen('id')\n").unwrap_err();
        assert_eq!(violations[0].offending_token, "o.popen");
    }

    #[test]
    fn test_from_restricted_module_import() {
        let violations = validate_py("from os import path, system\n").unwrap_err();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].offending_token, "os.system");

        let violations = validate_py("from os import *\n").unwrap_err();
        assert_eq!(violations[0].offending_token, "os.*");
    }

    #[test]
    fn test_parenthesized_from_import_spans_lines() {
        let code = "from os import (\n    path,\n    execv,\n)\n";
        let violations = validate_py(code).unwrap_err();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].offending_token, "os.execv");
        assert_eq!(violations[0].line, 1);
    }

    #[test]
    fn test_brackets_inside_strings_do_not_hide_imports() {
        let violations = validate_py("print(\"(\")\nimport subprocess\n").unwrap_err();
        assert_eq!(violations[0].offending_token, "subprocess");
        assert_eq!(violations[0].line, 2);
    }

    #[test]
    fn test_imports_after_compound_statement_head() {
        let code = "try: import subprocess\nexcept ImportError: pass\nif True: import socket\nelse: from os import system\n";
        let violations = validate_py(code).unwrap_err();
        let found: Vec<_> = violations
            .iter()
            .map(|v| (v.offending_token.as_str(), v.line))
            .collect();
        assert_eq!(found, vec![("subprocess", 1), ("socket", 3), ("os.system", 4)]);
    }

    #[test]
    fn test_import_after_semicolon() {
        let violations = validate_py("x = 1; import ctypes\n").unwrap_err();
        assert_eq!(violations[0].offending_token, "ctypes");
    }

    #[test]
    fn test_docstring_brackets_do_not_hide_imports() {
        let code = "\"\"\"Summary (see\nthe notes [here.\n\"\"\"\nimport subprocess\n";
        let violations = validate_py(code).unwrap_err();
        assert_eq!(violations[0].offending_token, "subprocess");
        assert_eq!(violations[0].line, 4);
    }

    #[test]
    fn test_hash_inside_multiline_string_is_not_a_comment() {
        let code = "s = '''\n# '''; eval('1')\n";
        let violations = validate_py(code).unwrap_err();
        assert_eq!(violations[0].offending_token, "eval(");
        assert_eq!(violations[0].line, 2);

        let continued = "s = 'a\\\n#'; eval('1')\n";
        assert!(validate_py(continued).is_err());
    }

    #[test]
    fn test_import_text_inside_docstring_is_ignored() {
        assert!(validate_py("\"\"\"\nimport subprocess\n\"\"\"\nprint(1)\n").is_ok());
    }

    #[test]
    fn test_relative_import_rejected() {
        let violations = validate_py("from . import secrets\n").unwrap_err();
        assert_eq!(violations[0].kind, ViolationKind::ForbiddenImport);
    }

    #[test]
    fn test_dunder_escape_rejected() {
        let violations = validate_py("x = ().__class__.__bases__[0].__subclasses__()\n").unwrap_err();
        assert!(violations.iter().any(|v| v.offending_token == "__subclasses__"));
    }

    #[test]
    fn test_open_rejected_by_default() {
        let violations = validate_py("f = open('/etc/passwd')\n").unwrap_err();
        assert_eq!(violations[0].offending_token, "open(");
    }

    #[test]
    fn test_scoped_read_relaxation() {
        let validator = CodeValidator::default().with_scoped_reads(true);
        let vars = vec!["counts".to_string()];

        let ok = "import os\nwith open(os.path.join(OUTPUT_DIR, 'a.csv')) as f:\n    pass\nwith open(counts, 'rb') as g:\n    pass\n";
        assert!(validator.validate(Language::Python, ok, &vars).is_ok());

        // Write mode is never relaxed.
        let write = "f = open(os.path.join(OUTPUT_DIR, 'a.csv'), 'w')\n";
        assert!(validator.validate(Language::Python, write, &vars).is_err());

        let write_kw = "f = open(counts, mode='a')\n";
        assert!(validator.validate(Language::Python, write_kw, &vars).is_err());

        // Not provably scoped.
        let escape = "f = open(os.path.join(OUTPUT_DIR, '/etc/passwd'))\n";
        assert!(validator.validate(Language::Python, escape, &vars).is_err());
        let traversal = "f = open(OUTPUT_DIR + '/../secret')\n";
        assert!(validator.validate(Language::Python, traversal, &vars).is_err());
        let other = "f = open('data.csv')\n";
        assert!(validator.validate(Language::Python, other, &vars).is_err());
    }

    #[test]
    fn test_reflection_calls_rejected() {
        let violations = validate_py("import os\ngetattr(os, 'system')('id')\n").unwrap_err();
        assert_eq!(violations[0].kind, ViolationKind::ForbiddenCall);
        assert_eq!(violations[0].offending_token, "getattr(");

        for code in ["setattr(x, 'a', 1)\n", "g = globals()\n", "v = vars(obj)\n"] {
            assert!(validate_py(code).is_err(), "{code}");
        }
        // Methods that share a name are fine.
        assert!(validate_py("import pandas as pd\ndf = pd.DataFrame()\ndf.vars(1)\n").is_ok());
    }

    #[test]
    fn test_path_methods_outside_sandbox_rejected() {
        let violations =
            validate_py("import pathlib\nprint(pathlib.Path('/etc/passwd').read_text())\n")
                .unwrap_err();
        assert_eq!(violations[0].offending_token, "read_text(");
        assert_eq!(violations[0].line, 2);

        let open = "from pathlib import Path\nwith Path('/etc/passwd').open() as f:\n    pass\n";
        assert_eq!(validate_py(open).unwrap_err()[0].offending_token, "open(");

        let scoped = CodeValidator::default().with_scoped_reads(true);
        let absolute = "import pathlib\npathlib.Path('/etc/passwd').read_bytes()\n";
        assert!(scoped.validate(Language::Python, absolute, &[]).is_err());
    }

    #[test]
    fn test_path_writes_confined_to_output_dir() {
        let ok = "import pathlib\npathlib.Path(OUTPUT_DIR, 'plot.png').write_bytes(b'')\nwith pathlib.Path(OUTPUT_DIR, 't.csv').open('w', newline='') as fh:\n    pass\n";
        assert!(validate_py(ok).is_ok());

        for code in [
            "import pathlib\npathlib.Path('/tmp/x').write_text('x')\n",
            "import pathlib\npathlib.Path(OUTPUT_DIR).parent.joinpath('x').write_text('')\n",
            "import pathlib\npathlib.Path(OUTPUT_DIR, '../x').unlink()\n",
            "import pathlib\np = pathlib.Path(OUTPUT_DIR, 'a')\np.write_text('x')\n",
        ] {
            assert!(validate_py(code).is_err(), "{code}");
        }
    }

    #[test]
    fn test_path_reads_follow_scoped_read_rule() {
        let vars = vec!["df".to_string()];
        let code = "import pathlib\nprint(pathlib.Path(df).read_text())\n";
        let read_mode = "import pathlib\nwith pathlib.Path(OUTPUT_DIR, 'a.csv').open('rb') as f:\n    pass\n";

        let strict = CodeValidator::default();
        assert!(strict.validate(Language::Python, code, &vars).is_err());
        assert!(strict.validate(Language::Python, read_mode, &vars).is_err());

        let relaxed = CodeValidator::default().with_scoped_reads(true);
        assert!(relaxed.validate(Language::Python, code, &vars).is_ok());
        assert!(relaxed.validate(Language::Python, read_mode, &vars).is_ok());
        // Staged inputs are readable, never writable.
        let overwrite = "import pathlib\npathlib.Path(df).write_text('x')\n";
        assert!(relaxed.validate(Language::Python, overwrite, &vars).is_err());
    }

    #[test]
    fn test_receiver_of() {
        assert_eq!(receiver_of("with Path(OUTPUT_DIR, 'a.csv')"), "Path(OUTPUT_DIR, 'a.csv')");
        assert_eq!(receiver_of("x = pathlib.Path(p)['k'].b "), "pathlib.Path(p)['k'].b");
        assert_eq!(receiver_of("print(p"), "p");
        assert_eq!(receiver_of(""), "");
    }

    #[test]
    fn test_extra_modules() {
        let validator = CodeValidator::new(
            LanguagePolicy::python().with_extra_modules(["polars"]),
            LanguagePolicy::r(),
        );
        assert!(validator.validate(Language::Python, "import polars as pl\n", &[]).is_ok());
        assert!(!validator.policy(Language::Python).is_module_allowed("requests"));
    }

    #[test]
    fn test_duplicate_violations_collapse() {
        let violations = validate_py("eval('1')\neval('2')\n").unwrap_err();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].line, 1);
    }

    #[test]
    fn test_r_allowed_script() {
        let code = "library(ggplot2)\nsuppressMessages(library(\"dplyr\"))\ndf <- data.frame(x = 1:3)\nprint(stats::median(df$x))\n";
        assert!(validate_r(code).is_ok());
    }

    #[test]
    fn test_r_denied_package_and_calls() {
        let code = "library(httr)\nsystem('ls')\nres <- base::system2('id')\n";
        let violations = validate_r(code).unwrap_err();
        let tokens: Vec<_> = violations.iter().map(|v| v.offending_token.as_str()).collect();
        assert!(tokens.contains(&"httr"));
        assert!(tokens.contains(&"system("));
        assert!(tokens.contains(&"system2("));
    }

    #[test]
    fn test_r_internal_namespace_access() {
        let violations = validate_r("x <- stats:::C_cor(1)\n").unwrap_err();
        assert_eq!(violations[0].kind, ViolationKind::ForbiddenModuleOperation);
        assert_eq!(violations[0].offending_token, "stats:::C_cor");
    }

    #[test]
    fn test_r_dotted_names_are_not_denied_calls() {
        assert!(validate_r("my.system <- function() 1\nmy.system()\n").is_ok());
    }

    #[test]
    fn test_violation_display() {
        let v = ValidationViolation::new(ViolationKind::ForbiddenImport, "socket", 4);
        assert_eq!(v.to_string(), "line 4: forbidden import 'socket'");
    }

    #[test]
    fn test_split_arguments_respects_nesting() {
        let parts = split_arguments("os.path.join(a, 'b'), 'r', encoding='utf-8'");
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "os.path.join(a, 'b')");
    }
}
