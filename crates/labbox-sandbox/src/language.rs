//! Guest languages and their launchers.
//!
//! User code is never executed directly. A small trusted launcher binds the
//! output directory and staged data files to variables, runs the user script,
//! and saves any figures left open when the script did not save one itself.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// A supported guest language.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    #[default]
    Python,
    R,
}

impl Language {
    /// Display name.
    pub fn name(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::R => "r",
        }
    }

    /// File name the user script is written to.
    pub fn script_file(&self) -> &'static str {
        match self {
            Language::Python => "script.py",
            Language::R => "script.R",
        }
    }

    /// File name of the trusted launcher.
    pub fn launcher_file(&self) -> &'static str {
        match self {
            Language::Python => "_labbox_launcher.py",
            Language::R => "_labbox_launcher.R",
        }
    }

    /// Default interpreter invocation.
    pub fn default_interpreter(&self) -> InterpreterConfig {
        match self {
            Language::Python => InterpreterConfig::new("python3").with_args(["-B"]),
            Language::R => InterpreterConfig::new("Rscript").with_args(["--vanilla"]),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "r" | "rscript" => Ok(Language::R),
            other => Err(format!("unsupported language '{other}' (expected python or r)")),
        }
    }
}

/// How to invoke an interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterpreterConfig {
    /// Program name or absolute path.
    pub program: PathBuf,
    /// Arguments placed before the launcher path.
    pub args: Vec<String>,
}

impl InterpreterConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

/// One file written into the working directory before spawning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptFile {
    pub name: String,
    pub contents: String,
}

/// The files to write and the one to hand to the interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptBundle {
    pub files: Vec<ScriptFile>,
    pub entry: String,
}

impl ScriptBundle {
    /// A bundle with a single script that is also the entry point.
    pub fn single(name: impl Into<String>, contents: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            files: vec![ScriptFile {
                name: name.clone(),
                contents: contents.into(),
            }],
            entry: name,
        }
    }

    /// Names of every file in the bundle.
    pub fn file_names(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|f| f.name.as_str())
    }
}

/// Values the launcher binds before running user code.
#[derive(Debug, Clone)]
pub struct LaunchContext<'a> {
    pub output_dir_var: &'a str,
    pub output_dir: &'a Path,
    pub working_dir: &'a Path,
    /// Staged data files: variable name -> absolute path.
    pub data_files: &'a [(String, PathBuf)],
    pub autosave_figures: bool,
}

/// Build the launcher + user script bundle for a language.
pub fn bundle(language: Language, code: &str, ctx: &LaunchContext<'_>) -> ScriptBundle {
    let script = ScriptFile {
        name: language.script_file().to_string(),
        contents: code.to_string(),
    };
    let launcher = ScriptFile {
        name: language.launcher_file().to_string(),
        contents: match language {
            Language::Python => python_launcher(ctx, &ctx.working_dir.join(&script.name)),
            Language::R => r_launcher(ctx, &ctx.working_dir.join(&script.name)),
        },
    };
    ScriptBundle {
        entry: launcher.name.clone(),
        files: vec![script, launcher],
    }
}

/// Quote a string for either language (JSON string syntax is valid in both).
fn quote(value: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| String::from("\"\""))
}

fn quote_path(path: &Path) -> String {
    quote(&path.to_string_lossy())
}

fn python_launcher(ctx: &LaunchContext<'_>, script: &Path) -> String {
    let mut bindings = format!("    {}: OUTPUT_DIR,\n", quote(ctx.output_dir_var));
    for (name, path) in ctx.data_files {
        bindings.push_str(&format!("    {}: {},\n", quote(name), quote_path(path)));
    }

    format!(
        r#"import os as _labbox_os
import runpy as _labbox_runpy
import sys as _labbox_sys

OUTPUT_DIR = _labbox_os.environ.get({var}, {out})
_LABBOX_IMAGE_SUFFIXES = (".png", ".jpg", ".jpeg", ".gif", ".bmp", ".webp", ".svg")


def _labbox_autosave():
    plt = _labbox_sys.modules.get("matplotlib.pyplot")
    if plt is None:
        return
    try:
        saved = [
            name
            for name in _labbox_os.listdir(OUTPUT_DIR)
            if name.lower().endswith(_LABBOX_IMAGE_SUFFIXES)
        ]
        if {autosave} and not saved:
            for index, number in enumerate(plt.get_fignums(), start=1):
                plt.figure(number).savefig(
                    _labbox_os.path.join(OUTPUT_DIR, "figure_%d.png" % index)
                )
        plt.close("all")
    except Exception as exc:
        print("[labbox] could not save figures: %s" % exc, file=_labbox_sys.stderr)


try:
    _labbox_runpy.run_path(
        {script},
        init_globals={{
{bindings}        }},
        run_name="__main__",
    )
finally:
    _labbox_sys.stdout.flush()
    _labbox_autosave()
"#,
        var = quote(ctx.output_dir_var),
        out = quote_path(ctx.output_dir),
        autosave = if ctx.autosave_figures { "True" } else { "False" },
        script = quote_path(script),
        bindings = bindings,
    )
}

fn r_launcher(ctx: &LaunchContext<'_>, script: &Path) -> String {
    let mut out = format!(
        "{var} <- Sys.getenv({var_q}, unset = {dir})\n",
        var = ctx.output_dir_var,
        var_q = quote(ctx.output_dir_var),
        dir = quote_path(ctx.output_dir),
    );
    for (name, path) in ctx.data_files {
        out.push_str(&format!("{name} <- {}\n", quote_path(path)));
    }
    if ctx.autosave_figures {
        out.push_str(&format!(
            "options(device = function(...) grDevices::png(filename = file.path({}, \"figure_%d.png\"), ...))\n",
            ctx.output_dir_var
        ));
    }
    out.push_str(&format!(
        "invisible(source({}, echo = FALSE, local = FALSE))\ninvisible(grDevices::graphics.off())\n",
        quote_path(script)
    ));
    out
}
