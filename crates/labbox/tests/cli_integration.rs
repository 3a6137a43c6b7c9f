//! CLI integration tests for the labbox command-line interface.
//!
//! Every test runs with its own config, data and working directory so the
//! host's config files are never read. Tests that execute scripts skip when
//! python3 is missing.

use std::path::Path;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Isolated directories for one test.
struct Env {
    dir: TempDir,
}

impl Env {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("config")).unwrap();
        std::fs::create_dir_all(dir.path().join("project")).unwrap();
        Self { dir }
    }

    fn project(&self) -> std::path::PathBuf {
        self.dir.path().join("project")
    }

    /// Get a command for the labbox binary.
    fn labbox(&self) -> Command {
        let mut cmd = Command::cargo_bin("labbox").unwrap();
        cmd.current_dir(self.project())
            .env("LABBOX_CONFIG_DIR", self.dir.path().join("config"))
            .env("LABBOX_DATA_DIR", self.dir.path().join("data"))
            .env_remove("RUST_LOG");
        cmd
    }

    /// Keep working directories inside the temp dir.
    fn write_project_config(&self, extra: &str) {
        let work = self.dir.path().join("work");
        std::fs::write(
            self.project().join("labbox.toml"),
            format!(
                "[sandbox]\nwork_root = \"{}\"\n{extra}\n[logging]\nfile = false\n",
                work.display()
            ),
        )
        .unwrap();
    }
}

fn python_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .is_ok_and(|o| o.status.success())
}

fn is_empty_dir(path: &Path) -> bool {
    std::fs::read_dir(path).map_or(true, |mut d| d.next().is_none())
}

// ─────────────────────────────────────────────────────────────────────────────
// Help and Version Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_help_displays() {
    Env::new()
        .labbox()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("sandbox"));
}

#[test]
fn test_version_displays() {
    Env::new()
        .labbox()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("labbox"));
}

#[test]
fn test_help_lists_subcommands() {
    Env::new()
        .labbox()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("check"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("upload"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn test_run_help_mentions_data() {
    Env::new()
        .labbox()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("NAME=REF"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Argument Parsing Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_bad_data_binding_rejected() {
    Env::new()
        .labbox()
        .args(["run", "-c", "print(1)", "--data", "no-equals-sign"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("NAME=REFERENCE"));
}

#[test]
fn test_unknown_language_rejected() {
    Env::new()
        .labbox()
        .args(["check", "-c", "print(1)", "--language", "julia"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unsupported language"));
}

#[test]
fn test_code_and_script_conflict() {
    Env::new()
        .labbox()
        .args(["check", "script.py", "-c", "print(1)"])
        .assert()
        .failure();
}

// ─────────────────────────────────────────────────────────────────────────────
// Check Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_check_passes_clean_script() {
    let env = Env::new();
    env.write_project_config("");
    env.labbox()
        .args(["check", "-c", "import math\nprint(math.sqrt(2))"])
        .assert()
        .success()
        .stdout(predicate::str::contains("passed"));
}

#[test]
fn test_check_reports_violation() {
    let env = Env::new();
    env.write_project_config("");
    env.labbox()
        .args(["check", "-c", "import subprocess\nsubprocess.run(['ls'])"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("subprocess"));
}

#[test]
fn test_check_json_from_stdin() {
    let env = Env::new();
    env.write_project_config("");
    let output = env
        .labbox()
        .args(["--json", "check", "-"])
        .write_stdin("import socket\n")
        .assert()
        .code(2)
        .get_output()
        .stdout
        .clone();

    let json: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(json["valid"], false);
    assert_eq!(json["language"], "python");
    assert_eq!(json["violations"][0]["offending_token"], "socket");
    assert_eq!(json["violations"][0]["line"], 1);
}

#[test]
fn test_check_infers_language_from_extension() {
    let env = Env::new();
    env.write_project_config("");
    std::fs::write(env.project().join("analysis.R"), "system(\"ls\")\n").unwrap();
    env.labbox()
        .args(["check", "analysis.R"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("system"));
}

#[test]
fn test_check_rejects_reflection_and_path_escape() {
    let env = Env::new();
    env.write_project_config("");
    env.labbox()
        .args([
            "check",
            "-c",
            "import os\nimport pathlib\ngetattr(os, 'system')('id')\npathlib.Path('/etc/passwd').read_text()",
        ])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("getattr("))
        .stdout(predicate::str::contains("read_text("));
}

#[test]
fn test_extra_modules_from_config() {
    let env = Env::new();
    env.write_project_config("\n[validator]\nextra_python_modules = [\"sklearn\"]\n");
    env.labbox()
        .args(["check", "-c", "import sklearn"])
        .assert()
        .success();
}

// ─────────────────────────────────────────────────────────────────────────────
// Run Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_run_rejected_script_never_spawns() {
    let env = Env::new();
    env.write_project_config("");
    env.labbox()
        .args(["run", "-c", "import os\nos.system('echo hi')"])
        .assert()
        .code(2)
        .stdout(predicate::str::contains("Code validation failed"));
    assert!(is_empty_dir(&env.dir.path().join("work")));
}

#[test]
fn test_run_prints_output() {
    if !python_available() {
        eprintln!("Skipping: python3 not available");
        return;
    }
    let env = Env::new();
    env.write_project_config("");
    env.labbox()
        .args(["run", "-c", "print('hello from labbox')"])
        .assert()
        .success()
        .stdout(predicate::str::contains("hello from labbox"));
    assert!(is_empty_dir(&env.dir.path().join("work")));
}

#[test]
fn test_run_json_reports_timeout() {
    if !python_available() {
        eprintln!("Skipping: python3 not available");
        return;
    }
    let env = Env::new();
    env.write_project_config("");
    let output = env
        .labbox()
        .args([
            "--json",
            "run",
            "-c",
            "import time\nwhile True:\n    time.sleep(0.1)",
            "--timeout",
            "1",
        ])
        .assert()
        .code(1)
        .get_output()
        .stdout
        .clone();

    let json: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(json["metadata"]["outcome"], "timed_out");
    assert_eq!(json["metadata"]["timed_out"], true);
    assert!(json["text"].as_str().unwrap().contains("timed out"));
}

#[test]
fn test_upload_then_run_with_data() {
    if !python_available() {
        eprintln!("Skipping: python3 not available");
        return;
    }
    let env = Env::new();
    env.write_project_config("\n[validator]\nallow_scoped_reads = true\n");
    let csv = env.project().join("sales.csv");
    std::fs::write(&csv, "region,total\nnorth,42\n").unwrap();

    let output = env
        .labbox()
        .args(["--json", "upload", "sales.csv"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let uploads: serde_json::Value = serde_json::from_slice(&output).unwrap();
    let id = uploads[0]["id"].as_str().unwrap().to_string();

    env.labbox()
        .args([
            "run",
            "-c",
            "import pathlib\nprint(pathlib.Path(sales).read_text())",
            "--data",
            &format!("sales={id}"),
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("north,42"));
}

// ─────────────────────────────────────────────────────────────────────────────
// Status and Config Tests
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn test_status_json() {
    let env = Env::new();
    env.write_project_config("");
    let output = env
        .labbox()
        .args(["--json", "status"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();

    let json: serde_json::Value = serde_json::from_slice(&output).unwrap();
    assert_eq!(json["interpreters"].as_array().unwrap().len(), 2);
    assert_eq!(json["default_timeout_secs"], 30);
}

#[test]
fn test_config_show_reports_project_file() {
    let env = Env::new();
    env.write_project_config("max_timeout_secs = 90\n");
    env.labbox()
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("labbox.toml"))
        .stdout(predicate::str::contains("max_timeout_secs = 90"));
}

#[test]
fn test_config_init_local() {
    let env = Env::new();
    env.labbox()
        .args(["config", "init", "--local"])
        .assert()
        .success();
    let written = std::fs::read_to_string(env.project().join("labbox.toml")).unwrap();
    assert!(written.contains("[sandbox]"));

    env.labbox()
        .args(["config", "init", "--local"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
}

#[test]
fn test_malformed_config_warns() {
    let env = Env::new();
    std::fs::write(env.project().join("labbox.toml"), "not toml {{{").unwrap();
    env.labbox()
        .args(["config", "path"])
        .assert()
        .success()
        .stderr(predicate::str::contains("Failed to load"));
}
