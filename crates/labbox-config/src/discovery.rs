//! Locating config files and layering them.
//!
//! Two layers are read, the second overriding the first section by section:
//! the user file (`config.toml` under [`user_config_dir`]) and `labbox.toml`
//! in the project directory. Command-line flags are applied by the caller.

use std::path::{Path, PathBuf};

use crate::{ConfigError, LabboxConfig, Result};

/// Project-local config file name.
pub const PROJECT_CONFIG_FILE: &str = "labbox.toml";

/// File name inside the user config directory.
pub const USER_CONFIG_FILE: &str = "config.toml";

/// Directory name under the platform config root.
pub const APP_NAME: &str = "labbox";

/// Overrides the user config directory when set and non-empty.
const CONFIG_DIR_ENV: &str = "LABBOX_CONFIG_DIR";

/// One candidate config file.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    pub path: PathBuf,
    /// Found and parsed.
    pub loaded: bool,
}

/// The merged configuration and how it was assembled.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: LabboxConfig,
    /// Every candidate, lowest precedence first.
    pub sources: Vec<ConfigSource>,
    /// The first candidate that loaded.
    pub source: Option<ConfigSource>,
    /// Unreadable layers and settings that weaken the sandbox.
    pub warnings: Vec<String>,
}

impl LoadedConfig {
    /// Paths of the layers that loaded.
    pub fn loaded_from(&self) -> Vec<&Path> {
        self.sources
            .iter()
            .filter(|s| s.loaded)
            .map(|s| s.path.as_path())
            .collect()
    }
}

/// Discover and merge the user and project layers.
///
/// `project_dir` defaults to the current directory.
pub fn load_config(project_dir: Option<&Path>) -> Result<LoadedConfig> {
    load_config_with_options(project_dir, None)
}

/// Like [`load_config`], reading the user layer from `config_dir` instead of
/// [`user_config_dir`] when given.
pub fn load_config_with_options(
    project_dir: Option<&Path>,
    config_dir: Option<&Path>,
) -> Result<LoadedConfig> {
    let user = config_dir
        .map(Path::to_path_buf)
        .or_else(user_config_dir)
        .map(|dir| dir.join(USER_CONFIG_FILE));
    let project = project_dir.unwrap_or(Path::new(".")).join(PROJECT_CONFIG_FILE);

    let mut config = LabboxConfig::new();
    let mut warnings = Vec::new();
    let sources: Vec<ConfigSource> = user
        .into_iter()
        .chain(std::iter::once(project))
        .map(|path| load_layer(&mut config, path, &mut warnings))
        .collect();

    check_loosened_limits(&config, &mut warnings);
    let source = sources.iter().find(|s| s.loaded).cloned();

    Ok(LoadedConfig {
        config,
        sources,
        source,
        warnings,
    })
}

/// Parse one file, without discovery or merging.
pub fn load_config_file(path: &Path) -> Result<LabboxConfig> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.display().to_string(),
        source,
    })?;
    LabboxConfig::from_toml(&contents)
}

/// Write `config` as TOML, creating missing parent directories.
pub fn save_config(config: &LabboxConfig, path: &Path) -> Result<()> {
    let write_error = |at: &Path| {
        let at = at.display().to_string();
        move |source| ConfigError::WriteFile { path: at, source }
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(write_error(parent))?;
    }
    std::fs::write(path, config.to_toml()?).map_err(write_error(path))
}

/// Directory holding the user config: `LABBOX_CONFIG_DIR`, else the platform
/// config root joined with [`APP_NAME`].
pub fn user_config_dir() -> Option<PathBuf> {
    match std::env::var_os(CONFIG_DIR_ENV) {
        Some(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
        _ => dirs::config_dir().map(|d| d.join(APP_NAME)),
    }
}

/// Full path of the user config file.
pub fn user_config_path() -> Option<PathBuf> {
    user_config_dir().map(|d| d.join(USER_CONFIG_FILE))
}

/// Merge `path` into `config` if it exists. Parse failures become warnings.
fn load_layer(
    config: &mut LabboxConfig,
    path: PathBuf,
    warnings: &mut Vec<String>,
) -> ConfigSource {
    let loaded = path.is_file()
        && match load_config_file(&path) {
            Ok(layer) => {
                tracing::debug!(path = %path.display(), "Loaded config layer");
                config.merge(layer);
                true
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable config layer");
                warnings.push(format!("Failed to load {}: {}", path.display(), e));
                false
            }
        };
    ConfigSource { path, loaded }
}

/// Host variables that change how a guest interpreter starts.
const STARTUP_ENV_VARS: &[&str] = &[
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "DYLD_INSERT_LIBRARIES",
    "PYTHONPATH",
    "PYTHONSTARTUP",
    "PYTHONHOME",
    "R_PROFILE",
    "R_PROFILE_USER",
    "R_LIBS",
    "R_LIBS_USER",
];

/// Flag settings that weaken the sandbox.
fn check_loosened_limits(config: &LabboxConfig, warnings: &mut Vec<String>) {
    if let Some(ref sandbox) = config.sandbox {
        if sandbox.memory_limit_mb == Some(0) {
            warnings.push(
                "[sandbox] memory_limit_mb = 0 disables the guest memory ceiling.".to_string(),
            );
        }
        for name in sandbox.inherit_env.iter().flatten() {
            if STARTUP_ENV_VARS.contains(&name.as_str()) {
                warnings.push(format!(
                    "[sandbox] inherit_env passes {name} to guests; it changes interpreter startup."
                ));
            }
        }
    }

    if let Some(ref paths) = config.paths
        && paths.allow_direct_paths
    {
        warnings.push(
            "[paths] allow_direct_paths lets data references name any readable host file."
                .to_string(),
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// Temp user and project directories with optional file contents.
    struct Layers {
        user: TempDir,
        project: TempDir,
    }

    impl Layers {
        fn new(user: Option<&str>, project: Option<&str>) -> Self {
            let layers = Self {
                user: TempDir::new().unwrap(),
                project: TempDir::new().unwrap(),
            };
            if let Some(contents) = user {
                fs::write(layers.user.path().join(USER_CONFIG_FILE), contents).unwrap();
            }
            if let Some(contents) = project {
                fs::write(layers.project.path().join(PROJECT_CONFIG_FILE), contents).unwrap();
            }
            layers
        }

        fn load(&self) -> LoadedConfig {
            load_config_with_options(Some(self.project.path()), Some(self.user.path())).unwrap()
        }
    }

    #[test]
    fn test_user_config_path_ends_with_file_name() {
        if let Some(p) = user_config_path() {
            assert!(p.ends_with("config.toml"));
        }
    }

    #[test]
    fn test_parse_single_file() {
        let layers = Layers::new(Some("[sandbox]\nmax_timeout_secs = 90\n"), None);
        let parsed = load_config_file(&layers.user.path().join(USER_CONFIG_FILE)).unwrap();
        assert_eq!(parsed.sandbox().max_timeout_secs, Some(90));
    }

    #[test]
    fn test_single_file_errors() {
        let missing = load_config_file(Path::new("/nonexistent/labbox/config.toml"));
        assert!(matches!(missing, Err(ConfigError::ReadFile { .. })));

        let layers = Layers::new(None, Some("[sandbox\nbroken"));
        let broken = load_config_file(&layers.project.path().join(PROJECT_CONFIG_FILE));
        assert!(matches!(broken, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_project_layer_alone() {
        let loaded = Layers::new(None, Some("[validator]\nextra_python_modules = [\"sklearn\"]\n"))
            .load();
        assert_eq!(
            loaded.config.validator.as_ref().unwrap().extra_python_modules,
            vec!["sklearn"]
        );
        assert_eq!(loaded.loaded_from().len(), 1);
        assert!(loaded.source.as_ref().unwrap().path.ends_with("labbox.toml"));
    }

    #[test]
    fn test_nothing_to_load() {
        let loaded = Layers::new(None, None).load();
        assert_eq!(loaded.config, LabboxConfig::default());
        assert_eq!(loaded.sources.len(), 2);
        assert!(loaded.loaded_from().is_empty());
        assert!(loaded.source.is_none());
    }

    #[test]
    fn test_sources_list_user_before_project() {
        let layers = Layers::new(Some("[logging]\nlevel = \"debug\"\n"), None);
        let loaded = layers.load();
        let paths: Vec<_> = loaded.sources.iter().map(|s| s.path.clone()).collect();
        assert_eq!(
            paths,
            vec![
                layers.user.path().join("config.toml"),
                layers.project.path().join("labbox.toml"),
            ]
        );
        assert!(loaded.sources[0].loaded);
        assert!(!loaded.sources[1].loaded);
        assert_eq!(loaded.source.unwrap().path, paths[0]);
    }

    #[test]
    fn test_project_overrides_user_per_section() {
        let user = r#"
[sandbox]
max_timeout_secs = 300

[logging]
level = "info"

[interpreters.python]
program = "/usr/bin/python3"
"#;
        let project = r#"
[sandbox]
max_timeout_secs = 60

[interpreters.r]
program = "/opt/R/bin/Rscript"
"#;
        let loaded = Layers::new(Some(user), Some(project)).load();
        let merged = &loaded.config;

        assert_eq!(merged.sandbox().max_timeout_secs, Some(60));
        assert_eq!(merged.logging().level, "info");
        let interpreters = merged.interpreters.as_ref().unwrap();
        assert!(interpreters.python.is_some());
        assert!(interpreters.r.is_some());
        assert_eq!(loaded.loaded_from().len(), 2);
    }

    #[test]
    fn test_unreadable_layer_becomes_warning() {
        let loaded = Layers::new(Some("[logging]\nfile = false\n"), Some("= nope")).load();
        assert_eq!(loaded.warnings.len(), 1);
        assert!(loaded.warnings[0].starts_with("Failed to load"));
        assert_eq!(loaded.loaded_from().len(), 1);
        assert!(!loaded.config.logging().file);
    }

    #[test]
    fn test_loosened_limit_warnings() {
        let project = r#"
[sandbox]
memory_limit_mb = 0
inherit_env = ["PATH", "PYTHONPATH"]

[paths]
allow_direct_paths = true
"#;
        let warnings = Layers::new(None, Some(project)).load().warnings;
        assert_eq!(warnings.len(), 3);
        assert!(warnings[0].contains("memory_limit_mb"));
        assert!(warnings[1].contains("PYTHONPATH"));
        assert!(warnings[2].contains("allow_direct_paths"));
    }

    #[test]
    fn test_ordinary_settings_do_not_warn() {
        let project = "[sandbox]\ninherit_env = [\"PATH\", \"LANG\"]\n";
        assert!(Layers::new(None, Some(project)).load().warnings.is_empty());
    }

    #[test]
    fn test_save_creates_parents_and_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = LabboxConfig::from_toml("[sandbox]\nmemory_limit_mb = 1024\n").unwrap();

        save_config(&config, &path).unwrap();
        assert_eq!(load_config_file(&path).unwrap(), config);
    }

    #[test]
    fn test_save_config_reports_unwritable_parent() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("file");
        fs::write(&blocker, "").unwrap();

        let err = save_config(&LabboxConfig::default(), &blocker.join("config.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::WriteFile { .. }));
    }
}
