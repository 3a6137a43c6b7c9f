//! Platform detection and interpreter availability checking.

use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::language::{InterpreterConfig, Language};

/// Supported host platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    MacOS,
    Linux,
    /// Runs, but without process groups or rlimits.
    Unsupported,
}

impl Platform {
    /// Detect the current platform.
    pub fn detect() -> Self {
        #[cfg(target_os = "macos")]
        {
            Platform::MacOS
        }

        #[cfg(target_os = "linux")]
        {
            Platform::Linux
        }

        #[cfg(not(any(target_os = "macos", target_os = "linux")))]
        {
            Platform::Unsupported
        }
    }

    /// Get the display name for this platform.
    pub fn name(&self) -> &'static str {
        match self {
            Platform::MacOS => "macOS",
            Platform::Linux => "Linux",
            Platform::Unsupported => "Unsupported",
        }
    }

    /// Whether the address-space limit is enforced by the kernel.
    pub fn enforces_memory_limit(&self) -> bool {
        matches!(self, Platform::Linux)
    }

    fn install_hint(&self, language: Language) -> String {
        let packages = match (self, language) {
            (Platform::MacOS, Language::Python) => "brew install python && pip3 install numpy pandas matplotlib",
            (Platform::MacOS, Language::R) => "brew install r",
            (_, Language::Python) => {
                "Ubuntu/Debian: sudo apt-get install python3 python3-numpy python3-pandas python3-matplotlib\n  \
                 Fedora:        sudo dnf install python3 python3-numpy python3-pandas python3-matplotlib"
            }
            (_, Language::R) => {
                "Ubuntu/Debian: sudo apt-get install r-base\n  \
                 Fedora:        sudo dnf install R"
            }
        };
        format!(
            "Install the {language} interpreter:\n  {packages}\n\n\
             Or point labbox at an existing one in labbox.toml under [interpreters.{language}]."
        )
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Availability of one guest interpreter.
#[derive(Debug, Clone)]
pub enum InterpreterStatus {
    /// Found and answered `--version`.
    Available {
        language: Language,
        program: PathBuf,
        version: Option<String>,
    },

    /// Not found on this host.
    Missing {
        language: Language,
        program: PathBuf,
        install_hint: String,
    },
}

impl InterpreterStatus {
    /// Check if the interpreter is available.
    pub fn is_available(&self) -> bool {
        matches!(self, InterpreterStatus::Available { .. })
    }

    pub fn language(&self) -> Language {
        match self {
            InterpreterStatus::Available { language, .. }
            | InterpreterStatus::Missing { language, .. } => *language,
        }
    }

    /// Get the install hint if the interpreter is missing.
    pub fn install_hint(&self) -> Option<&str> {
        match self {
            InterpreterStatus::Missing { install_hint, .. } => Some(install_hint),
            _ => None,
        }
    }

    /// Detect availability of a configured interpreter.
    pub fn detect(language: Language, interpreter: &InterpreterConfig) -> Self {
        let program = interpreter.program.clone();
        let found = if program.components().count() > 1 {
            program.is_file()
        } else {
            on_path(&program)
        };

        if found {
            InterpreterStatus::Available {
                language,
                version: version_of(&program),
                program,
            }
        } else {
            InterpreterStatus::Missing {
                language,
                install_hint: Platform::detect().install_hint(language),
                program,
            }
        }
    }
}

impl fmt::Display for InterpreterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InterpreterStatus::Available {
                language,
                program,
                version,
            } => {
                write!(f, "{language} available ({})", program.display())?;
                if let Some(version) = version {
                    write!(f, ": {version}")?;
                }
                Ok(())
            }
            InterpreterStatus::Missing {
                language,
                program,
                install_hint,
            } => write!(
                f,
                "{language} unavailable: '{}' not found\n\n{install_hint}",
                program.display()
            ),
        }
    }
}

fn on_path(program: &Path) -> bool {
    Command::new("which")
        .arg(program)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// First line of `<program> --version`, from stdout or stderr.
fn version_of(program: &Path) -> Option<String> {
    let output = Command::new(program).arg("--version").output().ok()?;
    let text = if output.stdout.is_empty() {
        output.stderr
    } else {
        output.stdout
    };
    String::from_utf8_lossy(&text)
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_detect() {
        let platform = Platform::detect();

        #[cfg(target_os = "macos")]
        assert_eq!(platform, Platform::MacOS);

        #[cfg(target_os = "linux")]
        assert_eq!(platform, Platform::Linux);

        let _ = platform.enforces_memory_limit();
    }

    #[test]
    fn test_platform_name() {
        assert_eq!(Platform::MacOS.name(), "macOS");
        assert_eq!(Platform::Linux.name(), "Linux");
        assert_eq!(Platform::Unsupported.name(), "Unsupported");
    }

    #[test]
    fn test_missing_interpreter() {
        let status = InterpreterStatus::detect(
            Language::R,
            &InterpreterConfig::new("/nonexistent/bin/Rscript"),
        );
        assert!(!status.is_available());
        assert_eq!(status.language(), Language::R);
        assert!(status.install_hint().unwrap().contains("[interpreters.r]"));
        assert!(status.to_string().contains("unavailable"));
    }

    #[cfg(unix)]
    #[test]
    fn test_absolute_path_interpreter() {
        let status = InterpreterStatus::detect(Language::Python, &InterpreterConfig::new("/bin/sh"));
        assert!(status.is_available());
        assert!(status.install_hint().is_none());
    }

    #[test]
    fn test_status_display() {
        let available = InterpreterStatus::Available {
            language: Language::Python,
            program: PathBuf::from("python3"),
            version: Some("Python 3.12.1".to_string()),
        };
        assert_eq!(available.to_string(), "python available (python3): Python 3.12.1");
    }
}
