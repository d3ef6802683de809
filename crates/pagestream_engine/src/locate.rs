use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::settings::EngineSettings;

pub const ENGINE_BINARY_NAME: &str = "pagestream-engine";

/// The engine cannot be run at all. Aborts the whole batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvocationError {
    #[error("engine binary not found (searched {})", display_paths(.searched))]
    NotFound { searched: Vec<PathBuf> },
    #[error("engine binary {} is not executable", .0.display())]
    NotExecutable(PathBuf),
    #[error("no bundled engine for platform {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },
    #[error("failed to start engine {}: {reason}", .path.display())]
    Spawn { path: PathBuf, reason: String },
}

fn display_paths(paths: &[PathBuf]) -> String {
    if paths.is_empty() {
        return "nothing".to_string();
    }
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Bundle directory naming: `<os>_<arch>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Platform {
    os: &'static str,
    arch: &'static str,
}

impl Platform {
    pub fn current() -> Result<Self, InvocationError> {
        Self::from_target(std::env::consts::OS, std::env::consts::ARCH)
    }

    pub fn from_target(os: &str, arch: &str) -> Result<Self, InvocationError> {
        let unsupported = || InvocationError::UnsupportedPlatform {
            os: os.to_string(),
            arch: arch.to_string(),
        };
        let os_name = match os {
            "macos" | "darwin" => "darwin",
            "linux" => "linux",
            "windows" => "windows",
            _ => return Err(unsupported()),
        };
        let arch_name = match arch {
            "x86_64" | "amd64" => "amd64",
            "aarch64" | "arm64" => "arm64",
            _ => return Err(unsupported()),
        };
        Ok(Self {
            os: os_name,
            arch: arch_name,
        })
    }

    pub fn binary_name(&self) -> String {
        if self.os == "windows" {
            format!("{ENGINE_BINARY_NAME}.exe")
        } else {
            ENGINE_BINARY_NAME.to_string()
        }
    }

    /// `bin/<os>_<arch>/<binary>` relative to a bundle directory.
    pub fn bundled_path(&self, bundle_dir: &Path) -> PathBuf {
        bundle_dir
            .join("bin")
            .join(format!("{}_{}", self.os, self.arch))
            .join(self.binary_name())
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.os, self.arch)
    }
}

/// A resolved, executable engine binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineBinary {
    path: PathBuf,
}

impl EngineBinary {
    /// Wraps `path` after checking it is an executable file.
    pub fn at(path: impl Into<PathBuf>) -> Result<Self, InvocationError> {
        let path = path.into();
        if !path.is_file() {
            return Err(InvocationError::NotFound {
                searched: vec![path],
            });
        }
        if !is_executable(&path) {
            return Err(InvocationError::NotExecutable(path));
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Resolution order: explicit path, bundled binary, then `PATH`.
#[derive(Debug, Clone, Default)]
pub struct EngineLocator {
    explicit: Option<PathBuf>,
    bundle_dir: Option<PathBuf>,
    search_path: Option<OsString>,
}

impl EngineLocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Captures `PATH` once; nothing is re-read after construction.
    pub fn from_settings(settings: &EngineSettings) -> Self {
        Self {
            explicit: settings.path.clone(),
            bundle_dir: settings.bundle_dir.clone(),
            search_path: std::env::var_os("PATH"),
        }
    }

    pub fn with_explicit(mut self, path: impl Into<PathBuf>) -> Self {
        self.explicit = Some(path.into());
        self
    }

    pub fn with_bundle_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.bundle_dir = Some(dir.into());
        self
    }

    pub fn with_search_path(mut self, search_path: impl Into<OsString>) -> Self {
        self.search_path = Some(search_path.into());
        self
    }

    pub fn resolve(&self) -> Result<EngineBinary, InvocationError> {
        // An explicit path is authoritative: no fallback if it is wrong.
        if let Some(path) = &self.explicit {
            return EngineBinary::at(path);
        }

        let platform = Platform::current()?;
        let mut searched = Vec::new();

        if let Some(dir) = &self.bundle_dir {
            let candidate = platform.bundled_path(dir);
            if candidate.is_file() {
                return EngineBinary::at(candidate);
            }
            searched.push(candidate);
        }

        if let Some(paths) = &self.search_path {
            let name = platform.binary_name();
            for dir in std::env::split_paths(paths) {
                let candidate = dir.join(&name);
                if candidate.is_file() && is_executable(&candidate) {
                    return Ok(EngineBinary { path: candidate });
                }
                searched.push(candidate);
            }
        }

        Err(InvocationError::NotFound { searched })
    }
}
