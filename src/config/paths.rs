//! Cross-platform application paths using the `dirs` crate.
//!
//! Layout:
//!
//! Config dir (settings):
//!   Windows: %APPDATA%\inference-governor\
//!   macOS:   ~/Library/Application Support/inference-governor/
//!   Linux:   ~/.config/inference-governor/
//!
//! Data dir (PID file of the supervised inference server):
//!   Windows: %LOCALAPPDATA%\inference-governor\
//!   macOS:   ~/Library/Application Support/inference-governor/
//!   Linux:   ~/.local/share/inference-governor/

use std::path::PathBuf;

/// Holds all resolved application directory/file paths.
#[derive(Debug, Clone)]
pub struct AppPaths {
    /// Directory for `settings.toml`.
    pub config_dir: PathBuf,
    /// Full path to `settings.toml`.
    pub settings_file: PathBuf,
    /// Directory for runtime state.  The governor keeps no models or caches
    /// of its own (the inference server manages those), so the only file
    /// here is the PID file below.
    pub data_dir: PathBuf,
    /// Default location of the PID file for the supervised `serve` process.
    pub pid_file: PathBuf,
}

impl AppPaths {
    const APP_NAME: &'static str = "inference-governor";

    /// Resolves all paths using the `dirs` crate.
    ///
    /// Falls back to the current directory if the platform cannot provide a
    /// standard path.
    pub fn new() -> Self {
        let config_dir = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(Self::APP_NAME);

        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(Self::APP_NAME);

        let settings_file = config_dir.join("settings.toml");
        let pid_file = data_dir.join("inference-serve.pid");

        Self {
            config_dir,
            settings_file,
            data_dir,
            pid_file,
        }
    }
}

impl Default for AppPaths {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_are_non_empty() {
        let paths = AppPaths::new();
        assert!(paths.config_dir.to_str().is_some_and(|s| !s.is_empty()));
        assert!(paths.data_dir.to_str().is_some_and(|s| !s.is_empty()));
        assert!(paths
            .settings_file
            .file_name()
            .is_some_and(|n| n == "settings.toml"));
        assert!(paths
            .pid_file
            .file_name()
            .is_some_and(|n| n == "inference-serve.pid"));
        assert_eq!(paths.pid_file.parent(), Some(paths.data_dir.as_path()));
    }
}
