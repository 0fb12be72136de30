//! Platform-specific locations of the daemon config file, the parameter
//! directory and the directory searched for the daemon executable.

use std::path::{Path, PathBuf};

use log::debug;

use crate::error::ConfigError;

pub const CONF_FILE_NAME: &str = "moonroomcash.conf";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Paths {
    conf_file: PathBuf,
    params_dir: PathBuf,
    daemon_dir: PathBuf,
}

impl Paths {
    /// Resolve every location from the user's home/app-data directories.
    pub fn platform_default() -> Result<Self, ConfigError> {
        let paths = Self { conf_file: default_conf_file()?, params_dir: default_params_dir()?, daemon_dir: default_daemon_dir() };
        debug!(
            "conf file {}, params dir {}, daemon dir {}",
            paths.conf_file.display(),
            paths.params_dir.display(),
            paths.daemon_dir.display()
        );
        Ok(paths)
    }

    /// Build from explicit locations, bypassing platform lookup entirely.
    pub fn new(conf_file: impl Into<PathBuf>, params_dir: impl Into<PathBuf>, daemon_dir: impl Into<PathBuf>) -> Self {
        Self { conf_file: conf_file.into(), params_dir: params_dir.into(), daemon_dir: daemon_dir.into() }
    }

    pub fn with_conf_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.conf_file = path.into();
        self
    }

    pub fn with_params_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.params_dir = path.into();
        self
    }

    pub fn with_daemon_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.daemon_dir = path.into();
        self
    }

    pub fn conf_file(&self) -> &Path {
        &self.conf_file
    }

    pub fn params_dir(&self) -> &Path {
        &self.params_dir
    }

    pub fn daemon_dir(&self) -> &Path {
        &self.daemon_dir
    }
}

#[cfg(not(windows))]
fn home() -> Result<PathBuf, ConfigError> {
    dirs::home_dir().ok_or(ConfigError::NoHomeDir("the moonroomcash data"))
}

#[cfg(target_os = "macos")]
fn default_conf_file() -> Result<PathBuf, ConfigError> {
    Ok(home()?.join("Library/Application Support/Moonroomcash").join(CONF_FILE_NAME))
}

#[cfg(target_os = "macos")]
fn default_params_dir() -> Result<PathBuf, ConfigError> {
    Ok(home()?.join("Library/Application Support/ZcashParams"))
}

#[cfg(windows)]
fn default_conf_file() -> Result<PathBuf, ConfigError> {
    let app_data = dirs::data_dir().ok_or(ConfigError::NoHomeDir(CONF_FILE_NAME))?;
    Ok(app_data.join("Moonroomcash").join(CONF_FILE_NAME))
}

#[cfg(windows)]
fn default_params_dir() -> Result<PathBuf, ConfigError> {
    let app_data = dirs::data_dir().ok_or(ConfigError::NoHomeDir("ZcashParams"))?;
    Ok(app_data.join("ZcashParams"))
}

#[cfg(not(any(target_os = "macos", windows)))]
fn default_conf_file() -> Result<PathBuf, ConfigError> {
    Ok(home()?.join(".moonroomcash").join(CONF_FILE_NAME))
}

#[cfg(not(any(target_os = "macos", windows)))]
fn default_params_dir() -> Result<PathBuf, ConfigError> {
    Ok(home()?.join(".zcash-params"))
}

/// The daemon is shipped next to the wallet executable.
fn default_daemon_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overrides_replace_platform_locations() {
        let paths = Paths::new("/a/moonroomcash.conf", "/b", "/c").with_params_dir("/params").with_daemon_dir("/bin");
        assert_eq!(paths.conf_file(), Path::new("/a/moonroomcash.conf"));
        assert_eq!(paths.params_dir(), Path::new("/params"));
        assert_eq!(paths.daemon_dir(), Path::new("/bin"));
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    #[test]
    fn unix_layout_lives_under_home() {
        if let Ok(paths) = Paths::platform_default() {
            assert!(paths.conf_file().ends_with(".moonroomcash/moonroomcash.conf"));
            assert!(paths.params_dir().ends_with(".zcash-params"));
        }
    }
}
