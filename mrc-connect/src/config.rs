//! Daemon connection descriptions and the locator that finds, parses or
//! generates the daemon's `moonroomcash.conf`.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::error::ConfigError;
use crate::settings::{SettingsStore, KEY_HOST, KEY_PORT, KEY_RPC_PASSWORD, KEY_RPC_USER};

pub const LOOPBACK_HOST: &str = "127.0.0.1";
pub const DEFAULT_RPC_PORT: &str = "16224";
pub const TESTNET_RPC_PORT: &str = "26224";
pub const GENERATED_RPC_USER: &str = "mrc-qt-wallet";
pub const BOOTSTRAP_PEER: &str = "178.128.104.155";
pub const GENERATED_PASSWORD_LEN: usize = 10;

/// Where a [`DaemonConfig`] came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConfigOrigin {
    /// Parsed from an existing `moonroomcash.conf`.
    DetectedFile,
    /// Manual host/port/credentials from the user settings.
    UserSettings,
    /// Parsed from a `moonroomcash.conf` this process just wrote.
    Generated,
}

/// How to reach a daemon. Immutable once built.
#[derive(Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    host: String,
    port: String,
    rpc_user: String,
    rpc_password: String,
    using_detected_conf: bool,
    is_daemon_background: bool,
    config_dir: Option<PathBuf>,
    origin: ConfigOrigin,
}

impl DaemonConfig {
    /// Parse `key=value` daemon config text. Keys are case-insensitive, `#`
    /// lines are comments and unknown keys are ignored.
    pub fn parse_conf(text: &str, config_dir: Option<PathBuf>) -> Self {
        let mut rpc_user = String::new();
        let mut rpc_password = String::new();
        let mut port = String::new();
        let mut is_daemon_background = false;

        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let Some((name, value)) = trimmed.split_once('=') else {
                continue;
            };
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim();

            match name.as_str() {
                "rpcuser" => rpc_user = value.to_string(),
                "rpcpassword" => rpc_password = value.to_string(),
                "rpcport" => port = value.to_string(),
                "daemon" if value == "1" => is_daemon_background = true,
                "testnet" if value == "1" && port.is_empty() => port = TESTNET_RPC_PORT.to_string(),
                _ => {}
            }
        }

        if port.is_empty() {
            port = DEFAULT_RPC_PORT.to_string();
        }

        Self {
            host: LOOPBACK_HOST.to_string(),
            port,
            rpc_user,
            rpc_password,
            using_detected_conf: true,
            is_daemon_background,
            config_dir,
            origin: ConfigOrigin::DetectedFile,
        }
    }

    /// A manually configured daemon. Both credentials are required.
    pub fn manual(
        host: impl Into<String>,
        port: impl Into<String>,
        rpc_user: impl Into<String>,
        rpc_password: impl Into<String>,
    ) -> Result<Self, ConfigError> {
        let rpc_user = rpc_user.into();
        let rpc_password = rpc_password.into();
        if rpc_user.is_empty() || rpc_password.is_empty() {
            return Err(ConfigError::MissingCredentials);
        }
        Ok(Self {
            host: host.into(),
            port: port.into(),
            rpc_user,
            rpc_password,
            using_detected_conf: false,
            is_daemon_background: false,
            config_dir: None,
            origin: ConfigOrigin::UserSettings,
        })
    }

    /// This config re-labelled as one this process generated. A file without
    /// credentials was not written by us, so it yields `None`.
    pub fn generated(&self) -> Option<Self> {
        if self.rpc_user.is_empty() || self.rpc_password.is_empty() {
            return None;
        }
        Some(Self { origin: ConfigOrigin::Generated, ..self.clone() })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn rpc_user(&self) -> &str {
        &self.rpc_user
    }

    pub fn rpc_password(&self) -> &str {
        &self.rpc_password
    }

    pub fn using_detected_conf(&self) -> bool {
        self.using_detected_conf
    }

    pub fn is_daemon_background(&self) -> bool {
        self.is_daemon_background
    }

    pub fn config_dir(&self) -> Option<&Path> {
        self.config_dir.as_deref()
    }

    pub fn origin(&self) -> ConfigOrigin {
        self.origin
    }
}

impl fmt::Debug for DaemonConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DaemonConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("rpc_user", &self.rpc_user)
            .field("rpc_password", &"<redacted>")
            .field("using_detected_conf", &self.using_detected_conf)
            .field("is_daemon_background", &self.is_daemon_background)
            .field("config_dir", &self.config_dir)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Finds the daemon config at a fixed path, or writes a fresh one there.
#[derive(Clone, Debug)]
pub struct ConfigLocator {
    conf_path: PathBuf,
}

impl ConfigLocator {
    pub fn new(conf_path: impl Into<PathBuf>) -> Self {
        Self { conf_path: conf_path.into() }
    }

    pub fn conf_path(&self) -> &Path {
        &self.conf_path
    }

    pub fn locate(&self) -> Option<DaemonConfig> {
        if !self.conf_path.is_file() {
            debug!("no daemon config at {}", self.conf_path.display());
            return None;
        }
        let text = match fs::read_to_string(&self.conf_path) {
            Ok(text) => text,
            Err(e) => {
                warn!("Could not read {}: {e}", self.conf_path.display());
                return None;
            }
        };
        info!("Found moonroomcash.conf at {}", self.conf_path.display());
        let config_dir = self.conf_path.parent().map(Path::to_path_buf);
        Some(DaemonConfig::parse_conf(&text, config_dir))
    }

    /// Write a fresh config with generated credentials. Failures are logged
    /// only, so callers must `locate` again rather than assume the file exists.
    pub fn synthesize(&self) {
        info!("Creating file {}", self.conf_path.display());
        if let Err(e) = synthesize_at(&self.conf_path) {
            warn!("Could not create moonroomcash.conf, returning: {e}");
        }
    }

    pub fn load_from_settings(settings: &dyn SettingsStore) -> Option<DaemonConfig> {
        let host = settings.get(KEY_HOST).unwrap_or_default();
        let port = settings.get(KEY_PORT).unwrap_or_default();
        let user = settings.get(KEY_RPC_USER).unwrap_or_default();
        let password = settings.get(KEY_RPC_PASSWORD).unwrap_or_default();
        DaemonConfig::manual(host, port, user, password).ok()
    }
}

/// Write a minimal RPC-enabled config to `target`, creating its directory.
pub fn synthesize_at(target: &Path) -> Result<(), ConfigError> {
    let io_err = |source| ConfigError::Io { path: target.to_path_buf(), source };

    if let Some(parent) = target.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }
    }

    let file = File::create(target).map_err(io_err)?;
    let mut out = BufWriter::new(file);
    writeln!(out, "server=1").map_err(io_err)?;
    writeln!(out, "addnode={BOOTSTRAP_PEER}").map_err(io_err)?;
    writeln!(out, "rpcuser={GENERATED_RPC_USER}").map_err(io_err)?;
    writeln!(out, "rpcpassword={}", random_password()).map_err(io_err)?;
    out.flush().map_err(io_err)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perm = fs::metadata(target).map_err(io_err)?.permissions();
        perm.set_mode(0o600);
        fs::set_permissions(target, perm).map_err(io_err)?;
    }

    Ok(())
}

/// Uniformly drawn from `[0-9A-Za-z]`.
pub fn random_password() -> String {
    rand::thread_rng().sample_iter(&Alphanumeric).take(GENERATED_PASSWORD_LEN).map(char::from).collect()
}
