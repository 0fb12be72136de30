use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Why a reachable daemon could not be used without starting one ourselves.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Unreachable {
    /// A config file was detected but the embedded daemon is disabled.
    EmbeddedDisabled,
    /// The manual host/port from the user settings refused the connection.
    ManualSettings,
}

impl fmt::Display for Unreachable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Unreachable::EmbeddedDisabled => write!(
                f,
                "Couldn't connect to moonroomcashd configured in moonroomcash.conf.\n\n\
                 Not starting embedded moonroomcashd because --no-embedded was passed"
            ),
            Unreachable::ManualSettings => write!(
                f,
                "Could not connect to moonroomcashd configured in settings.\n\n\
                 Please set the host/port and user/password in the connection settings."
            ),
        }
    }
}

/// Outcome taxonomy of an autoconnect attempt chain. The `Display` text is what
/// gets surfaced to the user through the fatal sink.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(
        "A manual connection was requested, but the settings are not configured.\n\n\
         Please set the host/port and user/password in the connection settings."
    )]
    ConfigNotFound,
    #[error("Could not create {}. Please check that its directory is writable.", .path.display())]
    ConfigUnwritable { path: PathBuf },
    #[error("Required parameter files are missing: {}", .missing.join(", "))]
    ParamsMissing { missing: Vec<String> },
    #[error("Downloading {file} failed. Please check the help site for more info ({reason})")]
    DownloadFailed { file: String, reason: String },
    #[error("{0}")]
    DaemonUnreachable(Unreachable),
    #[error("{}", unstartable_explanation(.background, .diagnostics))]
    DaemonUnstartable { background: bool, diagnostics: Option<String> },
    #[error(
        "Authentication failed. The username / password you specified was not accepted by \
         moonroomcashd. Try changing it in the connection settings"
    )]
    AuthRejected,
    #[error("moonroomcashd is still starting up: {0}")]
    DaemonInitializing(String),
    #[error("moonroomcashd returned a malformed response: {0}")]
    MalformedResponse(String),
    #[error("Couldn't connect to moonroomcashd: {0}")]
    Unclassified(String),
    #[error("invalid daemon endpoint: {0}")]
    InvalidEndpoint(String),
    #[error("could not set up the HTTP client: {0}")]
    Http(#[from] reqwest::Error),
}

fn unstartable_explanation(background: &bool, diagnostics: &Option<String>) -> String {
    if *background {
        return "You have moonroomcashd set to start as a daemon, which can cause problems with \
                the wallet.\n\nPlease remove the following line from your moonroomcash.conf and \
                restart the wallet\ndaemon=1"
            .to_string();
    }
    let mut explanation = String::from(
        "Couldn't start the embedded moonroomcashd.\n\nPlease try restarting.\n\n\
         If you previously started moonroomcashd with custom arguments, you might need to reset \
         moonroomcash.conf.\n\nIf all else fails, please run moonroomcashd manually.",
    );
    if let Some(output) = diagnostics.as_deref().filter(|s| !s.trim().is_empty()) {
        explanation.push_str("\n\nThe process returned:\n\n");
        explanation.push_str(output.trim_end());
    }
    explanation
}

/// Errors raised while reading or writing a daemon config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("rpcuser and rpcpassword must both be set")]
    MissingCredentials,
    #[error("no home directory available to place {0}")]
    NoHomeDir(&'static str),
}

/// Errors that abort the parameter download pipeline.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("{url} does not name a file")]
    InvalidUrl { url: String },
    #[error("downloading {file} failed: {source}")]
    Transfer {
        file: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("writing {file} failed: {source}")]
    Io {
        file: String,
        #[source]
        source: std::io::Error,
    },
}

impl DownloadError {
    /// Name of the file whose transfer failed.
    pub fn file(&self) -> &str {
        match self {
            DownloadError::InvalidUrl { url } => url,
            DownloadError::Transfer { file, .. } | DownloadError::Io { file, .. } => file,
        }
    }
}

/// Errors raised by the user settings store.
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("I/O error while reading settings: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings file is not valid TOML: {0}")]
    Parse(#[from] toml::de::Error),
}
