//! Session startup options
//!
//! Options can be built in code or read from TOML:
//!
//! ```toml
//! [session]
//! executable = "/opt/matlab/bin/matlab"
//! flags = ["-nosplash", "-nodesktop"]
//! buffer_size = 65536
//! check_exceptions = true
//! ```
//!
//! `flags` may also be a single string (`flags = "-nosplash -nojvm"`).

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{MatError, MatResult};

/// Default output capture buffer: 64 KiB.
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Startup flags as written by the user: one string or a list of tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StartupFlags {
    Line(String),
    Tokens(Vec<String>),
}

impl StartupFlags {
    /// Flags joined with single spaces
    pub fn joined(&self) -> String {
        match self {
            StartupFlags::Line(line) => line.split_whitespace().collect::<Vec<_>>().join(" "),
            StartupFlags::Tokens(tokens) => tokens
                .iter()
                .map(|t| t.trim())
                .filter(|t| !t.is_empty())
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

impl Default for StartupFlags {
    fn default() -> Self {
        StartupFlags::Tokens(vec!["-nosplash".to_string()])
    }
}

fn default_executable() -> String {
    "matlab".to_string()
}

fn default_buffer_size() -> usize {
    DEFAULT_BUFFER_SIZE
}

fn default_check_exceptions() -> bool {
    true
}

/// How to start and drive a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionOptions {
    /// Engine executable, first token of the startup command
    #[serde(default = "default_executable")]
    pub executable: String,
    /// Startup flags
    #[serde(default)]
    pub flags: StartupFlags,
    /// Output capture buffer size in bytes; 0 disables capture
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// Check for engine errors after every public evaluation
    #[serde(default = "default_check_exceptions")]
    pub check_exceptions: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            executable: default_executable(),
            flags: StartupFlags::default(),
            buffer_size: DEFAULT_BUFFER_SIZE,
            check_exceptions: true,
        }
    }
}

#[derive(Deserialize)]
struct OptionsFile {
    session: SessionOptions,
}

impl SessionOptions {
    /// Options with every field at its default
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the engine executable
    pub fn executable(mut self, executable: impl Into<String>) -> Self {
        self.executable = executable.into();
        self
    }

    /// Set the startup flags from a single string
    pub fn flags(mut self, flags: impl Into<String>) -> Self {
        self.flags = StartupFlags::Line(flags.into());
        self
    }

    /// Set the startup flags from a list of tokens
    pub fn flag_tokens<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.flags = StartupFlags::Tokens(tokens.into_iter().map(Into::into).collect());
        self
    }

    /// Set the output buffer size (0 disables capture)
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Enable or disable the exception check
    pub fn check_exceptions(mut self, enabled: bool) -> Self {
        self.check_exceptions = enabled;
        self
    }

    /// The command line handed to the engine's open call.
    pub fn startup_command(&self) -> String {
        let flags = self.flags.joined();
        if flags.is_empty() {
            self.executable.clone()
        } else {
            format!("{} {}", self.executable, flags)
        }
    }

    /// Parse options from TOML, either at the top level or under a
    /// `[session]` table.
    pub fn from_toml(text: &str) -> MatResult<Self> {
        let table: toml::Table = toml::from_str(text).map_err(config_error)?;
        if table.contains_key("session") {
            let file: OptionsFile = toml::from_str(text).map_err(config_error)?;
            return Ok(file.session);
        }
        toml::from_str(text).map_err(config_error)
    }

    /// Read options from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> MatResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| MatError::Config {
            message: format!("{}: {}", path.display(), e),
        })?;
        Self::from_toml(&text)
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> MatResult<String> {
        toml::to_string(self).map_err(config_error)
    }
}

fn config_error(err: impl std::fmt::Display) -> MatError {
    MatError::Config {
        message: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults() {
        let opts = SessionOptions::default();
        assert_eq!(opts.buffer_size, 64 * 1024);
        assert!(opts.check_exceptions);
        assert_eq!(opts.startup_command(), "matlab -nosplash");
    }

    #[test]
    fn test_builder() {
        let opts = SessionOptions::new()
            .executable("/opt/engine/bin/matlab")
            .flag_tokens(["-nosplash", "-nodesktop"])
            .buffer_size(0)
            .check_exceptions(false);
        assert_eq!(opts.startup_command(), "/opt/engine/bin/matlab -nosplash -nodesktop");
        assert_eq!(opts.buffer_size, 0);
        assert!(!opts.check_exceptions);
    }

    #[test]
    fn test_flag_string_is_normalised() {
        let opts = SessionOptions::new().flags("  -nojvm   -nosplash ");
        assert_eq!(opts.startup_command(), "matlab -nojvm -nosplash");
        let bare = SessionOptions::new().flags("");
        assert_eq!(bare.startup_command(), "matlab");
    }

    #[test]
    fn test_from_toml_session_table() {
        let opts = SessionOptions::from_toml(
            r#"
            [session]
            flags = ["-nodesktop"]
            buffer_size = 1024
            "#,
        )
        .unwrap();
        assert_eq!(opts.flags, StartupFlags::Tokens(vec!["-nodesktop".to_string()]));
        assert_eq!(opts.buffer_size, 1024);
        assert_eq!(opts.executable, "matlab");
        assert!(opts.check_exceptions);
    }

    #[test]
    fn test_from_toml_top_level_string_flags() {
        let opts = SessionOptions::from_toml(
            r#"
            flags = "-nojvm -nosplash"
            check_exceptions = false
            "#,
        )
        .unwrap();
        assert_eq!(opts.startup_command(), "matlab -nojvm -nosplash");
        assert!(!opts.check_exceptions);
    }

    #[test]
    fn test_bad_toml() {
        let err = SessionOptions::from_toml("buffer_size = \"big\"").unwrap_err();
        assert!(matches!(err, MatError::Config { .. }));
    }

    #[test]
    fn test_toml_round_trip() {
        let opts = SessionOptions::new().buffer_size(10).flag_tokens(["-a", "-b"]);
        let text = opts.to_toml().unwrap();
        assert_eq!(SessionOptions::from_toml(&text).unwrap(), opts);
    }
}
