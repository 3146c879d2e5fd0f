//! Command-line configuration.
//!
//! Loads settings for the `cowkv` binary from environment variables.
//!
//! # Environment Variables
//!
//! - `COWKV_DATABASE_PATH`: store file (default: `./data.cowkv`)
//! - `COWKV_INITIAL_MMAP_MB`: size of the first memory mapping in MiB (default and minimum: `64`)
//! - `COWKV_REHYDRATE_ON_OPEN`: copy every committed page into memory at open
//!   (`true`/`false`/`1`/`0`, default: `false`)

use std::path::PathBuf;

use crate::storage::StoreOptions;

pub const DATABASE_PATH_VAR: &str = "COWKV_DATABASE_PATH";
pub const INITIAL_MMAP_MB_VAR: &str = "COWKV_INITIAL_MMAP_MB";
pub const REHYDRATE_ON_OPEN_VAR: &str = "COWKV_REHYDRATE_ON_OPEN";

/// Settings for the command-line tool.
///
/// # Post-conditions
///
/// - `initial_mmap_mb` is at least `DEFAULT_INITIAL_MMAP_MB`
/// - `database_path` is non-empty
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub database_path: PathBuf,
    pub initial_mmap_mb: u64,
    pub rehydrate_on_open: bool,
}

/// Error returned when loading configuration fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    InvalidValue { name: String, message: String },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidValue { name, message } => {
                write!(f, "invalid value for {name}: {message}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from(Self::DEFAULT_DATABASE_PATH),
            initial_mmap_mb: Self::DEFAULT_INITIAL_MMAP_MB,
            rehydrate_on_open: false,
        }
    }
}

impl AppConfig {
    pub const DEFAULT_DATABASE_PATH: &'static str = "./data.cowkv";
    pub const DEFAULT_INITIAL_MMAP_MB: u64 = 64;

    /// Load configuration from the process environment.
    ///
    /// # Errors
    ///
    /// Returns an error if a variable is set to a value that does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through `lookup`, which returns the value of a
    /// variable or `None` when it is unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_path = match lookup(DATABASE_PATH_VAR) {
            Some(path) if path.is_empty() => {
                return Err(invalid(DATABASE_PATH_VAR, "must not be empty".to_string()));
            }
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(Self::DEFAULT_DATABASE_PATH),
        };

        let initial_mmap_mb = match lookup(INITIAL_MMAP_MB_VAR) {
            Some(value) => match value.parse::<u64>() {
                Ok(mb) if (Self::DEFAULT_INITIAL_MMAP_MB..=1 << 20).contains(&mb) => mb,
                _ => {
                    return Err(invalid(
                        INITIAL_MMAP_MB_VAR,
                        format!("'{value}' is not a size in MiB (must be 64-1048576)"),
                    ));
                }
            },
            None => Self::DEFAULT_INITIAL_MMAP_MB,
        };

        let rehydrate_on_open = match lookup(REHYDRATE_ON_OPEN_VAR).as_deref() {
            None | Some("false" | "0") => false,
            Some("true" | "1") => true,
            Some(other) => {
                return Err(invalid(
                    REHYDRATE_ON_OPEN_VAR,
                    format!("'{other}' is not one of true, false, 1, 0"),
                ));
            }
        };

        Ok(Self {
            database_path,
            initial_mmap_mb,
            rehydrate_on_open,
        })
    }

    #[must_use]
    pub fn to_store_options(&self) -> StoreOptions {
        StoreOptions::default()
            .with_initial_mmap_bytes(self.initial_mmap_mb << 20)
            .with_rehydrate_on_open(self.rehydrate_on_open)
    }
}

fn invalid(name: &str, message: String) -> ConfigError {
    ConfigError::InvalidValue {
        name: name.to_string(),
        message,
    }
}
