//! # Errors
//!
//! A single error type for the whole pipeline. Parsers that fail on one log
//! entry log the error and continue; everything else propagates with `?`.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the migrator pipeline.
#[derive(Debug, Error)]
pub enum MigratorError {
    /// Filesystem access failed.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A setting is missing, malformed or conflicts with another one.
    #[error("Invalid setting: {0}")]
    InvalidSetting(String),

    /// A command line could not be split into arguments.
    #[error("Tokenize error: {0}")]
    Tokenize(String),

    /// Two targets claim the same output path.
    #[error("Duplicate output: {0}")]
    DuplicateOutput(String),

    /// A requested target does not exist in the model.
    #[error("Target not found: {0}")]
    TargetNotFound(String),

    /// A user supplied regular expression is invalid.
    #[error("Invalid pattern: {0}")]
    Pattern(#[from] regex::Error),

    /// A user supplied glob is invalid.
    #[error("Invalid glob: {0}")]
    Glob(#[from] globset::Error),

    /// The same source file is compiled with different options by two targets.
    #[error("Source {path} has incompatible {property}: {previous:?} vs {current:?}")]
    IncompatibleSourceProperty {
        path: String,
        property: &'static str,
        previous: Vec<String>,
        current: Vec<String>,
    },

    /// A build command exited unsuccessfully.
    #[error("Build command failed ({status}): {command}")]
    BuildCommand { command: String, status: String },

    /// Content a parser or optimizer could not understand: a log entry or
    /// an undecodable captured file.
    #[error("Parse error: {0}")]
    Parse(String),
}

impl MigratorError {
    /// Attach a path to an I/O error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MigratorError>;
