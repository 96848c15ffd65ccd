//! Error taxonomy shared by the catalog, the extractor, and activation.
//!
//! Construction problems are fatal and surface immediately. Extraction
//! problems are scoped to one module and collected into the refresh report.
//! Activation problems are scoped to one handle and surface when its value
//! is requested.

use std::io;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors that abort catalog construction or a whole refresh.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("invalid catalog configuration: {0}")]
    Configuration(String),

    #[error("metadata cache at {}: {source}", path.display())]
    Cache {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("scanning {}: {source}", path.display())]
    Scan {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl CatalogError {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        CatalogError::Configuration(message.into())
    }
}

/// A single module could not be inspected in isolation.
#[derive(Debug, Clone, Error)]
#[error("extracting {}: {kind}", module.display())]
pub struct ExtractionError {
    pub module: PathBuf,
    pub kind: ExtractionFailure,
}

impl ExtractionError {
    pub fn new(module: impl Into<PathBuf>, kind: ExtractionFailure) -> Self {
        Self {
            module: module.into(),
            kind,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExtractionFailure {
    #[error("could not start the isolated extractor: {0}")]
    Spawn(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("extractor exited with status {code}: {detail}")]
    Failed { code: i32, detail: String },

    #[error("extractor terminated by signal {0}")]
    Crashed(i32),

    #[error("malformed extractor output: {0}")]
    Malformed(String),

    #[error("module file name is already provided by {}", .0.display())]
    NameCollision(PathBuf),

    #[error("could not persist extracted metadata: {0}")]
    Cache(String),
}

/// A lazy handle could not materialize its value.
#[derive(Debug, Clone, Error)]
pub enum ActivationError {
    #[error("loading module {}: {reason}", path.display())]
    Load { path: PathBuf, reason: String },

    #[error("module {} does not export entry point '{entry_point}'", path.display())]
    MissingEntryPoint { path: PathBuf, entry_point: String },

    #[error("constructing '{name}' from {}: {reason}", path.display())]
    Construct {
        path: PathBuf,
        name: String,
        reason: String,
    },

    #[error("'{name}' targets activation ABI {found}, host supports {supported}")]
    UnsupportedAbi {
        name: String,
        found: u32,
        supported: u32,
    },
}
