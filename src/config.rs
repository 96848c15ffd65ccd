//! Catalog configuration and its environment overrides.
//!
//! Defaults come from `CatalogOptions::new`; `from_env` applies the
//! `LAZYPLUG_*` variables on top. Validation happens when a catalog is
//! constructed so hosts get one `Configuration` error with the reason.

use crate::cache::DEFAULT_CACHE_DIR_NAME;
use crate::error::CatalogError;
use glob::Pattern;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

pub const CACHE_DIR_ENV: &str = "LAZYPLUG_CACHE_DIR";
pub const EXTRACTOR_ENV: &str = "LAZYPLUG_EXTRACTOR";
pub const TIMEOUT_ENV: &str = "LAZYPLUG_EXTRACT_TIMEOUT_MS";
pub const JOBS_ENV: &str = "LAZYPLUG_EXTRACT_JOBS";
pub const NO_NATIVE_ENV: &str = "LAZYPLUG_NO_NATIVE_EXTRACT";

pub const DEFAULT_EXTRACT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_PARALLEL_EXTRACTIONS: usize = 4;

/// Whether the scan descends into subdirectories.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum SearchScope {
    #[default]
    TopDirectoryOnly,
    AllDirectories,
}

#[derive(Clone, Debug)]
pub struct CatalogOptions {
    pub root: PathBuf,
    pub pattern: String,
    pub scope: SearchScope,
    pub cache_dir: PathBuf,
    /// Explicit extractor binary; resolved next to the current executable
    /// when unset.
    pub extractor: Option<PathBuf>,
    pub extract_timeout: Duration,
    pub max_parallel_extractions: usize,
    pub allow_native_extraction: bool,
}

impl CatalogOptions {
    pub fn new(root: impl Into<PathBuf>, pattern: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            pattern: pattern.into(),
            scope: SearchScope::TopDirectoryOnly,
            cache_dir: default_cache_dir(),
            extractor: None,
            extract_timeout: DEFAULT_EXTRACT_TIMEOUT,
            max_parallel_extractions: DEFAULT_MAX_PARALLEL_EXTRACTIONS,
            allow_native_extraction: true,
        }
    }

    /// Defaults with `LAZYPLUG_*` environment overrides applied.
    pub fn from_env(root: impl Into<PathBuf>, pattern: impl Into<String>) -> Self {
        Self::new(root, pattern).with_overrides(|key| env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (the environment in practice).
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let value = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(dir) = value(CACHE_DIR_ENV) {
            self.cache_dir = PathBuf::from(dir);
        }
        if let Some(path) = value(EXTRACTOR_ENV) {
            self.extractor = Some(PathBuf::from(path));
        }
        if let Some(ms) = value(TIMEOUT_ENV).and_then(|v| v.trim().parse::<u64>().ok()) {
            self.extract_timeout = Duration::from_millis(ms);
        }
        if let Some(jobs) = value(JOBS_ENV).and_then(|v| v.trim().parse::<usize>().ok()) {
            self.max_parallel_extractions = jobs.max(1);
        }
        if let Some(flag) = value(NO_NATIVE_ENV) {
            self.allow_native_extraction = flag.trim() == "0";
        }
        self
    }

    pub fn scope(mut self, scope: SearchScope) -> Self {
        self.scope = scope;
        self
    }

    pub fn cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn extractor(mut self, program: impl Into<PathBuf>) -> Self {
        self.extractor = Some(program.into());
        self
    }

    pub fn extract_timeout(mut self, timeout: Duration) -> Self {
        self.extract_timeout = timeout;
        self
    }

    pub fn max_parallel_extractions(mut self, jobs: usize) -> Self {
        self.max_parallel_extractions = jobs.max(1);
        self
    }

    pub fn allow_native_extraction(mut self, allow: bool) -> Self {
        self.allow_native_extraction = allow;
        self
    }

    /// Check construction arguments and compile the file-name pattern.
    pub fn validate(&self) -> Result<Pattern, CatalogError> {
        if self.root.as_os_str().is_empty() {
            return Err(CatalogError::configuration("root directory is empty"));
        }
        if !self.root.exists() {
            return Err(CatalogError::configuration(format!(
                "root directory {} does not exist",
                self.root.display()
            )));
        }
        if !self.root.is_dir() {
            return Err(CatalogError::configuration(format!(
                "root {} is not a directory",
                self.root.display()
            )));
        }
        if self.pattern.trim().is_empty() {
            return Err(CatalogError::configuration("name pattern is empty"));
        }
        if self.cache_dir.as_os_str().is_empty() {
            return Err(CatalogError::configuration("cache directory is empty"));
        }
        Pattern::new(&self.pattern).map_err(|err| {
            CatalogError::configuration(format!("invalid name pattern '{}': {err}", self.pattern))
        })
    }
}

/// `<system temp>/lazyplug-cache`.
pub fn default_cache_dir() -> PathBuf {
    env::temp_dir().join(DEFAULT_CACHE_DIR_NAME)
}
