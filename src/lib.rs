//! Lazy plugin catalog.
//!
//! The crate discovers extension modules in a directory and exposes what they
//! declare without loading their code into the host. Metadata is extracted by
//! the `plugin-extract` helper in a child process, cached on disk per module
//! version, and published as snapshots of `MetadataRecord`s paired with
//! `LazyHandle`s. A module is loaded into the host only when one of its
//! handles is asked for a value, and then only once.

use anyhow::{Result, bail};
use std::path::PathBuf;

pub mod activation;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod error;
pub mod extractor;
pub mod logging;
pub mod manifest;
pub mod native;
pub mod runtime;
mod schema_loader;

pub use activation::{
    ActivatedExtension, Extension, LazyHandle, LoadedModule, ModuleLoader, ModuleRegistry,
};
pub use cache::{CachedBatch, MetadataCache};
pub use catalog::{
    ACTIVATION_ABI_VERSION, ActivationDescriptor, Attribute, AttributeValue, CacheKey,
    CapabilityName, DirectoryCatalog, EntryPoint, MetadataRecord, ModuleStamp, RefreshReport,
    Snapshot,
};
pub use config::{CatalogOptions, SearchScope};
pub use error::{ActivationError, CatalogError, ExtractionError, ExtractionFailure};
pub use extractor::{ExtractionReport, Extractor, ProcessExtractor, inspect_module};
pub use manifest::PluginManifest;
pub use native::{NativeLoader, export_extension, is_loaded_in_process};

/// Locate the `plugin-extract` helper.
///
/// Search order: `LAZYPLUG_EXTRACTOR` when it names an executable, the
/// directory of the running binary (and its parent, for test harnesses under
/// `deps/`), then PATH.
pub fn resolve_extractor_binary() -> Result<PathBuf> {
    if let Some(hint) = std::env::var_os(config::EXTRACTOR_ENV) {
        let hint = PathBuf::from(hint);
        if runtime::helper_is_executable(&hint) {
            return Ok(hint);
        }
        bail!(
            "{} points at {}, which is not an executable file",
            config::EXTRACTOR_ENV,
            hint.display()
        );
    }

    if let Some(found) = runtime::resolve_sibling_helper(runtime::EXTRACTOR_BINARY) {
        return Ok(found);
    }

    if let Some(found) = runtime::find_on_path(runtime::EXTRACTOR_BINARY) {
        return Ok(found);
    }

    bail!(
        "Unable to locate '{}'. Build it alongside the host or set {}.",
        runtime::EXTRACTOR_BINARY,
        config::EXTRACTOR_ENV
    )
}
