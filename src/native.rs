//! Native dynamic-library modules.
//!
//! ABI contract for module authors (host and module must be built by the
//! same compiler):
//! - `lazyplug_manifest: unsafe extern "C" fn() -> *const c_char` returns a
//!   NUL-terminated manifest JSON string with static lifetime. It is only
//!   called inside the isolated extractor, and only when the module has no
//!   sidecar manifest.
//! - every entry point named in the manifest is an
//!   `unsafe extern "C" fn() -> *mut c_void` returning the pointer produced
//!   by [`export_extension`].

use crate::activation::{Extension, LoadedModule, ModuleLoader};
use crate::catalog::MetadataRecord;
use crate::error::ActivationError;
use anyhow::{Context, Result, anyhow};
use libloading::Library;
use std::ffi::{CStr, c_char, c_void};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const MANIFEST_SYMBOL: &[u8] = b"lazyplug_manifest\0";

pub type ManifestFn = unsafe extern "C" fn() -> *const c_char;
pub type ExtensionConstructor = unsafe extern "C" fn() -> *mut c_void;

/// Hand an extension across the module boundary from an entry point.
pub fn export_extension(extension: Box<dyn Extension>) -> *mut c_void {
    Box::into_raw(Box::new(extension)) as *mut c_void
}

/// Load `module` in this process and return its embedded manifest text.
///
/// Runs module initializers; call it only from the isolated extractor.
pub fn read_embedded_manifest(module: &Path) -> Result<String> {
    let library = unsafe { Library::new(module) }
        .with_context(|| format!("loading {}", module.display()))?;
    let manifest_fn = unsafe { library.get::<ManifestFn>(MANIFEST_SYMBOL) }
        .with_context(|| format!("{} does not export lazyplug_manifest", module.display()))?;
    let raw = unsafe { manifest_fn() };
    if raw.is_null() {
        return Err(anyhow!(
            "{} returned a null manifest",
            module.display()
        ));
    }
    let text = unsafe { CStr::from_ptr(raw) }
        .to_str()
        .with_context(|| format!("manifest of {} is not UTF-8", module.display()))?
        .to_string();
    Ok(text)
}

/// Default host loader backed by `libloading`.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeLoader;

impl ModuleLoader for NativeLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn LoadedModule>, ActivationError> {
        let library = unsafe { Library::new(path) }.map_err(|err| ActivationError::Load {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        Ok(Arc::new(NativeModule {
            path: path.to_path_buf(),
            library,
        }))
    }
}

/// A dynamic library mapped into the host. Dropping it unmaps the library,
/// so every instance keeps an `Arc` to its module.
pub struct NativeModule {
    path: PathBuf,
    library: Library,
}

impl LoadedModule for NativeModule {
    fn path(&self) -> &Path {
        &self.path
    }

    fn instantiate(
        &self,
        record: &MetadataRecord,
    ) -> Result<Box<dyn Extension>, ActivationError> {
        let entry_point = &record.activation.entry_point.0;
        let constructor = unsafe { self.library.get::<ExtensionConstructor>(entry_point.as_bytes()) }
            .map_err(|_| ActivationError::MissingEntryPoint {
                path: self.path.clone(),
                entry_point: entry_point.clone(),
            })?;
        let raw = unsafe { constructor() };
        if raw.is_null() {
            return Err(ActivationError::Construct {
                path: self.path.clone(),
                name: record.exported_name.0.clone(),
                reason: "entry point returned null".to_string(),
            });
        }
        let boxed = unsafe { Box::from_raw(raw as *mut Box<dyn Extension>) };
        Ok(*boxed)
    }
}

/// Whether `path` is currently mapped into this process by the dynamic linker.
///
/// Uses `RTLD_NOLOAD`, so the check itself never loads anything.
#[cfg(unix)]
pub fn is_loaded_in_process(path: &Path) -> bool {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    let handle = unsafe { libc::dlopen(c_path.as_ptr(), libc::RTLD_LAZY | libc::RTLD_NOLOAD) };
    if handle.is_null() {
        return false;
    }
    // NOLOAD still bumps the reference count.
    unsafe {
        libc::dlclose(handle);
    }
    true
}

#[cfg(not(unix))]
pub fn is_loaded_in_process(_path: &Path) -> bool {
    false
}
