//! Lazy activation handles and the process-wide module registry.
//!
//! A `LazyHandle` carries a metadata record and nothing else until its value
//! is requested. The first `value()` call loads the owning module through the
//! shared `ModuleRegistry` and constructs the extension; concurrent first
//! callers block on the same `OnceCell` and observe one instance. The
//! registry keys modules by path so two handles from the same module share a
//! single load.

use crate::catalog::{ACTIVATION_ABI_VERSION, EntryPoint, MetadataRecord};
use crate::error::ActivationError;
use once_cell::sync::OnceCell;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::info;

/// Behavior every materialized extension provides to the host.
pub trait Extension: Send + Sync {
    /// Called by hosts once they decide to use the extension.
    fn initialize(&self) {}

    fn as_any(&self) -> &dyn Any;
}

/// A module that has been brought into the host process.
pub trait LoadedModule: Send + Sync {
    fn path(&self) -> &Path;

    fn instantiate(
        &self,
        record: &MetadataRecord,
    ) -> Result<Box<dyn Extension>, ActivationError>;
}

/// Loads module files into the host process.
pub trait ModuleLoader: Send + Sync {
    fn load(&self, path: &Path) -> Result<Arc<dyn LoadedModule>, ActivationError>;
}

type ModuleSlot = Arc<OnceCell<Arc<dyn LoadedModule>>>;

/// Tracks which modules the host has loaded; each path loads at most once.
pub struct ModuleRegistry {
    loader: Arc<dyn ModuleLoader>,
    slots: Mutex<HashMap<PathBuf, ModuleSlot>>,
}

impl ModuleRegistry {
    pub fn new(loader: Arc<dyn ModuleLoader>) -> Self {
        Self {
            loader,
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Return the loaded module, loading it on first request.
    ///
    /// The registry lock is held only to find the slot; the load itself runs
    /// on the per-module cell so unrelated modules load independently. A
    /// failed load leaves the cell empty and a later request retries.
    pub fn module(&self, path: &Path) -> Result<Arc<dyn LoadedModule>, ActivationError> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|err| err.into_inner());
            slots.entry(path.to_path_buf()).or_default().clone()
        };
        slot.get_or_try_init(|| {
            info!(module = %path.display(), "loading module into host");
            self.loader.load(path)
        })
        .cloned()
    }

    pub fn is_loaded(&self, path: &Path) -> bool {
        let slots = self.slots.lock().unwrap_or_else(|err| err.into_inner());
        slots.get(path).is_some_and(|slot| slot.get().is_some())
    }

    /// Paths of every module loaded so far, sorted.
    pub fn loaded_modules(&self) -> Vec<PathBuf> {
        let slots = self.slots.lock().unwrap_or_else(|err| err.into_inner());
        let mut loaded: Vec<PathBuf> = slots
            .iter()
            .filter(|(_, slot)| slot.get().is_some())
            .map(|(path, _)| path.clone())
            .collect();
        loaded.sort();
        loaded
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("loaded", &self.loaded_modules())
            .finish()
    }
}

/// A constructed extension plus the module that must outlive it.
pub struct ActivatedExtension {
    // Declared before `module` so the instance drops first.
    extension: Box<dyn Extension>,
    module: Arc<dyn LoadedModule>,
}

impl ActivatedExtension {
    pub fn extension(&self) -> &dyn Extension {
        self.extension.as_ref()
    }

    pub fn module_path(&self) -> &Path {
        self.module.path()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.extension.as_any().downcast_ref::<T>()
    }
}

impl std::ops::Deref for ActivatedExtension {
    type Target = dyn Extension;

    fn deref(&self) -> &Self::Target {
        self.extension.as_ref()
    }
}

struct HandleInner {
    record: Arc<MetadataRecord>,
    registry: Arc<ModuleRegistry>,
    value: OnceCell<Arc<ActivatedExtension>>,
}

/// Deferred-construction handle for one metadata record.
#[derive(Clone)]
pub struct LazyHandle {
    inner: Arc<HandleInner>,
}

impl LazyHandle {
    pub fn new(record: Arc<MetadataRecord>, registry: Arc<ModuleRegistry>) -> Self {
        Self {
            inner: Arc::new(HandleInner {
                record,
                registry,
                value: OnceCell::new(),
            }),
        }
    }

    /// Metadata is always available and never loads the module.
    pub fn metadata(&self) -> &MetadataRecord {
        &self.inner.record
    }

    pub fn is_materialized(&self) -> bool {
        self.inner.value.get().is_some()
    }

    /// Materialize the extension on first access; later calls share it.
    pub fn value(&self) -> Result<Arc<ActivatedExtension>, ActivationError> {
        self.inner
            .value
            .get_or_try_init(|| self.materialize())
            .cloned()
    }

    fn materialize(&self) -> Result<Arc<ActivatedExtension>, ActivationError> {
        let record = self.metadata();
        if record.activation.abi_version != ACTIVATION_ABI_VERSION {
            return Err(ActivationError::UnsupportedAbi {
                name: record.exported_name.0.clone(),
                found: record.activation.abi_version,
                supported: ACTIVATION_ABI_VERSION,
            });
        }
        let module = self.inner.registry.module(&record.source_module_path)?;
        let extension = module.instantiate(record)?;
        info!(
            capability = %record.exported_name,
            module = %record.source_module_path.display(),
            "materialized extension"
        );
        Ok(Arc::new(ActivatedExtension { extension, module }))
    }

    pub fn entry_point(&self) -> &EntryPoint {
        &self.inner.record.activation.entry_point
    }
}

impl fmt::Debug for LazyHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LazyHandle")
            .field("exported_name", &self.metadata().exported_name)
            .field("materialized", &self.is_materialized())
            .finish()
    }
}
