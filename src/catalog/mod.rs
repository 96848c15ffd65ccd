//! Extension catalog wiring.
//!
//! `DirectoryCatalog` is the entry point: it scans a plugin directory, keeps
//! the metadata cache current through the isolated extractor, and publishes
//! `Snapshot`s of `MetadataRecord`s with lazy activation handles. The
//! identity and model types here are what the cache and the extractor
//! serialize.

pub mod directory;
pub mod identity;
pub mod model;
pub mod scan;
pub mod snapshot;

pub use directory::{DirectoryCatalog, RefreshReport};
pub use identity::{CacheKey, CapabilityName, EntryPoint, ModuleStamp};
pub use model::{
    ACTIVATION_ABI_VERSION, ActivationDescriptor, Attribute, AttributeValue, MetadataRecord,
};
pub use scan::{ModuleCandidate, absolute_module_path, module_stamp, scan_modules};
pub use snapshot::Snapshot;
