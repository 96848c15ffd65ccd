//! Immutable view of the catalog after one refresh.
//!
//! Records and handles are built together and never change; the catalog
//! replaces the whole snapshot on the next refresh.

use crate::activation::{LazyHandle, ModuleRegistry};
use crate::catalog::identity::CapabilityName;
use crate::catalog::model::MetadataRecord;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct Snapshot {
    records: Vec<Arc<MetadataRecord>>,
    handles: Vec<LazyHandle>,
}

impl Snapshot {
    pub(crate) fn build(records: Vec<MetadataRecord>, registry: &Arc<ModuleRegistry>) -> Self {
        let records: Vec<Arc<MetadataRecord>> = records.into_iter().map(Arc::new).collect();
        let handles = records
            .iter()
            .map(|record| LazyHandle::new(record.clone(), registry.clone()))
            .collect();
        Self { records, handles }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &MetadataRecord> {
        self.records.iter().map(|record| record.as_ref())
    }

    pub fn handles(&self) -> &[LazyHandle] {
        &self.handles
    }

    /// Handles whose exported capability name matches, in catalog order.
    ///
    /// The iterator borrows only the snapshot; `name` is copied.
    pub fn import_many<'a>(
        &'a self,
        name: &str,
    ) -> impl Iterator<Item = &'a LazyHandle> + use<'a> {
        let name = name.to_owned();
        self.handles
            .iter()
            .filter(move |handle| handle.metadata().exported_name.0 == name)
    }

    /// The first handle exporting `name`, if any.
    pub fn import(&self, name: &CapabilityName) -> Option<&LazyHandle> {
        self.import_many(&name.0).next()
    }

    /// Handles whose text attribute `key` equals `value`.
    pub fn find_by_attribute<'a>(
        &'a self,
        key: &str,
        value: &str,
    ) -> impl Iterator<Item = &'a LazyHandle> + use<'a> {
        let (key, value) = (key.to_owned(), value.to_owned());
        self.handles.iter().filter(move |handle| {
            handle.metadata().text_attribute(&key) == Some(value.as_str())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activation::{LoadedModule, ModuleLoader};
    use crate::catalog::{ActivationDescriptor, Attribute, AttributeValue, EntryPoint};
    use crate::error::ActivationError;
    use std::path::{Path, PathBuf};

    struct NeverLoader;

    impl ModuleLoader for NeverLoader {
        fn load(&self, path: &Path) -> Result<Arc<dyn LoadedModule>, ActivationError> {
            Err(ActivationError::Load {
                path: path.to_path_buf(),
                reason: "not in this test".into(),
            })
        }
    }

    fn record(export: &str, name: &str) -> MetadataRecord {
        MetadataRecord {
            exported_name: CapabilityName(export.into()),
            attributes: vec![Attribute {
                key: "Name".into(),
                value: AttributeValue::Text(name.into()),
            }],
            source_module_path: PathBuf::from(format!("/plugins/{name}.ext")),
            activation: ActivationDescriptor {
                entry_point: EntryPoint("create".into()),
                abi_version: 1,
            },
        }
    }

    #[test]
    fn queries_match_by_name_and_attribute() {
        let registry = Arc::new(ModuleRegistry::new(Arc::new(NeverLoader)));
        let snapshot = Snapshot::build(
            vec![
                record("Plugin", "Alpha"),
                record("Plugin", "Beta"),
                record("Exporter", "Gamma"),
            ],
            &registry,
        );
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot.handles().len(), 3);
        assert_eq!(snapshot.import_many("Plugin").count(), 2);
        assert!(snapshot.import(&CapabilityName("Missing".into())).is_none());

        let gamma: Vec<_> = snapshot.find_by_attribute("Name", "Gamma").collect();
        assert_eq!(gamma.len(), 1);
        assert_eq!(gamma[0].metadata().exported_name.0, "Exporter");
        assert!(snapshot.handles().iter().all(|h| !h.is_materialized()));
    }

    #[test]
    fn lookups_outlive_the_query_strings() {
        let registry = Arc::new(ModuleRegistry::new(Arc::new(NeverLoader)));
        let snapshot = Snapshot::build(vec![record("Plugin", "Alpha")], &registry);

        let by_name = {
            let wanted = CapabilityName(String::from("Plugin"));
            snapshot.import(&wanted)
        };
        assert_eq!(by_name.map(|h| h.entry_point().0.as_str()), Some("create"));

        let by_attribute: Vec<&LazyHandle> = {
            let (key, value) = (String::from("Name"), String::from("Alpha"));
            snapshot.find_by_attribute(&key, &value).collect()
        };
        assert_eq!(by_attribute.len(), 1);
    }
}
