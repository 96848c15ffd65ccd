//! Serializable description of one discovered extension.
//!
//! Records are produced by the isolated extractor, persisted in the metadata
//! cache, and handed to hosts through the catalog snapshot. They hold enough
//! to rebuild an activation handle but never reference a loaded module.

use crate::catalog::identity::{CapabilityName, EntryPoint};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Activation ABI this host understands.
pub const ACTIVATION_ABI_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
/// Immutable metadata for one exported capability.
pub struct MetadataRecord {
    pub exported_name: CapabilityName,
    #[serde(default)]
    pub attributes: Vec<Attribute>,
    pub source_module_path: PathBuf,
    pub activation: ActivationDescriptor,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
/// One declared metadata pair, kept in declaration order.
pub struct Attribute {
    pub key: String,
    pub value: AttributeValue,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
/// Primitive metadata value.
pub enum AttributeValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
/// What the host needs to construct the instance later.
pub struct ActivationDescriptor {
    pub entry_point: EntryPoint,
    #[serde(default = "default_abi_version")]
    pub abi_version: u32,
}

fn default_abi_version() -> u32 {
    ACTIVATION_ABI_VERSION
}

impl MetadataRecord {
    /// Look up a declared attribute by key.
    pub fn attribute(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes
            .iter()
            .find(|attr| attr.key == key)
            .map(|attr| &attr.value)
    }

    /// Text attribute shortcut for the common `Name`/`Version` style keys.
    pub fn text_attribute(&self, key: &str) -> Option<&str> {
        self.attribute(key).and_then(AttributeValue::as_str)
    }

    /// File name of the owning module, used as the cache identity.
    pub fn module_file_name(&self) -> Option<&str> {
        self.source_module_path
            .file_name()
            .and_then(|name| name.to_str())
    }
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Bool(value) => write!(f, "{value}"),
            AttributeValue::Integer(value) => write!(f, "{value}"),
            AttributeValue::Float(value) => write!(f, "{value}"),
            AttributeValue::Text(value) => f.write_str(value),
        }
    }
}
