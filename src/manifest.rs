//! Plugin manifests: the explicit declaration a module makes about itself.
//!
//! A module declares its exports either in a sidecar file next to it
//! (`<module file name>.manifest.json`) or through a JSON string returned by
//! the `lazyplug_manifest` symbol of a native library. Both forms share the
//! schema in `schema/plugin_manifest.schema.json`; reading a sidecar never
//! executes module code.

use crate::catalog::{
    ACTIVATION_ABI_VERSION, ActivationDescriptor, Attribute, AttributeValue, CapabilityName,
    EntryPoint, MetadataRecord,
};
use crate::schema_loader::{CompiledSchema, SchemaLoadOptions, compile_schema, validate_instance};
use anyhow::{Context, Result, anyhow, bail};
use once_cell::sync::OnceCell;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

pub const MANIFEST_SCHEMA_VERSION: &str = "lazyplug_manifest_v1";
pub const SIDECAR_SUFFIX: &str = ".manifest.json";

const MANIFEST_SCHEMA_SOURCE: &str = include_str!("../schema/plugin_manifest.schema.json");

#[derive(Clone, Debug, Deserialize)]
/// Parsed manifest as declared by a module.
pub struct PluginManifest {
    pub schema_version: String,
    pub exports: Vec<ExportDecl>,
}

#[derive(Clone, Debug, Deserialize)]
/// One exported capability in a manifest.
pub struct ExportDecl {
    pub name: String,
    pub entry_point: String,
    #[serde(default)]
    pub abi_version: Option<u32>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl PluginManifest {
    /// Parse and validate manifest text; `origin` names the source in errors.
    pub fn from_json_str(text: &str, origin: &str) -> Result<Self> {
        let value: Value =
            serde_json::from_str(text).with_context(|| format!("parsing manifest {origin}"))?;
        validate_instance(manifest_schema()?, &value, &format!("manifest {origin}"))?;
        let manifest: PluginManifest = serde_json::from_value(value)
            .with_context(|| format!("decoding manifest {origin}"))?;
        Ok(manifest)
    }

    /// Read the sidecar manifest for `module`, if one exists.
    pub fn from_sidecar(module: &Path) -> Result<Option<Self>> {
        let Some(path) = sidecar_path(module) else {
            return Ok(None);
        };
        if !path.is_file() {
            return Ok(None);
        }
        let text =
            fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        Self::from_json_str(&text, &path.display().to_string()).map(Some)
    }

    /// Convert declared exports into metadata records owned by `module`.
    pub fn into_records(self, module: &Path) -> Result<Vec<MetadataRecord>> {
        self.exports
            .into_iter()
            .map(|export| export.into_record(module))
            .collect()
    }
}

impl ExportDecl {
    fn into_record(self, module: &Path) -> Result<MetadataRecord> {
        let mut attributes = Vec::with_capacity(self.metadata.len());
        for (key, value) in self.metadata {
            let value = attribute_value(&value).ok_or_else(|| {
                anyhow!(
                    "export '{}' declares non-primitive metadata '{}'",
                    self.name,
                    key
                )
            })?;
            attributes.push(Attribute { key, value });
        }
        Ok(MetadataRecord {
            exported_name: CapabilityName(self.name),
            attributes,
            source_module_path: module.to_path_buf(),
            activation: ActivationDescriptor {
                entry_point: EntryPoint(self.entry_point),
                abi_version: self.abi_version.unwrap_or(ACTIVATION_ABI_VERSION),
            },
        })
    }
}

fn attribute_value(value: &Value) -> Option<AttributeValue> {
    match value {
        Value::Bool(flag) => Some(AttributeValue::Bool(*flag)),
        Value::Number(number) => number
            .as_i64()
            .map(AttributeValue::Integer)
            .or_else(|| number.as_f64().map(AttributeValue::Float)),
        Value::String(text) => Some(AttributeValue::Text(text.clone())),
        _ => None,
    }
}

/// Sidecar manifest location for a module file.
pub fn sidecar_path(module: &Path) -> Option<PathBuf> {
    let file_name = module.file_name()?.to_str()?;
    Some(module.with_file_name(format!("{file_name}{SIDECAR_SUFFIX}")))
}

/// True when `file_name` is itself a sidecar manifest.
pub fn is_sidecar_name(file_name: &str) -> bool {
    file_name.ends_with(SIDECAR_SUFFIX)
}

fn manifest_schema() -> Result<&'static CompiledSchema> {
    static RAW: OnceCell<Value> = OnceCell::new();
    static COMPILED: OnceCell<CompiledSchema> = OnceCell::new();

    COMPILED.get_or_try_init(|| {
        let raw = RAW.get_or_try_init(|| {
            serde_json::from_str::<Value>(MANIFEST_SCHEMA_SOURCE)
                .context("parsing embedded manifest schema")
        })?;
        let allowed = BTreeSet::from_iter([MANIFEST_SCHEMA_VERSION.to_string()]);
        let compiled = compile_schema(
            "plugin_manifest",
            raw,
            SchemaLoadOptions {
                allowed_versions: Some(&allowed),
                ..Default::default()
            },
        )?;
        if compiled.schema_version != MANIFEST_SCHEMA_VERSION {
            bail!(
                "embedded manifest schema declares {}, expected {}",
                compiled.schema_version,
                MANIFEST_SCHEMA_VERSION
            );
        }
        Ok(compiled)
    })
}
