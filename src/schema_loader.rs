//! Compiles the embedded JSON Schemas and validates documents against them.
//!
//! Schemas ship inside the binary so the isolated extractor can validate a
//! manifest without locating any files next to the executable. The declared
//! `schema_version` const is checked against the versions this build accepts
//! before the validator is compiled.

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::JSONSchema;
use serde_json::Value;
use std::collections::BTreeSet;

/// Result of compiling one embedded schema.
pub(crate) struct CompiledSchema {
    pub schema_version: String,
    pub compiled: JSONSchema,
}

/// Controls how an embedded schema is checked before compilation.
pub(crate) struct SchemaLoadOptions<'a> {
    /// Where to find the schema_version const inside the schema payload.
    pub schema_version_pointer: &'a str,
    /// Allowed schema_version values; enforced when present.
    pub allowed_versions: Option<&'a BTreeSet<String>>,
}

impl Default for SchemaLoadOptions<'_> {
    fn default() -> Self {
        Self {
            schema_version_pointer: "/properties/schema_version/const",
            allowed_versions: None,
        }
    }
}

/// Compile a schema whose JSON payload lives for the whole process.
///
/// `jsonschema` ties compile errors to the schema value, so the payload must
/// be `'static`; callers keep it in a `OnceCell`.
pub(crate) fn compile_schema(
    label: &str,
    schema: &'static Value,
    options: SchemaLoadOptions<'_>,
) -> Result<CompiledSchema> {
    let schema_version = extract_schema_version(schema, options.schema_version_pointer)
        .ok_or_else(|| anyhow!("schema {label} missing schema_version const"))?;

    if let Some(allowed) = options.allowed_versions {
        if !allowed.contains(&schema_version) {
            bail!(
                "schema_version '{}' not in allowed set {:?}",
                schema_version,
                allowed
            );
        }
    }

    let compiled =
        JSONSchema::compile(schema).with_context(|| format!("compiling schema {label}"))?;
    Ok(CompiledSchema {
        schema_version,
        compiled,
    })
}

/// Validate `instance`, joining every violation into one error message.
pub(crate) fn validate_instance(
    schema: &CompiledSchema,
    instance: &Value,
    origin: &str,
) -> Result<()> {
    if let Err(errors) = schema.compiled.validate(instance) {
        let details = errors
            .map(|err| format!("{}: {}", err.instance_path, err))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("{origin} failed schema validation:\n{details}");
    }
    Ok(())
}

fn extract_schema_version(schema: &Value, pointer: &str) -> Option<String> {
    let version = schema.pointer(pointer).and_then(Value::as_str)?;
    if version
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
    {
        Some(version.to_string())
    } else {
        None
    }
}
