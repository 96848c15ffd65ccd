use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::time::SystemTime;

/// Logical capability name an extension is exported under (e.g. `Alpha`).
///
/// Hosts bind handles to their import points by matching this name.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityName(pub String);

/// Exported constructor symbol inside the owning module.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntryPoint(pub String);

impl fmt::Display for CapabilityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

const STAMP_FORMAT: &str = "%Y%m%d%H%M%S%9f";
const STAMP_LEN: usize = 23;

/// Modification time of one module version, UTC with nanosecond precision.
///
/// Rendered as `YYYYMMDDhhmmss` followed by nine digits of nanoseconds so
/// stamps sort chronologically as plain strings and can be embedded in cache
/// file names.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ModuleStamp(String);

impl ModuleStamp {
    pub fn from_system_time(time: SystemTime) -> Self {
        let utc: DateTime<Utc> = time.into();
        ModuleStamp(utc.format(STAMP_FORMAT).to_string())
    }

    /// Accepts only well-formed 23-digit stamps.
    pub fn parse(value: &str) -> Option<Self> {
        if value.len() == STAMP_LEN && value.bytes().all(|b| b.is_ascii_digit()) {
            Some(ModuleStamp(value.to_string()))
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ModuleStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for ModuleStamp {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ModuleStamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        ModuleStamp::parse(&value)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid module stamp '{value}'")))
    }
}

pub(crate) const ENTRY_SUFFIX: &str = ".parts.json";

/// Identity of one cache entry: module file name plus module stamp.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CacheKey {
    pub module_file_name: String,
    pub stamp: ModuleStamp,
}

impl CacheKey {
    pub fn new(module_file_name: impl Into<String>, stamp: ModuleStamp) -> Self {
        Self {
            module_file_name: module_file_name.into(),
            stamp,
        }
    }

    /// File name the entry is persisted under.
    pub fn file_name(&self) -> String {
        format!("{}.{}{}", self.module_file_name, self.stamp, ENTRY_SUFFIX)
    }

    /// Recover a key from a cache directory listing.
    ///
    /// Splitting on the last dot before the suffix keeps module names that
    /// themselves contain dots (`A.ext`, `A.ext.bak`) distinct.
    pub fn from_file_name(file_name: &str) -> Option<Self> {
        let base = file_name.strip_suffix(ENTRY_SUFFIX)?;
        let (module_file_name, stamp) = base.rsplit_once('.')?;
        if module_file_name.is_empty() {
            return None;
        }
        Some(Self {
            module_file_name: module_file_name.to_string(),
            stamp: ModuleStamp::parse(stamp)?,
        })
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.module_file_name, self.stamp)
    }
}
