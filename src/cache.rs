//! Durable store of extracted metadata, one JSON batch per module version.
//!
//! Entries are named `<module file name>.<stamp>.parts.json`. Writing an
//! entry first removes every other entry for the same module file name and
//! then renames a fully written temporary file into place, so readers never
//! see a partial batch and a module never has more than one entry after a
//! write. The cache is an optimization only: unreadable entries are dropped
//! and simply cost a re-extraction.

use crate::catalog::{CacheKey, MetadataRecord, ModuleStamp};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, BufReader, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

pub const CACHE_FORMAT: &str = "lazyplug_cache_v1";
pub const DEFAULT_CACHE_DIR_NAME: &str = "lazyplug-cache";

#[derive(Debug, Serialize, Deserialize)]
struct CacheEntryFile {
    schema_version: String,
    module_file_name: String,
    module_stamp: ModuleStamp,
    records: Vec<MetadataRecord>,
}

/// One persisted batch with its key.
#[derive(Clone, Debug, PartialEq)]
pub struct CachedBatch {
    pub key: CacheKey,
    pub records: Vec<MetadataRecord>,
}

#[derive(Clone, Debug)]
pub struct MetadataCache {
    root: PathBuf,
}

impl MetadataCache {
    /// Open (and create, if needed) the cache directory.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.root.join(key.file_name())
    }

    /// True iff an entry exists for exactly this file name and stamp.
    pub fn has_current_entry(&self, module_file_name: &str, stamp: &ModuleStamp) -> bool {
        let key = CacheKey::new(module_file_name, stamp.clone());
        self.entry_path(&key).is_file()
    }

    /// Keys currently stored for one module file name, oldest stamp first.
    pub fn entries_for(&self, module_file_name: &str) -> io::Result<Vec<CacheKey>> {
        let mut keys: Vec<CacheKey> = self
            .list_keys()?
            .into_iter()
            .filter(|key| key.module_file_name == module_file_name)
            .collect();
        keys.sort();
        Ok(keys)
    }

    /// Persist `records` as the only entry for `module_file_name`.
    pub fn write_entry(
        &self,
        module_file_name: &str,
        stamp: &ModuleStamp,
        records: &[MetadataRecord],
    ) -> io::Result<PathBuf> {
        let key = CacheKey::new(module_file_name, stamp.clone());
        self.remove_superseded(&key)?;

        let entry = CacheEntryFile {
            schema_version: CACHE_FORMAT.to_string(),
            module_file_name: module_file_name.to_string(),
            module_stamp: stamp.clone(),
            records: records.to_vec(),
        };

        let mut staged = tempfile::Builder::new()
            .prefix(&format!(".{module_file_name}."))
            .suffix(".tmp")
            .tempfile_in(&self.root)?;
        serde_json::to_writer_pretty(staged.as_file_mut(), &entry).map_err(io::Error::other)?;
        staged.as_file_mut().flush()?;
        staged.as_file().sync_all()?;

        let final_path = self.entry_path(&key);
        persist(staged, &final_path)?;
        debug!(entry = %key, "wrote metadata cache entry");
        Ok(final_path)
    }

    /// Every persisted entry, sorted by key.
    pub fn read_all_entries(&self) -> io::Result<Vec<CachedBatch>> {
        let mut keys = self.list_keys()?;
        keys.sort();

        let mut batches = Vec::with_capacity(keys.len());
        for key in keys {
            let path = self.entry_path(&key);
            match read_entry(&path, &key) {
                Ok(records) => batches.push(CachedBatch { key, records }),
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => {
                    warn!(entry = %path.display(), error = %err, "dropping unreadable cache entry");
                    remove_if_present(&path)?;
                }
            }
        }
        Ok(batches)
    }

    /// Delete one entry; missing entries are not an error.
    pub fn remove_entry(&self, key: &CacheKey) -> io::Result<()> {
        remove_if_present(&self.entry_path(key))
    }

    fn remove_superseded(&self, current: &CacheKey) -> io::Result<()> {
        for key in self.entries_for(&current.module_file_name)? {
            if key.stamp != current.stamp {
                debug!(entry = %key, "removing superseded cache entry");
                self.remove_entry(&key)?;
            }
        }
        Ok(())
    }

    fn list_keys(&self) -> io::Result<Vec<CacheKey>> {
        let mut keys = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if let Some(key) = CacheKey::from_file_name(name) {
                keys.push(key);
            }
        }
        Ok(keys)
    }
}

fn read_entry(path: &Path, key: &CacheKey) -> io::Result<Vec<MetadataRecord>> {
    let file = fs::File::open(path)?;
    let entry: CacheEntryFile = serde_json::from_reader(BufReader::new(file))
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    if entry.schema_version != CACHE_FORMAT {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unsupported cache format '{}'", entry.schema_version),
        ));
    }
    if entry.module_file_name != key.module_file_name || entry.module_stamp != key.stamp {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("entry contents describe {}", entry.module_file_name),
        ));
    }
    Ok(entry.records)
}

fn persist(staged: NamedTempFile, final_path: &Path) -> io::Result<()> {
    staged
        .persist(final_path)
        .map(|_| ())
        .map_err(|err| err.error)
}

fn remove_if_present(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{ActivationDescriptor, CapabilityName, EntryPoint};
    use tempfile::TempDir;

    fn record(name: &str) -> MetadataRecord {
        MetadataRecord {
            exported_name: CapabilityName(name.to_string()),
            attributes: Vec::new(),
            source_module_path: PathBuf::from(format!("/plugins/{name}.ext")),
            activation: ActivationDescriptor {
                entry_point: EntryPoint(format!("{}_create", name.to_lowercase())),
                abi_version: 1,
            },
        }
    }

    fn stamp(value: &str) -> ModuleStamp {
        ModuleStamp::parse(value).unwrap()
    }

    #[test]
    fn write_supersedes_other_stamps() {
        let dir = TempDir::new().unwrap();
        let cache = MetadataCache::open(dir.path().join("cache")).unwrap();
        let old = stamp("20240101000000000000000");
        let new = stamp("20240101000000000000001");

        cache.write_entry("A.ext", &old, &[record("Alpha")]).unwrap();
        cache.write_entry("B.ext", &old, &[record("Beta")]).unwrap();
        assert!(cache.has_current_entry("A.ext", &old));

        cache.write_entry("A.ext", &new, &[record("Alpha")]).unwrap();
        assert!(!cache.has_current_entry("A.ext", &old));
        assert!(cache.has_current_entry("A.ext", &new));
        assert_eq!(
            cache.entries_for("A.ext").unwrap(),
            vec![CacheKey::new("A.ext", new.clone())]
        );
        assert!(cache.has_current_entry("B.ext", &old));
    }

    #[test]
    fn read_all_skips_foreign_files_and_drops_corrupt_entries() {
        let dir = TempDir::new().unwrap();
        let cache = MetadataCache::open(dir.path()).unwrap();
        let current = stamp("20240101000000000000000");
        cache.write_entry("A.ext", &current, &[record("Alpha")]).unwrap();

        fs::write(dir.path().join("README.txt"), "not an entry").unwrap();
        let corrupt = CacheKey::new("B.ext", current.clone());
        fs::write(cache.entry_path(&corrupt), "{ truncated").unwrap();

        let batches = cache.read_all_entries().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].key.module_file_name, "A.ext");
        assert_eq!(batches[0].records, vec![record("Alpha")]);
        assert!(!cache.entry_path(&corrupt).exists());
        assert!(dir.path().join("README.txt").exists());
    }

    #[test]
    fn renamed_entry_with_mismatched_contents_is_dropped() {
        let dir = TempDir::new().unwrap();
        let cache = MetadataCache::open(dir.path()).unwrap();
        let written = cache
            .write_entry("A.ext", &stamp("20240101000000000000000"), &[record("Alpha")])
            .unwrap();
        let forged = cache.entry_path(&CacheKey::new("A.ext", stamp("20250101000000000000000")));
        fs::rename(&written, &forged).unwrap();

        assert!(cache.read_all_entries().unwrap().is_empty());
        assert!(!forged.exists());
    }

    #[test]
    fn write_leaves_no_staging_files() {
        let dir = TempDir::new().unwrap();
        let cache = MetadataCache::open(dir.path()).unwrap();
        cache
            .write_entry("A.ext", &stamp("20240101000000000000000"), &[record("Alpha")])
            .unwrap();
        let names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["A.ext.20240101000000000000000.parts.json".to_string()]);
    }
}
