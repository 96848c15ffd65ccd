//! Lazy directory catalog: scan, extract out of process, cache, merge.
//!
//! `refresh` makes sure every scanned module has a current cache entry,
//! extracting only the modules whose entry is missing or stale, then rebuilds
//! the snapshot from the cache store and swaps it in one write. Extraction
//! failures are per module and land in the `RefreshReport`; only problems
//! with the root directory or the cache directory itself fail the refresh.

use crate::activation::{ModuleLoader, ModuleRegistry};
use crate::cache::{CachedBatch, MetadataCache};
use crate::catalog::scan::{ModuleCandidate, scan_modules};
use crate::catalog::snapshot::Snapshot;
use crate::catalog::{CacheKey, MetadataRecord};
use crate::config::{CatalogOptions, SearchScope};
use crate::error::{CatalogError, ExtractionError, ExtractionFailure};
use crate::extractor::{Extractor, ProcessExtractor};
use crate::native::NativeLoader;
use crate::resolve_extractor_binary;
use glob::Pattern;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use tracing::{debug, info, warn};

/// Outcome of one refresh.
#[derive(Clone, Debug, Default)]
pub struct RefreshReport {
    /// Module files that matched the pattern, sorted.
    pub scanned: Vec<PathBuf>,
    /// Modules served from an existing cache entry.
    pub reused: Vec<PathBuf>,
    /// Modules run through the isolated extractor and cached.
    pub extracted: Vec<PathBuf>,
    pub failures: Vec<ExtractionError>,
}

impl RefreshReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failure_for(&self, module: &Path) -> Option<&ExtractionError> {
        self.failures.iter().find(|failure| failure.module == module)
    }
}

pub struct DirectoryCatalog {
    options: CatalogOptions,
    pattern: Pattern,
    extractor: Arc<dyn Extractor>,
    registry: Arc<ModuleRegistry>,
    snapshot: RwLock<Arc<Snapshot>>,
    last_report: Mutex<RefreshReport>,
}

impl DirectoryCatalog {
    /// Catalog over `root` with environment-derived defaults.
    pub fn new(
        root: impl Into<PathBuf>,
        pattern: impl Into<String>,
        scope: SearchScope,
    ) -> Result<Self, CatalogError> {
        Self::with_options(CatalogOptions::from_env(root, pattern).scope(scope))
    }

    /// Catalog using the out-of-process extractor and the native loader.
    pub fn with_options(options: CatalogOptions) -> Result<Self, CatalogError> {
        options.validate()?;
        let program = match &options.extractor {
            Some(program) => program.clone(),
            None => resolve_extractor_binary()
                .map_err(|err| CatalogError::configuration(format!("{err:#}")))?,
        };
        let extractor = ProcessExtractor::new(program, options.extract_timeout)
            .allow_native(options.allow_native_extraction);
        Self::with_components(options, Arc::new(extractor), Arc::new(NativeLoader))
    }

    /// Catalog with injected extraction and loading strategies.
    ///
    /// Performs the initial refresh before returning.
    pub fn with_components(
        options: CatalogOptions,
        extractor: Arc<dyn Extractor>,
        loader: Arc<dyn ModuleLoader>,
    ) -> Result<Self, CatalogError> {
        let pattern = options.validate()?;
        let catalog = Self {
            options,
            pattern,
            extractor,
            registry: Arc::new(ModuleRegistry::new(loader)),
            snapshot: RwLock::new(Arc::new(Snapshot::default())),
            last_report: Mutex::new(RefreshReport::default()),
        };
        catalog.refresh()?;
        Ok(catalog)
    }

    pub fn options(&self) -> &CatalogOptions {
        &self.options
    }

    /// The snapshot published by the last completed refresh.
    pub fn parts(&self) -> Arc<Snapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn last_report(&self) -> RefreshReport {
        self.last_report
            .lock()
            .unwrap_or_else(|err| err.into_inner())
            .clone()
    }

    /// Re-scan, extract what changed, and publish a new snapshot.
    pub fn refresh(&self) -> Result<RefreshReport, CatalogError> {
        let cache = MetadataCache::open(&self.options.cache_dir).map_err(|source| {
            CatalogError::Cache {
                path: self.options.cache_dir.clone(),
                source,
            }
        })?;
        let scanned = scan_modules(&self.options.root, &self.pattern, self.options.scope)?;

        let mut report = RefreshReport {
            scanned: scanned.iter().map(|c| c.path.clone()).collect(),
            ..Default::default()
        };

        let (modules, collisions) = dedupe_by_file_name(scanned);
        report.failures.extend(collisions);

        let (current, stale): (Vec<_>, Vec<_>) = modules
            .into_iter()
            .partition(|module| cache.has_current_entry(&module.file_name, &module.stamp));
        for module in &current {
            debug!(module = %module.path.display(), "metadata cache hit");
        }
        report.reused = current.iter().map(|m| m.path.clone()).collect();

        // Keys carry only the file name and stamp, so each wanted key maps to
        // the path scanned this time.
        let wanted: BTreeMap<CacheKey, PathBuf> = current
            .iter()
            .chain(stale.iter())
            .map(|module| (candidate_key(module), module.path.clone()))
            .collect();

        let outcomes = self.extract_all(&cache, &stale);
        record_outcomes(&mut report, outcomes);

        let mut batches = read_batches(&cache)?;

        // An entry that existed at scan time but could not be read was dropped
        // by the cache; extract those modules again so this snapshot stays
        // complete.
        let present: BTreeSet<&CacheKey> = batches.iter().map(|batch| &batch.key).collect();
        let lost: Vec<ModuleCandidate> = current
            .iter()
            .filter(|module| !present.contains(&candidate_key(module)))
            .cloned()
            .collect();
        if !lost.is_empty() {
            warn!(modules = lost.len(), "re-extracting modules with unreadable cache entries");
            report.reused.retain(|path| !lost.iter().any(|m| &m.path == path));
            let outcomes = self.extract_all(&cache, &lost);
            record_outcomes(&mut report, outcomes);
            batches = read_batches(&cache)?;
        }
        report.extracted.sort();
        report.failures.sort_by(|a, b| a.module.cmp(&b.module));

        let records: Vec<MetadataRecord> = batches
            .into_iter()
            .filter_map(|batch| {
                let path = wanted.get(&batch.key)?;
                Some(bind_to_module(batch.records, path))
            })
            .flatten()
            .collect();

        let snapshot = Arc::new(Snapshot::build(records, &self.registry));
        info!(
            parts = snapshot.len(),
            scanned = report.scanned.len(),
            extracted = report.extracted.len(),
            failed = report.failures.len(),
            "catalog refreshed"
        );
        *self.snapshot.write().unwrap_or_else(|err| err.into_inner()) = snapshot;
        *self.last_report.lock().unwrap_or_else(|err| err.into_inner()) = report.clone();
        Ok(report)
    }

    fn extract_all(
        &self,
        cache: &MetadataCache,
        stale: &[ModuleCandidate],
    ) -> Vec<Result<PathBuf, ExtractionError>> {
        let jobs = self.options.max_parallel_extractions.max(1);
        let mut outcomes = Vec::with_capacity(stale.len());
        for chunk in stale.chunks(jobs) {
            thread::scope(|scope| {
                let workers: Vec<_> = chunk
                    .iter()
                    .map(|module| scope.spawn(move || self.extract_one(cache, module)))
                    .collect();
                for (worker, module) in workers.into_iter().zip(chunk) {
                    let outcome = worker.join().unwrap_or_else(|_| {
                        Err(ExtractionError::new(
                            &module.path,
                            ExtractionFailure::Malformed("extraction worker panicked".into()),
                        ))
                    });
                    outcomes.push(outcome);
                }
            });
        }
        outcomes
    }

    fn extract_one(
        &self,
        cache: &MetadataCache,
        module: &ModuleCandidate,
    ) -> Result<PathBuf, ExtractionError> {
        let records = self.extractor.extract(&module.path)?;
        cache
            .write_entry(&module.file_name, &module.stamp, &records)
            .map_err(|err| {
                ExtractionError::new(&module.path, ExtractionFailure::Cache(err.to_string()))
            })?;
        Ok(module.path.clone())
    }
}

fn candidate_key(module: &ModuleCandidate) -> CacheKey {
    CacheKey::new(module.file_name.clone(), module.stamp.clone())
}

/// Point cached records at the module file scanned for their key. An entry
/// written for the same file name elsewhere (a moved module, another root
/// sharing the cache) must never activate that other file.
fn bind_to_module(mut records: Vec<MetadataRecord>, module: &Path) -> Vec<MetadataRecord> {
    for record in &mut records {
        if record.source_module_path != module {
            debug!(
                cached = %record.source_module_path.display(),
                module = %module.display(),
                "rebinding cached record to scanned module"
            );
            record.source_module_path = module.to_path_buf();
        }
    }
    records
}

fn read_batches(cache: &MetadataCache) -> Result<Vec<CachedBatch>, CatalogError> {
    cache.read_all_entries().map_err(|source| CatalogError::Cache {
        path: cache.root().to_path_buf(),
        source,
    })
}

fn record_outcomes(report: &mut RefreshReport, outcomes: Vec<Result<PathBuf, ExtractionError>>) {
    for outcome in outcomes {
        match outcome {
            Ok(path) => report.extracted.push(path),
            Err(err) => {
                warn!(error = %err, "module skipped for this refresh");
                report.failures.push(err);
            }
        }
    }
}

/// Cache entries are keyed by file name, so a recursive scan that finds the
/// same name twice keeps the first path (sorted order) and reports the rest.
fn dedupe_by_file_name(
    scanned: Vec<ModuleCandidate>,
) -> (Vec<ModuleCandidate>, Vec<ExtractionError>) {
    let mut seen: BTreeMap<String, PathBuf> = BTreeMap::new();
    let mut modules = Vec::with_capacity(scanned.len());
    let mut collisions = Vec::new();
    for candidate in scanned {
        if let Some(first) = seen.get(&candidate.file_name) {
            collisions.push(ExtractionError::new(
                &candidate.path,
                ExtractionFailure::NameCollision(first.clone()),
            ));
            continue;
        }
        seen.insert(candidate.file_name.clone(), candidate.path.clone());
        modules.push(candidate);
    }
    (modules, collisions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ModuleStamp;

    fn candidate(path: &str) -> ModuleCandidate {
        let path = PathBuf::from(path);
        ModuleCandidate {
            file_name: path.file_name().unwrap().to_string_lossy().into_owned(),
            path,
            stamp: ModuleStamp::parse("20240101000000000000000").unwrap(),
        }
    }

    #[test]
    fn cached_records_follow_the_scanned_path() {
        let record = MetadataRecord {
            exported_name: crate::catalog::CapabilityName("Plugin".into()),
            attributes: Vec::new(),
            source_module_path: PathBuf::from("/plugins/v1/A.ext"),
            activation: crate::catalog::ActivationDescriptor {
                entry_point: crate::catalog::EntryPoint("alpha_create".into()),
                abi_version: 1,
            },
        };
        let bound = bind_to_module(vec![record], Path::new("/plugins/v2/A.ext"));
        assert_eq!(bound[0].source_module_path, PathBuf::from("/plugins/v2/A.ext"));
    }

    #[test]
    fn duplicate_file_names_keep_first_path() {
        let (modules, collisions) = dedupe_by_file_name(vec![
            candidate("/plugins/A.ext"),
            candidate("/plugins/sub/A.ext"),
            candidate("/plugins/sub/B.ext"),
        ]);
        let kept: Vec<_> = modules.iter().map(|m| m.path.clone()).collect();
        assert_eq!(
            kept,
            vec![PathBuf::from("/plugins/A.ext"), PathBuf::from("/plugins/sub/B.ext")]
        );
        assert_eq!(collisions.len(), 1);
        assert_eq!(collisions[0].module, PathBuf::from("/plugins/sub/A.ext"));
        assert_eq!(
            collisions[0].kind,
            ExtractionFailure::NameCollision(PathBuf::from("/plugins/A.ext"))
        );
    }
}
