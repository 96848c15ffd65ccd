#![allow(dead_code)]

use anyhow::{Context, Result, bail};
use lazyplug::{
    ActivationError, CatalogOptions, DirectoryCatalog, Extension, ExtractionError, Extractor,
    LoadedModule, MetadataRecord, ModuleLoader, ProcessExtractor,
};
use serde_json::{Value, json};
use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

/// Module and sidecar mtimes written by `write_module`.
pub const BASE_MTIME_SECS: u64 = 1_700_000_000;
pub const EXTRACT_TIMEOUT: Duration = Duration::from_secs(20);

pub fn extractor_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_plugin-extract"))
}

const NATIVE_FIXTURE_PACKAGE: &str = "lazyplug-native-fixture";

/// Build the native fixture module once per test binary and return the
/// shared library path.
pub fn native_fixture() -> Result<PathBuf> {
    static BUILT: OnceLock<Result<PathBuf, String>> = OnceLock::new();
    BUILT
        .get_or_init(|| build_native_fixture().map_err(|err| format!("{err:#}")))
        .clone()
        .map_err(anyhow::Error::msg)
}

fn build_native_fixture() -> Result<PathBuf> {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR")).join("Cargo.toml");
    let cargo = option_env!("CARGO").unwrap_or("cargo");
    let output = Command::new(cargo)
        .arg("build")
        .arg("--quiet")
        .arg("--message-format=json")
        .arg("--package")
        .arg(NATIVE_FIXTURE_PACKAGE)
        .arg("--manifest-path")
        .arg(&manifest)
        .output()
        .context("failed to run cargo for the native fixture")?;
    if !output.status.success() {
        bail!(
            "building {} failed: status {:?}\nstderr: {}",
            NATIVE_FIXTURE_PACKAGE,
            output.status.code(),
            String::from_utf8_lossy(&output.stderr)
        );
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    for line in stdout.lines() {
        let Ok(message) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if message["reason"] != "compiler-artifact" {
            continue;
        }
        let is_cdylib = message["target"]["kind"]
            .as_array()
            .is_some_and(|kinds| kinds.iter().any(|kind| kind == "cdylib"));
        if !is_cdylib {
            continue;
        }
        let library = message["filenames"]
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
            .find(|name| name.ends_with(std::env::consts::DLL_SUFFIX));
        if let Some(library) = library {
            return Ok(PathBuf::from(library));
        }
    }
    bail!("cargo reported no shared library for {NATIVE_FIXTURE_PACKAGE}")
}

pub fn mtime(secs: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
}

pub fn set_mtime(path: &Path, secs: u64) -> Result<()> {
    let file = File::options()
        .write(true)
        .open(path)
        .with_context(|| format!("opening {} to set mtime", path.display()))?;
    file.set_modified(mtime(secs))?;
    Ok(())
}

/// Sidecar manifest document with the given exports.
pub fn manifest(exports: Value) -> Value {
    json!({
        "schema_version": lazyplug::manifest::MANIFEST_SCHEMA_VERSION,
        "exports": exports,
    })
}

/// One `Plugin` export with `Name`/`Version` metadata.
pub fn plugin_manifest(name: &str, version: &str) -> Value {
    manifest(json!([{
        "name": "Plugin",
        "entry_point": format!("{}_create", name.to_lowercase()),
        "metadata": {"Name": name, "Version": version}
    }]))
}

/// Write an opaque module file plus its sidecar manifest, both stamped with
/// `BASE_MTIME_SECS`.
pub fn write_module(dir: &Path, file_name: &str, manifest: &Value) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let module = dir.join(file_name);
    fs::write(&module, b"opaque module bytes")?;
    let sidecar = dir.join(format!("{file_name}.manifest.json"));
    fs::write(&sidecar, serde_json::to_vec_pretty(manifest)?)?;
    set_mtime(&module, BASE_MTIME_SECS)?;
    set_mtime(&sidecar, BASE_MTIME_SECS)?;
    Ok(module.canonicalize()?)
}

pub fn remove_module(module: &Path) -> Result<()> {
    fs::remove_file(module)?;
    let sidecar = lazyplug::manifest::sidecar_path(module).context("sidecar path")?;
    if sidecar.exists() {
        fs::remove_file(sidecar)?;
    }
    Ok(())
}

pub fn write_script(dir: &Path, name: &str, body: &str) -> Result<PathBuf> {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n"))?;
    make_executable(&path)?;
    Ok(path)
}

pub fn make_executable(path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}

/// Plugin root and cache directory that live as long as the test.
pub struct Workspace {
    pub root: TempDir,
    pub cache: TempDir,
}

impl Workspace {
    pub fn new() -> Result<Self> {
        Ok(Self {
            root: TempDir::new().context("allocating plugin root")?,
            cache: TempDir::new().context("allocating cache dir")?,
        })
    }

    /// Plugin root under the cargo target directory, for modules that must
    /// be mapped executable (system temp may be mounted `noexec`).
    pub fn in_target_dir() -> Result<Self> {
        Ok(Self {
            root: TempDir::new_in(env!("CARGO_TARGET_TMPDIR"))
                .context("allocating plugin root")?,
            cache: TempDir::new().context("allocating cache dir")?,
        })
    }

    pub fn root(&self) -> PathBuf {
        self.root
            .path()
            .canonicalize()
            .unwrap_or_else(|_| self.root.path().to_path_buf())
    }

    pub fn options(&self, pattern: &str) -> CatalogOptions {
        CatalogOptions::new(self.root.path(), pattern)
            .cache_dir(self.cache.path())
            .extractor(extractor_binary())
            .extract_timeout(EXTRACT_TIMEOUT)
    }

    pub fn catalog(&self, pattern: &str) -> Result<(DirectoryCatalog, Arc<FakeLoader>)> {
        self.catalog_with(self.options(pattern))
    }

    pub fn catalog_with(
        &self,
        options: CatalogOptions,
    ) -> Result<(DirectoryCatalog, Arc<FakeLoader>)> {
        let loader = Arc::new(FakeLoader::default());
        let extractor = ProcessExtractor::new(extractor_binary(), options.extract_timeout);
        let catalog = DirectoryCatalog::with_components(options, Arc::new(extractor), loader.clone())?;
        Ok((catalog, loader))
    }
}

/// Extension produced by `FakeLoader`; remembers what it was built from.
pub struct FakeExtension {
    pub exported_name: String,
    pub entry_point: String,
    pub initialized: AtomicUsize,
}

impl Extension for FakeExtension {
    fn initialize(&self) {
        self.initialized.fetch_add(1, Ordering::SeqCst);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

struct FakeModule {
    path: PathBuf,
}

impl LoadedModule for FakeModule {
    fn path(&self) -> &Path {
        &self.path
    }

    fn instantiate(&self, record: &MetadataRecord) -> Result<Box<dyn Extension>, ActivationError> {
        Ok(Box::new(FakeExtension {
            exported_name: record.exported_name.0.clone(),
            entry_point: record.activation.entry_point.0.clone(),
            initialized: AtomicUsize::new(0),
        }))
    }
}

/// Stands in for the native loader: counts loads per path and refuses the
/// paths registered with `fail_on`.
#[derive(Default)]
pub struct FakeLoader {
    loads: Mutex<BTreeMap<PathBuf, usize>>,
    failing: Mutex<BTreeSet<PathBuf>>,
    delay: Mutex<Option<Duration>>,
}

impl FakeLoader {
    pub fn fail_on(&self, path: &Path) {
        self.failing
            .lock()
            .unwrap()
            .insert(path.to_path_buf());
    }

    pub fn slow_down(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn loads_of(&self, path: &Path) -> usize {
        self.loads.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    pub fn total_loads(&self) -> usize {
        self.loads.lock().unwrap().values().sum()
    }
}

impl ModuleLoader for FakeLoader {
    fn load(&self, path: &Path) -> Result<Arc<dyn LoadedModule>, ActivationError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        *self
            .loads
            .lock()
            .unwrap()
            .entry(path.to_path_buf())
            .or_default() += 1;
        if self.failing.lock().unwrap().contains(path) {
            return Err(ActivationError::Load {
                path: path.to_path_buf(),
                reason: "refused by test loader".to_string(),
            });
        }
        Ok(Arc::new(FakeModule {
            path: path.to_path_buf(),
        }))
    }
}

/// Wraps another extractor and counts how many modules it was asked for.
pub struct CountingExtractor<E> {
    inner: E,
    calls: AtomicUsize,
}

impl<E: Extractor> CountingExtractor<E> {
    pub fn new(inner: E) -> Self {
        Self {
            inner,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl<E: Extractor> Extractor for CountingExtractor<E> {
    fn extract(&self, module: &Path) -> Result<Vec<MetadataRecord>, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.extract(module)
    }
}

/// Exported names paired with their `Name` attribute, in snapshot order.
pub fn named_parts(catalog: &DirectoryCatalog) -> Vec<(String, String)> {
    catalog
        .parts()
        .records()
        .map(|record| {
            (
                record.exported_name.0.clone(),
                record.text_attribute("Name").unwrap_or_default().to_string(),
            )
        })
        .collect()
}
