//! Directory scan for candidate module files.
//!
//! The pattern applies to file names only, as in `*.plugin`. Sidecar
//! manifests are never candidates even when the pattern would match them.

use crate::catalog::identity::ModuleStamp;
use crate::config::SearchScope;
use crate::error::CatalogError;
use crate::manifest::{is_sidecar_name, sidecar_path};
use glob::Pattern;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Clone, Debug, Eq, PartialEq)]
/// One module file found by the scan.
pub struct ModuleCandidate {
    pub path: PathBuf,
    pub file_name: String,
    pub stamp: ModuleStamp,
}

/// List matching module files, sorted by path.
pub fn scan_modules(
    root: &Path,
    pattern: &Pattern,
    scope: SearchScope,
) -> Result<Vec<ModuleCandidate>, CatalogError> {
    let mut paths = Vec::new();
    collect_from_dir(root, pattern, scope, &mut paths).map_err(|source| CatalogError::Scan {
        path: root.to_path_buf(),
        source,
    })?;
    paths.sort();

    let mut candidates = Vec::with_capacity(paths.len());
    for path in paths {
        // Files can disappear between listing and stat; skip them.
        let Ok(stamp) = module_stamp(&path) else {
            continue;
        };
        let path = absolute_module_path(&path).unwrap_or(path);
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()).map(str::to_string)
        else {
            continue;
        };
        candidates.push(ModuleCandidate {
            path,
            file_name,
            stamp,
        });
    }
    Ok(candidates)
}

/// Absolute module path with its directory resolved but not the file itself,
/// so a symlinked module keeps the name the pattern matched and the sidecar
/// next to the link.
pub fn absolute_module_path(module: &Path) -> io::Result<PathBuf> {
    let file_name = module.file_name().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} has no file name", module.display()),
        )
    })?;
    let parent = match module.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    Ok(fs::canonicalize(parent)?.join(file_name))
}

/// Latest modification time of the module and its sidecar manifest.
pub fn module_stamp(module: &Path) -> io::Result<ModuleStamp> {
    let mut modified = fs::metadata(module)?.modified()?;
    if let Some(sidecar) = sidecar_path(module) {
        if let Ok(sidecar_modified) = fs::metadata(&sidecar).and_then(|meta| meta.modified()) {
            modified = modified.max(sidecar_modified);
        }
    }
    Ok(ModuleStamp::from_system_time(modified.max(SystemTime::UNIX_EPOCH)))
}

fn collect_from_dir(
    dir: &Path,
    pattern: &Pattern,
    scope: SearchScope,
    acc: &mut Vec<PathBuf>,
) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            if scope == SearchScope::AllDirectories {
                collect_from_dir(&path, pattern, scope, acc)?;
            }
            continue;
        }
        if !path.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if is_sidecar_name(name) || !pattern.matches(name) {
            continue;
        }
        acc.push(path);
    }
    Ok(())
}
