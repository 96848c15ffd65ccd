//! Runtime helpers for locating the extractor binary.
//!
//! Centralizes executable detection and search order so the library, the
//! sample host, and the tests all find the same `plugin-extract`.

use std::env;
use std::path::{Path, PathBuf};

pub const EXTRACTOR_BINARY: &str = "plugin-extract";

/// Returns true when a file exists and has any execute bit set.
pub fn helper_is_executable(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = std::fs::metadata(path) {
            return meta.permissions().mode() & 0o111 != 0;
        }
        false
    }
    #[cfg(not(unix))]
    {
        true
    }
}

fn binary_file_name(name: &str) -> String {
    format!("{name}{}", env::consts::EXE_SUFFIX)
}

/// Candidate locations for a helper installed alongside `exe`.
///
/// Checks the executable's own directory first, then its parent, which
/// covers test binaries living in `target/<profile>/deps`.
pub fn sibling_helper_candidates(exe: &Path, name: &str) -> Vec<PathBuf> {
    let file_name = binary_file_name(name);
    let mut candidates = Vec::new();
    if let Some(dir) = exe.parent() {
        candidates.push(dir.join(&file_name));
        if let Some(parent) = dir.parent() {
            candidates.push(parent.join(&file_name));
        }
    }
    candidates
}

/// Find an executable by name somewhere on PATH.
pub fn find_on_path(name: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    let file_name = binary_file_name(name);
    for dir in env::split_paths(&paths) {
        let candidate = dir.join(&file_name);
        if helper_is_executable(&candidate) {
            return Some(candidate);
        }
    }
    None
}

/// Resolve the first executable helper next to the running binary.
pub fn resolve_sibling_helper(name: &str) -> Option<PathBuf> {
    let exe = env::current_exe().ok()?;
    sibling_helper_candidates(&exe, name)
        .into_iter()
        .find(|candidate| helper_is_executable(candidate))
}
