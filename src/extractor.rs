//! Isolated metadata extraction.
//!
//! The host never opens a module itself. `ProcessExtractor` runs the
//! `plugin-extract` helper as a child process per module; the child reads the
//! module's manifest (loading native code only inside its own address space)
//! and prints one JSON report on stdout. Whatever the outcome, the child and
//! its process group are gone before `extract` returns.

use crate::catalog::{MetadataRecord, absolute_module_path};
use crate::error::{ExtractionError, ExtractionFailure};
use crate::manifest::PluginManifest;
use crate::native;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub const EXTRACT_REPORT_VERSION: &str = "lazyplug_extract_v1";
pub const NO_NATIVE_FLAG: &str = "--no-native";

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Produces metadata records for one module without loading it in the host.
pub trait Extractor: Send + Sync {
    fn extract(&self, module: &Path) -> Result<Vec<MetadataRecord>, ExtractionError>;
}

#[derive(Debug, Serialize, Deserialize)]
/// What the extractor child prints on success.
pub struct ExtractionReport {
    pub schema_version: String,
    pub module: PathBuf,
    pub records: Vec<MetadataRecord>,
}

impl ExtractionReport {
    pub fn new(module: PathBuf, records: Vec<MetadataRecord>) -> Self {
        Self {
            schema_version: EXTRACT_REPORT_VERSION.to_string(),
            module,
            records,
        }
    }
}

/// Read a module's declared exports in the current process.
///
/// This is what the extractor child runs. The sidecar manifest wins because
/// reading it executes nothing; the embedded native manifest is a fallback
/// and requires `allow_native`.
pub fn inspect_module(module: &Path, allow_native: bool) -> Result<Vec<MetadataRecord>> {
    if !module.is_file() {
        bail!("module {} does not exist", module.display());
    }
    let module = absolute_module_path(module)
        .with_context(|| format!("resolving {}", module.display()))?;

    if let Some(manifest) = PluginManifest::from_sidecar(&module)? {
        return manifest.into_records(&module);
    }
    if !allow_native {
        bail!(
            "module {} has no sidecar manifest and native inspection is disabled",
            module.display()
        );
    }
    let text = native::read_embedded_manifest(&module)?;
    PluginManifest::from_json_str(&text, &module.display().to_string())?.into_records(&module)
}

/// Runs the extractor helper binary once per module.
#[derive(Clone, Debug)]
pub struct ProcessExtractor {
    program: PathBuf,
    timeout: Duration,
    allow_native: bool,
}

impl ProcessExtractor {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
            allow_native: true,
        }
    }

    pub fn allow_native(mut self, allow: bool) -> Self {
        self.allow_native = allow;
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn command(&self, module: &Path) -> Command {
        let mut command = Command::new(&self.program);
        if !self.allow_native {
            command.arg(NO_NATIVE_FLAG);
        }
        command
            .arg(module)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        command
    }
}

impl Extractor for ProcessExtractor {
    fn extract(&self, module: &Path) -> Result<Vec<MetadataRecord>, ExtractionError> {
        let fail = |kind| ExtractionError::new(module, kind);
        let started = Instant::now();

        let child = self.command(module).spawn().map_err(|err| {
            fail(ExtractionFailure::Spawn(format!(
                "{}: {err}",
                self.program.display()
            )))
        })?;
        let mut guard = ChildGuard::new(child);
        let stdout = guard.drain_stdout();
        let stderr = guard.drain_stderr();

        let status = match guard.wait_with_timeout(self.timeout) {
            Ok(Some(status)) => status,
            Ok(None) => {
                guard.terminate();
                return Err(fail(ExtractionFailure::Timeout(self.timeout)));
            }
            Err(err) => {
                guard.terminate();
                return Err(fail(ExtractionFailure::Spawn(format!(
                    "waiting for extractor: {err}"
                ))));
            }
        };
        let stdout = join_output(stdout);
        let stderr = join_output(stderr);

        if let Some(failure) = status_failure(status, &stderr) {
            return Err(fail(failure));
        }

        let report: ExtractionReport = serde_json::from_slice(&stdout)
            .map_err(|err| fail(ExtractionFailure::Malformed(err.to_string())))?;
        if report.schema_version != EXTRACT_REPORT_VERSION {
            return Err(fail(ExtractionFailure::Malformed(format!(
                "unexpected report version '{}'",
                report.schema_version
            ))));
        }
        let requested = absolute_module_path(module).unwrap_or_else(|_| module.to_path_buf());
        if let Some(mismatch) = report_mismatch(&report, &requested) {
            return Err(fail(ExtractionFailure::Malformed(mismatch)));
        }

        debug!(
            module = %module.display(),
            records = report.records.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "isolated extraction finished"
        );
        info!(module = %module.display(), "extracted module metadata");
        Ok(report.records)
    }
}

/// Describe how a report disagrees with the module it was requested for.
fn report_mismatch(report: &ExtractionReport, requested: &Path) -> Option<String> {
    if report.module != requested {
        return Some(format!(
            "report describes {}, expected {}",
            report.module.display(),
            requested.display()
        ));
    }
    report
        .records
        .iter()
        .find(|record| record.source_module_path != requested)
        .map(|record| {
            format!(
                "record '{}' claims module {}",
                record.exported_name,
                record.source_module_path.display()
            )
        })
}

fn status_failure(status: ExitStatus, stderr: &[u8]) -> Option<ExtractionFailure> {
    if status.success() {
        return None;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Some(ExtractionFailure::Crashed(signal));
        }
    }
    let detail = String::from_utf8_lossy(stderr)
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("no diagnostics")
        .to_string();
    Some(ExtractionFailure::Failed {
        code: status.code().unwrap_or(-1),
        detail,
    })
}

fn join_output(reader: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

/// Owns the extractor child and tears it down on every exit path.
struct ChildGuard {
    child: Child,
    reaped: bool,
}

impl ChildGuard {
    fn new(child: Child) -> Self {
        Self {
            child,
            reaped: false,
        }
    }

    fn drain_stdout(&mut self) -> Option<JoinHandle<Vec<u8>>> {
        self.child.stdout.take().map(spawn_reader)
    }

    fn drain_stderr(&mut self) -> Option<JoinHandle<Vec<u8>>> {
        self.child.stderr.take().map(spawn_reader)
    }

    fn wait_with_timeout(&mut self, timeout: Duration) -> io::Result<Option<ExitStatus>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.poll_exit()? {
                return Ok(Some(status));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Reap the leader once it has exited.
    ///
    /// While the exited leader is unreaped its pid, and so the group id,
    /// cannot be reused; the group is killed in that window so grandchildren
    /// holding the pipes die with it.
    #[cfg(any(target_os = "linux", target_os = "android"))]
    fn poll_exit(&mut self) -> io::Result<Option<ExitStatus>> {
        if !leader_exited(&self.child)? {
            return Ok(None);
        }
        kill_group(&self.child);
        let status = self.child.wait()?;
        self.reaped = true;
        Ok(Some(status))
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    fn poll_exit(&mut self) -> io::Result<Option<ExitStatus>> {
        let status = self.child.try_wait()?;
        if status.is_some() {
            self.reaped = true;
        }
        Ok(status)
    }

    /// Kill the group and reap the leader. A reaped leader no longer pins its
    /// group id, so nothing is signalled after that.
    fn terminate(&mut self) {
        if self.reaped {
            return;
        }
        kill_group(&self.child);
        let _ = self.child.kill();
        let _ = self.child.wait();
        self.reaped = true;
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if !self.reaped {
            self.terminate();
        }
    }
}

#[cfg(unix)]
fn kill_group(child: &Child) {
    // The child leads its own process group (see `process_group(0)`).
    let pgid = child.id() as libc::pid_t;
    unsafe {
        libc::kill(-pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_child: &Child) {}

/// Whether the leader has exited, leaving it waitable (`WNOWAIT`).
#[cfg(any(target_os = "linux", target_os = "android"))]
fn leader_exited(child: &Child) -> io::Result<bool> {
    let mut info: libc::siginfo_t = unsafe { std::mem::zeroed() };
    let rc = unsafe {
        libc::waitid(
            libc::P_PID,
            child.id() as libc::id_t,
            &mut info,
            libc::WEXITED | libc::WNOHANG | libc::WNOWAIT,
        )
    };
    if rc == -1 {
        return Err(io::Error::last_os_error());
    }
    Ok(unsafe { info.si_pid() } != 0)
}

fn spawn_reader<R: Read + Send + 'static>(mut source: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = source.read_to_end(&mut buf);
        buf
    })
}

/// Arguments understood by the extractor binary.
pub struct ExtractArgs {
    pub allow_native: bool,
    pub module: PathBuf,
}

impl ExtractArgs {
    pub fn parse(args: impl IntoIterator<Item = OsString>) -> Result<Self> {
        let mut allow_native = true;
        let mut module = None;
        for arg in args {
            if arg == NO_NATIVE_FLAG {
                allow_native = false;
                continue;
            }
            if arg.to_str().is_some_and(|value| value.starts_with("--")) {
                bail!("Unknown option: {}", arg.to_string_lossy());
            }
            if module.replace(PathBuf::from(arg)).is_some() {
                bail!("expected exactly one module path");
            }
        }
        let module = module.context("missing module path")?;
        Ok(Self {
            allow_native,
            module,
        })
    }
}
