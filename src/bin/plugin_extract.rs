//! Isolated metadata extractor.
//!
//! Spawned by the catalog once per module that needs extraction. Reads the
//! module's manifest, loading native code only when there is no sidecar and
//! `--no-native` was not passed, and prints one JSON extraction report on
//! stdout. Any failure exits with status 2 and a message on stderr; the
//! process (and whatever the module loaded into it) is then discarded.

use anyhow::{Context, Result};
use lazyplug::extractor::{ExtractArgs, ExtractionReport, inspect_module};
use lazyplug::catalog::absolute_module_path;
use lazyplug::logging::init_logging;
use std::env;
use std::io::{self, Write};

fn main() {
    init_logging();
    if let Err(err) = run() {
        eprintln!("{err:#}");
        std::process::exit(2);
    }
}

fn run() -> Result<()> {
    let args = ExtractArgs::parse(env::args_os().skip(1)).map_err(|err| {
        eprintln!("Usage: plugin-extract [--no-native] MODULE");
        err
    })?;
    let records = inspect_module(&args.module, args.allow_native)?;
    let module = absolute_module_path(&args.module).unwrap_or_else(|_| args.module.clone());
    tracing::debug!(module = %module.display(), records = records.len(), "manifest read");

    let report = ExtractionReport::new(module, records);
    let stdout = io::stdout();
    let mut out = stdout.lock();
    serde_json::to_writer(&mut out, &report).context("writing extraction report")?;
    out.write_all(b"\n")?;
    out.flush()?;
    Ok(())
}
