//! Sample host for the lazy plugin catalog.
//!
//! Lists every discovered capability with its metadata and whether its module
//! is mapped into this process, then activates the capabilities named with
//! `--activate` and shows the load state again.

use anyhow::{Result, bail};
use lazyplug::logging::init_logging;
use lazyplug::{CatalogOptions, DirectoryCatalog, SearchScope, Snapshot, is_loaded_in_process};
use std::collections::BTreeSet;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

fn main() {
    init_logging();
    if let Err(err) = run() {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let args = CliArgs::parse()?;
    let mut options = CatalogOptions::from_env(&args.root, &args.pattern).scope(args.scope);
    if let Some(dir) = args.cache_dir {
        options = options.cache_dir(dir);
    }
    if let Some(program) = args.extractor {
        options = options.extractor(program);
    }
    if let Some(timeout) = args.timeout {
        options = options.extract_timeout(timeout);
    }

    let catalog = DirectoryCatalog::with_options(options)?;
    let report = catalog.last_report();
    for failure in &report.failures {
        eprintln!("warning: {failure}");
    }

    let parts = catalog.parts();
    println!(
        "Discovered {} part(s) in {} module(s)",
        parts.len(),
        report.scanned.len()
    );
    print_parts(&parts);

    let mut failed = false;
    for name in &args.activate {
        let handles: Vec<_> = parts.import_many(name).collect();
        if handles.is_empty() {
            eprintln!("No part exports '{name}'");
            failed = true;
            continue;
        }
        for handle in handles {
            println!("Activating {name} by requesting its value");
            match handle.value() {
                Ok(extension) => extension.initialize(),
                Err(err) => {
                    eprintln!("{err}");
                    failed = true;
                }
            }
        }
        print_load_state(&parts);
    }

    if failed {
        bail!("one or more activations failed");
    }
    Ok(())
}

fn print_parts(parts: &Snapshot) {
    for record in parts.records() {
        let attributes = record
            .attributes
            .iter()
            .map(|attr| format!("{}={}", attr.key, attr.value))
            .collect::<Vec<_>>()
            .join(", ");
        println!(
            "  {} [{}] from {}",
            record.exported_name,
            attributes,
            record.source_module_path.display()
        );
    }
    print_load_state(parts);
}

fn print_load_state(parts: &Snapshot) {
    let modules: BTreeSet<&PathBuf> = parts
        .records()
        .map(|record| &record.source_module_path)
        .collect();
    for module in modules {
        println!(
            "  Is {} loaded: {}",
            module.display(),
            is_loaded_in_process(module)
        );
    }
}

struct CliArgs {
    root: PathBuf,
    pattern: String,
    scope: SearchScope,
    cache_dir: Option<PathBuf>,
    extractor: Option<PathBuf>,
    timeout: Option<Duration>,
    activate: Vec<String>,
}

impl CliArgs {
    fn parse() -> Result<Self> {
        let mut args_iter = env::args().skip(1);
        let mut scope = SearchScope::TopDirectoryOnly;
        let mut cache_dir = None;
        let mut extractor = None;
        let mut timeout = None;
        let mut activate = Vec::new();
        let mut positionals = Vec::new();

        while let Some(arg) = args_iter.next() {
            match arg.as_str() {
                "--recursive" => scope = SearchScope::AllDirectories,
                "--cache" => cache_dir = Some(PathBuf::from(required(&mut args_iter, &arg))),
                "--extractor" => extractor = Some(PathBuf::from(required(&mut args_iter, &arg))),
                "--timeout-ms" => {
                    let value = required(&mut args_iter, &arg);
                    let Ok(ms) = value.parse::<u64>() else {
                        bail!("--timeout-ms expects milliseconds, got '{value}'");
                    };
                    timeout = Some(Duration::from_millis(ms));
                }
                "--activate" => activate.push(required(&mut args_iter, &arg)),
                "-h" | "--help" => usage(),
                _ if arg.starts_with("--") => {
                    eprintln!("Unknown option: {arg}");
                    usage();
                }
                _ => positionals.push(arg),
            }
        }

        let (root, pattern) = match positionals.as_slice() {
            [root] => (PathBuf::from(root), default_pattern()),
            [root, pattern] => (PathBuf::from(root), pattern.clone()),
            _ => usage(),
        };

        Ok(Self {
            root,
            pattern,
            scope,
            cache_dir,
            extractor,
            timeout,
            activate,
        })
    }
}

fn required(args_iter: &mut impl Iterator<Item = String>, flag: &str) -> String {
    args_iter.next().unwrap_or_else(|| {
        eprintln!("Missing value for {flag}");
        usage();
    })
}

fn default_pattern() -> String {
    format!("*{}", env::consts::DLL_SUFFIX)
}

fn usage() -> ! {
    eprintln!(
        "Usage: plugin-catalog [--recursive] [--cache DIR] [--extractor PATH] [--timeout-ms N] [--activate NAME]... ROOT [PATTERN]\n\nPATTERN defaults to '*{}'.\n\nEnvironment:\n  LAZYPLUG_CACHE_DIR         Metadata cache directory (default: <temp>/lazyplug-cache).\n  LAZYPLUG_EXTRACTOR         Path to the plugin-extract helper.\n  LAZYPLUG_EXTRACT_TIMEOUT_MS  Per-module extraction timeout.\n  LAZYPLUG_LOG               tracing filter for diagnostics (default: warn).",
        env::consts::DLL_SUFFIX
    );
    std::process::exit(1);
}
