use std::io;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use harmoniq_plugin_db::{ManifestProber, PluginFormat, PluginList};
use harmoniq_plugin_scanner::{worker, PluginScanner, ScanEvent, ScannerConfig, WorkerConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "harmoniq-plugin-scanner")]
struct Args {
    /// Run as the isolated scan worker of another scanner process
    #[arg(long = "scan-worker", hide = true)]
    scan_worker: bool,

    /// Restrict scanning to the given plugin formats
    #[arg(
        long,
        value_name = "FORMAT",
        value_parser = parse_format,
        default_values_t = PluginFormat::ALL.to_vec(),
    )]
    formats: Vec<PluginFormat>,

    /// Additional paths to scan for plugins
    #[arg(long = "path", value_name = "PATH")]
    extra_paths: Vec<PathBuf>,

    /// Only scan the paths given with --path
    #[arg(long)]
    no_default_roots: bool,

    /// Scanner settings file (JSON)
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// How long a silent worker may take before it is considered hung
    #[arg(long, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Print the stored plugin list and unverified candidates without scanning
    #[arg(long)]
    list_only: bool,
}

fn parse_format(value: &str) -> Result<PluginFormat, String> {
    value
        .parse::<PluginFormat>()
        .map_err(|err| err.to_string())
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .try_init()
        .ok();

    let args = Args::parse();
    if args.scan_worker {
        // stdout carries the framed channel back to the master.
        let exit = worker::run(WorkerConfig::from_env(), ManifestProber, io::stdin(), io::stdout())?;
        tracing::debug!(?exit, "scan worker done");
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => ScannerConfig::load(path)
            .with_context(|| format!("failed to load scanner config {}", path.display()))?,
        None => ScannerConfig::default(),
    };
    config.search.roots.extend(args.extra_paths.iter().cloned());
    if args.no_default_roots {
        config.search.include_default_roots = false;
    }
    if let Some(timeout) = args.timeout_ms {
        config.launch_timeout = Duration::from_millis(timeout);
    }

    let scanner = PluginScanner::new(config).context("failed to open plugin list")?;
    if args.list_only {
        print_list(&scanner.plugin_list());
        for format in &args.formats {
            for key in scanner.unverified_plugins(*format) {
                println!("unverified {key}");
            }
        }
        return Ok(());
    }

    let events = scanner.subscribe();
    if !scanner.start_scan(&args.formats) {
        bail!("failed to launch the scan worker");
    }
    while let Ok(event) = events.receiver().recv() {
        match event {
            ScanEvent::ProbeStarted(identifier) => eprintln!("probing {identifier}"),
            ScanEvent::Progress(fraction) => eprintln!("{:>5.1}%", fraction * 100.0),
            ScanEvent::PluginListChanged => {}
            ScanEvent::Finished => break,
            ScanEvent::Failed(reason) => bail!("plugin scan failed: {reason}"),
        }
    }

    print_list(&scanner.plugin_list());
    Ok(())
}

fn print_list(list: &PluginList) {
    for plugin in list.descriptions() {
        println!("{} ({})", plugin.name(), plugin.format());
    }
    for identifier in list.blacklist() {
        println!("blacklisted {identifier}");
    }
}
