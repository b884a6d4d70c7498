use anyhow::{Context, Result};
use callstat::classify::{FileInfo, PathClassifier};
use callstat::cli::{Cli, OutputFormat};
use callstat::config::MonitorConfig;
use callstat::error::ResolveError;
use callstat::identity::IdentityResolver;
use callstat::monitor::PerfMonitor;
use callstat::reporter::{JsonSink, LogSink, ReportSink};
use clap::Parser;
use rand::Rng;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

const CACHE_DIR: &str = "/home/player/Zomboid";
const GAME_ROOT: &str = "/opt/game";

/// Initialize tracing subscriber; reports are logged at INFO
fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::from_default_env().add_directive(tracing::Level::TRACE.into())
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

/// Synthetic call sites are their own stable names
struct SyntheticResolver {
    classifier: PathClassifier,
}

impl IdentityResolver for SyntheticResolver {
    type Identity = str;

    fn resolve(&self, identity: &str) -> Result<String, ResolveError> {
        Ok(identity.to_string())
    }

    fn classify(&self, source_path: &str) -> FileInfo {
        self.classifier.classify(source_path)
    }
}

/// `"path:line"` names spread over game sources and two local mods
fn synthetic_sites(count: usize) -> Vec<String> {
    (0..count)
        .map(|i| match i % 3 {
            0 => format!("{}/media/lua/client/Site{:03}.lua:{}", GAME_ROOT, i, 10 + i),
            1 => format!("{}/mods/Hydrocraft/media/lua/server/Site{:03}.lua:{}", CACHE_DIR, i, 20 + i),
            _ => format!("{}/mods/BetterSorting/media/lua/shared/Site{:03}.lua:{}", CACHE_DIR, i, 5 + i),
        })
        .collect()
}

fn load_config(args: &Cli) -> Result<MonitorConfig> {
    let mut config = match &args.config {
        Some(path) => MonitorConfig::load(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => MonitorConfig::default(),
    };
    if let Some(secs) = args.report_interval_secs {
        config.report_interval_secs = secs;
    }
    if let Some(top) = args.top {
        config.report_top_n = top;
    }
    if args.exclude_builtin {
        config.exclude_builtin_entries = true;
    }
    config.validate()?;
    Ok(config)
}

fn run_workload(monitor: &PerfMonitor<SyntheticResolver>, sites: &[String], args: &Cli) {
    let deadline_ns = monitor
        .clock()
        .now_ns()
        .saturating_add(Duration::from_secs(args.duration_secs).as_nanos() as u64);

    crossbeam::scope(|scope| {
        for worker in 0..args.threads.max(1) {
            scope.spawn(move |_| {
                let mut rng = rand::thread_rng();
                let mut calls: u64 = 0;
                loop {
                    let now = monitor.clock().now_ns();
                    if now >= deadline_ns {
                        break;
                    }
                    // Low indices are hot: squaring skews the pick towards 0
                    let pick: f64 = rng.gen();
                    let index = ((pick * pick) * sites.len() as f64) as usize;
                    let site = &sites[index.min(sites.len() - 1)];
                    let duration_ns = rng.gen_range(5_000..2_000_000);
                    monitor.on_call_at(site, now, duration_ns);

                    calls += 1;
                    if calls % 256 == 0 {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                }
                tracing::debug!(worker, calls, "worker finished");
            });
        }
    })
    .unwrap_or_else(|_| tracing::warn!("a workload thread panicked"));
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.debug);

    let config = load_config(&args)?;
    let classifier = PathClassifier::new()
        .with_cache_dir(CACHE_DIR)
        .with_game_root(GAME_ROOT);

    let sink: Box<dyn ReportSink> = match args.format {
        OutputFormat::Text => Box::new(LogSink),
        OutputFormat::Json => Box::new(JsonSink::new(std::io::stdout())),
    };
    if args.sites == 0 {
        anyhow::bail!("--sites must be at least 1");
    }
    let monitor = PerfMonitor::new(SyntheticResolver { classifier }, &config)?.with_sink(sink);
    let sites = synthetic_sites(args.sites);

    tracing::info!(
        threads = args.threads,
        sites = sites.len(),
        duration_secs = args.duration_secs,
        "starting synthetic workload"
    );
    run_workload(&monitor, &sites, &args);

    let report = monitor.report_now();
    tracing::info!(
        rows = report.rows.len(),
        tracked = monitor.registry().tracked_sites(),
        excluded = monitor.registry().excluded_sites(),
        "final report published"
    );
    Ok(())
}
