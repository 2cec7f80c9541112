//! ArrayShift CLI
//!
//! Rebalances JBOD data disks by moving allocation units between mounts.
//! Default behavior is a dry run that prints the plan; pass `--execute` to
//! move data.

use arrayshift_core::{format_bytes, parse_size, CoreError, Plan, RsyncMode, Strategy};
use arrayshift_rebalancer::engine::{Engine, EngineEvent};
use arrayshift_rebalancer::planner::Diagnostic;
use arrayshift_rebalancer::{
    build_plan, discover_disks, load_plan, save_plan, scan_units, CoreConfig, ScanError,
    TransferJournal,
};
use clap::Parser;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info, Level};

/// Process exit codes.
const EXIT_OK: i32 = 0;
const EXIT_GENERIC: i32 = 1;
const EXIT_USAGE: i32 = 2;
const EXIT_DISCOVERY: i32 = 3;
const EXIT_FAILED_MOVES: i32 = 4;

fn parse_mode(s: &str) -> Result<RsyncMode, CoreError> {
    s.parse()
}

fn parse_size_arg(s: &str) -> Result<u64, CoreError> {
    parse_size(s)
}

#[derive(Parser)]
#[command(name = "arrayshift")]
#[command(about = "Rebalance JBOD data disks by moving directory/file units between mounts")]
#[command(version)]
struct Cli {
    /// Optional TOML config file; flags override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Target maximum fill percent per disk (default 80); -1 auto-evens with headroom
    #[arg(long)]
    target_percent: Option<f64>,

    /// Headroom percent when auto-evening (default 5)
    #[arg(long)]
    headroom_percent: Option<f64>,

    /// Execute moves (default is dry-run)
    #[arg(long)]
    execute: bool,

    /// Comma list of disk names to include
    #[arg(long, value_delimiter = ',')]
    include_disks: Vec<String>,

    /// Comma list of disk names to exclude
    #[arg(long, value_delimiter = ',')]
    exclude_disks: Vec<String>,

    /// Comma list of shares to include (default: all)
    #[arg(long, value_delimiter = ',')]
    include_shares: Vec<String>,

    /// Comma list of shares to exclude (e.g. appdata,System)
    #[arg(long, value_delimiter = ',')]
    exclude_shares: Vec<String>,

    /// Comma list of globs matched against share/rel_path to skip
    #[arg(long, value_delimiter = ',')]
    exclude_globs: Vec<String>,

    /// Allocation unit depth under each share (0 = whole share per disk)
    #[arg(long)]
    unit_depth: Option<usize>,

    /// Only move units at least this large (default 1GiB)
    #[arg(long, value_parser = parse_size_arg)]
    min_unit_size: Option<u64>,

    /// Write the computed plan to this path
    #[arg(long)]
    save_plan: Option<PathBuf>,

    /// Load a plan from this path and skip planning
    #[arg(long)]
    load_plan: Option<PathBuf>,

    /// Rsync performance mode: fast, balanced or integrity
    #[arg(long, value_parser = parse_mode)]
    rsync_mode: Option<RsyncMode>,

    /// Comma list of extra rsync flags appended verbatim
    #[arg(long)]
    rsync_extra: Option<String>,

    /// Shed from the disks with the least free space first
    #[arg(long)]
    prioritize_low_space: bool,

    /// Merge into existing destination directories instead of failing
    #[arg(long)]
    allow_merge: bool,

    /// List rsync performance modes and exit
    #[arg(long)]
    list_rsync_modes: bool,

    /// Directory the data disks are mounted under
    #[arg(long)]
    mount_prefix: Option<PathBuf>,

    /// Directory for the transfer journal
    #[arg(long)]
    state_dir: Option<PathBuf>,

    /// Maximum concurrent moves (0 = half the disk count)
    #[arg(long)]
    max_parallel: Option<usize>,

    /// Soft timeout per move in hours (default 6)
    #[arg(long)]
    move_timeout_hours: Option<u64>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Write logs to this file in addition to stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
}

impl Cli {
    /// Fold command-line overrides into the configuration.
    fn apply_to(&self, mut config: CoreConfig) -> CoreConfig {
        if let Some(v) = self.target_percent {
            config.target_percent = v;
        }
        if let Some(v) = self.headroom_percent {
            config.headroom_percent = v;
        }
        if !self.include_disks.is_empty() {
            config.include_disks = self.include_disks.clone();
        }
        if !self.exclude_disks.is_empty() {
            config.exclude_disks = self.exclude_disks.clone();
        }
        if !self.include_shares.is_empty() {
            config.include_shares = self.include_shares.clone();
        }
        if !self.exclude_shares.is_empty() {
            config.exclude_shares = self.exclude_shares.clone();
        }
        if !self.exclude_globs.is_empty() {
            config.exclude_globs = self.exclude_globs.clone();
        }
        if let Some(v) = self.unit_depth {
            config.unit_depth = v;
        }
        if let Some(v) = self.min_unit_size {
            config.min_unit_size = v;
        }
        if let Some(v) = self.rsync_mode {
            config.rsync_mode = v;
        }
        if let Some(extra) = &self.rsync_extra {
            config.rsync_extra = extra
                .split(',')
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect();
        }
        if self.prioritize_low_space {
            config.strategy = Strategy::LowSpaceFirst;
        }
        if self.allow_merge {
            config.allow_merge = true;
        }
        if let Some(v) = &self.mount_prefix {
            config.mount_prefix = v.clone();
        }
        if let Some(v) = &self.state_dir {
            config.state_dir = v.clone();
        }
        if let Some(v) = self.max_parallel {
            config.max_parallel = v;
        }
        if let Some(v) = self.move_timeout_hours {
            config.move_timeout_secs = v * 60 * 60;
        }
        config
    }
}

fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    let base_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(base_level.into());

    match &cli.log_file {
        Some(path) => {
            let file = std::fs::File::create(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

fn print_rsync_modes() {
    println!("Available rsync performance modes:\n");
    for mode in [RsyncMode::Fast, RsyncMode::Balanced, RsyncMode::Integrity] {
        println!(
            "  {:>9}: {}",
            style(mode.to_string()).cyan().bold(),
            arrayshift_rebalancer::rsync::mode_description(mode)
        );
        println!(
            "           flags: {}",
            arrayshift_rebalancer::rsync::mode_flags(mode).join(" ")
        );
        println!();
    }
}

fn print_disks(disks: &[arrayshift_core::Disk]) {
    println!("{}", style("Discovered disks").bold());
    println!("{}", style("─".repeat(50)).dim());
    for d in disks {
        println!(
            "  {}: used {} ({:.1}%), free {}",
            style(&d.name).cyan(),
            format_bytes(d.used_bytes),
            d.fill_percent(),
            format_bytes(d.free_bytes)
        );
    }
    println!();
}

fn print_plan(plan: &Plan, diagnostics: &[Diagnostic]) {
    const PREVIEW: usize = 20;

    println!(
        "{} {} moves, {} to redistribute",
        style("Plan:").bold(),
        plan.moves.len(),
        format_bytes(plan.total_bytes())
    );
    for (i, m) in plan.moves.iter().take(PREVIEW).enumerate() {
        println!(
            "  {:>3}. {} | {} | {} -> {}",
            i + 1,
            m.unit.share_path(),
            format_bytes(m.size_bytes()),
            m.src_disk(),
            m.dest_disk
        );
    }
    if plan.moves.len() > PREVIEW {
        println!("  ... and {} more", plan.moves.len() - PREVIEW);
    }

    for diag in diagnostics {
        match diag {
            Diagnostic::Balanced => {
                println!("{}", style("Array is already balanced.").green());
            }
            Diagnostic::UnderServed { disk, remaining } => {
                println!(
                    "{} {disk} remains {} over its cap; no more units fit",
                    style("warning:").yellow().bold(),
                    format_bytes(*remaining)
                );
            }
            Diagnostic::NoFit { unit } => {
                println!(
                    "{} no destination can hold {} ({})",
                    style("warning:").yellow().bold(),
                    unit.share_path(),
                    format_bytes(unit.size_bytes)
                );
            }
        }
    }
    println!();
}

/// Render engine events onto a progress bar until the channel closes.
async fn render_progress(mut events: tokio::sync::mpsc::Receiver<EngineEvent>) {
    let bar = ProgressBar::hidden();
    bar.set_style(
        ProgressStyle::with_template(
            "{bar:30.cyan/blue} {bytes}/{total_bytes} ({bytes_per_sec}) {msg}",
        )
        .expect("static template"),
    );

    while let Some(event) = events.recv().await {
        match event {
            EngineEvent::MoveStarted { index, total, mv } => {
                bar.set_message(format!(
                    "[{}/{}] {} {} -> {}",
                    index + 1,
                    total,
                    mv.unit.share_path(),
                    mv.src_disk(),
                    mv.dest_disk
                ));
            }
            EngineEvent::Progress { .. } => {
                // Per-file progress feeds the overall position below.
            }
            EngineEvent::MoveFinished { mv, success, detail, .. } => {
                if success {
                    bar.println(format!(
                        "{} {} ({})",
                        style("moved").green(),
                        mv.unit.share_path(),
                        format_bytes(mv.size_bytes())
                    ));
                } else {
                    bar.println(format!(
                        "{} {}: {}",
                        style("failed").red().bold(),
                        mv.unit.share_path(),
                        detail
                    ));
                }
            }
            EngineEvent::Overall(overall) => {
                if bar.is_hidden() && overall.bytes_total > 0 {
                    bar.set_draw_target(indicatif::ProgressDrawTarget::stderr());
                    bar.set_length(overall.bytes_total);
                }
                bar.set_position(overall.bytes_moved);
            }
        }
    }
    bar.finish_and_clear();
}

async fn run(cli: Cli) -> i32 {
    if cli.list_rsync_modes {
        print_rsync_modes();
        return EXIT_OK;
    }

    // Config file, then environment, then flags.
    let config = match &cli.config {
        Some(path) => match CoreConfig::from_file(path) {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "Invalid config file");
                eprintln!("error: {e}");
                return EXIT_USAGE;
            }
        },
        None => CoreConfig::default(),
    };
    let config = cli.apply_to(config.with_env_overrides());
    if let Err(e) = config.validate() {
        eprintln!("error: {e}");
        return EXIT_USAGE;
    }

    // Step 1: discover disks.
    let disks = match discover_disks(&config) {
        Ok(d) => d,
        Err(e) => {
            eprintln!("error: {e}");
            return EXIT_DISCOVERY;
        }
    };
    print_disks(&disks);

    // Step 2 & 3: scan units and build the plan, unless one was supplied.
    let (plan, diagnostics) = if let Some(path) = &cli.load_plan {
        match load_plan(path, &config.mount_prefix) {
            Ok(plan) => (plan, Vec::new()),
            Err(e) => {
                eprintln!("error: {e}");
                return EXIT_GENERIC;
            }
        }
    } else {
        println!("Scanning allocation units (this can take a while)...");
        let units = match scan_units(&config, &disks) {
            Ok(u) => u,
            Err(ScanError::BadGlob { .. }) => {
                eprintln!("error: invalid --exclude-globs pattern");
                return EXIT_USAGE;
            }
            Err(ScanError::Discovery(e)) => {
                eprintln!("error: {e}");
                return EXIT_DISCOVERY;
            }
        };
        println!(
            "Found {} units totaling {}\n",
            units.len(),
            format_bytes(units.iter().map(|u| u.size_bytes).sum::<u64>())
        );

        match build_plan(&config, &disks, &units) {
            Ok(outcome) => (outcome.plan, outcome.diagnostics),
            Err(e) => {
                eprintln!("error: {e}");
                return EXIT_USAGE;
            }
        }
    };
    print_plan(&plan, &diagnostics);

    if let Some(path) = &cli.save_plan {
        if let Err(e) = save_plan(&plan, path) {
            eprintln!("error: {e}");
            return EXIT_GENERIC;
        }
        println!("Saved plan to {}", path.display());
    }

    if !cli.execute {
        println!(
            "{} pass --execute to perform these moves.",
            style("Dry run:").bold()
        );
        return EXIT_OK;
    }

    // Step 4: execute.
    let journal = match TransferJournal::open(&config.state_dir) {
        Ok(j) => j,
        Err(e) => {
            eprintln!("error: {e}");
            return EXIT_GENERIC;
        }
    };

    let (engine, events) = Engine::with_events(config.clone(), journal, &disks);
    let renderer = tokio::spawn(render_progress(events));

    let cancel = engine.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupt received; finishing in-flight moves...");
            cancel.store(true, Ordering::SeqCst);
        }
    });

    // Resume what a previous run left behind before starting new work.
    let recovered = match engine.recover().await {
        Ok(reports) => reports,
        Err(e) => {
            eprintln!("error: {e}");
            return EXIT_GENERIC;
        }
    };
    if !recovered.is_empty() {
        info!(count = recovered.len(), "Resumed orphaned transfers");
    }

    let result = match engine.execute(&plan).await {
        Ok(r) => r,
        Err(e) => {
            eprintln!("error: {e}");
            return EXIT_GENERIC;
        }
    };
    drop(engine);
    let _ = renderer.await;

    println!("\n{}", style("Run complete").bold());
    println!("{}", style("─".repeat(50)).dim());
    println!("  {}", result.summary());

    let failures = result.failed()
        + recovered
            .iter()
            .filter(|r| !r.outcome.is_success())
            .count();
    if failures > 0 {
        println!(
            "{} completed with {failures} failed move(s); see the log above.",
            style("warning:").yellow().bold()
        );
        EXIT_FAILED_MOVES
    } else {
        println!("{}", style("All moves completed successfully.").green());
        EXIT_OK
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = init_logging(&cli) {
        eprintln!("error: failed to initialize logging: {e}");
        std::process::exit(EXIT_GENERIC);
    }
    let code = run(cli).await;
    std::process::exit(code);
}
