use anyhow::{Context, Result, bail};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use sessiondex::config::{self, Config};
use sessiondex::debug_log;
use sessiondex::engine::Engine;
use sessiondex::error::Cancelled;
use sessiondex::filter::{DaySelection, FilterOutput, FilterState};
use sessiondex::path_tree::PathTreeNode;
use sessiondex::types::{DateDimension, MonthKey, Scope, SessionRecord, SortOrder};
use sessiondex::utils::format_bytes;
use sessiondex::watcher::{FileWatcher, RescanDebouncer};

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "sessiondex")]
#[command(version)]
#[command(disable_help_subcommand = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override the sessions root from the config file
    #[arg(long, global = true)]
    root: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// List sessions, filtered and grouped by day
    List(ListArgs),
    /// Fully parse sessions and print authoritative counts
    Enrich(EnrichArgs),
    /// Find sessions whose transcript contains a term
    Search(SearchArgs),
    /// Session counts per working directory
    Tree(OutputArgs),
    /// Per-day session counts for a month
    Calendar(CalendarArgs),
    /// Rescan whenever transcripts change
    Watch(WatchArgs),
    /// Manage configuration
    Config(ConfigArgs),
}

#[derive(Args, Clone, Copy)]
struct OutputArgs {
    /// Output JSON instead of text
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Pretty-print JSON
    #[arg(long, default_value_t = false)]
    pretty: bool,
}

#[derive(Args)]
struct ListArgs {
    /// `all`, a month (YYYY-MM) or a day (YYYY-MM-DD)
    #[arg(long, default_value = "all")]
    scope: Scope,

    /// Only sessions whose working directory lies under this path
    #[arg(long)]
    dir: Option<String>,

    /// Only sessions of this project (or one nested below it)
    #[arg(long)]
    project: Option<String>,

    /// Only sessions on these days (repeatable)
    #[arg(long = "day")]
    days: Vec<NaiveDate>,

    /// created or updated
    #[arg(long, default_value = "created")]
    dimension: DateDimension,

    /// Case-insensitive text to match against titles and notes
    #[arg(long, short)]
    query: Option<String>,

    /// Also search transcript contents for the query
    #[arg(long, default_value_t = false)]
    deep: bool,

    /// updated, updated-asc, created, created-asc, size or events
    #[arg(long, default_value = "updated")]
    sort: SortOrder,

    /// Fully parse every listed session first
    #[arg(long, default_value_t = false)]
    enrich: bool,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args)]
struct EnrichArgs {
    /// Transcript files; enrich the whole scope when omitted
    paths: Vec<PathBuf>,

    #[arg(long, default_value = "all")]
    scope: Scope,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args)]
struct SearchArgs {
    term: String,

    #[arg(long, default_value = "all")]
    scope: Scope,
}

#[derive(Args)]
struct CalendarArgs {
    /// Month as YYYY-MM
    month: MonthKey,

    #[arg(long, default_value = "updated")]
    dimension: DateDimension,

    /// Skip the deep day-coverage scan and print the single-day approximation
    #[arg(long, default_value_t = false)]
    quick: bool,

    #[command(flatten)]
    output: OutputArgs,
}

#[derive(Args)]
struct WatchArgs {
    #[arg(long, default_value = "all")]
    scope: Scope,
}

#[derive(Args)]
struct ConfigArgs {
    #[command(subcommand)]
    subcommand: ConfigSubcommands,
}

#[derive(Subcommand)]
enum ConfigSubcommands {
    /// Create default configuration file
    Init {
        #[arg(long, default_value_t = false)]
        overwrite: bool,
    },
    /// Show current configuration
    Show,
}

#[tokio::main]
async fn main() {
    debug_log::init();
    let cli = Cli::parse();

    if let Commands::Config(config_args) = cli.command {
        handle_config_subcommand(config_args);
        return;
    }

    let mut config = match Config::load() {
        Ok(config) => config.unwrap_or_default(),
        Err(e) => {
            eprintln!("Config error: {e:#}");
            std::process::exit(1);
        }
    };
    if let Some(root) = cli.root {
        config.paths.sessions_root = Some(root);
    }

    let engine = match Engine::open(&config) {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            eprintln!("Error opening session index: {e:#}");
            std::process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::List(args) => run_list(&engine, args),
        Commands::Enrich(args) => run_enrich(&engine, args),
        Commands::Search(args) => run_search(&engine, args),
        Commands::Tree(output) => run_tree(&engine, output),
        Commands::Calendar(args) => run_calendar(&engine, args),
        Commands::Watch(args) => run_watch(Arc::clone(&engine), args, &config).await,
        Commands::Config(_) => Ok(()),
    };

    engine.shutdown();
    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn print_json<T: serde::Serialize>(value: &T, output: OutputArgs) -> Result<()> {
    let json = if output.pretty {
        simd_json::to_string_pretty(value)?
    } else {
        simd_json::to_string(value)?
    };
    println!("{json}");
    Ok(())
}

/// Scan `scope`, printing skipped files to stderr.
fn refresh(engine: &Engine, scope: Scope) {
    let scan = engine.refresh(scope);
    if let Some(condition) = &scan.condition {
        eprintln!("Warning: {condition}");
    }
    for warning in &scan.warnings {
        eprintln!("Skipped: {warning}");
    }
}

fn enrich_all(engine: &Engine) {
    engine.start_enrichment(|_| {}).join();
}

fn print_record_line(record: &SessionRecord, dimension: DateDimension) {
    let when = record.timestamp_for(dimension).format("%H:%M");
    let title = record.title.as_deref().unwrap_or("(untitled)");
    let cwd = record.cwd.as_deref().unwrap_or("-");
    let marker = if record.is_enriched() { ' ' } else { '~' };
    println!(
        "  {when} {marker}{:>5} events {:>10}  {title}  [{cwd}]",
        record.total_events,
        format_bytes(record.file_size),
    );
}

fn print_sections(output: &FilterOutput) {
    for section in &output.sections {
        let minutes = section.total_duration.num_minutes();
        println!(
            "{}  {} sessions, {} events, {}h{:02}m",
            section.date,
            section.len(),
            section.total_events,
            minutes / 60,
            minutes % 60
        );
        for record in &section.records {
            print_record_line(record, output.state.dimension);
        }
    }
    println!("{} sessions", output.total);
}

fn run_list(engine: &Engine, args: ListArgs) -> Result<()> {
    refresh(engine, args.scope);
    if args.enrich {
        enrich_all(engine);
    }

    let query = args.query.unwrap_or_default();
    if args.deep && !query.trim().is_empty() {
        engine
            .search(&query)
            .map_err(|_| anyhow::anyhow!("search was cancelled"))?;
    }
    if args.dimension == DateDimension::Updated {
        let months: BTreeSet<MonthKey> = args.days.iter().map(|d| MonthKey::of(*d)).collect();
        for month in months {
            if let Err(Cancelled) = engine.load_coverage(month) {
                eprintln!("Coverage scan for {month} was cancelled; multi-day sessions count on their last day only");
            }
        }
    }

    let days = match args.days.len() {
        0 => DaySelection::None,
        1 => DaySelection::Single(args.days[0]),
        _ => DaySelection::Set(args.days.into_iter().collect()),
    };
    let state = FilterState {
        directory: args.dir,
        project: args.project,
        days,
        dimension: args.dimension,
        query,
        sort: args.sort,
    };
    let output = engine
        .filter_now(state)
        .map_err(|_| anyhow::anyhow!("filter was cancelled"))?;

    if args.output.json {
        let records: Vec<&SessionRecord> = output.records().collect();
        print_json(&records, args.output)
    } else {
        print_sections(&output);
        Ok(())
    }
}

fn run_enrich(engine: &Engine, args: EnrichArgs) -> Result<()> {
    let records = if args.paths.is_empty() {
        refresh(engine, args.scope);
        enrich_all(engine);
        engine.records().iter().cloned().collect::<Vec<_>>()
    } else {
        let mut records = Vec::with_capacity(args.paths.len());
        for path in &args.paths {
            let record = engine
                .enrich_one(path)
                .with_context(|| format!("Failed to enrich {}", path.display()))?;
            records.push(record);
        }
        records
    };

    if args.output.json {
        return print_json(&records, args.output);
    }
    for record in &records {
        let counts = &record.role_counts;
        println!(
            "{}  user {} assistant {} system {} other {}  tools {}  events {}  lines {}  {}",
            record.id,
            counts.user,
            counts.assistant,
            counts.system,
            counts.other,
            record.tool_invocations,
            record.total_events,
            record.total_lines,
            record.model.as_deref().unwrap_or("-"),
        );
    }
    Ok(())
}

fn run_search(engine: &Engine, args: SearchArgs) -> Result<()> {
    refresh(engine, args.scope);
    let hits = engine
        .search(&args.term)
        .map_err(|_| anyhow::anyhow!("search was cancelled"))?;

    let records = engine.records();
    let mut matched: Vec<&SessionRecord> = records.iter().filter(|r| hits.ids.contains(&r.id)).collect();
    matched.sort_by_key(|r| std::cmp::Reverse(r.last_updated_at));
    for record in &matched {
        println!(
            "{}  {}  {}",
            record.last_updated_at.format("%Y-%m-%d %H:%M"),
            record.id,
            record.path.display()
        );
    }
    println!("{} matching sessions", matched.len());
    Ok(())
}

fn print_tree(node: &PathTreeNode, depth: usize) {
    for child in node.children.values() {
        println!("{:indent$}{} ({})", "", child.segment, child.count, indent = depth * 2);
        print_tree(child, depth + 1);
    }
}

fn run_tree(engine: &Engine, output: OutputArgs) -> Result<()> {
    let tree = engine.directory_counts();
    if output.json {
        return print_json(tree.root(), output);
    }
    print_tree(tree.root(), 0);
    println!("{} sessions", tree.total());
    Ok(())
}

fn run_calendar(engine: &Engine, args: CalendarArgs) -> Result<()> {
    // Sessions updated in the month can live in earlier creation partitions.
    let scope = match args.dimension {
        DateDimension::Created => Scope::Month(args.month),
        DateDimension::Updated => Scope::All,
    };
    refresh(engine, scope);
    if args.dimension == DateDimension::Updated && !args.quick {
        engine
            .load_coverage(args.month)
            .map_err(|_| anyhow::anyhow!("coverage scan was cancelled"))?;
    }

    let counts = engine.calendar_counts(args.month, args.dimension);
    if args.output.json {
        let keyed: BTreeMap<String, u32> = counts.iter().map(|(d, c)| (d.to_string(), *c)).collect();
        return print_json(&keyed, args.output);
    }
    for day in 1..=args.month.days() {
        let count = counts.get(&day).copied().unwrap_or(0);
        if count > 0 {
            println!("{}-{day:02}  {count}", args.month);
        }
    }
    Ok(())
}

async fn run_watch(engine: Arc<Engine>, args: WatchArgs, config: &Config) -> Result<()> {
    if !engine.root().is_dir() {
        bail!("sessions directory does not exist: {}", engine.root().display());
    }
    let watcher = FileWatcher::new(engine.root())?;
    let mut debouncer = RescanDebouncer::new(config.timing.rescan_debounce());
    refresh(&engine, args.scope);
    println!("Watching {} ({} sessions)", engine.root().display(), engine.records().len());

    let stop = Arc::new(AtomicBool::new(false));
    let worker = {
        let engine = Arc::clone(&engine);
        let stop = Arc::clone(&stop);
        tokio::task::spawn_blocking(move || {
            while !stop.load(Ordering::Relaxed) {
                let Some(request) = watcher.pump(&mut debouncer, Duration::from_millis(500)) else {
                    continue;
                };
                let Some(scan) = engine.rescan() else {
                    continue;
                };
                println!(
                    "{} files changed: {} sessions ({} reparsed)",
                    request.len(),
                    scan.records.len(),
                    scan.stats.parsed
                );
                let records = engine.records();
                let changed: Vec<SessionRecord> = records
                    .iter()
                    .filter(|r| request.changed.contains(&r.path))
                    .cloned()
                    .collect();
                if let Some(active) = engine.poll_activity(&changed)
                    && !active.is_empty()
                {
                    let mut active: Vec<String> = active.into_iter().collect();
                    active.sort();
                    println!("active: {}", active.join(", "));
                }
            }
        })
    };

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    stop.store(true, Ordering::Relaxed);
    worker.await.context("Watch loop panicked")?;
    Ok(())
}

fn handle_config_subcommand(config_args: ConfigArgs) {
    match config_args.subcommand {
        ConfigSubcommands::Init { overwrite } => {
            if let Err(e) = config::create_default_config(overwrite) {
                eprintln!("Error creating config: {e}");
                std::process::exit(1);
            }
        }
        ConfigSubcommands::Show => {
            if let Err(e) = config::show_config() {
                eprintln!("Error showing config: {e}");
                std::process::exit(1);
            }
        }
    }
}
