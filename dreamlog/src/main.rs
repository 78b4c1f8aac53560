use std::{
    path::{Path, PathBuf},
    process::Command,
};

use anyhow::{Context, Result, bail};
use chrono::{Local, NaiveDate};
use clap::{Args, Parser, Subcommand};
use dreamlog::backup;
use dreamlog::config::Settings;
use dreamlog::core::{DreamFields, DreamType, EntryKind, EntryRecord, SleepCycle, Technique};
use dreamlog::index::EntryStamp;
use dreamlog::logging;
use dreamlog::stats;
use dreamlog::store::{EntryDraft, EntryStore};
use dreamlog::sync::SyncEngine;
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(
    name = "dreamlog",
    about = "Dream and journal entries stored as dated text files",
    version
)]
struct Cli {
    /// Settings file (JSON).
    #[arg(long, global = true, default_value = "settings.json")]
    settings: PathBuf,
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Work with dream entries.
    Dream {
        #[command(subcommand)]
        action: StoreAction,
    },

    /// Work with journal entries.
    Journal {
        #[command(subcommand)]
        action: StoreAction,
    },

    /// Print the log file.
    Logs,

    /// Empty the log file.
    ClearLogs,

    /// Check that the configured directories exist.
    Check,
}

#[derive(Debug, Subcommand)]
enum StoreAction {
    /// List entries, newest first.
    List(ListArgs),

    /// Print one entry.
    Show {
        /// 1-based position in `list`.
        position: usize,
    },

    /// Find entries containing some text (case-insensitive).
    Search { query: String },

    /// Create a blank entry.
    New(NewArgs),

    /// Open an entry in the configured editor.
    Edit {
        /// 1-based position in `list`.
        position: usize,
    },

    /// Delete an entry file.
    Delete {
        /// 1-based position in `list`.
        position: usize,
    },

    /// Import new entries from an export file.
    Sync(SyncArgs),

    /// Summarize the store.
    Stats(StatsArgs),

    /// Entries per day between two months.
    Graph(GraphArgs),

    /// Write every entry into one file in the backup directory.
    Backup,
}

#[derive(Debug, Args)]
struct ListArgs {
    /// Emit JSON instead of a table.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct NewArgs {
    /// Entry date (MM/DD/YYYY).
    #[arg(long, value_parser = parse_entry_date)]
    date: NaiveDate,
    #[arg(long)]
    title: Option<String>,
    /// Dream types, comma separated (dreams only).
    #[arg(long, value_delimiter = ',')]
    dream_type: Vec<DreamType>,
    #[arg(long)]
    technique: Option<Technique>,
    #[arg(long)]
    sleep_cycle: Option<SleepCycle>,
    /// Open the new entry in the editor.
    #[arg(long)]
    edit: bool,
}

#[derive(Debug, Args)]
struct SyncArgs {
    /// Export file to read instead of the configured one.
    #[arg(long)]
    file: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct StatsArgs {
    /// Emit JSON instead of a report.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct GraphArgs {
    /// First month (YYYY-MM).
    #[arg(long, value_parser = parse_month_arg)]
    from: NaiveDate,
    /// Last month, inclusive (YYYY-MM).
    #[arg(long, value_parser = parse_month_arg)]
    to: NaiveDate,
    /// Count only dreams of this type.
    #[arg(long)]
    only: Option<DreamType>,
}

#[derive(Debug, Serialize)]
struct ListRow {
    position: usize,
    path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    record: Option<EntryRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli.settings)?;
    let _guard = logging::init(&settings.log_file(), cli.verbose)?;

    match cli.command {
        Commands::Dream { action } => handle_store(&settings, EntryKind::Dream, action),
        Commands::Journal { action } => handle_store(&settings, EntryKind::Journal, action),
        Commands::Logs => handle_logs(&settings),
        Commands::ClearLogs => {
            logging::clear_log(&settings.log_file())?;
            println!("Cleared {:?}", settings.log_file());
            Ok(())
        }
        Commands::Check => {
            settings.validate()?;
            println!("All configured directories exist.");
            Ok(())
        }
    }
}

fn handle_store(settings: &Settings, kind: EntryKind, action: StoreAction) -> Result<()> {
    settings.validate()?;
    let store = EntryStore::new(settings.store_root(kind), kind);

    match action {
        StoreAction::List(args) => handle_list(&store, args),
        StoreAction::Show { position } => handle_show(&store, position),
        StoreAction::Search { query } => handle_search(&store, &query),
        StoreAction::New(args) => handle_new(&store, settings, args),
        StoreAction::Edit { position } => {
            let path = resolve_position(&store.list()?, position)?;
            open_editor(settings, &path)
        }
        StoreAction::Delete { position } => {
            let path = resolve_position(&store.list()?, position)?;
            store.delete(&path)?;
            println!("Deleted {:?}", path);
            Ok(())
        }
        StoreAction::Sync(args) => handle_sync(&store, settings, args),
        StoreAction::Stats(args) => handle_stats(&store, args),
        StoreAction::Graph(args) => handle_graph(&store, args),
        StoreAction::Backup => handle_backup(&store, settings),
    }
}

fn handle_list(store: &EntryStore, args: ListArgs) -> Result<()> {
    let rows: Vec<ListRow> = store
        .list()?
        .into_iter()
        .enumerate()
        .map(|(idx, path)| {
            let (record, error) = match store.read(&path) {
                Ok(record) => (Some(record), None),
                Err(err) => (None, Some(format!("{err:#}"))),
            };
            ListRow {
                position: idx + 1,
                path,
                record,
                error,
            }
        })
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&rows)?);
        return Ok(());
    }

    if rows.is_empty() {
        eprintln!("No {} entries yet.", store.kind());
        return Ok(());
    }
    for row in &rows {
        match &row.record {
            Some(record) => println!(
                "{:>4}  {:<20}  {}",
                row.position, record.display_date, record.title
            ),
            None => println!("{:>4}  {:<20}  {:?}", row.position, "(unreadable)", row.path),
        }
    }
    Ok(())
}

fn handle_show(store: &EntryStore, position: usize) -> Result<()> {
    let path = resolve_position(&store.list()?, position)?;
    let record = store.read(&path)?;

    println!("{}  ({})", record.title, record.display_date);
    if let Some(fields) = &record.dream {
        println!("Dream Type:  {}", fields.dream_type);
        println!("Technique:   {}", fields.technique);
        println!("Sleep Cycle: {}", fields.sleep_cycle);
    }
    let tags = record.tags();
    if !tags.is_empty() {
        println!("Tags:        {}", tags.join(", "));
    }
    println!();
    println!("{}", record.body);
    Ok(())
}

fn handle_search(store: &EntryStore, query: &str) -> Result<()> {
    let hits = store.search(query)?;
    if hits.is_empty() {
        eprintln!("No entries contain {:?}.", query);
    }
    for hit in hits {
        println!("{:>4}  {:?}", hit.position, hit.path);
    }
    Ok(())
}

fn handle_new(store: &EntryStore, settings: &Settings, args: NewArgs) -> Result<()> {
    let draft = build_draft(
        store.kind(),
        args.date,
        args.title,
        &args.dream_type,
        args.technique,
        args.sleep_cycle,
    );
    let path = store.create(&draft, &EntryStamp::now())?;
    println!("Created {:?}", path);
    if args.edit {
        open_editor(settings, &path)?;
    }
    Ok(())
}

/// Omitted options fall back to the blank-entry defaults.
fn build_draft(
    kind: EntryKind,
    date: NaiveDate,
    title: Option<String>,
    dream_types: &[DreamType],
    technique: Option<Technique>,
    sleep_cycle: Option<SleepCycle>,
) -> EntryDraft {
    let mut draft = EntryDraft::new(kind, date);
    if let Some(title) = title.filter(|t| !t.trim().is_empty()) {
        draft = draft.with_title(title.trim());
    }
    if kind == EntryKind::Dream {
        let types = if dream_types.is_empty() {
            vec![DreamType::Lucid]
        } else {
            dream_types.to_vec()
        };
        draft.dream = Some(DreamFields::from_values(
            &types,
            technique.unwrap_or(Technique::Wild),
            sleep_cycle.unwrap_or(SleepCycle::Regular),
        ));
    }
    draft
}

fn handle_sync(store: &EntryStore, settings: &Settings, args: SyncArgs) -> Result<()> {
    let file = args
        .file
        .unwrap_or_else(|| settings.sync_file(store.kind()).to_path_buf());
    let report = SyncEngine::new(store)
        .with_delay(settings.sync_delay)
        .run_file(&file)?;

    for path in &report.created {
        println!("Synced {:?}", path);
    }
    for failure in &report.failures {
        eprintln!("warning: {} ({}): {}", failure.title, failure.date, failure.reason);
    }
    println!(
        "{} blocks: {} created, {} already present, {} failed",
        report.parsed,
        report.created.len(),
        report.skipped,
        report.failures.len()
    );
    Ok(())
}

fn handle_stats(store: &EntryStore, args: StatsArgs) -> Result<()> {
    let stats = stats::compute(&store.load_all()?);
    if args.json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Entries:        {}", stats.total);
    println!("Dirty:          {}", stats.dirty);
    println!("Longest streak: {} days", stats.longest_streak);
    for (heading, counts) in [
        ("Dream types", &stats.dream_types),
        ("Techniques", &stats.techniques),
        ("Sleep cycles", &stats.sleep_cycles),
    ] {
        if counts.is_empty() {
            continue;
        }
        println!();
        println!("{heading}:");
        for (value, count) in counts {
            println!("  {value:<12} {count}");
        }
    }
    Ok(())
}

fn handle_graph(store: &EntryStore, args: GraphArgs) -> Result<()> {
    if args.from > args.to {
        bail!("--from must not be after --to");
    }
    let report = store.load_all()?;
    let to = stats::month_end(args.to);
    let counts = stats::daily_counts(&report.entries, args.from, to, args.only);
    if counts.is_empty() {
        eprintln!("No entries in range.");
        return Ok(());
    }
    for (day, count) in counts {
        println!("{}  {}", day, render_bar(count));
    }
    Ok(())
}

fn render_bar(count: usize) -> String {
    format!("{} {count}", "#".repeat(count))
}

fn handle_backup(store: &EntryStore, settings: &Settings) -> Result<()> {
    let report = backup::write_backup(store, settings.backup_dir(), Local::now().naive_local())?;
    for failure in &report.failures {
        eprintln!("warning: left out {:?}: {}", failure.path, failure.reason);
    }
    println!("Backed up {} entries to {:?}", report.written, report.path);
    Ok(())
}

fn handle_logs(settings: &Settings) -> Result<()> {
    let lines = logging::read_log(&settings.log_file())?;
    if lines.is_empty() {
        eprintln!("Log file is empty.");
    }
    for line in lines {
        println!("{line}");
    }
    Ok(())
}

fn open_editor(settings: &Settings, path: &Path) -> Result<()> {
    let (program, args) = settings.editor_command();
    let status = Command::new(&program)
        .args(&args)
        .arg(path)
        .status()
        .with_context(|| format!("launching editor {:?}", program))?;
    if !status.success() {
        warn!(editor = %program, path = %path.display(), %status, "editor exited unsuccessfully");
        bail!("editor {:?} exited with {}", program, status);
    }
    info!(path = %path.display(), "edited entry");
    Ok(())
}

/// 1-based position into the newest-first index.
fn resolve_position(paths: &[PathBuf], position: usize) -> Result<PathBuf> {
    position
        .checked_sub(1)
        .and_then(|idx| paths.get(idx))
        .cloned()
        .with_context(|| format!("no entry at position {} (store has {})", position, paths.len()))
}

fn parse_entry_date(raw: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw.trim(), "%m/%d/%Y")
        .map_err(|_| format!("expected MM/DD/YYYY, got {raw:?}"))
}

fn parse_month_arg(raw: &str) -> Result<NaiveDate, String> {
    stats::parse_month(raw).ok_or_else(|| format!("expected YYYY-MM, got {raw:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_are_one_based() {
        let paths = vec![PathBuf::from("newest.txt"), PathBuf::from("older.txt")];
        assert_eq!(resolve_position(&paths, 1).expect("first"), PathBuf::from("newest.txt"));
        assert_eq!(resolve_position(&paths, 2).expect("second"), PathBuf::from("older.txt"));
        assert!(resolve_position(&paths, 0).is_err());
        assert!(resolve_position(&paths, 3).is_err());
    }

    #[test]
    fn entry_dates_are_month_first() {
        assert_eq!(
            parse_entry_date("03/05/2024").expect("date"),
            NaiveDate::from_ymd_opt(2024, 3, 5).unwrap()
        );
        assert!(parse_entry_date("2024-03-05").is_err());
        assert!(parse_entry_date("13/01/2024").is_err());
    }

    #[test]
    fn new_dream_takes_cli_values() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 5).unwrap();
        let draft = build_draft(
            EntryKind::Dream,
            date,
            Some("  Flying Dream ".into()),
            &[DreamType::Lucid, DreamType::Vivid],
            Some(Technique::Mild),
            None,
        );
        assert_eq!(draft.title, "Flying Dream");
        assert_eq!(draft.dream, Some(DreamFields::new("Lucid, Vivid", "MILD", "Regular")));

        let journal = build_draft(EntryKind::Journal, date, None, &[], None, None);
        assert_eq!(journal.title, "Untitled Journal");
        assert_eq!(journal.dream, None);
    }

    #[test]
    fn cli_parses_store_commands() {
        let cli = Cli::try_parse_from([
            "dreamlog",
            "dream",
            "new",
            "--date",
            "03/05/2024",
            "--dream-type",
            "lucid,no recall",
            "--technique",
            "wild",
        ])
        .expect("parse");
        match cli.command {
            Commands::Dream {
                action: StoreAction::New(args),
            } => {
                assert_eq!(args.dream_type, vec![DreamType::Lucid, DreamType::NoRecall]);
                assert_eq!(args.technique, Some(Technique::Wild));
            }
            other => panic!("unexpected command {other:?}"),
        }

        let cli = Cli::try_parse_from([
            "dreamlog", "journal", "graph", "--from", "2024-01", "--to", "2024-03",
        ])
        .expect("parse graph");
        assert!(matches!(cli.command, Commands::Journal { action: StoreAction::Graph(_) }));
        let bad_month = ["dreamlog", "dream", "graph", "--from", "2024", "--to", "2024-03"];
        assert!(Cli::try_parse_from(bad_month).is_err());
    }

    #[test]
    fn bars_scale_with_count() {
        assert_eq!(render_bar(3), "### 3");
    }
}
