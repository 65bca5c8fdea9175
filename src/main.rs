mod cli;
mod logging;
mod reporter;

use std::io;
use std::path::Path;
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{CommandFactory, Parser};
use cli::{Cli, Commands, CrawlArgs, DuplicatesArgs};
use colored::*;
use console::Term;
use deep_index::config::{self, AppConfig};
use deep_index::scheduler::AlwaysIdle;
use deep_index::storage::Database;
use deep_index::{Indexer, ProgressReporter};
use dotenv::dotenv;
use reporter::CliReporter;
use tracing::{error, info};

fn main() -> anyhow::Result<()> {
    dotenv().ok();

    let _guard = logging::init_logger();

    let config = match config::load_configuration() {
        Ok(config) => config,
        Err(err) => {
            error!("Error loading configuration: {}", err);
            process::exit(1);
        }
    };

    let args = Cli::parse();

    match args.command {
        Some(Commands::AddRoot(args)) => {
            let indexer = Indexer::open(config)?;
            let id = indexer.add_root(&args.path)?;
            info!("Root {} added with id {}", args.path.display(), id);
        }
        Some(Commands::Index) => run_index(config)?,
        Some(Commands::Crawl(args)) => run_crawl(config, &args)?,
        Some(Commands::Duplicates(args)) => run_duplicates(&config, &args)?,
        Some(Commands::Stats) => print_stats(config)?,
        Some(Commands::PrintConfig) => {
            println!("Configuration: {:?}", config);
        }
        Some(Commands::TruncateDb) => {
            match confirm_on_index(
                &Term::stdout(),
                "Delete every entry, closure edge and duplicate pair in",
                &config.db_path,
            ) {
                Ok(true) => {
                    let db = Database::open(&config.db_path)
                        .with_context(|| format!("opening {}", config.db_path))?;
                    db.truncate_all()?;
                    println!("All tables truncated");
                }
                _ => process::exit(0),
            }
        }
        None => {
            let _ = Cli::command().print_long_help();
        }
    }

    Ok(())
}

fn run_index(config: AppConfig) -> anyhow::Result<()> {
    let mut indexer = Indexer::open(config)?;
    indexer.add_configured_roots();
    let reporter = CliReporter::new();
    let result = indexer.index_now(&reporter)?;
    indexer.shutdown();

    info!(
        "Index: {} across {} root(s), {} entries, {} unreadable",
        format!("{:.2}s", result.duration.as_secs_f64()).green(),
        result.roots,
        format!("{}", result.dispatched).cyan(),
        format!("{}", result.disabled).red(),
    );
    Ok(())
}

fn run_crawl(config: AppConfig, args: &CrawlArgs) -> anyhow::Result<()> {
    let mut indexer = Indexer::open(config)?;
    indexer.add_configured_roots();
    indexer.start(Arc::new(AlwaysIdle))?;

    let stop = Arc::new(AtomicBool::new(false));
    if args.seconds.is_none() {
        println!("Crawling in the background, press Enter to stop");
        let flag = Arc::clone(&stop);
        thread::spawn(move || {
            let mut line = String::new();
            let _ = io::stdin().read_line(&mut line);
            flag.store(true, Ordering::SeqCst);
        });
    }

    let term = Term::stdout();
    let _ = term.hide_cursor();
    let reporter = CliReporter::new();
    let start = Instant::now();
    let deadline = args.seconds.map(Duration::from_secs);
    while !stop.load(Ordering::SeqCst) {
        if deadline.map_or(false, |d| start.elapsed() >= d) {
            break;
        }
        let (listings, updates) = indexer.pending();
        reporter.on_crawl_tick(listings, updates);
        thread::sleep(Duration::from_millis(500));
    }
    reporter.finish();
    let _ = term.show_cursor();

    indexer.shutdown();
    let stats = indexer.stats()?;
    info!(
        "Crawled for {}: {} entries, {} dirty, {} duplicate pairs",
        format!("{:.0}s", start.elapsed().as_secs_f64()).green(),
        stats.entries,
        format!("{}", stats.dirty).yellow(),
        format!("{}", stats.equalities).red(),
    );
    Ok(())
}

fn run_duplicates(config: &AppConfig, args: &DuplicatesArgs) -> anyhow::Result<()> {
    let db = Database::open(&config.db_path)?;
    let pairs = db.duplicate_pairs(0, args.limit)?;

    match &args.csv {
        Some(path) => {
            write_csv(path, &pairs)?;
            info!("{} pairs written to {}", pairs.len(), path.display());
        }
        None => {
            for pair in &pairs {
                println!(
                    "{} {}\n    {}\n    {}",
                    format!("{:>12}", pair.size).red(),
                    format!("{:08x}", pair.checksum).dimmed(),
                    pair.path1,
                    pair.path2
                );
            }
            info!("{} duplicate pairs", pairs.len());
        }
    }
    Ok(())
}

fn write_csv(path: &Path, pairs: &[deep_index::storage::DuplicatePair]) -> anyhow::Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["path1", "path2", "size", "checksum", "last_verified"])?;
    for pair in pairs {
        writer.write_record([
            pair.path1.as_str(),
            pair.path2.as_str(),
            &pair.size.to_string(),
            &format!("{:08x}", pair.checksum),
            &pair.last_verified.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn print_stats(config: AppConfig) -> anyhow::Result<()> {
    let mut indexer = Indexer::open(config)?;
    let stats = indexer.stats()?;
    indexer.shutdown();
    println!("{:<16}{}", "entries", stats.entries);
    println!("{:<16}{}", "folders", stats.folders);
    println!("{:<16}{}", "files", stats.files);
    println!("{:<16}{}", "in archives", stats.compressed);
    println!("{:<16}{}", "dirty", format!("{}", stats.dirty).yellow());
    println!("{:<16}{}", "no access", format!("{}", stats.no_access).red());
    println!("{:<16}{}", "orphans", stats.orphans);
    println!("{:<16}{}", "closure edges", stats.closure_edges);
    println!("{:<16}{}", "duplicates", stats.equalities);
    println!("{:<16}{}", "dedupable bytes", stats.dedupable_bytes);
    Ok(())
}

/// Reading of a yes/no reply; `None` asks again.
fn parse_answer(reply: &str, default: bool) -> Option<bool> {
    match reply.trim().to_ascii_lowercase().as_str() {
        "" => Some(default),
        "y" | "yes" => Some(true),
        "n" | "no" => Some(false),
        _ => None,
    }
}

/// Ask before a destructive action on the index. Defaults to no.
fn confirm_on_index(term: &Term, action: &str, db_path: &str) -> io::Result<bool> {
    loop {
        term.write_str(&format!(
            "{} {} (y/N): ",
            action.red().bold(),
            db_path.yellow()
        ))?;
        if let Some(answer) = parse_answer(&term.read_line()?, false) {
            return Ok(answer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::parse_answer;

    #[test]
    fn test_parse_answer() {
        assert_eq!(parse_answer("", false), Some(false));
        assert_eq!(parse_answer(" Yes\n", false), Some(true));
        assert_eq!(parse_answer("n", true), Some(false));
        assert_eq!(parse_answer("maybe", false), None);
    }
}
