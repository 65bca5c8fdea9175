use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "deep-index")]
#[command(about = "Incremental file and archive indexer", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Register a folder as an index root
    AddRoot(AddRootArgs),
    /// Crawl every root in the foreground until the index is current
    Index,
    /// Run the background crawler
    Crawl(CrawlArgs),
    /// List confirmed duplicate pairs
    Duplicates(DuplicatesArgs),
    /// Print index statistics
    Stats,
    /// Print configuration values
    PrintConfig,
    /// Truncate all database tables
    TruncateDb,
}

#[derive(Debug, Args)]
pub struct AddRootArgs {
    pub path: PathBuf,
}

#[derive(Debug, Args)]
pub struct CrawlArgs {
    /// Stop after this many seconds; runs until Enter is pressed otherwise
    #[arg(long)]
    pub seconds: Option<u64>,
}

#[derive(Debug, Args)]
pub struct DuplicatesArgs {
    /// Write the pairs to a CSV file instead of stdout
    #[arg(long)]
    pub csv: Option<PathBuf>,
    #[arg(long, default_value_t = 100)]
    pub limit: i64,
}
