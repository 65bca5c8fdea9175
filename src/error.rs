use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Queue is closed")]
    QueueClosed,

    #[error("Compression stack broken at {0}")]
    Orphaned(String),

    #[error("Lister error: {0}")]
    Lister(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Errors that disable the entry being dispatched instead of aborting the pass.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Lister(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    pub fn is_storage(&self) -> bool {
        matches!(self, Error::Database(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
