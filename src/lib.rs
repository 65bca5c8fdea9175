pub mod cancel;
pub mod config;
pub mod engine;
pub mod equality;
pub mod error;
pub mod lister;
pub mod lock;
pub mod model;
pub mod progress;
pub mod queue;
pub mod reconciler;
pub mod scheduler;
pub mod storage;

pub use cancel::{CancellationToken, WorkerContext};
pub use config::AppConfig;
pub use engine::{IndexResult, Indexer};
pub use error::{Error, Result};
pub use progress::{ProgressReporter, SilentReporter};
pub use storage::{Database, SharedDb};
