pub mod maintenance;
pub mod queries;
pub mod sqlite;
pub mod writer;

use crate::lock::StackingLock;
use std::sync::Arc;

pub use queries::{DiscoveryQuery, DuplicatePair, IndexStats};
pub use sqlite::Database;
pub use writer::{
    apply_batch, CountingWriter, DirectWriter, LoggingWriter, Mutation, ParentRef, StorageWriter,
};

/// The database behind the stacking lock. Every read and write goes through it.
pub type SharedDb = Arc<StackingLock<Database>>;

pub fn shared(db: Database) -> SharedDb {
    Arc::new(StackingLock::new(db))
}
