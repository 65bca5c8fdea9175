//! Duplicate detection: byte-exact comparison of stored files, and the
//! equality mutations built from it.

use crate::cancel::WorkerContext;
use crate::error::Result;
use crate::lister::ListerRegistry;
use crate::model::{now_secs, Equality, StoredEntry};
use crate::reconciler::stack::CompressionStack;
use crate::storage::{Mutation, SharedDb};
use std::io::{self, Read};
use std::sync::Arc;
use tracing::debug;

const COMPARE_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EqualityMode {
    /// Same size and stored checksum.
    Checksum,
    /// Streamed byte-for-byte comparison through every archive level.
    Bytes,
}

pub fn check_equality(
    ctx: &WorkerContext,
    db: &SharedDb,
    registry: &Arc<ListerRegistry>,
    a: &StoredEntry,
    b: &StoredEntry,
    mode: EqualityMode,
) -> Result<bool> {
    if !a.entry_type().is_file() || !b.entry_type().is_file() {
        return Ok(false);
    }
    if a.id == b.id {
        return Ok(true);
    }
    if a.entry.size != b.entry.size {
        return Ok(false);
    }
    match mode {
        EqualityMode::Checksum => Ok(a.entry.checksum.is_some() && a.entry.checksum == b.entry.checksum),
        EqualityMode::Bytes => {
            let (stack_a, stack_b) = {
                let guard = db.lock(ctx.priority());
                (
                    CompressionStack::resolve(&guard, a)?,
                    CompressionStack::resolve(&guard, b)?,
                )
            };
            let mut reader_a = stack_a.open_source(registry, &a.entry)()?;
            let mut reader_b = stack_b.open_source(registry, &b.entry)()?;
            streams_equal(ctx, &mut reader_a, &mut reader_b)
        }
    }
}

pub fn streams_equal(ctx: &WorkerContext, a: &mut dyn Read, b: &mut dyn Read) -> Result<bool> {
    let mut buf_a = vec![0u8; COMPARE_BUFFER_SIZE];
    let mut buf_b = vec![0u8; COMPARE_BUFFER_SIZE];
    loop {
        ctx.checkpoint()?;
        let n_a = fill(a, &mut buf_a)?;
        let n_b = fill(b, &mut buf_b)?;
        if n_a != n_b || buf_a[..n_a] != buf_b[..n_b] {
            return Ok(false);
        }
        if n_a == 0 {
            return Ok(true);
        }
    }
}

fn fill(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Full verification of a candidate or previously confirmed pair: checksum
/// first, then bytes. Yields the upsert or the retraction to submit.
pub fn verify_pair(
    ctx: &WorkerContext,
    db: &SharedDb,
    registry: &Arc<ListerRegistry>,
    a: &StoredEntry,
    b: &StoredEntry,
) -> Result<Mutation> {
    let equal = check_equality(ctx, db, registry, a, b, EqualityMode::Checksum)?
        && check_equality(ctx, db, registry, a, b, EqualityMode::Bytes)?;
    let mutation = match (equal, a.entry.checksum) {
        (true, Some(checksum)) => Mutation::UpsertEquality(Equality::new(
            a.id,
            b.id,
            a.entry.size,
            checksum,
            now_secs(),
        )),
        _ => {
            let eq = Equality::new(a.id, b.id, 0, 0, 0);
            Mutation::DeleteEquality {
                id1: eq.id1,
                id2: eq.id2,
            }
        }
    };
    debug!(
        "Equality {} <-> {}: {}",
        a.path(),
        b.path(),
        if equal { "confirmed" } else { "rejected" }
    );
    Ok(mutation)
}
