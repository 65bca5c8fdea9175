use crate::cancel::WorkerContext;
use crate::error::Result;
use std::hash::Hasher as _;
use std::io::Read;
use twox_hash::XxHash64;

const CHECKSUM_BUFFER_SIZE: usize = 64 * 1024;

/// Fold a 64-bit digest to the 32 bits stored per entry.
pub fn fold(hash: u64) -> u32 {
    ((hash >> 32) ^ (hash & 0xffff_ffff)) as u32
}

/// Stream the whole content once, yielding the folded digest and the
/// number of bytes read. The byte count is authoritative for size.
pub fn checksum_stream(ctx: &WorkerContext, reader: &mut dyn Read) -> Result<(u32, i64)> {
    let mut hasher = XxHash64::with_seed(0);
    let mut buffer = vec![0u8; CHECKSUM_BUFFER_SIZE];
    let mut total: i64 = 0;
    loop {
        ctx.checkpoint()?;
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        };
        hasher.write(&buffer[..n]);
        total += n as i64;
    }
    Ok((fold(hasher.finish()), total))
}

pub fn checksum_bytes(data: &[u8]) -> u32 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(data);
    fold(hasher.finish())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::error::Error;
    use std::io::Cursor;

    #[test]
    fn test_stream_matches_buffer_digest() {
        let data: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let ctx = WorkerContext::foreground();
        let (sum, size) = checksum_stream(&ctx, &mut Cursor::new(data.clone())).unwrap();
        assert_eq!(size, data.len() as i64);
        assert_eq!(sum, checksum_bytes(&data));
    }

    #[test]
    fn test_cancelled_context_stops_read() {
        let token = CancellationToken::new();
        token.cancel();
        let ctx = WorkerContext::background(token);
        let result = checksum_stream(&ctx, &mut Cursor::new(vec![1u8; 10]));
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
