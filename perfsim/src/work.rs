//! Bounded synthetic work generators.
//!
//! These burn CPU, touch memory or round-trip a file so that observers see a
//! real cost. They are deliberately simple; the interesting part of the crate
//! is deciding how much of them to run.

use std::hint::black_box;
use std::io;
use std::path::Path;

const PAGE_SIZE: usize = 4096;

/// Spin for `iterations` rounds of integer mixing. Returns the final state so
/// the loop cannot be optimized away.
pub fn burn_cpu(iterations: u64) -> u64 {
    let mut state: u64 = 0x9E37_79B9_7F4A_7C15;
    for i in 0..iterations {
        state ^= black_box(i);
        state = state.wrapping_mul(0xBF58_476D_1CE4_E5B9);
        state ^= state >> 31;
    }
    black_box(state)
}

/// Allocate `bytes` and write one byte per page. Returns the bytes touched.
pub fn touch_memory(bytes: usize) -> usize {
    if bytes == 0 {
        return 0;
    }
    let mut buffer = vec![0u8; bytes];
    for (n, offset) in (0..bytes).step_by(PAGE_SIZE).enumerate() {
        buffer[offset] = (n % 251) as u8;
    }
    black_box(&buffer);
    buffer.len()
}

/// Write `bytes` to a fresh file under `dir`, read it back and remove it.
/// Returns the bytes read.
pub async fn file_round_trip(dir: &Path, bytes: usize) -> io::Result<usize> {
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(format!(
        "probe-{}-{:016x}.bin",
        std::process::id(),
        rand::random::<u64>()
    ));

    let payload: Vec<u8> = (0..bytes).map(|i| (i % 256) as u8).collect();
    tokio::fs::write(&path, &payload).await?;
    let read = tokio::fs::read(&path).await;
    let _ = tokio::fs::remove_file(&path).await;

    let read = read?;
    if read != payload {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "probe file content changed during round trip",
        ));
    }
    Ok(read.len())
}
