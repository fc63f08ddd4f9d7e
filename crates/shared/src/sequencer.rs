//! Maps a group's logical position onto a physical album index.
//!
//! The order is a seeded shuffle of `0..album_size`, so any party holding the
//! seed, position and album size reconstructs the same index. The position is
//! reduced modulo the album size on every call because the remote album can
//! grow or shrink between observations.

use rand::{seq::SliceRandom, SeedableRng};
use rand_chacha::ChaCha8Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Advance {
    pub position: i64,
    /// The position wrapped to zero; callers reseed before the next traversal.
    pub wrapped: bool,
}

/// Stored seeds are only meaningful while this stream stays fixed, so the
/// generator is ChaCha8, whose output is stable across rand releases.
pub fn permutation(seed: i64, album_size: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..album_size).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(seed as u64);
    order.shuffle(&mut rng);
    order
}

pub fn resolve(seed: i64, position: i64, album_size: usize) -> Option<usize> {
    let slot = reduce(position, album_size)?;
    permutation(seed, album_size).get(slot).copied()
}

pub fn advance(position: i64, album_size: usize) -> Option<Advance> {
    let size = i64::try_from(album_size).ok().filter(|size| *size > 0)?;
    let next = (position.rem_euclid(size) + 1) % size;
    Some(Advance {
        position: next,
        wrapped: next == 0,
    })
}

fn reduce(position: i64, album_size: usize) -> Option<usize> {
    let size = i64::try_from(album_size).ok().filter(|size| *size > 0)?;
    usize::try_from(position.rem_euclid(size)).ok()
}

#[cfg(test)]
#[path = "tests/sequencer_tests.rs"]
mod tests;
