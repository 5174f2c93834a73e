//! Deterministic test-pattern generation.
//!
//! Patterns are a pure function of `(pass, offset, length)`: the verify sweep
//! regenerates what the write sweep produced instead of keeping it around, so
//! nothing larger than one chunk is ever held in memory.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

/// Seed used when the operator does not pick one.
pub const DEFAULT_SEED: u64 = 0x5EED_D15C_7E57_0001;

/// Random streams are re-seeded every `PATTERN_BLOCK` bytes so any offset can
/// be produced without generating everything before it.
const PATTERN_BLOCK: usize = 4096;

/// The fixed bytes written by `badblocks -w`, in its order.
const BADBLOCKS_BYTES: [u8; 4] = [0xAA, 0x55, 0xFF, 0x00];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PatternKind {
    /// Seeded pseudo-random data; odd passes are the complement of the
    /// preceding even pass.
    #[default]
    Random,
    /// Whole-device fills of 0xAA, 0x55, 0xFF, 0x00, cycling by pass.
    Badblocks,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternGenerator {
    kind: PatternKind,
    seed: u64,
}

impl Default for PatternGenerator {
    fn default() -> Self {
        Self::new(PatternKind::default(), DEFAULT_SEED)
    }
}

impl PatternGenerator {
    pub fn new(kind: PatternKind, seed: u64) -> Self {
        Self { kind, seed }
    }

    pub fn kind(&self) -> PatternKind {
        self.kind
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Bytes for `len` bytes starting at `offset` during pass `pass`.
    pub fn generate(&self, pass: u32, offset: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        self.fill(pass, offset, &mut out);
        out
    }

    /// In-place form of [`generate`](Self::generate); `dest.len()` is the length.
    pub fn fill(&self, pass: u32, offset: u64, dest: &mut [u8]) {
        match self.kind {
            PatternKind::Badblocks => {
                dest.fill(BADBLOCKS_BYTES[(pass % BADBLOCKS_BYTES.len() as u32) as usize]);
            }
            PatternKind::Random => {
                self.fill_stream(pass & !1, offset, dest);
                if pass % 2 == 1 {
                    for b in dest.iter_mut() {
                        *b = !*b;
                    }
                }
            }
        }
    }

    fn fill_stream(&self, stream: u32, offset: u64, dest: &mut [u8]) {
        let mut scratch = [0u8; PATTERN_BLOCK];
        let mut pos = offset;
        let mut done = 0usize;
        while done < dest.len() {
            let block = pos / PATTERN_BLOCK as u64;
            let within = (pos % PATTERN_BLOCK as u64) as usize;
            let take = (PATTERN_BLOCK - within).min(dest.len() - done);
            let mut rng = StdRng::seed_from_u64(block_seed(self.seed, stream, block));
            if take == PATTERN_BLOCK {
                rng.fill_bytes(&mut dest[done..done + take]);
            } else {
                rng.fill_bytes(&mut scratch);
                dest[done..done + take].copy_from_slice(&scratch[within..within + take]);
            }
            pos += take as u64;
            done += take;
        }
    }
}

fn block_seed(seed: u64, stream: u32, block: u64) -> u64 {
    splitmix64(splitmix64(seed ^ u64::from(stream)) ^ block)
}

fn splitmix64(mut x: u64) -> u64 {
    x = x.wrapping_add(0x9E37_79B9_7F4A_7C15);
    x = (x ^ (x >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    x = (x ^ (x >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    x ^ (x >> 31)
}
