//! Deterministic random substreams.
//!
//! Every random draw is taken from a stream keyed by the dataset seed plus the
//! item index and epoch, so results do not depend on processing order.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Which consumer a stream feeds. Geometry and augmentation draws never share a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Geometry,
    Augment,
    Shuffle,
}

impl StreamKind {
    fn salt(self) -> u64 {
        match self {
            StreamKind::Geometry => 0x6765_6f6d,
            StreamKind::Augment => 0x6175_676d,
            StreamKind::Shuffle => 0x7368_7566,
        }
    }
}

fn splitmix64(mut z: u64) -> u64 {
    z = z.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Use the configured seed, or draw one from the thread RNG once per process.
pub fn resolve_seed(seed: Option<u64>) -> u64 {
    seed.unwrap_or_else(|| rand::rng().random())
}

/// Stream for one item in one epoch.
pub fn item_stream(seed: u64, index: usize, epoch: usize, kind: StreamKind) -> StdRng {
    let mixed = splitmix64(seed ^ kind.salt())
        ^ splitmix64((index as u64).wrapping_add(1).wrapping_mul(0xD6E8_FEB8_6659_FD93))
        ^ splitmix64((epoch as u64).rotate_left(32) ^ 0xA076_1D64_78BD_642F);
    StdRng::seed_from_u64(splitmix64(mixed))
}

/// Stream for dataset-wide draws (bucket shuffling) in one epoch.
pub fn epoch_stream(seed: u64, epoch: usize) -> StdRng {
    let mixed = splitmix64(seed ^ StreamKind::Shuffle.salt()) ^ splitmix64(epoch as u64);
    StdRng::seed_from_u64(mixed)
}
