//! Uniform selection of record indices for sampled loads.

use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

/// Selects `want` distinct indices uniformly from `0..total`, returned in
/// ascending order so that the caller's seek pattern walks the file
/// monotonically.
///
/// The default generator is seeded from the system clock, which is cheap and
/// good enough for load sampling; `strong` instead seeds from OS entropy for
/// callers that need run-to-run independence. Selection is a partial
/// Fisher-Yates over a sparse view of the index space, so it stays O(want)
/// in memory even for huge files.
pub fn select_indices(total: usize, want: usize, strong: bool) -> Vec<usize> {
    let want = want.min(total);
    let mut rng = if strong {
        SmallRng::from_entropy()
    } else {
        SmallRng::seed_from_u64(timer_seed())
    };

    let mut displaced: HashMap<usize, usize> = HashMap::new();
    let mut picked = Vec::with_capacity(want);
    for i in 0..want {
        let j = rng.gen_range(i..total);
        let value_at_j = displaced.get(&j).copied().unwrap_or(j);
        let value_at_i = displaced.get(&i).copied().unwrap_or(i);
        picked.push(value_at_j);
        displaced.insert(j, value_at_i);
    }
    picked.sort_unstable();
    picked
}

fn timer_seed() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0x5eed)
}
