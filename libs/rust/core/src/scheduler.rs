//! Participant selection for the fit and evaluate phases.

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::error::{FlError, Result};
use crate::protocol::ClientId;

// keeps 0.3 * 10 = 3.0000000000000004 from rounding up to 4
const FRACTION_EPSILON: f64 = 1e-9;

/// How eligible sessions are ordered before trimming to the target count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SelectionPolicy {
    /// Lowest client ids first.
    #[default]
    Ascending,
    /// Reproducible shuffle; the round number is mixed into the seed.
    Seeded(u64),
}

impl SelectionPolicy {
    pub fn from_seed(seed: Option<u64>) -> Self {
        seed.map(SelectionPolicy::Seeded).unwrap_or_default()
    }
}

/// `NotEnoughClients` when fewer than `min_available` sessions are connected.
pub fn check_availability(available: usize, min_available: usize) -> Result<()> {
    if available < min_available {
        return Err(FlError::NotEnoughClients { available, required: min_available });
    }
    Ok(())
}

/// `ceil(fraction * n)`, raised to `minimum`, capped at `n`. A zero fraction selects nobody.
pub fn target_count(n: usize, fraction: f64, minimum: usize) -> usize {
    if fraction <= 0.0 || n == 0 {
        return 0;
    }
    let raw = (fraction * n as f64 - FRACTION_EPSILON).ceil().max(0.0) as usize;
    raw.max(minimum).min(n)
}

/// Pick participants from `sessions`. The result is sorted by client id.
pub fn select_participants(
    sessions: &[ClientId],
    fraction: f64,
    minimum: usize,
    policy: SelectionPolicy,
    round: u64,
) -> Vec<ClientId> {
    let target = target_count(sessions.len(), fraction, minimum);
    let mut pool: Vec<ClientId> = sessions.to_vec();
    pool.sort();
    pool.dedup();
    if let SelectionPolicy::Seeded(seed) = policy {
        let mut rng = StdRng::seed_from_u64(seed ^ round.rotate_left(32));
        pool.shuffle(&mut rng);
    }
    pool.truncate(target);
    pool.sort();
    pool
}
