//! Test fixtures and builders for PSA tables used across the engine tests.

use crate::data::psa::PsaTable;
use ndarray::Array2;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};

/// Effect value at which Ketamine's NMB equals Usual care's at λ = 50 000.
pub const KETAMINE_CROSSING_EFFECT: f64 = 2.008;

/// Standard deviation giving `P(effect < crossing) = 0.10` around a mean of 2.4.
pub const KETAMINE_EFFECT_SD: f64 = (2.4 - KETAMINE_CROSSING_EFFECT) / 1.281_551_565_5;

pub fn names(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// Usual care (cost 1000, effect 2.0) against Ketamine (cost 1400, effect 2.4)
/// with no variance across draws.
pub fn constant_two_strategy_table(n_draws: usize) -> PsaTable {
    let mut cost = Array2::<f64>::zeros((n_draws, 2));
    let mut effect = Array2::<f64>::zeros((n_draws, 2));
    for mut row in cost.outer_iter_mut() {
        row[0] = 1000.0;
        row[1] = 1400.0;
    }
    for mut row in effect.outer_iter_mut() {
        row[0] = 2.0;
        row[1] = 2.4;
    }
    PsaTable::from_arrays(
        names(&["Usual care", "Ketamine"]),
        (1..=n_draws as i64).collect(),
        cost,
        effect,
    )
    .expect("constant table")
}

/// Same costs as [`constant_two_strategy_table`], with Ketamine's effect drawn
/// from `Normal(2.4, KETAMINE_EFFECT_SD)`.
pub fn uncertain_two_strategy_table(n_draws: usize, seed: u64) -> PsaTable {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(2.4, KETAMINE_EFFECT_SD).expect("normal");
    let mut cost = Array2::<f64>::zeros((n_draws, 2));
    let mut effect = Array2::<f64>::zeros((n_draws, 2));
    for (mut c, mut e) in cost.outer_iter_mut().zip(effect.outer_iter_mut()) {
        c[0] = 1000.0;
        c[1] = 1400.0;
        e[0] = 2.0;
        e[1] = normal.sample(&mut rng);
    }
    PsaTable::from_arrays(
        names(&["Usual care", "Ketamine"]),
        (1..=n_draws as i64).collect(),
        cost,
        effect,
    )
    .expect("uncertain table")
}

/// Three strategies with independent noise on cost and effect.
pub fn noisy_three_strategy_table(n_draws: usize, seed: u64) -> PsaTable {
    let mut rng = StdRng::seed_from_u64(seed);
    let means: [(f64, f64); 3] = [(1000.0, 2.0), (1400.0, 2.4), (6000.0, 2.5)];
    let cost_noise = Normal::new(0.0, 150.0).expect("normal");
    let effect_noise = Normal::new(0.0, 0.15).expect("normal");
    let mut cost = Array2::<f64>::zeros((n_draws, 3));
    let mut effect = Array2::<f64>::zeros((n_draws, 3));
    for (mut c, mut e) in cost.outer_iter_mut().zip(effect.outer_iter_mut()) {
        for (s, &(mc, me)) in means.iter().enumerate() {
            c[s] = (mc + cost_noise.sample(&mut rng)).max(0.0);
            e[s] = me + effect_noise.sample(&mut rng);
        }
    }
    PsaTable::from_arrays(
        names(&["Usual care", "Ketamine", "ECT"]),
        (1..=n_draws as i64).collect(),
        cost,
        effect,
    )
    .expect("noisy table")
}
