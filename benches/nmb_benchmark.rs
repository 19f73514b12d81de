// ========================================================================================
//
//                 TRD-CEA NET MONETARY BENEFIT BENCHMARK
//
// ========================================================================================
//
// Measures NMB cube construction (including the per-draw optimal selection) and
// the acceptability-frontier sweep across realistic PSA sizes.
//
// ========================================================================================

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use ndarray::Array2;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Normal};
use trd_cea::ceac::compute_frontier;
use trd_cea::data::psa::PsaTable;
use trd_cea::grid::Jurisdiction;
use trd_cea::nmb::{TieBreak, compute_nmb};

/// Number of PSA draws in each benchmarked table.
const DRAW_COUNTS: [usize; 3] = [1_000, 5_000, 20_000];

/// (mean cost, mean effect) for each simulated strategy.
const STRATEGY_MEANS: [(f64, f64); 5] = [
    (1_000.0, 2.0),
    (1_400.0, 2.4),
    (6_000.0, 2.5),
    (3_200.0, 2.3),
    (4_800.0, 2.45),
];

fn simulated_table(n_draws: usize) -> PsaTable {
    let mut rng = StdRng::seed_from_u64(2024);
    let cost_noise = Normal::new(0.0, 200.0).expect("normal");
    let effect_noise = Normal::new(0.0, 0.2).expect("normal");
    let n_strategies = STRATEGY_MEANS.len();
    let mut cost = Array2::<f64>::zeros((n_draws, n_strategies));
    let mut effect = Array2::<f64>::zeros((n_draws, n_strategies));
    for (mut c, mut e) in cost.outer_iter_mut().zip(effect.outer_iter_mut()) {
        for (s, &(mc, me)) in STRATEGY_MEANS.iter().enumerate() {
            c[s] = (mc + cost_noise.sample(&mut rng)).max(0.0);
            e[s] = me + effect_noise.sample(&mut rng);
        }
    }
    let names = ["Usual care", "Ketamine", "ECT", "rTMS", "Esketamine"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    PsaTable::from_arrays(names, (1..=n_draws as i64).collect(), cost, effect)
        .expect("simulated table")
}

fn bench_nmb_cube(c: &mut Criterion) {
    let lambdas = Jurisdiction::Au.default_lambda_grid();
    let mut group = c.benchmark_group("nmb_cube");
    for &n_draws in &DRAW_COUNTS {
        let table = simulated_table(n_draws);
        group.throughput(Throughput::Elements((n_draws * lambdas.len()) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n_draws), &table, |b, table| {
            b.iter(|| {
                compute_nmb(
                    black_box(table),
                    black_box(&lambdas),
                    Some("Ketamine"),
                    TieBreak::Declared,
                )
                .expect("nmb")
            })
        });
    }
    group.finish();
}

fn bench_frontier(c: &mut Criterion) {
    let lambdas = Jurisdiction::Au.default_lambda_grid();
    let mut group = c.benchmark_group("ceaf_sweep");
    for &n_draws in &DRAW_COUNTS {
        let table = simulated_table(n_draws);
        let strategies = table.strategies().to_vec();
        group.throughput(Throughput::Elements((n_draws * lambdas.len()) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n_draws), &table, |b, table| {
            b.iter(|| {
                compute_frontier(black_box(table), black_box(&lambdas), &strategies)
                    .expect("frontier")
            })
        });
    }
    group.finish();
}

criterion_group!(benches, bench_nmb_cube, bench_frontier);
criterion_main!(benches);
