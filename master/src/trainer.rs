//! Adaptive parameter trainer
//!
//! A fixed-period epoch pulls the last day of task history and worker stats,
//! fits the execution-time coefficients by ordinary least squares, evolves the
//! full parameter set with a small genetic algorithm, rebuilds the affinity
//! matrix and penalty vector from the window, and publishes the bundle
//! atomically for the scheduler to hot-reload. Epochs with too little history
//! publish the defaults so consumers always converge on a well-formed file.
//! The optimization itself runs on the blocking pool; an epoch never stalls
//! the RPC plane.

use crate::database::{db_history, db_worker_stats, HistoryRecord, MasterDatabase, WorkerStatsWindow};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shared::params::{ParameterBundle, AFFINITY_MAX, AFFINITY_MIN};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

const POPULATION: usize = 20;
const GENERATIONS: usize = 10;
const ELITISM: usize = 2;
const TOURNAMENT: usize = 3;
const CROSSOVER_RATE: f64 = 0.7;
const MUTATION_RATE: f64 = 0.1;

/// Minimum usable regression rows before OLS is attempted
const MIN_REGRESSION_ROWS: usize = 5;
const PIVOT_FLOOR: f64 = 1e-9;
const EPSILON: f64 = 1e-6;

/// Gene layout: theta[4], alpha, beta, affinity coefficients a1..a3,
/// penalty coefficients g1..g3
const GENE_COUNT: usize = 12;
type Chromosome = [f64; GENE_COUNT];

struct GeneSpec {
    min: f64,
    max: f64,
    sigma: f64,
}

const GENE_SPECS: [GeneSpec; GENE_COUNT] = [
    GeneSpec { min: 0.0, max: 2.0, sigma: 0.05 },   // theta cpu
    GeneSpec { min: 0.0, max: 2.0, sigma: 0.05 },   // theta mem
    GeneSpec { min: 0.0, max: 2.0, sigma: 0.05 },   // theta gpu
    GeneSpec { min: 0.0, max: 2.0, sigma: 0.05 },   // theta load
    GeneSpec { min: 0.0, max: 100.0, sigma: 2.0 },  // alpha
    GeneSpec { min: 0.0, max: 100.0, sigma: 0.5 },  // beta
    GeneSpec { min: 0.0, max: 2.0, sigma: 0.1 },    // a1 speed advantage
    GeneSpec { min: 0.0, max: 2.0, sigma: 0.1 },    // a2 SLA reliability
    GeneSpec { min: 0.0, max: 2.0, sigma: 0.1 },    // a3 overload avoidance
    GeneSpec { min: 0.0, max: 5.0, sigma: 0.25 },   // g1 SLA failure
    GeneSpec { min: 0.0, max: 5.0, sigma: 0.25 },   // g2 overload
    GeneSpec { min: 0.0, max: 5.0, sigma: 0.25 },   // g3 energy
];

const DEFAULT_THETA: [f64; 4] = [0.1, 0.1, 0.1, 0.1];
const DEFAULT_AFFINITY_COEFFS: [f64; 3] = [1.0, 1.0, 0.25];
const DEFAULT_PENALTY_COEFFS: [f64; 3] = [1.0, 1.0, 0.5];

/// What an epoch did
#[derive(Debug, PartialEq)]
pub enum EpochOutcome {
    /// Not enough history; the defaults bundle was published
    DefaultsPublished,
    /// A trained bundle was published from this many history records
    Published { history_len: usize },
}

pub struct AodTrainer {
    db: Arc<Mutex<MasterDatabase>>,
    param_path: PathBuf,
    window_seconds: u64,
    min_history: usize,
}

impl AodTrainer {
    pub fn new(
        db: Arc<Mutex<MasterDatabase>>,
        param_path: PathBuf,
        window_seconds: u64,
        min_history: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            db,
            param_path,
            window_seconds,
            min_history,
        })
    }

    /// Epoch loop. Runs until shutdown. A failed epoch is logged and retried
    /// on the next tick.
    pub async fn run(
        self: Arc<Self>,
        epoch_seconds: u64,
        mut shutdown_rx: tokio::sync::broadcast::Receiver<()>,
    ) {
        let mut interval = tokio::time::interval(Duration::from_secs(epoch_seconds.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.run_epoch().await {
                        Ok(outcome) => debug!(?outcome, "Trainer epoch finished"),
                        Err(e) => warn!(error = %e, "Trainer epoch failed, will retry next period"),
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Trainer received shutdown signal");
                    break;
                }
            }
        }
    }

    pub async fn run_epoch(&self) -> shared::Result<EpochOutcome> {
        self.run_epoch_seeded(None).await
    }

    /// Epoch with an optional RNG seed so tests are deterministic.
    pub async fn run_epoch_seeded(&self, seed: Option<u64>) -> shared::Result<EpochOutcome> {
        let now = shared::utils::current_timestamp();
        let since = now.saturating_sub(self.window_seconds);

        let (history, stats) = {
            let mut db = self.db.lock().await;
            let conn = db.get_connection()?;
            (
                db_history::fetch_window(conn, since)?,
                db_worker_stats::aggregate_window(conn, since)?,
            )
        };

        if history.len() < self.min_history {
            debug!(
                history = history.len(),
                min = self.min_history,
                "Insufficient history, publishing defaults"
            );
            let mut bundle = ParameterBundle::default();
            bundle.generated_at = now;
            bundle.save(&self.param_path)?;
            return Ok(EpochOutcome::DefaultsPublished);
        }

        // The published fitness weights carry over from the current bundle so
        // an operator override survives retraining.
        let fitness_weights = ParameterBundle::load(&self.param_path)
            .map(|b| b.fitness_weights)
            .unwrap_or(ParameterBundle::default().fitness_weights);

        let history_len = history.len();
        let window_seconds = self.window_seconds;
        let trained = tokio::task::spawn_blocking(move || {
            let mut rng = match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_os_rng(),
            };
            train(&history, &stats, window_seconds, &fitness_weights, &mut rng)
        })
        .await
        .map_err(|e| shared::OrchestratorError::Scheduling(format!("trainer panicked: {}", e)))?;

        let bundle = ParameterBundle {
            theta: trained.theta,
            alpha: trained.alpha,
            beta: trained.beta,
            affinity: trained.affinity,
            penalty: trained.penalty,
            fitness_weights,
            generated_at: now,
        };
        bundle.save(&self.param_path)?;

        info!(
            history = history_len,
            alpha = bundle.alpha,
            beta = bundle.beta,
            "Published trained parameter bundle"
        );
        Ok(EpochOutcome::Published { history_len })
    }
}

struct TrainedParams {
    theta: [f64; 4],
    alpha: f64,
    beta: f64,
    affinity: HashMap<String, HashMap<String, f64>>,
    penalty: HashMap<String, f64>,
}

/// Per-record regression features: resource-contention ratios and load
fn features(record: &HistoryRecord) -> [f64; 4] {
    [
        record.request.cpu / record.available_at_assign.cpu.max(EPSILON),
        record.request.mem_mb / record.available_at_assign.mem_mb.max(EPSILON),
        record.request.gpu / record.available_at_assign.gpu.max(EPSILON),
        record.worker_load,
    ]
}

/// The full offline optimization. Pure compute; runs on the blocking pool.
fn train(
    history: &[HistoryRecord],
    stats: &[WorkerStatsWindow],
    window_seconds: u64,
    fitness_weights: &[f64; 4],
    rng: &mut StdRng,
) -> TrainedParams {
    let seed_theta = fit_theta(history).unwrap_or(DEFAULT_THETA);
    let aggregates = WindowAggregates::compute(stats, window_seconds);
    let best = evolve(history, &aggregates, fitness_weights, seed_theta, rng);

    let affinity_coeffs = [best[6], best[7], best[8]];
    let penalty_coeffs = [best[9], best[10], best[11]];

    TrainedParams {
        theta: [best[0], best[1], best[2], best[3]],
        alpha: best[4],
        beta: best[5],
        affinity: build_affinity(history, stats, &affinity_coeffs),
        penalty: build_penalty(history, stats, &penalty_coeffs),
    }
}

/// Fit theta by ordinary least squares over `actual_runtime / tau - 1`.
/// Returns None when the window is too small or the normal equations are
/// ill-conditioned; callers fall back to the default coefficients.
fn fit_theta(history: &[HistoryRecord]) -> Option<[f64; 4]> {
    let rows: Vec<([f64; 4], f64)> = history
        .iter()
        .filter_map(|record| {
            let tau = record.tau_seconds?;
            if tau <= 0.0 || record.actual_runtime <= 0.0 {
                return None;
            }
            Some((features(record), record.actual_runtime / tau - 1.0))
        })
        .collect();

    if rows.len() < MIN_REGRESSION_ROWS {
        return None;
    }

    // Normal equations: (X'X) theta = X'y
    let mut xtx = [[0.0f64; 4]; 4];
    let mut xty = [0.0f64; 4];
    for (x, y) in &rows {
        for i in 0..4 {
            xty[i] += x[i] * y;
            for j in 0..4 {
                xtx[i][j] += x[i] * x[j];
            }
        }
    }

    let theta = solve_4x4(xtx, xty)?;
    if theta.iter().any(|t| !t.is_finite()) {
        return None;
    }
    // Negative contention coefficients have no physical meaning here; clip
    // into the gene range.
    Some([
        theta[0].clamp(0.0, 2.0),
        theta[1].clamp(0.0, 2.0),
        theta[2].clamp(0.0, 2.0),
        theta[3].clamp(0.0, 2.0),
    ])
}

/// Gaussian elimination with partial pivoting on a 4x4 system.
fn solve_4x4(mut a: [[f64; 4]; 4], mut b: [f64; 4]) -> Option<[f64; 4]> {
    for col in 0..4 {
        let pivot_row = (col..4).max_by(|&i, &j| {
            a[i][col]
                .abs()
                .partial_cmp(&a[j][col].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if a[pivot_row][col].abs() < PIVOT_FLOOR {
            return None;
        }
        a.swap(col, pivot_row);
        b.swap(col, pivot_row);

        for row in (col + 1)..4 {
            let factor = a[row][col] / a[col][col];
            for k in col..4 {
                a[row][k] -= factor * a[col][k];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = [0.0f64; 4];
    for row in (0..4).rev() {
        let mut sum = b[row];
        for col in (row + 1)..4 {
            sum -= a[row][col] * x[col];
        }
        x[row] = sum / a[row][row];
    }
    Some(x)
}

/// Chromosome-independent normalized aggregates of the stats window
struct WindowAggregates {
    utilization: f64,
    energy: f64,
    overload: f64,
}

impl WindowAggregates {
    fn compute(stats: &[WorkerStatsWindow], window_seconds: u64) -> Self {
        if stats.is_empty() || window_seconds == 0 {
            return Self {
                utilization: 0.0,
                energy: 0.0,
                overload: 0.0,
            };
        }
        let window = window_seconds as f64;
        let n = stats.len() as f64;

        // Three resource kinds are counted toward utilization.
        let utilization = stats
            .iter()
            .map(|w| (w.cpu_seconds + w.mem_seconds + w.gpu_seconds) / (3.0 * window))
            .sum::<f64>()
            / n;
        let energy = stats
            .iter()
            .map(|w| (0.65 * w.cpu_seconds + 0.35 * w.gpu_seconds) / window)
            .sum::<f64>()
            / n;
        let overload = stats
            .iter()
            .map(|w| w.overload_seconds / window)
            .sum::<f64>()
            / n;

        Self {
            utilization: utilization.max(0.0),
            energy: energy.max(0.0),
            overload: overload.max(0.0),
        }
    }
}

/// Fraction of window records whose predicted finish under the chromosome's
/// theta meets the recorded deadline.
fn predicted_sla_fraction(history: &[HistoryRecord], chromosome: &Chromosome) -> f64 {
    if history.is_empty() {
        return 0.0;
    }
    let on_time = history
        .iter()
        .filter(|record| {
            let Some(deadline) = record.deadline else {
                return true;
            };
            let Some(tau) = record.tau_seconds else {
                return true;
            };
            let x = features(record);
            let predicted = tau
                * (1.0
                    + chromosome[0] * x[0]
                    + chromosome[1] * x[1]
                    + chromosome[2] * x[2]
                    + chromosome[3] * x[3]);
            record.arrival_time as f64 + predicted <= deadline as f64
        })
        .count();
    on_time as f64 / history.len() as f64
}

fn fitness(
    history: &[HistoryRecord],
    aggregates: &WindowAggregates,
    weights: &[f64; 4],
    chromosome: &Chromosome,
) -> f64 {
    weights[0] * predicted_sla_fraction(history, chromosome)
        + weights[1] * aggregates.utilization
        - weights[2] * aggregates.energy
        - weights[3] * aggregates.overload
}

fn random_chromosome(rng: &mut StdRng) -> Chromosome {
    let mut genes = [0.0f64; GENE_COUNT];
    for (i, spec) in GENE_SPECS.iter().enumerate() {
        genes[i] = rng.random_range(spec.min..=spec.max);
    }
    genes
}

fn seed_chromosome(theta: [f64; 4]) -> Chromosome {
    [
        theta[0],
        theta[1],
        theta[2],
        theta[3],
        10.0,
        1.0,
        DEFAULT_AFFINITY_COEFFS[0],
        DEFAULT_AFFINITY_COEFFS[1],
        DEFAULT_AFFINITY_COEFFS[2],
        DEFAULT_PENALTY_COEFFS[0],
        DEFAULT_PENALTY_COEFFS[1],
        DEFAULT_PENALTY_COEFFS[2],
    ]
}

/// Standard normal via Box-Muller
fn gaussian(rng: &mut StdRng) -> f64 {
    let u1: f64 = rng.random::<f64>().max(1e-12);
    let u2: f64 = rng.random::<f64>();
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

fn tournament_select<'a>(scored: &'a [(f64, Chromosome)], rng: &mut StdRng) -> &'a Chromosome {
    let mut best: Option<&(f64, Chromosome)> = None;
    for _ in 0..TOURNAMENT {
        let candidate = &scored[rng.random_range(0..scored.len())];
        best = match best {
            Some(current) if current.0 >= candidate.0 => Some(current),
            _ => Some(candidate),
        };
    }
    &best.expect("tournament over non-empty population").1
}

fn crossover(p1: &Chromosome, p2: &Chromosome, rng: &mut StdRng) -> Chromosome {
    let mut child = *p1;
    if rng.random::<f64>() < CROSSOVER_RATE {
        for i in 0..GENE_COUNT {
            if rng.random::<f64>() < 0.5 {
                child[i] = p2[i];
            }
        }
    }
    child
}

fn mutate(chromosome: &mut Chromosome, rng: &mut StdRng) {
    for (i, spec) in GENE_SPECS.iter().enumerate() {
        if rng.random::<f64>() < MUTATION_RATE {
            chromosome[i] =
                (chromosome[i] + gaussian(rng) * spec.sigma).clamp(spec.min, spec.max);
        }
    }
}

fn evolve(
    history: &[HistoryRecord],
    aggregates: &WindowAggregates,
    weights: &[f64; 4],
    seed_theta: [f64; 4],
    rng: &mut StdRng,
) -> Chromosome {
    let mut population: Vec<Chromosome> = Vec::with_capacity(POPULATION);
    population.push(seed_chromosome(seed_theta));
    while population.len() < POPULATION {
        population.push(random_chromosome(rng));
    }

    let score = |population: &[Chromosome]| -> Vec<(f64, Chromosome)> {
        let mut scored: Vec<(f64, Chromosome)> = population
            .iter()
            .map(|c| (fitness(history, aggregates, weights, c), *c))
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored
    };

    for _ in 0..GENERATIONS {
        let scored = score(&population);
        let mut next: Vec<Chromosome> =
            scored.iter().take(ELITISM).map(|(_, c)| *c).collect();
        while next.len() < POPULATION {
            let p1 = *tournament_select(&scored, rng);
            let p2 = *tournament_select(&scored, rng);
            let mut child = crossover(&p1, &p2, rng);
            mutate(&mut child, rng);
            next.push(child);
        }
        population = next;
    }

    score(&population)[0].1
}

/// Per-worker overload and energy fractions from the stats window
fn worker_fractions(stats: &[WorkerStatsWindow]) -> HashMap<String, (f64, f64)> {
    stats
        .iter()
        .filter(|w| w.total_seconds > 0.0)
        .map(|w| {
            (
                w.worker_id.clone(),
                (
                    w.overload_seconds / w.total_seconds,
                    (0.65 * w.cpu_seconds + 0.35 * w.gpu_seconds) / w.total_seconds,
                ),
            )
        })
        .collect()
}

/// Affinity per (task type, worker): speed advantage plus SLA reliability
/// minus overload avoidance, weighted by the evolved coefficients. Pairs with
/// fewer than two samples stay neutral at 1.0.
fn build_affinity(
    history: &[HistoryRecord],
    stats: &[WorkerStatsWindow],
    coeffs: &[f64; 3],
) -> HashMap<String, HashMap<String, f64>> {
    let fractions = worker_fractions(stats);

    // Mean tau per task type is the speed baseline
    let mut type_tau: HashMap<&str, (f64, usize)> = HashMap::new();
    for record in history {
        if let Some(tau) = record.tau_seconds {
            let entry = type_tau.entry(record.task_type.as_str()).or_insert((0.0, 0));
            entry.0 += tau;
            entry.1 += 1;
        }
    }

    let mut groups: HashMap<(&str, &str), Vec<&HistoryRecord>> = HashMap::new();
    for record in history {
        groups
            .entry((record.task_type.as_str(), record.worker_id.as_str()))
            .or_default()
            .push(record);
    }

    let mut matrix: HashMap<String, HashMap<String, f64>> = HashMap::new();
    for ((task_type, worker_id), records) in groups {
        let score = if records.len() < 2 {
            1.0
        } else {
            let avg_runtime =
                records.iter().map(|r| r.actual_runtime).sum::<f64>() / records.len() as f64;
            let baseline = type_tau
                .get(task_type)
                .filter(|(_, n)| *n > 0)
                .map(|(sum, n)| sum / *n as f64);
            let speed = match (baseline, avg_runtime > 0.0) {
                (Some(baseline), true) => baseline / avg_runtime,
                _ => 1.0,
            };
            let reliability = records.iter().filter(|r| r.sla_success).count() as f64
                / records.len() as f64;
            let overload = fractions.get(worker_id).map(|(o, _)| *o).unwrap_or(0.0);
            coeffs[0] * speed + coeffs[1] * reliability - coeffs[2] * overload
        };

        matrix
            .entry(task_type.to_string())
            .or_default()
            .insert(
                worker_id.to_string(),
                score.clamp(AFFINITY_MIN, AFFINITY_MAX),
            );
    }
    matrix
}

/// Penalty per worker: SLA-failure rate, overload fraction, and energy term
/// combined with the evolved coefficients, clamped non-negative.
fn build_penalty(
    history: &[HistoryRecord],
    stats: &[WorkerStatsWindow],
    coeffs: &[f64; 3],
) -> HashMap<String, f64> {
    let fractions = worker_fractions(stats);

    let mut completions: HashMap<&str, (usize, usize)> = HashMap::new();
    for record in history {
        let entry = completions.entry(record.worker_id.as_str()).or_insert((0, 0));
        entry.0 += 1;
        if !record.sla_success {
            entry.1 += 1;
        }
    }

    let mut workers: Vec<&str> = completions.keys().copied().collect();
    for window in stats {
        if !workers.contains(&window.worker_id.as_str()) {
            workers.push(window.worker_id.as_str());
        }
    }

    let mut penalty = HashMap::new();
    for worker_id in workers {
        let failure_rate = completions
            .get(worker_id)
            .filter(|(total, _)| *total > 0)
            .map(|(total, failures)| *failures as f64 / *total as f64)
            .unwrap_or(0.0);
        let (overload, energy) = fractions.get(worker_id).copied().unwrap_or((0.0, 0.0));
        let value = coeffs[0] * failure_rate + coeffs[1] * overload + coeffs[2] * energy;
        penalty.insert(worker_id.to_string(), value.max(0.0));
    }
    penalty
}
