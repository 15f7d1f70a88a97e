//! Extended negative log-likelihood of the signal mixture.
//!
//! ```text
//! -logL(v) = sum_j N_j(v)
//!          + 1/2 sum_k ((v_k - mean_k) / sigma_k)^2
//!          - sum_i log(sum_j N_j(v) * P_j(x_i) / norm_j)
//! ```
//!
//! The event term is computed in three stages: independent partial sums
//! over chunks of events, a fixed-order reduction of those partials, and a
//! final combine with the normalization and constraint terms. Only the first
//! stage runs in parallel.

use itertools::izip;

use crate::error::{try_zeroed, Result};
use crate::lut::LookupTable;
use crate::math::{chunk_log_density, parallel_reduce, Backend};
use crate::parameters::ParameterModel;

/// Returned in place of any NLL that is not a finite number, or for
/// parameter vectors with no or negative expected events.
///
/// It is finite, so the acceptance rule still works, and large enough that a
/// step onto it is always rejected.
pub const DEGENERATE_NLL: f64 = 1e100;

/// How the expected count of a signal follows the systematics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NormalizationPolicy {
    /// `N_j = rate * nexpected_j`, with the efficiency fixed at the
    /// systematic means.
    #[default]
    Nominal,
    /// The efficiency is re-derived from the normalization counts of the
    /// current lookup table: `N_j = rate * nexpected_j / eff_j * norm_j / n_mc_j`.
    PerStep,
}

#[derive(Debug, Clone)]
pub struct NllSettings {
    /// Number of events per stage-one chunk.
    pub chunk_size: usize,
    pub backend: Backend,
    pub normalization: NormalizationPolicy,
}

impl Default for NllSettings {
    fn default() -> Self {
        NllSettings {
            chunk_size: 4096,
            backend: Backend::default(),
            normalization: NormalizationPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Constraint {
    index: usize,
    mean: f64,
    sigma: f64,
}

#[derive(Debug, Clone)]
pub struct NllEvaluator {
    settings: NllSettings,
    nparameters: usize,
    sources: Vec<usize>,
    nexpected: Vec<f64>,
    n_mc: Vec<f64>,
    efficiency: Vec<f64>,
    constraints: Vec<Constraint>,
    expected: Vec<f64>,
    weights: Vec<f64>,
    partials: Vec<f64>,
    degenerate: u64,
}

impl NllEvaluator {
    /// An evaluator with scratch space for `nevents` events.
    pub fn new(model: &ParameterModel, nevents: usize, settings: NllSettings) -> Result<Self> {
        let nsignals = model.nsignals();
        let chunk_size = settings.chunk_size.max(1);
        let nchunks = nevents.div_ceil(chunk_size);

        let constraints = model
            .parameters()
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_constrained())
            .map(|(index, p)| Constraint {
                index,
                mean: p.mean,
                sigma: p.sigma,
            })
            .collect();

        let signals = model.signals();
        Ok(NllEvaluator {
            settings: NllSettings {
                chunk_size,
                ..settings
            },
            nparameters: model.nparameters(),
            sources: signals.iter().map(|s| s.source).collect(),
            nexpected: signals.iter().map(|s| s.nexpected).collect(),
            n_mc: signals.iter().map(|s| s.n_mc).collect(),
            efficiency: signals.iter().map(|s| s.efficiency).collect(),
            constraints,
            expected: try_zeroed("expected counts", nsignals)?,
            weights: try_zeroed("signal weights", nsignals)?,
            partials: try_zeroed("partial sums", nchunks)?,
            degenerate: 0,
        })
    }

    /// The negative log-likelihood of `position` given the densities in
    /// `table`.
    pub fn evaluate(&mut self, table: &LookupTable, position: &[f64]) -> f64 {
        assert_eq!(position.len(), self.nparameters);
        assert_eq!(table.nsignals(), self.sources.len());

        let Some(total_expected) = self.update_weights(table, position) else {
            return self.penalty();
        };

        let event_sum = self.event_sum(table);
        let nll = total_expected - event_sum + self.constraint(position);

        if nll.is_finite() {
            nll
        } else {
            self.penalty()
        }
    }

    /// Stage zero: expected counts and per-signal weights.
    ///
    /// Returns `None` if the expectations are degenerate.
    fn update_weights(&mut self, table: &LookupTable, position: &[f64]) -> Option<f64> {
        let policy = self.settings.normalization;
        let mut total = 0f64;
        let mut valid = true;

        izip!(
            self.expected.iter_mut(),
            self.weights.iter_mut(),
            &self.sources,
            &self.nexpected,
            &self.n_mc,
            &self.efficiency,
            table.norms(),
        )
        .for_each(|(expected, weight, &source, &nexpected, &n_mc, &eff, &norm)| {
            let mut count = position[source] * nexpected;
            if policy == NormalizationPolicy::PerStep {
                count = if (eff > 0f64) & (n_mc > 0f64) {
                    count / eff * norm / n_mc
                } else {
                    0f64
                };
            }
            *expected = count;
            *weight = if norm > 0f64 { count / norm } else { 0f64 };
            // also catches NaN
            valid &= count >= 0f64;
            total += count;
        });

        if valid & (total > 0f64) & total.is_finite() {
            Some(total)
        } else {
            None
        }
    }

    /// Stages one and two: `sum_i log(sum_j w_j P_j(x_i))`.
    fn event_sum(&mut self, table: &LookupTable) -> f64 {
        let nevents = table.nevents();
        if nevents == 0 {
            return 0f64;
        }

        let chunk_size = self.settings.chunk_size;
        let nchunks = nevents.div_ceil(chunk_size);
        if self.partials.len() != nchunks {
            self.partials.resize(nchunks, 0f64);
        }

        let nsignals = table.nsignals();
        let values = table.values();
        let weights = &self.weights;

        parallel_reduce(
            &self.settings.backend,
            &mut self.partials,
            |chunk| {
                let start = chunk * chunk_size * nsignals;
                let end = ((chunk + 1) * chunk_size * nsignals).min(values.len());
                chunk_log_density(&values[start..end], weights)
            },
            |a, b| a + b,
        )
        .unwrap_or(0f64)
    }

    /// Gaussian constraint of the floating systematics with nonzero sigma.
    pub fn constraint(&self, position: &[f64]) -> f64 {
        self.constraints
            .iter()
            .map(|c| {
                let pull = (position[c.index] - c.mean) / c.sigma;
                0.5 * pull * pull
            })
            .sum()
    }

    /// Expected counts of the last evaluation, in signal order.
    pub fn expected_counts(&self) -> &[f64] {
        &self.expected
    }

    /// Number of evaluations that returned `DEGENERATE_NLL`.
    pub fn degenerate_count(&self) -> u64 {
        self.degenerate
    }

    pub fn settings(&self) -> &NllSettings {
        &self.settings
    }

    fn penalty(&mut self) -> f64 {
        self.degenerate += 1;
        DEGENERATE_NLL
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::{
        ModelOptions, Observable, SignalInfo, Source, Systematic, SystematicKind,
    };
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use rand::{Rng, SeedableRng};
    use rand_chacha::ChaCha8Rng;

    fn two_signal_model(systematics: &[Systematic]) -> ParameterModel {
        ParameterModel::new(
            &[Source::new("a", 1.), Source::new("b", 1.)],
            &[SignalInfo::new("sa", 0, 30., 100.), SignalInfo::new("sb", 1, 70., 100.)],
            systematics,
            &[Observable::new("x", "x", 0., 1., 10)],
            ModelOptions::default(),
        )
        .unwrap()
    }

    fn random_table(nevents: usize, seed: u64) -> LookupTable {
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let values = (0..nevents * 2).map(|_| rng.random::<f32>() * 3.).collect();
        LookupTable::from_values(values, vec![1., 1.]).unwrap()
    }

    fn direct_nll(table: &LookupTable, position: &[f64], nexpected: &[f64]) -> f64 {
        let counts: Vec<f64> = nexpected.iter().zip(position).map(|(n, r)| n * r).collect();
        let mut nll: f64 = counts.iter().sum();
        for event in 0..table.nevents() {
            let density: f64 = table
                .row(event)
                .iter()
                .zip(&counts)
                .map(|(&p, n)| n * f64::from(p))
                .sum();
            if density > 0. {
                nll -= density.ln();
            }
        }
        nll
    }

    #[test]
    fn matches_direct_sum() {
        let model = two_signal_model(&[]);
        let table = random_table(1000, 1);
        let mut eval = NllEvaluator::new(&model, 1000, NllSettings::default()).unwrap();
        let position = [0.8, 1.3];
        let nll = eval.evaluate(&table, &position);
        assert_relative_eq!(nll, direct_nll(&table, &position, &[30., 70.]), max_relative = 1e-10);
        assert_relative_eq!(eval.expected_counts()[0], 24., max_relative = 1e-12);
        assert_relative_eq!(eval.expected_counts()[1], 91., max_relative = 1e-12);
    }

    #[test]
    fn chunk_size_is_at_least_one() {
        let model = two_signal_model(&[]);
        let settings = NllSettings {
            chunk_size: 0,
            backend: Backend::Serial,
            ..Default::default()
        };
        let mut eval = NllEvaluator::new(&model, 10, settings).unwrap();
        assert_eq!(eval.settings().chunk_size, 1);
        let table = random_table(10, 6);
        assert!(eval.evaluate(&table, &[1., 1.]) < DEGENERATE_NLL);
    }

    #[test]
    fn zero_rates_are_penalized() {
        let model = two_signal_model(&[]);
        let table = random_table(100, 2);
        let mut eval = NllEvaluator::new(&model, 100, NllSettings::default()).unwrap();
        let nll = eval.evaluate(&table, &[0., 0.]);
        assert!(nll.is_finite());
        assert_eq!(nll, DEGENERATE_NLL);
        assert_eq!(eval.degenerate_count(), 1);
    }

    #[test]
    fn negative_and_nan_rates_are_penalized() {
        let model = two_signal_model(&[]);
        let table = random_table(100, 3);
        let mut eval = NllEvaluator::new(&model, 100, NllSettings::default()).unwrap();
        assert_eq!(eval.evaluate(&table, &[-0.1, 1.]), DEGENERATE_NLL);
        assert_eq!(eval.evaluate(&table, &[f64::NAN, 1.]), DEGENERATE_NLL);
        assert_eq!(eval.evaluate(&table, &[f64::INFINITY, 1.]), DEGENERATE_NLL);
        assert_eq!(eval.degenerate_count(), 3);
    }

    #[test]
    fn one_zero_rate_is_fine() {
        let model = two_signal_model(&[]);
        let table = random_table(100, 4);
        let mut eval = NllEvaluator::new(&model, 100, NllSettings::default()).unwrap();
        let nll = eval.evaluate(&table, &[0., 1.]);
        assert!(nll < DEGENERATE_NLL);
        assert_eq!(eval.degenerate_count(), 0);
    }

    #[test]
    fn zero_density_events_contribute_nothing() {
        let model = two_signal_model(&[]);
        let table = LookupTable::from_values(vec![0., 0., 1., 1.], vec![1., 1.]).unwrap();
        let mut eval = NllEvaluator::new(&model, 2, NllSettings::default()).unwrap();
        let nll = eval.evaluate(&table, &[1., 1.]);
        assert_relative_eq!(nll, 100. - 100f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn norms_divide_densities() {
        let model = two_signal_model(&[]);
        let table = LookupTable::from_values(vec![10., 20.], vec![10., 20.]).unwrap();
        let mut eval = NllEvaluator::new(&model, 1, NllSettings::default()).unwrap();
        assert_relative_eq!(eval.evaluate(&table, &[1., 1.]), 100. - 100f64.ln(), epsilon = 1e-12);

        let empty = LookupTable::from_values(vec![0., 1.], vec![0., 1.]).unwrap();
        assert_relative_eq!(eval.evaluate(&empty, &[1., 1.]), 100. - 70f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn zero_sigma_systematic_has_no_constraint() {
        let systematics = [Systematic::new(
            "shift",
            SystematicKind::Shift,
            "x",
            vec![0.],
            vec![0.],
        )];
        let model = two_signal_model(&systematics);
        let eval = NllEvaluator::new(&model, 0, NllSettings::default()).unwrap();
        for value in [-100., -1., 0., 0.5, 1e6] {
            assert_eq!(eval.constraint(&[1., 1., value]), 0.);
        }
    }

    #[test]
    fn constraint_term() {
        let systematics = [
            Systematic::new("shift", SystematicKind::Shift, "x", vec![0.5], vec![0.25]),
            Systematic::new("scale", SystematicKind::Scale, "x", vec![0.], vec![0.1]).fixed(),
        ];
        let model = two_signal_model(&systematics);
        let table = random_table(10, 5);
        let mut eval = NllEvaluator::new(&model, 10, NllSettings::default()).unwrap();
        // pull of 2 on the floating systematic, the fixed one is ignored
        assert_relative_eq!(eval.constraint(&[1., 1., 1., 5.]), 2.);
        let with = eval.evaluate(&table, &[1., 1., 1., 5.]);
        let without = eval.evaluate(&table, &[1., 1., 0.5, 5.]);
        assert_relative_eq!(with - without, 2., epsilon = 1e-9);
    }

    #[test]
    fn per_step_normalization() {
        let mut signals = vec![SignalInfo::new("s", 0, 50., 200.)];
        signals[0].efficiency = 0.5;
        let model = ParameterModel::new(
            &[Source::new("a", 1.)],
            &signals,
            &[],
            &[],
            ModelOptions::default(),
        )
        .unwrap();
        let table = LookupTable::from_values(vec![1.], vec![50.]).unwrap();

        let settings = NllSettings {
            normalization: NormalizationPolicy::PerStep,
            ..Default::default()
        };
        let mut eval = NllEvaluator::new(&model, 1, settings).unwrap();
        eval.evaluate(&table, &[2.]);
        // 2 * 50 / 0.5 * 50 / 200
        assert_relative_eq!(eval.expected_counts()[0], 50.);

        let mut nominal = NllEvaluator::new(&model, 1, NllSettings::default()).unwrap();
        nominal.evaluate(&table, &[2.]);
        assert_relative_eq!(nominal.expected_counts()[0], 100.);
    }

    #[test]
    fn no_events() {
        let model = two_signal_model(&[]);
        let table = LookupTable::try_new(0, 2).unwrap();
        let mut eval = NllEvaluator::new(&model, 0, NllSettings::default()).unwrap();
        assert_relative_eq!(eval.evaluate(&table, &[1., 1.]), 100.);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn chunking_does_not_change_nll(
            nevents in 1usize..3000,
            chunk_size in 1usize..5000,
            seed in 0u64..1000,
            ra in 0.1f64..3.,
            rb in 0.1f64..3.,
        ) {
            let model = two_signal_model(&[]);
            let table = random_table(nevents, seed);
            let single = NllSettings {
                chunk_size: nevents,
                backend: Backend::Serial,
                ..Default::default()
            };
            let chunked = NllSettings {
                chunk_size,
                backend: Backend::Rayon,
                ..Default::default()
            };

            let mut a = NllEvaluator::new(&model, nevents, single).unwrap();
            let mut b = NllEvaluator::new(&model, nevents, chunked).unwrap();
            let nll_a = a.evaluate(&table, &[ra, rb]);
            let nll_b = b.evaluate(&table, &[ra, rb]);
            prop_assert!((nll_a - nll_b).abs() <= 1e-9 * (1. + nll_a.abs()));
        }

        #[test]
        fn backends_agree_exactly(
            nevents in 1usize..3000,
            chunk_size in 1usize..600,
            seed in 0u64..1000,
        ) {
            let model = two_signal_model(&[]);
            let table = random_table(nevents, seed);
            let serial = NllSettings {
                chunk_size,
                backend: Backend::Serial,
                ..Default::default()
            };
            let parallel = NllSettings {
                chunk_size,
                backend: Backend::Rayon,
                ..Default::default()
            };

            let mut a = NllEvaluator::new(&model, nevents, serial).unwrap();
            let mut b = NllEvaluator::new(&model, nevents, parallel).unwrap();
            prop_assert_eq!(
                a.evaluate(&table, &[1.1, 0.9]).to_bits(),
                b.evaluate(&table, &[1.1, 0.9]).to_bits()
            );
        }
    }
}
