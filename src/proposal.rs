use rand::Rng;
use rand_distr::StandardNormal;

use crate::parameters::ParameterModel;
use crate::rng::RngPool;

/// Gaussian random-walk proposals.
///
/// Floating parameter `k` (counted among the floating parameters only) is
/// always drawn from lane `k % num_lanes`, so the proposals depend only on
/// the seed and the number of lanes.
#[derive(Debug, Clone)]
pub struct ProposalGenerator {
    floating: Vec<usize>,
    sigmas: Vec<f64>,
    first_systematic: usize,
}

impl ProposalGenerator {
    pub fn new(model: &ParameterModel) -> Self {
        let floating = model.floating_indices().to_vec();
        let sigmas = floating
            .iter()
            .map(|&idx| model.parameters()[idx].sigma)
            .collect();
        ProposalGenerator {
            floating,
            sigmas,
            first_systematic: model.systematic_range().start,
        }
    }

    /// Write a candidate next to `current` into `candidate`.
    ///
    /// Fixed parameters are copied. Returns true if a systematic coefficient
    /// changed, which invalidates the lookup table.
    pub fn propose(&self, current: &[f64], candidate: &mut [f64], rngs: &mut RngPool) -> bool {
        candidate.copy_from_slice(current);

        let num_lanes = rngs.num_lanes();
        let mut shape_changed = false;
        for (lane, rng) in rngs.lanes_mut().iter_mut().enumerate() {
            for k in (lane..self.floating.len()).step_by(num_lanes) {
                let idx = self.floating[k];
                let z: f64 = rng.sample(StandardNormal);
                candidate[idx] = current[idx] + self.sigmas[k] * z;
                shape_changed |= (idx >= self.first_systematic) & (candidate[idx] != current[idx]);
            }
        }
        shape_changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parameters::{
        ModelOptions, Observable, SignalInfo, Source, Systematic, SystematicKind,
    };
    use pretty_assertions::assert_eq;

    fn model(shift_sigma: f64) -> ParameterModel {
        ParameterModel::new(
            &[Source::new("a", 1.).with_sigma(0.5), Source::new("b", 2.).fixed()],
            &[SignalInfo::new("sa", 0, 10., 10.), SignalInfo::new("sb", 1, 10., 10.)],
            &[Systematic::new(
                "shift",
                SystematicKind::Shift,
                "x",
                vec![0.],
                vec![shift_sigma],
            )],
            &[Observable::new("x", "x", 0., 1., 1)],
            ModelOptions::default(),
        )
        .unwrap()
    }

    #[test]
    fn fixed_parameters_do_not_move() {
        let model = model(0.1);
        let proposals = ProposalGenerator::new(&model);
        let mut rngs = RngPool::new(3, 2);
        let current = model.means();
        let mut candidate = vec![0.; 3];
        for _ in 0..100 {
            let shape_changed = proposals.propose(&current, &mut candidate, &mut rngs);
            assert!(shape_changed);
            assert_eq!(candidate[1], 2.);
            assert!(candidate[0] != current[0]);
        }
    }

    #[test]
    fn zero_width_systematic_keeps_the_table() {
        let model = model(0.);
        let proposals = ProposalGenerator::new(&model);
        let mut rngs = RngPool::new(3, 2);
        let current = model.means();
        let mut candidate = vec![0.; 3];
        for _ in 0..100 {
            assert!(!proposals.propose(&current, &mut candidate, &mut rngs));
            assert_eq!(candidate[2], 0.);
        }
    }

    #[test]
    fn reproducible() {
        let model = model(0.1);
        let proposals = ProposalGenerator::new(&model);
        let run = |seed| {
            let mut rngs = RngPool::new(seed, 4);
            let mut current = model.means();
            let mut candidate = vec![0.; 3];
            for _ in 0..20 {
                proposals.propose(&current, &mut candidate, &mut rngs);
                current.copy_from_slice(&candidate);
            }
            current
        };
        assert_eq!(run(5), run(5));
        assert!(run(5) != run(6));
    }

    #[test]
    fn proposal_width() {
        let model = model(0.1);
        let proposals = ProposalGenerator::new(&model);
        let mut rngs = RngPool::new(9, 1);
        let current = model.means();
        let mut candidate = vec![0.; 3];
        let n = 20000;
        let steps: Vec<f64> = (0..n)
            .map(|_| {
                proposals.propose(&current, &mut candidate, &mut rngs);
                candidate[0] - current[0]
            })
            .collect();
        let mean = steps.iter().sum::<f64>() / n as f64;
        let var = steps.iter().map(|s| (s - mean) * (s - mean)).sum::<f64>() / n as f64;
        assert!(mean.abs() < 0.02);
        assert!((var.sqrt() - 0.5).abs() < 0.02);
    }
}
