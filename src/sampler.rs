use anyhow::Result;
use rand::Rng;

use crate::dataset::EventData;
use crate::error::McmcError;
use crate::likelihood_space::{LikelihoodSpace, WalkSummary};
use crate::lut::{LookupTable, LutProvider};
use crate::nll::{NllEvaluator, NllSettings, DEGENERATE_NLL};
use crate::parameters::ParameterModel;
use crate::proposal::ProposalGenerator;
use crate::recorder::{ChainRecorder, SampleStorage, VecStorage};
use crate::rng::RngPool;

/// Settings for one random walk.
#[derive(Debug, Clone)]
pub struct WalkSettings {
    /// Total number of proposals, burn-in included.
    pub nsteps: u64,
    /// Fraction of `nsteps` that is not recorded. Must be in `[0, 1)`.
    pub burnin_fraction: f64,
    /// Accept and record every proposal regardless of its likelihood.
    pub debug_mode: bool,
    /// Number of steps between moves of the sample buffer to storage.
    pub sync_interval: u64,
    pub seed: u64,
    /// Number of independent proposal streams.
    pub num_lanes: usize,
    pub nll: NllSettings,
}

impl Default for WalkSettings {
    fn default() -> Self {
        WalkSettings {
            nsteps: 10000,
            burnin_fraction: 0.1,
            debug_mode: false,
            sync_interval: 10000,
            seed: 42,
            num_lanes: 4,
            nll: NllSettings::default(),
        }
    }
}

impl WalkSettings {
    pub fn new(nsteps: u64, burnin_fraction: f64) -> Self {
        WalkSettings {
            nsteps,
            burnin_fraction,
            ..Default::default()
        }
    }

    pub fn burnin_steps(&self) -> u64 {
        (self.nsteps as f64 * self.burnin_fraction).floor() as u64
    }

    pub fn validate(&self) -> Result<(), McmcError> {
        if self.nsteps == 0 {
            return Err(invalid("nsteps must be positive"));
        }
        if !(0f64..1f64).contains(&self.burnin_fraction) {
            return Err(invalid(format!(
                "burnin fraction {} is outside [0, 1)",
                self.burnin_fraction
            )));
        }
        if self.sync_interval == 0 {
            return Err(invalid("sync interval must be positive"));
        }
        if self.num_lanes == 0 {
            return Err(invalid("at least one lane is required"));
        }
        if self.nll.chunk_size == 0 {
            return Err(invalid("chunk size must be positive"));
        }
        Ok(())
    }
}

fn invalid(msg: impl Into<String>) -> McmcError {
    McmcError::InvalidSettings(msg.into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Burnin,
    Sampling,
    Done,
}

/// The accepted point of the chain and its counters.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainState {
    pub position: Vec<f64>,
    pub nll: f64,
    /// Number of completed steps.
    pub step: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub phase: Phase,
}

/// Metropolis rule for a uniform draw `u` in `[0, 1)`.
///
/// A candidate that is at least as likely as the current point is always
/// accepted, independent of `u`.
pub fn accept(current_nll: f64, candidate_nll: f64, u: f64) -> bool {
    if candidate_nll <= current_nll {
        return true;
    }
    u < (current_nll - candidate_nll).exp()
}

/// Drives a Metropolis-Hastings random walk over a parameter model.
///
/// The chain itself is sequential. Within a step the likelihood is evaluated
/// in parallel over events, according to the backend in `NllSettings`.
pub struct MetropolisSampler<P: LutProvider> {
    model: ParameterModel,
    provider: P,
    state: Option<ChainState>,
}

impl<P: LutProvider> MetropolisSampler<P> {
    pub fn new(model: ParameterModel, provider: P) -> Self {
        MetropolisSampler {
            model,
            provider,
            state: None,
        }
    }

    pub fn model(&self) -> &ParameterModel {
        &self.model
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// State of the chain at the end of the last walk.
    pub fn state(&self) -> Option<&ChainState> {
        self.state.as_ref()
    }

    /// Run a walk and keep the samples in memory.
    pub fn run(&mut self, data: &EventData, settings: &WalkSettings) -> Result<LikelihoodSpace> {
        let storage = VecStorage::new(self.model.nparameters() + 1);
        self.run_with_storage(data, settings, storage)
    }

    pub fn run_with_storage<S: SampleStorage>(
        &mut self,
        data: &EventData,
        settings: &WalkSettings,
        storage: S,
    ) -> Result<LikelihoodSpace> {
        settings.validate()?;

        let model = &self.model;
        let nevents = data.nevents();
        let nsignals = model.nsignals();
        let systematics = model.systematic_range();
        let burnin_steps = settings.burnin_steps();

        let mut current_table = LookupTable::try_new(nevents, nsignals)?;
        let recompute = self.provider.shape_dependent() & !model.systematics_fixed();
        let mut candidate_table = if recompute {
            LookupTable::try_new(nevents, nsignals)?
        } else {
            LookupTable::try_new(0, nsignals)?
        };

        let mut evaluator = NllEvaluator::new(model, nevents, settings.nll.clone())?;
        let proposals = ProposalGenerator::new(model);
        let mut rngs = RngPool::new(settings.seed, settings.num_lanes);

        let capacity = settings
            .sync_interval
            .min(settings.nsteps - burnin_steps)
            .try_into()
            .unwrap_or(usize::MAX);
        let mut recorder = ChainRecorder::new(storage, model.nparameters(), capacity)?;

        let mut state = ChainState {
            position: model.means(),
            nll: f64::NAN,
            step: 0,
            accepted: 0,
            rejected: 0,
            phase: Phase::Init,
        };
        self.provider
            .fill(data, &state.position[systematics.clone()], &mut current_table)?;
        let mut lut_evaluations = 1u64;
        state.nll = evaluator.evaluate(&current_table, &state.position);
        if state.nll == DEGENERATE_NLL {
            log::warn!("likelihood is degenerate at the starting point");
        }
        log::info!(
            "starting walk of {} steps ({} burn-in) over {} events, {} floating parameters",
            settings.nsteps,
            burnin_steps,
            nevents,
            model.nfloating()
        );

        let mut candidate = vec![0f64; model.nparameters()];
        for step in 0..settings.nsteps {
            state.phase = if step < burnin_steps {
                Phase::Burnin
            } else {
                Phase::Sampling
            };

            let shape_changed = proposals.propose(&state.position, &mut candidate, &mut rngs);
            let fresh_table = recompute & shape_changed;
            if fresh_table {
                self.provider
                    .fill(data, &candidate[systematics.clone()], &mut candidate_table)?;
                lut_evaluations += 1;
            }
            let table = if fresh_table {
                &candidate_table
            } else {
                &current_table
            };
            let candidate_nll = evaluator.evaluate(table, &candidate);

            // one draw per step, debug mode included
            let u: f64 = rngs.control().random();
            if settings.debug_mode || accept(state.nll, candidate_nll, u) {
                std::mem::swap(&mut state.position, &mut candidate);
                state.nll = candidate_nll;
                if fresh_table {
                    std::mem::swap(&mut current_table, &mut candidate_table);
                }
                state.accepted += 1;
                if state.phase == Phase::Sampling {
                    recorder.record(&state.position, state.nll);
                }
            } else {
                state.rejected += 1;
            }

            state.step = step + 1;
            if state.step % settings.sync_interval == 0 {
                recorder.flush()?;
            }
        }
        state.phase = Phase::Done;

        let summary = WalkSummary {
            nsteps: settings.nsteps,
            burnin_steps,
            accepted: state.accepted,
            rejected: state.rejected,
            lut_evaluations,
            degenerate_evaluations: evaluator.degenerate_count(),
            ..Default::default()
        };
        let floating = model.parameters().iter().map(|p| p.is_floating()).collect();
        let space = recorder.finish(model.names(), floating, summary)?;

        let summary = space.summary();
        log::info!(
            "walk finished: {} steps, acceptance {:.3}, {} samples, {} table fills, {} degenerate",
            summary.nsteps,
            summary.acceptance_rate(),
            summary.recorded,
            summary.lut_evaluations,
            summary.degenerate_evaluations
        );
        self.state = Some(state);
        Ok(space)
    }
}
