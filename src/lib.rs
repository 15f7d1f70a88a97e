//! Metropolis-Hastings random walk over the likelihood of a signal mixture.
//!
//! A dataset of events is fit with a sum of signal distributions, each scaled
//! by the rate of its source and shaped by systematic coefficients. The walk
//! proposes Gaussian steps in the floating parameters, evaluates the extended
//! negative log-likelihood in parallel over the events, and records the
//! accepted points after burn-in.
//!
//! ```ignore
//! let options = ModelOptions::default();
//! let model = ParameterModel::new(&sources, &signals, &systematics, &observables, options)?;
//! let provider = HistogramLut::new(observables, pdfs);
//! let mut sampler = MetropolisSampler::new(model, provider);
//! let space = sampler.run(&data, &WalkSettings::new(100_000, 0.1))?;
//! println!("{:?}", space.best_fit());
//! ```

pub(crate) mod dataset;
pub(crate) mod error;
pub(crate) mod histogram;
pub(crate) mod likelihood_space;
pub(crate) mod lut;
pub(crate) mod math;
pub(crate) mod nll;
pub(crate) mod parameters;
pub(crate) mod proposal;
pub(crate) mod recorder;
pub(crate) mod rng;
pub(crate) mod sampler;

pub use dataset::{apply_exclusions, read_dataset_to_samples, EventData};
pub use error::McmcError;
pub use histogram::{HistogramLut, HistogramPdf};
pub use likelihood_space::{
    BestFit, LikelihoodSpace, Projection, Projection2d, WalkSummary, NLL_COLUMN,
};
pub use lut::{LookupTable, LutProvider, StaticLut};
pub use math::{parallel_reduce, Backend};
pub use nll::{NllEvaluator, NllSettings, NormalizationPolicy, DEGENERATE_NLL};
pub use parameters::{
    ModelOptions, Observable, Parameter, ParameterKind, ParameterModel, SignalInfo, Source,
    Systematic, SystematicKind,
};
pub use proposal::ProposalGenerator;
pub use recorder::{ArrowStorage, ChainRecorder, SampleStorage, VecStorage};
pub use rng::RngPool;
pub use sampler::{accept, ChainState, MetropolisSampler, Phase, WalkSettings};
