//! Parameter layout of the walk.
//!
//! The parameter vector holds one rate per source followed by the
//! coefficients of every systematic, in the order the systematics were
//! given. A rate scales the nominal expectation of every signal that belongs
//! to its source.

use std::collections::HashSet;
use std::ops::Range;

use crate::error::{McmcError, Result};
use crate::likelihood_space::NLL_COLUMN;

/// A group of signals whose rates move together.
#[derive(Debug, Clone, PartialEq)]
pub struct Source {
    pub name: String,
    /// Central value of the rate scale factor.
    pub mean: f64,
    /// Proposal width, `ModelOptions::default_rate_sigma` if unset.
    pub sigma: Option<f64>,
    pub fixed: bool,
}

impl Source {
    pub fn new(name: impl Into<String>, mean: f64) -> Self {
        Source {
            name: name.into(),
            mean,
            sigma: None,
            fixed: false,
        }
    }

    pub fn with_sigma(mut self, sigma: f64) -> Self {
        self.sigma = Some(sigma);
        self
    }

    pub fn fixed(mut self) -> Self {
        self.fixed = true;
        self
    }
}

/// Metadata of one mixture component.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalInfo {
    pub name: String,
    /// Index into the source list.
    pub source: usize,
    /// Expected number of events inside the observable range at nominal
    /// systematics.
    pub nexpected: f64,
    /// Number of simulated events the density was built from.
    pub n_mc: f64,
    /// Fraction of simulated events inside the observable range at nominal
    /// systematics. Already folded into `nexpected`.
    pub efficiency: f64,
}

impl SignalInfo {
    pub fn new(name: impl Into<String>, source: usize, nexpected: f64, n_mc: f64) -> Self {
        SignalInfo {
            name: name.into(),
            source,
            nexpected,
            n_mc,
            efficiency: 1f64,
        }
    }
}

/// A measured quantity of the events, binned over `[lower, upper]`.
#[derive(Debug, Clone, PartialEq)]
pub struct Observable {
    pub name: String,
    /// Name of the dataset field holding this quantity.
    pub field: String,
    pub lower: f64,
    pub upper: f64,
    pub bins: usize,
    /// Region removed from the fit, see `dataset::apply_exclusions`.
    pub exclude: Option<(f64, f64)>,
}

impl Observable {
    pub fn new(
        name: impl Into<String>,
        field: impl Into<String>,
        lower: f64,
        upper: f64,
        bins: usize,
    ) -> Self {
        Observable {
            name: name.into(),
            field: field.into(),
            lower,
            upper,
            bins,
            exclude: None,
        }
    }

    pub fn with_exclusion(mut self, lower: f64, upper: f64) -> Self {
        self.exclude = Some((lower, upper));
        self
    }

    pub fn contains(&self, value: f64) -> bool {
        (value >= self.lower) & (value <= self.upper)
    }

    pub fn bin_width(&self) -> f64 {
        (self.upper - self.lower) / self.bins as f64
    }
}

/// How a systematic distorts its observable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystematicKind {
    /// `x + p(x)`
    Shift,
    /// `x * (1 + p(x))`
    Scale,
    /// `t + (x - t) * (1 + p(t))`, with `t` the true value of `x`
    ResolutionScale,
}

/// A nuisance parameter group with a Gaussian constraint.
///
/// `means` and `sigmas` hold one entry per polynomial coefficient. The sigma
/// is both the proposal width and the width of the constraint.
#[derive(Debug, Clone, PartialEq)]
pub struct Systematic {
    pub name: String,
    pub kind: SystematicKind,
    pub observable_field: String,
    /// Field with the true value, required by `ResolutionScale`.
    pub truth_field: Option<String>,
    pub means: Vec<f64>,
    pub sigmas: Vec<f64>,
    pub fixed: bool,
}

impl Systematic {
    pub fn new(
        name: impl Into<String>,
        kind: SystematicKind,
        observable_field: impl Into<String>,
        means: Vec<f64>,
        sigmas: Vec<f64>,
    ) -> Self {
        Systematic {
            name: name.into(),
            kind,
            observable_field: observable_field.into(),
            truth_field: None,
            means,
            sigmas,
            fixed: false,
        }
    }

    pub fn with_truth_field(mut self, field: impl Into<String>) -> Self {
        self.truth_field = Some(field.into());
        self
    }

    pub fn fixed(mut self) -> Self {
        self.fixed = true;
        self
    }

    pub fn npars(&self) -> usize {
        self.means.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    Rate { source: usize },
    Systematic { systematic: usize, coefficient: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Parameter {
    pub name: String,
    pub kind: ParameterKind,
    pub mean: f64,
    pub sigma: f64,
    pub fixed: bool,
}

impl Parameter {
    pub fn is_floating(&self) -> bool {
        !self.fixed
    }

    /// Whether the parameter adds a Gaussian term to the likelihood.
    pub fn is_constrained(&self) -> bool {
        matches!(self.kind, ParameterKind::Systematic { .. }) & !self.fixed & (self.sigma > 0f64)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ModelOptions {
    /// Proposal width of rates whose source does not set one.
    pub default_rate_sigma: f64,
}

impl Default for ModelOptions {
    fn default() -> Self {
        ModelOptions {
            default_rate_sigma: 0.1,
        }
    }
}

/// Names, central values, widths and the fixed/floating split of all
/// parameters, together with the signal metadata they act on.
#[derive(Debug, Clone)]
pub struct ParameterModel {
    parameters: Vec<Parameter>,
    floating: Vec<usize>,
    nsources: usize,
    signals: Vec<SignalInfo>,
    systematics: Vec<Systematic>,
}

impl ParameterModel {
    pub fn new(
        sources: &[Source],
        signals: &[SignalInfo],
        systematics: &[Systematic],
        observables: &[Observable],
        options: ModelOptions,
    ) -> Result<Self> {
        if sources.is_empty() {
            return Err(config("at least one source is required"));
        }
        if signals.is_empty() {
            return Err(config("at least one signal is required"));
        }
        check_width("default rate sigma", options.default_rate_sigma)?;

        for signal in signals {
            if signal.source >= sources.len() {
                return Err(config(format!(
                    "signal '{}' references source {} but only {} sources are defined",
                    signal.name,
                    signal.source,
                    sources.len()
                )));
            }
            if !(signal.nexpected >= 0f64) | !signal.nexpected.is_finite() {
                return Err(config(format!(
                    "signal '{}' has invalid expectation {}",
                    signal.name, signal.nexpected
                )));
            }
        }

        if let Some(unused) = sources
            .iter()
            .enumerate()
            .find(|(idx, _)| !signals.iter().any(|s| s.source == *idx))
            .map(|(_, source)| source)
        {
            return Err(config(format!(
                "source '{}' is not referenced by any signal",
                unused.name
            )));
        }

        let mut parameters = Vec::with_capacity(
            sources.len() + systematics.iter().map(Systematic::npars).sum::<usize>(),
        );

        for (idx, source) in sources.iter().enumerate() {
            let sigma = source.sigma.unwrap_or(options.default_rate_sigma);
            check_width(&source.name, sigma)?;
            if !source.mean.is_finite() {
                return Err(config(format!("source '{}' has no finite mean", source.name)));
            }
            parameters.push(Parameter {
                name: source.name.clone(),
                kind: ParameterKind::Rate { source: idx },
                mean: source.mean,
                sigma,
                fixed: source.fixed,
            });
        }

        for (idx, syst) in systematics.iter().enumerate() {
            if syst.npars() == 0 {
                return Err(config(format!("systematic '{}' has no parameters", syst.name)));
            }
            if syst.sigmas.len() != syst.npars() {
                return Err(config(format!(
                    "systematic '{}' has {} means but {} sigmas",
                    syst.name,
                    syst.npars(),
                    syst.sigmas.len()
                )));
            }
            if !observables.iter().any(|o| o.field == syst.observable_field) {
                return Err(config(format!(
                    "systematic '{}' references unknown observable field '{}'",
                    syst.name, syst.observable_field
                )));
            }
            if (syst.kind == SystematicKind::ResolutionScale) & syst.truth_field.is_none() {
                return Err(config(format!(
                    "resolution systematic '{}' needs a truth field",
                    syst.name
                )));
            }
            for (coefficient, (&mean, &sigma)) in syst.means.iter().zip(&syst.sigmas).enumerate() {
                let name = if syst.npars() == 1 {
                    syst.name.clone()
                } else {
                    format!("{}_{}", syst.name, coefficient)
                };
                check_width(&name, sigma)?;
                if !mean.is_finite() {
                    return Err(config(format!("parameter '{}' has no finite mean", name)));
                }
                parameters.push(Parameter {
                    name,
                    kind: ParameterKind::Systematic {
                        systematic: idx,
                        coefficient,
                    },
                    mean,
                    sigma,
                    fixed: syst.fixed,
                });
            }
        }

        let mut seen = HashSet::new();
        for param in &parameters {
            if param.name == NLL_COLUMN {
                return Err(config(format!(
                    "parameter name '{}' is reserved for the likelihood column",
                    NLL_COLUMN
                )));
            }
            if !seen.insert(param.name.as_str()) {
                return Err(config(format!("duplicate parameter name '{}'", param.name)));
            }
        }

        let floating = parameters
            .iter()
            .enumerate()
            .filter(|(_, p)| p.is_floating())
            .map(|(idx, _)| idx)
            .collect();

        Ok(ParameterModel {
            parameters,
            floating,
            nsources: sources.len(),
            signals: signals.to_vec(),
            systematics: systematics.to_vec(),
        })
    }

    pub fn nparameters(&self) -> usize {
        self.parameters.len()
    }

    pub fn nfloating(&self) -> usize {
        self.floating.len()
    }

    pub fn nsources(&self) -> usize {
        self.nsources
    }

    pub fn nsignals(&self) -> usize {
        self.signals.len()
    }

    pub fn parameters(&self) -> &[Parameter] {
        &self.parameters
    }

    pub fn parameter(&self, idx: usize) -> Option<&Parameter> {
        self.parameters.get(idx)
    }

    /// Full-vector indices of the floating parameters, in vector order.
    pub fn floating_indices(&self) -> &[usize] {
        &self.floating
    }

    /// Map a floating-parameter index to its position in the full vector.
    pub fn full_index(&self, floating_idx: usize) -> Option<usize> {
        self.floating.get(floating_idx).copied()
    }

    pub fn names(&self) -> Vec<String> {
        self.parameters.iter().map(|p| p.name.clone()).collect()
    }

    /// The parameter vector at the central values.
    pub fn means(&self) -> Vec<f64> {
        self.parameters.iter().map(|p| p.mean).collect()
    }

    pub fn signals(&self) -> &[SignalInfo] {
        &self.signals
    }

    pub fn systematics(&self) -> &[Systematic] {
        &self.systematics
    }

    /// Positions of the systematic coefficients in the parameter vector.
    pub fn systematic_range(&self) -> Range<usize> {
        self.nsources..self.parameters.len()
    }

    /// True if no systematic coefficient can move during the walk.
    pub fn systematics_fixed(&self) -> bool {
        self.parameters[self.systematic_range()]
            .iter()
            .all(|p| p.fixed | (p.sigma == 0f64))
    }
}

fn config(msg: impl Into<String>) -> McmcError {
    McmcError::Configuration(msg.into())
}

fn check_width(name: &str, sigma: f64) -> Result<()> {
    if !(sigma >= 0f64) | !sigma.is_finite() {
        return Err(config(format!("'{}' has invalid sigma {}", name, sigma)));
    }
    Ok(())
}
