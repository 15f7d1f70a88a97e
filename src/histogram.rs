//! Binned densities built from simulated events.
//!
//! Systematics act on the simulated events before they are binned, so every
//! change of a systematic coefficient rebuilds the histograms and with them
//! the lookup table.

use anyhow::{bail, Context};
use rayon::prelude::*;

use crate::dataset::EventData;
use crate::error::{try_zeroed, McmcError, Result};
use crate::lut::{LookupTable, LutProvider};
use crate::math::polynomial;
use crate::parameters::{Observable, SignalInfo, Systematic, SystematicKind};

#[derive(Debug, Clone)]
struct Axis {
    field: usize,
    lower: f64,
    upper: f64,
    bins: usize,
    stride: usize,
}

impl Axis {
    fn bin(&self, value: f64) -> Option<usize> {
        if !((value >= self.lower) & (value <= self.upper)) {
            return None;
        }
        let width = (self.upper - self.lower) / self.bins as f64;
        let idx = ((value - self.lower) / width) as usize;
        Some(idx.min(self.bins - 1))
    }
}

#[derive(Debug, Clone)]
struct BoundSystematic {
    kind: SystematicKind,
    axis: usize,
    truth_field: Option<usize>,
    offset: usize,
    npars: usize,
}

impl BoundSystematic {
    fn apply(&self, coefficients: &[f64], value: f64, row: &[f64]) -> f64 {
        let coefficients = &coefficients[self.offset..self.offset + self.npars];
        match self.kind {
            SystematicKind::Shift => value + polynomial(coefficients, value),
            SystematicKind::Scale => value * (1f64 + polynomial(coefficients, value)),
            SystematicKind::ResolutionScale => {
                let truth = self.truth_field.map_or(value, |idx| row[idx]);
                truth + (value - truth) * (1f64 + polynomial(coefficients, truth))
            }
        }
    }
}

/// Histogram density of one signal over all observables.
#[derive(Debug, Clone)]
pub struct HistogramPdf {
    axes: Vec<Axis>,
    samples: EventData,
    weights: Vec<f64>,
    systematics: Vec<BoundSystematic>,
    npars: usize,
    counts: Vec<f64>,
    bin_volume: f64,
    in_range: f64,
    n_mc: f64,
}

impl HistogramPdf {
    /// Bin `samples` over `observables`.
    ///
    /// `systematics` must be the same list, in the same order, as the one
    /// given to the parameter model, so that coefficient offsets agree.
    /// Empty `weights` weigh every sample with one.
    pub fn new(
        samples: EventData,
        weights: Vec<f64>,
        observables: &[Observable],
        systematics: &[Systematic],
    ) -> Result<Self> {
        if observables.is_empty() {
            return Err(McmcError::Configuration("a histogram needs observables".into()));
        }
        let weights = if weights.is_empty() {
            vec![1f64; samples.nevents()]
        } else {
            weights
        };
        if weights.len() != samples.nevents() {
            return Err(McmcError::ShapeMismatch(format!(
                "{} weights for {} samples",
                weights.len(),
                samples.nevents()
            )));
        }

        let mut axes = Vec::with_capacity(observables.len());
        for obs in observables {
            let field = samples.field_index(&obs.field).ok_or_else(|| {
                McmcError::Configuration(format!("samples have no field '{}'", obs.field))
            })?;
            if (obs.bins == 0) | !(obs.upper > obs.lower) {
                return Err(McmcError::Configuration(format!(
                    "observable '{}' has an empty range or no bins",
                    obs.name
                )));
            }
            axes.push(Axis {
                field,
                lower: obs.lower,
                upper: obs.upper,
                bins: obs.bins,
                stride: 1,
            });
        }

        let mut nbins = 1usize;
        for axis in axes.iter_mut().rev() {
            axis.stride = nbins;
            nbins = nbins.checked_mul(axis.bins).ok_or_else(|| {
                McmcError::Configuration("histogram has too many bins".into())
            })?;
        }

        let mut bound = Vec::with_capacity(systematics.len());
        let mut offset = 0;
        for syst in systematics {
            let axis = observables
                .iter()
                .position(|obs| obs.field == syst.observable_field)
                .ok_or_else(|| {
                    McmcError::Configuration(format!(
                        "systematic '{}' references unknown observable field '{}'",
                        syst.name, syst.observable_field
                    ))
                })?;
            let truth_field = match &syst.truth_field {
                Some(field) => Some(samples.field_index(field).ok_or_else(|| {
                    McmcError::Configuration(format!("samples have no truth field '{}'", field))
                })?),
                None => None,
            };
            bound.push(BoundSystematic {
                kind: syst.kind,
                axis,
                truth_field,
                offset,
                npars: syst.npars(),
            });
            offset += syst.npars();
        }

        let bin_volume = axes
            .iter()
            .map(|a| (a.upper - a.lower) / a.bins as f64)
            .product();
        let n_mc = weights.iter().sum();

        Ok(HistogramPdf {
            axes,
            samples,
            weights,
            systematics: bound,
            npars: offset,
            counts: try_zeroed("histogram", nbins)?,
            bin_volume,
            in_range: 0f64,
            n_mc,
        })
    }

    /// Total weight of the simulated events.
    pub fn n_mc(&self) -> f64 {
        self.n_mc
    }

    /// Weight inside the observable range after the last `fill`.
    pub fn in_range(&self) -> f64 {
        self.in_range
    }

    /// Rebin the samples with the given systematic coefficients and return
    /// the weight that lands inside the observable range.
    pub fn fill(&mut self, coefficients: &[f64]) -> Result<f64> {
        if coefficients.len() < self.npars {
            return Err(McmcError::ShapeMismatch(format!(
                "{} systematic coefficients, histogram needs {}",
                coefficients.len(),
                self.npars
            )));
        }

        self.counts.fill(0f64);
        self.in_range = 0f64;
        let mut coords = vec![0f64; self.axes.len()];

        for (row, &weight) in self.samples.rows().zip(&self.weights) {
            for (coord, axis) in coords.iter_mut().zip(&self.axes) {
                *coord = row[axis.field];
            }
            for syst in &self.systematics {
                coords[syst.axis] = syst.apply(coefficients, coords[syst.axis], row);
            }
            if let Some(bin) = self.bin(&coords) {
                self.counts[bin] += weight;
                self.in_range += weight;
            }
        }
        Ok(self.in_range)
    }

    /// Unnormalized density at a point, given in observable order.
    pub fn density(&self, coords: &[f64]) -> f64 {
        self.bin(coords)
            .map_or(0f64, |bin| self.counts[bin] / self.bin_volume)
    }

    fn bin(&self, coords: &[f64]) -> Option<usize> {
        self.axes
            .iter()
            .zip(coords)
            .try_fold(0usize, |acc, (axis, &x)| Some(acc + axis.bin(x)? * axis.stride))
    }

    /// Fraction of the simulated weight inside the observable range with all
    /// systematics at their means.
    pub fn nominal_efficiency(&mut self, systematics: &[Systematic]) -> Result<f64> {
        let means: Vec<f64> = systematics
            .iter()
            .flat_map(|s| s.means.iter().copied())
            .collect();
        let in_range = self.fill(&means)?;
        if self.n_mc > 0f64 {
            Ok(in_range / self.n_mc)
        } else {
            Ok(0f64)
        }
    }

    /// Signal metadata with the expectation scaled by the nominal efficiency.
    ///
    /// `nexpected` is the number of physical events expected before any
    /// observable range is applied. A negative value is instead a scale
    /// factor on the simulated weight, so `-0.5` expects half of `n_mc`.
    pub fn signal_info(
        &mut self,
        name: impl Into<String>,
        source: usize,
        nexpected: f64,
        systematics: &[Systematic],
    ) -> Result<SignalInfo> {
        let name = name.into();
        if !nexpected.is_finite() {
            return Err(McmcError::Configuration(format!(
                "signal '{}' has invalid expectation {}",
                name, nexpected
            )));
        }
        let nexpected = if nexpected < 0f64 {
            -nexpected * self.n_mc
        } else {
            nexpected
        };
        let efficiency = self.nominal_efficiency(systematics)?;
        log::info!(
            "{}: {}/{} simulated events in range, efficiency {:.2}%",
            name,
            self.in_range,
            self.n_mc,
            100. * efficiency
        );
        Ok(SignalInfo {
            name,
            source,
            nexpected: nexpected * efficiency,
            n_mc: self.n_mc,
            efficiency,
        })
    }
}

/// Lookup tables from one histogram per signal.
#[derive(Debug, Clone)]
pub struct HistogramLut {
    observables: Vec<Observable>,
    pdfs: Vec<HistogramPdf>,
}

impl HistogramLut {
    /// `pdfs` are in signal order and binned over `observables`.
    pub fn new(observables: Vec<Observable>, pdfs: Vec<HistogramPdf>) -> Self {
        HistogramLut { observables, pdfs }
    }

    pub fn pdfs(&self) -> &[HistogramPdf] {
        &self.pdfs
    }
}

impl LutProvider for HistogramLut {
    fn fill(
        &mut self,
        data: &EventData,
        systematics: &[f64],
        table: &mut LookupTable,
    ) -> anyhow::Result<()> {
        let nsignals = self.pdfs.len();
        if (table.nsignals() != nsignals) | (table.nevents() != data.nevents()) {
            bail!(
                "table is {} x {}, need {} x {}",
                table.nevents(),
                table.nsignals(),
                data.nevents(),
                nsignals
            );
        }

        let fields = self
            .observables
            .iter()
            .map(|obs| {
                data.field_index(&obs.field)
                    .with_context(|| format!("dataset has no field '{}'", obs.field))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        for (pdf, norm) in self.pdfs.iter_mut().zip(table.norms_mut()) {
            *norm = pdf.fill(systematics)?;
        }

        if data.nevents() == 0 {
            return Ok(());
        }

        let pdfs = &self.pdfs;
        let nfields = data.nfields();
        table
            .values_mut()
            .par_chunks_exact_mut(nsignals)
            .zip(data.values().par_chunks_exact(nfields))
            .for_each_init(
                || vec![0f64; fields.len()],
                |coords, (cells, row)| {
                    for (coord, &field) in coords.iter_mut().zip(&fields) {
                        *coord = row[field];
                    }
                    for (cell, pdf) in cells.iter_mut().zip(pdfs) {
                        *cell = pdf.density(coords) as f32;
                    }
                },
            );
        Ok(())
    }
}
