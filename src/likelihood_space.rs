use std::sync::Arc;

use arrow::array::{ArrayRef, Float64Array, StructArray};
use arrow::datatypes::{DataType, Field, Fields};
use faer::Mat;

use crate::error::{McmcError, Result};

/// Name of the likelihood column in exports. No parameter may use it.
pub const NLL_COLUMN: &str = "nll";

/// Counters describing a finished walk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkSummary {
    pub nsteps: u64,
    pub burnin_steps: u64,
    pub accepted: u64,
    pub rejected: u64,
    pub recorded: u64,
    pub flushes: u64,
    /// Number of lookup table recomputations, including the initial one.
    pub lut_evaluations: u64,
    /// Evaluations that hit the penalty value.
    pub degenerate_evaluations: u64,
}

impl WalkSummary {
    pub fn acceptance_rate(&self) -> f64 {
        let total = self.accepted + self.rejected;
        if total == 0 {
            return 0.;
        }
        self.accepted as f64 / total as f64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BestFit {
    /// Sample index of the lowest NLL.
    pub index: usize,
    pub nll: f64,
    pub values: Vec<f64>,
}

/// Histogram of one parameter's samples.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection {
    pub lower: f64,
    pub upper: f64,
    pub counts: Vec<u64>,
}

impl Projection {
    pub fn bin_width(&self) -> f64 {
        (self.upper - self.lower) / self.counts.len() as f64
    }

    pub fn bin_center(&self, bin: usize) -> f64 {
        self.lower + (bin as f64 + 0.5) * self.bin_width()
    }

    fn bin(&self, x: f64) -> usize {
        if self.upper <= self.lower {
            return 0;
        }
        let bin = ((x - self.lower) / self.bin_width()) as usize;
        bin.min(self.counts.len() - 1)
    }
}

/// Joint histogram of two parameters. `counts` is row-major with the first
/// parameter along the rows.
#[derive(Debug, Clone, PartialEq)]
pub struct Projection2d {
    pub x: Projection,
    pub y: Projection,
    pub counts: Vec<u64>,
}

/// The recorded samples of a walk, one column per parameter plus the NLL.
#[derive(Debug, Clone)]
pub struct LikelihoodSpace {
    names: Vec<String>,
    floating: Vec<bool>,
    columns: Vec<Vec<f64>>,
    nll: Vec<f64>,
    summary: WalkSummary,
}

impl LikelihoodSpace {
    pub fn new(
        names: Vec<String>,
        floating: Vec<bool>,
        columns: Vec<Vec<f64>>,
        nll: Vec<f64>,
        summary: WalkSummary,
    ) -> Result<Self> {
        if names.len() != columns.len() || floating.len() != columns.len() {
            return Err(McmcError::ShapeMismatch(format!(
                "{} names and {} flags for {} columns",
                names.len(),
                floating.len(),
                columns.len()
            )));
        }
        if names.iter().any(|name| name == NLL_COLUMN) {
            return Err(McmcError::Configuration(format!(
                "parameter name '{}' is reserved for the likelihood column",
                NLL_COLUMN
            )));
        }
        if let Some(column) = columns.iter().find(|c| c.len() != nll.len()) {
            return Err(McmcError::ShapeMismatch(format!(
                "column of {} samples next to {} NLL values",
                column.len(),
                nll.len()
            )));
        }
        Ok(LikelihoodSpace {
            names,
            floating,
            columns,
            nll,
            summary,
        })
    }

    pub fn len(&self) -> usize {
        self.nll.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nll.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn floating_names(&self) -> impl Iterator<Item = &str> {
        self.names
            .iter()
            .zip(&self.floating)
            .filter(|&(_, &floating)| floating)
            .map(|(name, _)| name.as_str())
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn values(&self, name: &str) -> Option<&[f64]> {
        self.index_of(name).map(|idx| self.columns[idx].as_slice())
    }

    pub fn nll(&self) -> &[f64] {
        &self.nll
    }

    pub fn summary(&self) -> &WalkSummary {
        &self.summary
    }

    /// Parameter vector of sample `i`.
    pub fn sample(&self, i: usize) -> Option<Vec<f64>> {
        if i >= self.len() {
            return None;
        }
        Some(self.columns.iter().map(|c| c[i]).collect())
    }

    /// The sample with the lowest NLL. Ties go to the earliest sample.
    pub fn best_fit(&self) -> Option<BestFit> {
        let (index, &nll) = self
            .nll
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| a.total_cmp(b))?;
        Some(BestFit {
            index,
            nll,
            values: self.sample(index)?,
        })
    }

    pub fn mean(&self, name: &str) -> Option<f64> {
        let values = self.values(name)?;
        if values.is_empty() {
            return None;
        }
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }

    /// Population standard deviation of a parameter.
    pub fn std_dev(&self, name: &str) -> Option<f64> {
        let values = self.values(name)?;
        let mean = self.mean(name)?;
        let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
        Some(var.sqrt())
    }

    fn empty_projection(&self, name: &str, bins: usize) -> Option<Projection> {
        if bins == 0 {
            return None;
        }
        let values = self.values(name)?;
        let (lower, upper) = values
            .iter()
            .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &v| (lo.min(v), hi.max(v)));
        if !lower.is_finite() || !upper.is_finite() {
            return None;
        }
        Some(Projection {
            lower,
            upper,
            counts: vec![0; bins],
        })
    }

    /// Histogram of one parameter over the range of its samples.
    pub fn projection(&self, name: &str, bins: usize) -> Option<Projection> {
        let mut projection = self.empty_projection(name, bins)?;
        for &value in self.values(name)? {
            let bin = projection.bin(value);
            projection.counts[bin] += 1;
        }
        Some(projection)
    }

    pub fn projection_2d(
        &self,
        x: &str,
        y: &str,
        xbins: usize,
        ybins: usize,
    ) -> Option<Projection2d> {
        let xp = self.empty_projection(x, xbins)?;
        let yp = self.empty_projection(y, ybins)?;
        let mut counts = vec![0u64; xbins * ybins];
        for (&vx, &vy) in self.values(x)?.iter().zip(self.values(y)?) {
            counts[xp.bin(vx) * ybins + yp.bin(vy)] += 1;
        }
        Some(Projection2d { x: xp, y: yp, counts })
    }

    /// Pearson correlation of two parameters. None if either is constant.
    pub fn correlation(&self, a: &str, b: &str) -> Option<f64> {
        let xs = self.values(a)?;
        let ys = self.values(b)?;
        let mx = self.mean(a)?;
        let my = self.mean(b)?;
        let mut sxy = 0f64;
        let mut sxx = 0f64;
        let mut syy = 0f64;
        for (&x, &y) in xs.iter().zip(ys) {
            sxy += (x - mx) * (y - my);
            sxx += (x - mx) * (x - mx);
            syy += (y - my) * (y - my);
        }
        if sxx <= 0. || syy <= 0. {
            return None;
        }
        Some(sxy / (sxx * syy).sqrt())
    }

    /// Correlations between all floating parameters, in the order of
    /// `floating_names`. Undefined entries are NaN.
    pub fn correlation_matrix(&self) -> Mat<f64> {
        let names: Vec<&str> = self.floating_names().collect();
        Mat::from_fn(names.len(), names.len(), |i, j| {
            if i == j {
                return 1.;
            }
            self.correlation(names[i], names[j]).unwrap_or(f64::NAN)
        })
    }

    /// Value below which a fraction `cl` of the samples lie.
    pub fn upper_limit(&self, name: &str, cl: f64) -> Option<f64> {
        if !(0. ..=1.).contains(&cl) {
            return None;
        }
        let mut values = self.values(name)?.to_vec();
        if values.is_empty() {
            return None;
        }
        values.sort_by(f64::total_cmp);
        let idx = ((cl * values.len() as f64).ceil() as usize).clamp(1, values.len()) - 1;
        Some(values[idx])
    }

    /// One Float64 column per parameter followed by `nll`.
    pub fn to_arrow(&self) -> StructArray {
        let mut fields: Vec<Field> = self
            .names
            .iter()
            .map(|name| Field::new(name, DataType::Float64, false))
            .collect();
        fields.push(Field::new(NLL_COLUMN, DataType::Float64, false));

        let mut arrays: Vec<ArrayRef> = self
            .columns
            .iter()
            .map(|column| Arc::new(Float64Array::from(column.clone())) as ArrayRef)
            .collect();
        arrays.push(Arc::new(Float64Array::from(self.nll.clone())));

        StructArray::new(Fields::from(fields), arrays, None)
    }
}
