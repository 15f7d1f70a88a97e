use anyhow::{bail, Result};

use crate::dataset::EventData;
use crate::error::{try_zeroed, McmcError};

/// Density of every event under every signal for one systematics
/// configuration.
///
/// Cells are stored row-major, one row per event. `norms[j]` is the total
/// weight behind the densities of signal `j`, so `cell / norms[j]` is a
/// normalized density. Providers that already return normalized densities
/// set all norms to one.
#[derive(Debug, Clone, PartialEq)]
pub struct LookupTable {
    values: Vec<f32>,
    norms: Vec<f64>,
    nevents: usize,
    nsignals: usize,
}

impl LookupTable {
    /// A zero-filled table.
    pub fn try_new(nevents: usize, nsignals: usize) -> Result<Self, McmcError> {
        let len = nevents.checked_mul(nsignals).ok_or_else(|| {
            McmcError::ShapeMismatch(format!("{} x {} lookup table", nevents, nsignals))
        })?;
        Ok(LookupTable {
            values: try_zeroed("lookup table", len)?,
            norms: vec![1f64; nsignals],
            nevents,
            nsignals,
        })
    }

    pub fn from_values(values: Vec<f32>, norms: Vec<f64>) -> Result<Self, McmcError> {
        let nsignals = norms.len();
        if nsignals == 0 || values.len() % nsignals != 0 {
            return Err(McmcError::ShapeMismatch(format!(
                "{} cells do not split into rows of {} signals",
                values.len(),
                nsignals
            )));
        }
        Ok(LookupTable {
            nevents: values.len() / nsignals,
            values,
            norms,
            nsignals,
        })
    }

    pub fn nevents(&self) -> usize {
        self.nevents
    }

    pub fn nsignals(&self) -> usize {
        self.nsignals
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [f32] {
        &mut self.values
    }

    pub fn norms(&self) -> &[f64] {
        &self.norms
    }

    pub fn norms_mut(&mut self) -> &mut [f64] {
        &mut self.norms
    }

    pub fn get(&self, event: usize, signal: usize) -> f32 {
        self.values[event * self.nsignals + signal]
    }

    pub fn row(&self, event: usize) -> &[f32] {
        &self.values[event * self.nsignals..(event + 1) * self.nsignals]
    }

    pub fn same_shape(&self, other: &LookupTable) -> bool {
        (self.nevents == other.nevents) & (self.nsignals == other.nsignals)
    }
}

/// Supplies the lookup table for the current systematic coefficients.
///
/// The table handed to `fill` is already sized to the dataset and the signal
/// count, and must keep that shape. For identical systematics the provider
/// must produce identical tables.
pub trait LutProvider {
    /// Whether the table changes with the systematic coefficients. If not,
    /// it is computed once at the start of the walk.
    fn shape_dependent(&self) -> bool {
        true
    }

    fn fill(
        &mut self,
        data: &EventData,
        systematics: &[f64],
        table: &mut LookupTable,
    ) -> Result<()>;
}

/// A table computed ahead of time, independent of any systematic.
#[derive(Debug, Clone)]
pub struct StaticLut {
    table: LookupTable,
}

impl StaticLut {
    pub fn new(table: LookupTable) -> Self {
        StaticLut { table }
    }

    /// Every event gets the same density under each signal.
    pub fn uniform(nevents: usize, densities: &[f32]) -> Result<Self, McmcError> {
        let values = (0..nevents).flat_map(|_| densities.iter().copied()).collect();
        Ok(StaticLut::new(LookupTable::from_values(
            values,
            vec![1f64; densities.len()],
        )?))
    }
}

impl LutProvider for StaticLut {
    fn shape_dependent(&self) -> bool {
        false
    }

    fn fill(
        &mut self,
        data: &EventData,
        _systematics: &[f64],
        table: &mut LookupTable,
    ) -> Result<()> {
        if data.nevents() != self.table.nevents() {
            bail!(
                "precomputed table has {} events, dataset has {}",
                self.table.nevents(),
                data.nevents()
            );
        }
        if !table.same_shape(&self.table) {
            bail!(
                "precomputed table is {} x {}, expected {} x {}",
                self.table.nevents(),
                self.table.nsignals(),
                table.nevents(),
                table.nsignals()
            );
        }
        table.clone_from(&self.table);
        Ok(())
    }
}
