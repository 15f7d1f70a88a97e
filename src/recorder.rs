use anyhow::{bail, Result};
use arrow::array::{Array, ArrayBuilder, Float64Array, Float64Builder};

use crate::error::McmcError;
use crate::likelihood_space::{LikelihoodSpace, WalkSummary};

/// Durable storage for recorded samples.
///
/// Samples arrive in blocks of rows, each row holding the parameter vector
/// followed by its NLL.
pub trait SampleStorage: Send {
    fn append_block(&mut self, rows: &[f64], width: usize) -> Result<()>;

    /// Number of rows stored so far.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All stored values, one column per row entry.
    fn into_columns(self) -> Result<Vec<Vec<f64>>>;
}

/// Column vectors in memory.
#[derive(Debug, Clone)]
pub struct VecStorage {
    columns: Vec<Vec<f64>>,
}

impl VecStorage {
    pub fn new(width: usize) -> Self {
        VecStorage {
            columns: vec![Vec::new(); width],
        }
    }
}

impl SampleStorage for VecStorage {
    fn append_block(&mut self, rows: &[f64], width: usize) -> Result<()> {
        if width != self.columns.len() {
            bail!("storage has {} columns, got rows of {}", self.columns.len(), width);
        }
        for row in rows.chunks_exact(width) {
            for (column, &value) in self.columns.iter_mut().zip(row) {
                column.push(value);
            }
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.columns.first().map_or(0, Vec::len)
    }

    fn into_columns(self) -> Result<Vec<Vec<f64>>> {
        Ok(self.columns)
    }
}

/// Arrow column builders.
pub struct ArrowStorage {
    builders: Vec<Float64Builder>,
}

impl ArrowStorage {
    pub fn new(width: usize) -> Self {
        ArrowStorage {
            builders: (0..width).map(|_| Float64Builder::new()).collect(),
        }
    }
}

impl SampleStorage for ArrowStorage {
    fn append_block(&mut self, rows: &[f64], width: usize) -> Result<()> {
        if width != self.builders.len() {
            bail!("storage has {} columns, got rows of {}", self.builders.len(), width);
        }
        for row in rows.chunks_exact(width) {
            for (builder, &value) in self.builders.iter_mut().zip(row) {
                builder.append_value(value);
            }
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.builders.first().map_or(0, |b| ArrayBuilder::len(b))
    }

    fn into_columns(self) -> Result<Vec<Vec<f64>>> {
        self.builders
            .into_iter()
            .map(|mut builder| {
                let array: Float64Array = builder.finish();
                if array.null_count() != 0 {
                    bail!("sample column contains nulls");
                }
                Ok(array.values().to_vec())
            })
            .collect()
    }
}

/// Buffers recorded samples and moves them to storage in blocks.
pub struct ChainRecorder<S: SampleStorage> {
    storage: S,
    buffer: Vec<f64>,
    width: usize,
    recorded: u64,
    flushed: u64,
    flushes: u64,
}

impl<S: SampleStorage> ChainRecorder<S> {
    /// Reserve room for `capacity` samples of `nparameters` values each.
    pub fn new(storage: S, nparameters: usize, capacity: usize) -> Result<Self, McmcError> {
        let width = nparameters + 1;
        let len = capacity.saturating_mul(width);
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(len)
            .map_err(|source| McmcError::ResourceExhaustion {
                what: "sample buffer",
                len,
                source,
            })?;
        Ok(ChainRecorder {
            storage,
            buffer,
            width,
            recorded: 0,
            flushed: 0,
            flushes: 0,
        })
    }

    pub fn record(&mut self, position: &[f64], nll: f64) {
        assert_eq!(position.len() + 1, self.width);
        self.buffer.extend_from_slice(position);
        self.buffer.push(nll);
        self.recorded += 1;
    }

    /// Copy the buffered samples to storage and clear the buffer.
    pub fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let rows = self.pending();
        self.storage.append_block(&self.buffer, self.width)?;
        self.buffer.clear();
        self.flushed += rows as u64;
        self.flushes += 1;
        log::debug!("flushed {} samples, {} in storage", rows, self.storage.len());
        Ok(())
    }

    /// Samples waiting in the buffer.
    pub fn pending(&self) -> usize {
        self.buffer.len() / self.width
    }

    pub fn recorded(&self) -> u64 {
        self.recorded
    }

    pub fn flushed(&self) -> u64 {
        self.flushed
    }

    pub fn flushes(&self) -> u64 {
        self.flushes
    }

    /// Flush what is left and build the likelihood space.
    pub fn finish(
        mut self,
        names: Vec<String>,
        floating: Vec<bool>,
        mut summary: WalkSummary,
    ) -> Result<LikelihoodSpace> {
        self.flush()?;
        summary.recorded = self.recorded;
        summary.flushes = self.flushes;
        let mut columns = self.storage.into_columns()?;
        let nll = columns
            .pop()
            .ok_or_else(|| anyhow::anyhow!("storage returned no columns"))?;
        Ok(LikelihoodSpace::new(names, floating, columns, nll, summary)?)
    }
}
