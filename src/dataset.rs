use std::slice::ChunksExact;

use crate::error::{McmcError, Result};
use crate::parameters::Observable;

/// Events stored row by row, one `f64` per named field.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EventData {
    fields: Vec<String>,
    values: Vec<f64>,
}

impl EventData {
    pub fn new(fields: Vec<String>, values: Vec<f64>) -> Result<Self> {
        if fields.is_empty() {
            return Err(McmcError::ShapeMismatch("event data needs at least one field".into()));
        }
        if values.len() % fields.len() != 0 {
            return Err(McmcError::ShapeMismatch(format!(
                "{} values do not split into rows of {} fields",
                values.len(),
                fields.len()
            )));
        }
        Ok(EventData { fields, values })
    }

    /// Events with a single field.
    pub fn from_column(field: impl Into<String>, values: Vec<f64>) -> Self {
        EventData {
            fields: vec![field.into()],
            values,
        }
    }

    pub fn nevents(&self) -> usize {
        if self.fields.is_empty() {
            0
        } else {
            self.values.len() / self.fields.len()
        }
    }

    pub fn nfields(&self) -> usize {
        self.fields.len()
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn field_index(&self, field: &str) -> Option<usize> {
        self.fields.iter().position(|f| f == field)
    }

    pub fn row(&self, idx: usize) -> &[f64] {
        let n = self.fields.len();
        &self.values[idx * n..(idx + 1) * n]
    }

    pub fn rows(&self) -> ChunksExact<'_, f64> {
        self.values.chunks_exact(self.fields.len().max(1))
    }

    pub fn column(&self, field: &str) -> Option<impl Iterator<Item = f64> + '_> {
        let idx = self.field_index(field)?;
        Some(self.rows().map(move |row| row[idx]))
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }
}

/// Copy `sample_fields` out of a wider dataset.
///
/// Events outside the `[lower, upper]` range of any cut whose field exists in
/// the dataset are dropped. Cuts on fields the dataset does not have are
/// ignored.
pub fn read_dataset_to_samples(
    dataset: &EventData,
    sample_fields: &[&str],
    cuts: &[Observable],
) -> Result<EventData> {
    let mapping = sample_fields
        .iter()
        .map(|&field| {
            dataset.field_index(field).ok_or_else(|| {
                McmcError::Configuration(format!("dataset has no field '{}'", field))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let active_cuts: Vec<(usize, &Observable)> = cuts
        .iter()
        .filter_map(|cut| Some((dataset.field_index(&cut.field)?, cut)))
        .collect();

    let mut values = Vec::with_capacity(dataset.nevents() * mapping.len());
    for row in dataset.rows() {
        let valid = active_cuts
            .iter()
            .all(|&(idx, cut)| cut.contains(row[idx]));
        if !valid {
            continue;
        }
        values.extend(mapping.iter().map(|&idx| row[idx]));
    }

    EventData::new(sample_fields.iter().map(|&f| f.to_string()).collect(), values)
}

/// Drop events that fall inside the exclusion window of every observable
/// that defines one.
///
/// An event inside only some of the windows is kept. `weights` holds one
/// entry per event or is empty, and is filtered alongside the events.
pub fn apply_exclusions(
    samples: &EventData,
    weights: &[f64],
    observables: &[Observable],
) -> Result<(EventData, Vec<f64>)> {
    if !weights.is_empty() && weights.len() != samples.nevents() {
        return Err(McmcError::ShapeMismatch(format!(
            "{} weights for {} events",
            weights.len(),
            samples.nevents()
        )));
    }

    let windows: Vec<(usize, f64, f64)> = observables
        .iter()
        .filter_map(|obs| {
            let (lower, upper) = obs.exclude?;
            Some((samples.field_index(&obs.field)?, lower, upper))
        })
        .collect();

    let mut values = Vec::with_capacity(samples.values().len());
    let mut kept_weights = Vec::with_capacity(weights.len());
    for (idx, row) in samples.rows().enumerate() {
        let excluded = !windows.is_empty()
            && windows
                .iter()
                .all(|&(field, lower, upper)| (row[field] >= lower) & (row[field] <= upper));
        if excluded {
            continue;
        }
        values.extend_from_slice(row);
        if !weights.is_empty() {
            kept_weights.push(weights[idx]);
        }
    }

    Ok((EventData::new(samples.fields().to_vec(), values)?, kept_weights))
}
