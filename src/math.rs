use std::sync::Arc;

use itertools::izip;
use multiversion::multiversion;
use rayon::prelude::*;

/// Where the independent chunks of a reduction are evaluated.
///
/// All variants run the same chunk function and combine the partial results
/// in the same fixed order, so they produce bit-identical totals.
#[derive(Debug, Clone, Default)]
pub enum Backend {
    /// Chunks are processed one after another on the calling thread.
    Serial,
    /// Chunks are spread over the global rayon thread pool.
    #[default]
    Rayon,
    /// Chunks are spread over a dedicated rayon thread pool.
    Pool(Arc<rayon::ThreadPool>),
}

impl Backend {
    /// Build a backend with its own pool of `num_threads` workers.
    pub fn with_threads(num_threads: usize) -> anyhow::Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(num_threads)
            .thread_name(|idx| format!("nll-lane-{}", idx))
            .build()?;
        Ok(Backend::Pool(Arc::new(pool)))
    }
}

/// Evaluate `map` for every chunk index and combine the results.
///
/// `partials` holds one slot per chunk and doubles as scratch space, so the
/// reduction does not allocate. Every slot is written before the combine
/// starts. The combine walks the partials pairwise in index order, which
/// keeps the result independent of how the chunks were scheduled.
///
/// Returns `None` if there are no chunks.
pub fn parallel_reduce<T, F, C>(
    backend: &Backend,
    partials: &mut [T],
    map: F,
    combine: C,
) -> Option<T>
where
    T: Copy + Send,
    F: Fn(usize) -> T + Sync,
    C: Fn(T, T) -> T,
{
    match backend {
        Backend::Serial => partials
            .iter_mut()
            .enumerate()
            .for_each(|(idx, out)| *out = map(idx)),
        Backend::Rayon => fill_partials(partials, &map),
        Backend::Pool(pool) => pool.install(|| fill_partials(partials, &map)),
    }
    pairwise_reduce(partials, &combine)
}

fn fill_partials<T, F>(partials: &mut [T], map: &F)
where
    T: Send,
    F: Fn(usize) -> T + Sync,
{
    partials
        .par_iter_mut()
        .enumerate()
        .for_each(|(idx, out)| *out = map(idx));
}

fn pairwise_reduce<T: Copy, C: Fn(T, T) -> T>(values: &[T], combine: &C) -> Option<T> {
    match values.len() {
        0 => None,
        1 => Some(values[0]),
        n => {
            let (left, right) = values.split_at(n / 2);
            let left = pairwise_reduce(left, combine)?;
            let right = pairwise_reduce(right, combine)?;
            Some(combine(left, right))
        }
    }
}

/// Sum of `ln(sum_j weights[j] * row[j])` over the rows of one event chunk.
///
/// `rows` is a row-major block of the lookup table. Events whose mixture
/// density is zero or not finite add nothing.
#[multiversion(targets("x86_64+avx+avx2+fma", "x86_64+avx", "x86+sse"))]
pub(crate) fn chunk_log_density(rows: &[f32], weights: &[f64]) -> f64 {
    let nsignals = weights.len();
    assert!(nsignals > 0);
    assert!(rows.len() % nsignals == 0);

    rows.chunks_exact(nsignals)
        .map(|row| {
            let density: f64 = izip!(row, weights)
                .map(|(&p, &w)| w * f64::from(p))
                .sum();
            if (density > 0f64) & density.is_finite() {
                density.ln()
            } else {
                0f64
            }
        })
        .sum()
}

/// Evaluate a polynomial with coefficients in increasing order of power.
#[inline]
pub(crate) fn polynomial(coefficients: &[f64], x: f64) -> f64 {
    coefficients.iter().rev().fold(0f64, |acc, &c| acc * x + c)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn chunk_sums(backend: &Backend, values: &[f64], chunk: usize) -> f64 {
        let nchunks = values.len().div_ceil(chunk);
        let mut partials = vec![0f64; nchunks];
        parallel_reduce(
            backend,
            &mut partials,
            |idx| {
                let end = ((idx + 1) * chunk).min(values.len());
                values[idx * chunk..end].iter().sum::<f64>()
            },
            |a, b| a + b,
        )
        .unwrap_or(0f64)
    }

    proptest! {
        #[test]
        fn reduce_matches_plain_sum(
            values in prop::collection::vec(-1e3f64..1e3f64, 1..500),
            chunk in 1usize..64,
        ) {
            let plain: f64 = values.iter().sum();
            let reduced = chunk_sums(&Backend::Serial, &values, chunk);
            prop_assert!((plain - reduced).abs() <= 1e-9 * (1. + plain.abs()));
        }

        #[test]
        fn backends_agree_exactly(
            values in prop::collection::vec(-1e3f64..1e3f64, 1..500),
            chunk in 1usize..64,
        ) {
            let serial = chunk_sums(&Backend::Serial, &values, chunk);
            let parallel = chunk_sums(&Backend::Rayon, &values, chunk);
            prop_assert_eq!(serial.to_bits(), parallel.to_bits());
        }
    }

    #[test]
    fn empty_reduction() {
        let mut partials: Vec<f64> = vec![];
        let out = parallel_reduce(&Backend::Serial, &mut partials, |_| 1f64, |a, b| a + b);
        assert_eq!(out, None);
    }

    #[test]
    fn dedicated_pool() {
        let backend = Backend::with_threads(2).unwrap();
        let values: Vec<f64> = (0..1000).map(|x| x as f64).collect();
        assert_eq!(chunk_sums(&backend, &values, 37), 499500.);
    }

    #[test]
    fn zero_density_rows_are_skipped() {
        let rows = [0.5f32, 0.5, 0., 0., 2., 0.];
        let weights = [2., 2.];
        let out = chunk_log_density(&rows, &weights);
        assert_relative_eq!(out, 2f64.ln() + 4f64.ln(), epsilon = 1e-12);
    }

    #[test]
    fn polynomial_horner() {
        assert_eq!(polynomial(&[], 3.), 0.);
        assert_eq!(polynomial(&[1.], 3.), 1.);
        assert_eq!(polynomial(&[1., 2., 3.], 2.), 1. + 4. + 12.);
    }
}
