//! Poisson photon counting from normalized emission.

use ndarray::{Array2, ArrayView2};
use rand_distr::{Distribution, Poisson};
use serde::{Deserialize, Serialize};

use crate::core::rng::RandomStream;
use crate::error::{Error, Result};

/// What to do with a sampled count that does not fit in a u8.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OverflowPolicy {
    /// Fail with [`Error::CountOverflow`].
    #[default]
    Error,
    /// Clamp to 255 and log a warning.
    Saturate,
}

/// Photon counts per particle row (plus an optional background row) and bin.
pub type CountChunk = Array2<u8>;

fn poisson(stream: &mut RandomStream, lambda: f64) -> Result<u64> {
    if lambda == 0.0 {
        return Ok(0);
    }
    let dist = Poisson::new(lambda)
        .map_err(|e| Error::InvalidParam(format!("poisson rate {lambda}: {e}")))?;
    Ok(dist.sample(stream) as u64)
}

/// Draw photon counts `~ Poisson(emission * max_rate * t_step)` for every cell of `emission`.
///
/// With `bg_rate = Some(rate)` one extra row is appended holding a constant-rate
/// background process `~ Poisson(rate * t_step)`, drawn after all particle rows.
pub fn sim_timetrace_bg(
    emission: ArrayView2<'_, f32>,
    max_rate: f64,
    bg_rate: Option<f64>,
    t_step: f64,
    stream: &mut RandomStream,
    overflow: OverflowPolicy,
) -> Result<CountChunk> {
    if !max_rate.is_finite() || max_rate < 0.0 {
        return Err(Error::InvalidParam("max_rate must be finite and >= 0".into()));
    }
    if let Some(bg) = bg_rate {
        if !bg.is_finite() || bg < 0.0 {
            return Err(Error::InvalidParam("bg_rate must be finite and >= 0".into()));
        }
    }
    let (rows, bins) = emission.dim();
    let nrows = rows + usize::from(bg_rate.is_some());
    let mut counts = CountChunk::zeros((nrows, bins));
    let mut saturated = 0usize;

    let mut store = |row: usize, bin: usize, count: u64, counts: &mut CountChunk| -> Result<()> {
        let narrow = match u8::try_from(count) {
            Ok(c) => c,
            Err(_) => match overflow {
                OverflowPolicy::Error => return Err(Error::CountOverflow { row, bin, count }),
                OverflowPolicy::Saturate => {
                    saturated += 1;
                    u8::MAX
                }
            },
        };
        counts[[row, bin]] = narrow;
        Ok(())
    };

    let scale = max_rate * t_step;
    for ((row, bin), &em) in emission.indexed_iter() {
        let count = poisson(stream, f64::from(em) * scale)?;
        store(row, bin, count, &mut counts)?;
    }
    if let Some(bg) = bg_rate {
        let lambda = bg * t_step;
        for bin in 0..bins {
            let count = poisson(stream, lambda)?;
            store(rows, bin, count, &mut counts)?;
        }
    }

    if saturated > 0 {
        log::warn!("{saturated} photon counts saturated at 255 in a {nrows}x{bins} chunk");
    }
    Ok(counts)
}
