//! Expansion of photon counts into tagged, time-ordered timestamps.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::ops::Range;

use ndarray::{s, ArrayView2};
use serde::{Deserialize, Serialize};

use crate::core::photons::{sim_timetrace_bg, CountChunk, OverflowPolicy};
use crate::core::rng::{RandomStream, StreamCheckpoint};
use crate::error::{Error, Result};

/// Photon arrival times (clock ticks) with the index of the emitting particle.
///
/// Ticks are non-decreasing. Background photons carry index `num_particles`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampStream {
    pub ticks: Vec<i64>,
    pub particles: Vec<u8>,
}

impl TimestampStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ticks.is_empty()
    }

    pub fn push(&mut self, tick: i64, particle: u8) {
        self.ticks.push(tick);
        self.particles.push(particle);
    }

    /// Append `other`, which must not start before this stream ends.
    pub fn extend(&mut self, other: &TimestampStream) -> Result<()> {
        if let (Some(&last), Some(&first)) = (self.ticks.last(), other.ticks.first()) {
            if first < last {
                return Err(Error::InvalidState(format!(
                    "appended stream starts at tick {first}, before last tick {last}"
                )));
            }
        }
        self.ticks.extend_from_slice(&other.ticks);
        self.particles.extend_from_slice(&other.particles);
        Ok(())
    }

    pub fn is_sorted(&self) -> bool {
        self.ticks.windows(2).all(|w| w[0] <= w[1])
    }

    /// Stable sort by tick; equal ticks keep their current relative order.
    pub fn sort_stable(&mut self) {
        let mut idx: Vec<usize> = (0..self.ticks.len()).collect();
        idx.sort_by_key(|&i| self.ticks[i]);
        self.ticks = idx.iter().map(|&i| self.ticks[i]).collect();
        self.particles = idx.iter().map(|&i| self.particles[i]).collect();
    }
}

/// A contiguous particle range sharing a peak emission rate and optional background.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Population {
    pub range: Range<usize>,
    /// Peak emission rate of a particle at the PSF maximum (Hz).
    pub max_rate: f64,
    /// Background rate (Hz); `None` disables the background row.
    pub bg_rate: Option<f64>,
}

impl Population {
    pub fn new(range: Range<usize>, max_rate: f64, bg_rate: Option<f64>) -> Result<Self> {
        if range.start >= range.end {
            return Err(Error::InvalidParam(format!(
                "population {}..{} is empty",
                range.start, range.end
            )));
        }
        if !max_rate.is_finite() || max_rate <= 0.0 {
            return Err(Error::InvalidParam("max_rate must be finite and > 0".into()));
        }
        if let Some(bg) = bg_rate {
            if !bg.is_finite() || bg < 0.0 {
                return Err(Error::InvalidParam("bg_rate must be finite and >= 0".into()));
            }
        }
        Ok(Self {
            range,
            max_rate,
            bg_rate,
        })
    }

    /// Populations with per-population rates and a single background on the last one.
    pub fn mixture(
        ranges: &[Range<usize>],
        max_rates: &[f64],
        bg_rate: Option<f64>,
    ) -> Result<Vec<Self>> {
        if ranges.len() != max_rates.len() || ranges.is_empty() {
            return Err(Error::InvalidParam(format!(
                "{} populations but {} rates",
                ranges.len(),
                max_rates.len()
            )));
        }
        let last = ranges.len() - 1;
        ranges
            .iter()
            .zip(max_rates)
            .enumerate()
            .map(|(i, (r, &rate))| Self::new(r.clone(), rate, if i == last { bg_rate } else { None }))
            .collect()
    }
}

/// Expand one row of counts into ticks in threshold order.
///
/// For v = 1..=max_count every bin with count >= v contributes its tick once, so a
/// bin with count c yields c identical ticks.
fn expand_row(counts: &[u8], max_count: u8, i_start: usize, scale: i64, tag: u8, out: &mut TimestampStream) {
    for v in 1..=max_count {
        for (bin, &c) in counts.iter().enumerate() {
            if c >= v {
                out.push((i_start + bin) as i64 * scale, tag);
            }
        }
    }
}

/// Timestamps of a count chunk, concatenated particle-major and not yet sorted.
///
/// Row `r` is tagged `first_index + r`, except the background row (the last row
/// when `has_background`) which is tagged `bg_index`.
pub fn expand_counts(
    counts: &CountChunk,
    i_start: usize,
    scale: i64,
    first_index: usize,
    has_background: bool,
    bg_index: usize,
) -> Result<TimestampStream> {
    let mut out = TimestampStream::new();
    let max_count = counts.iter().copied().max().unwrap_or(0);
    if max_count == 0 {
        return Ok(out);
    }
    let nrows = counts.nrows();
    for (r, row) in counts.rows().into_iter().enumerate() {
        let index = if has_background && r == nrows - 1 {
            bg_index
        } else {
            first_index + r
        };
        let tag = u8::try_from(index)
            .map_err(|_| Error::InvalidParam(format!("particle index {index} does not fit in u8")))?;
        let row = row.to_vec();
        expand_row(&row, max_count, i_start, scale, tag, &mut out);
    }
    Ok(out)
}

/// Count sampling plus timestamp expansion for one population of one chunk.
///
/// `emission` holds every particle row of the chunk; only the population's rows
/// are sampled. The result is sorted only when `sort` is set.
#[allow(clippy::too_many_arguments)]
pub fn sim_timestamps_population(
    emission: ArrayView2<'_, f32>,
    population: &Population,
    i_start: usize,
    t_step: f64,
    scale: i64,
    bg_index: usize,
    stream: &mut RandomStream,
    overflow: OverflowPolicy,
    sort: bool,
) -> Result<TimestampStream> {
    if population.range.end > emission.nrows() {
        return Err(Error::Shape(format!(
            "population ends at {} but emission has {} rows",
            population.range.end,
            emission.nrows()
        )));
    }
    let rows = emission.slice(s![population.range.clone(), ..]);
    let n_rows = population.range.len();
    let counts = sim_timetrace_bg(rows, population.max_rate, population.bg_rate, t_step, stream, overflow)
        .map_err(|e| match e {
            // report the particle index and absolute time index
            Error::CountOverflow { row, bin, count } => Error::CountOverflow {
                row: if row == n_rows { bg_index } else { population.range.start + row },
                bin: i_start + bin,
                count,
            },
            other => other,
        })?;
    let mut ts = expand_counts(
        &counts,
        i_start,
        scale,
        population.range.start,
        population.bg_rate.is_some(),
        bg_index,
    )?;
    if sort {
        ts.sort_stable();
    }
    Ok(ts)
}

/// Head of one input stream in the k-way merge.
///
/// Ordered by tick, then by stream order, then by position, which reproduces a
/// stable sort of the streams' concatenation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MergeHead {
    tick: i64,
    source: usize,
    pos: usize,
}

impl Ord for MergeHead {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.tick, self.source, self.pos).cmp(&(other.tick, other.source, other.pos))
    }
}

impl PartialOrd for MergeHead {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Merge sorted streams; ties go to the stream listed first.
pub fn merge_sorted(streams: &[TimestampStream]) -> Result<TimestampStream> {
    if let Some(i) = streams.iter().position(|s| !s.is_sorted()) {
        return Err(Error::InvalidState(format!("merge input {i} is not sorted")));
    }
    let total = streams.iter().map(TimestampStream::len).sum();
    let mut out = TimestampStream {
        ticks: Vec::with_capacity(total),
        particles: Vec::with_capacity(total),
    };
    let mut pq: BinaryHeap<Reverse<MergeHead>> = streams
        .iter()
        .enumerate()
        .filter(|(_, s)| !s.is_empty())
        .map(|(source, s)| {
            Reverse(MergeHead {
                tick: s.ticks[0],
                source,
                pos: 0,
            })
        })
        .collect();
    while let Some(Reverse(head)) = pq.pop() {
        let s = &streams[head.source];
        out.push(head.tick, s.particles[head.pos]);
        let next = head.pos + 1;
        if next < s.len() {
            pq.push(Reverse(MergeHead {
                tick: s.ticks[next],
                source: head.source,
                pos: next,
            }));
        }
    }
    Ok(out)
}

/// Timestamps for one chunk of emission across all populations, merged in time order.
///
/// Populations draw from `stream` in the order given; ties across populations go to
/// the population listed first.
#[allow(clippy::too_many_arguments)]
pub fn sim_timestamps_chunk(
    emission: ArrayView2<'_, f32>,
    populations: &[Population],
    i_start: usize,
    t_step: f64,
    scale: i64,
    bg_index: usize,
    stream: &mut RandomStream,
    overflow: OverflowPolicy,
) -> Result<TimestampStream> {
    let per_pop = populations
        .iter()
        .map(|p| {
            sim_timestamps_population(emission, p, i_start, t_step, scale, bg_index, stream, overflow, true)
        })
        .collect::<Result<Vec<_>>>()?;
    match per_pop.len() {
        1 => Ok(per_pop.into_iter().next().unwrap_or_default()),
        _ => merge_sorted(&per_pop),
    }
}

fn kcps(rate: f64) -> i64 {
    (rate * 1e-3) as i64
}

/// Artifact name for a timestamp stream, e.g. `max_rate200kcps_bg1500cps_rs_1a2b`.
///
/// A single population covering every particle gets the short form; otherwise every
/// population is listed with its first and last particle index.
pub fn timestamps_name(
    populations: &[Population],
    num_particles: usize,
    init: &StreamCheckpoint,
) -> Result<String> {
    let bg = populations.iter().filter_map(|p| p.bg_rate).sum::<f64>() as i64;
    let core = match populations {
        [p] if p.range == (0..num_particles) => {
            format!("max_rate{}kcps_bg{}cps", kcps(p.max_rate), bg)
        }
        _ => {
            let pops: Vec<String> = populations
                .iter()
                .enumerate()
                .map(|(i, p)| {
                    format!(
                        "Pop{}_P{}_{}_max_rate{}kcps",
                        i + 1,
                        p.range.start,
                        p.range.end - 1,
                        kcps(p.max_rate)
                    )
                })
                .collect();
            format!("{}_bg{}cps", pops.join("_"), bg)
        }
    };
    Ok(format!("{core}_rs_{}", init.short_hash(4)?))
}
