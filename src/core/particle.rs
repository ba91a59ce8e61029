use std::fmt;
use std::ops::Range;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::rng::{RandomStream, StreamCheckpoint};
use crate::error::{Error, Result};

/// Fixed spatial dimension (3D).
pub const DIM: usize = 3;

/// Axis-aligned simulation box `[x1, x2] x [y1, y2] x [z1, z2]` in metres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimBox {
    bounds: [[f64; 2]; DIM],
}

impl SimBox {
    /// Errors:
    /// - `Error::InvalidParam` if any bound is non-finite or a lower bound is not below its upper bound.
    pub fn new(x1: f64, x2: f64, y1: f64, y2: f64, z1: f64, z2: f64) -> Result<Self> {
        let bounds = [[x1, x2], [y1, y2], [z1, z2]];
        for (k, [lo, hi]) in bounds.iter().enumerate() {
            if !lo.is_finite() || !hi.is_finite() {
                return Err(Error::InvalidParam(format!(
                    "box bounds on axis {k} must be finite"
                )));
            }
            if lo >= hi {
                return Err(Error::InvalidParam(format!(
                    "box axis {k}: lower bound {lo} must be < upper bound {hi}"
                )));
            }
        }
        Ok(Self { bounds })
    }

    /// `[a1, a2]` for axis `k` (0 = x, 1 = y, 2 = z).
    #[inline]
    pub fn bounds(&self, axis: usize) -> (f64, f64) {
        let [lo, hi] = self.bounds[axis];
        (lo, hi)
    }

    #[inline]
    pub fn width(&self, axis: usize) -> f64 {
        let (lo, hi) = self.bounds(axis);
        hi - lo
    }

    /// Box volume in m^3.
    pub fn volume(&self) -> f64 {
        (0..DIM).map(|k| self.width(k)).product()
    }

    /// Box volume in liters.
    pub fn volume_liters(&self) -> f64 {
        self.volume() * 1e3
    }

    /// True if `r` lies inside the closed box.
    pub fn contains(&self, r: &[f64; DIM]) -> bool {
        r.iter().enumerate().all(|(k, &x)| {
            let (lo, hi) = self.bounds(k);
            x >= lo && x <= hi
        })
    }
}

impl fmt::Display for SimBox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Box: X {:.1}um, Y {:.1}um, Z {:.1}um",
            self.width(0) * 1e6,
            self.width(1) * 1e6,
            self.width(2) * 1e6
        )
    }
}

/// A diffusing point particle.
///
/// Fields:
/// - `d`: diffusion coefficient in m^2/s (> 0)
/// - `r0`: initial position [x, y, z]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    /// Diffusion coefficient (m^2/s).
    pub d: f64,
    /// Initial position (x, y, z).
    pub r0: [f64; DIM],
}

impl Particle {
    /// Create a new particle after validating invariants.
    ///
    /// Errors:
    /// - `Error::InvalidParam` if `d` is non-positive or any component is NaN/inf.
    pub fn new(d: f64, r0: [f64; DIM]) -> Result<Self> {
        if !d.is_finite() || d <= 0.0 {
            return Err(Error::InvalidParam(
                "diffusion coefficient must be finite and > 0".into(),
            ));
        }
        if !r0.iter().all(|x| x.is_finite()) {
            return Err(Error::InvalidParam("position must be finite".into()));
        }
        Ok(Self { d, r0 })
    }
}

/// Ordered particle list inside a box.
///
/// Insertion order defines the particle index used by every downstream array.
/// The list only grows, through [`Particles::add`].
#[derive(Debug, Clone)]
pub struct Particles {
    sim_box: SimBox,
    list: Vec<Particle>,
    stream: RandomStream,
    init_checkpoint: StreamCheckpoint,
}

impl Particles {
    /// Place `num_particles` particles with coefficient `d` uniformly inside `sim_box`.
    ///
    /// `stream` is retained so later calls to [`Particles::add`] continue the same sequence.
    pub fn generate(
        num_particles: usize,
        d: f64,
        sim_box: SimBox,
        stream: RandomStream,
    ) -> Result<Self> {
        let init_checkpoint = stream.checkpoint();
        let mut out = Self {
            sim_box,
            list: Vec::with_capacity(num_particles),
            stream,
            init_checkpoint,
        };
        out.add(num_particles, d)?;
        Ok(out)
    }

    /// Wrap an explicit particle list. Every position must lie inside `sim_box`.
    pub fn from_particles(sim_box: SimBox, list: Vec<Particle>, stream: RandomStream) -> Result<Self> {
        if let Some(i) = list.iter().position(|p| !sim_box.contains(&p.r0)) {
            return Err(Error::InvalidParam(format!(
                "particle {i} starts outside the simulation box"
            )));
        }
        Ok(Self {
            sim_box,
            list,
            init_checkpoint: stream.checkpoint(),
            stream,
        })
    }

    /// Append `num_particles` particles with coefficient `d` at random positions.
    pub fn add(&mut self, num_particles: usize, d: f64) -> Result<()> {
        // validate before consuming random numbers
        Particle::new(d, [0.0; DIM])?;
        let mut coords: [Vec<f64>; DIM] = Default::default();
        for (k, c) in coords.iter_mut().enumerate() {
            let (lo, hi) = self.sim_box.bounds(k);
            *c = (0..num_particles)
                .map(|_| self.stream.random::<f64>() * (hi - lo) + lo)
                .collect();
        }
        self.list.reserve(num_particles);
        for i in 0..num_particles {
            self.list
                .push(Particle::new(d, [coords[0][i], coords[1][i], coords[2][i]])?);
        }
        Ok(())
    }

    pub fn sim_box(&self) -> &SimBox {
        &self.sim_box
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn get(&self, i: usize) -> Option<&Particle> {
        self.list.get(i)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Particle> {
        self.list.iter()
    }

    /// Stream state before the first particle was placed.
    pub fn init_checkpoint(&self) -> &StreamCheckpoint {
        &self.init_checkpoint
    }

    /// Three hex digits identifying the placement stream.
    pub fn rs_hash(&self) -> Result<String> {
        self.init_checkpoint.short_hash(3)
    }

    pub fn diffusion_coeff(&self) -> Vec<f64> {
        self.list.iter().map(|p| p.d).collect()
    }

    /// Run-length groups `(D, count)` of consecutive particles sharing a coefficient.
    pub fn diffusion_coeff_counts(&self) -> Vec<(f64, usize)> {
        let mut out: Vec<(f64, usize)> = Vec::new();
        for p in &self.list {
            match out.last_mut() {
                Some((d, n)) if *d == p.d => *n += 1,
                _ => out.push((p.d, 1)),
            }
        }
        out
    }

    /// Compact label such as `P20_D9.00e-11_P15_D3.00e-11`.
    pub fn short_repr(&self) -> String {
        self.diffusion_coeff_counts()
            .iter()
            .map(|(d, n)| format!("P{n}_D{d:.2e}"))
            .collect::<Vec<_>>()
            .join("_")
    }

    /// One index range per run of equal diffusion coefficients.
    pub fn populations(&self) -> Vec<Range<usize>> {
        let mut start = 0;
        self.diffusion_coeff_counts()
            .into_iter()
            .map(|(_, n)| {
                let r = start..start + n;
                start += n;
                r
            })
            .collect()
    }

    /// Validate a half-open index range over this set.
    pub fn population(&self, range: Range<usize>) -> Result<Range<usize>> {
        if range.start >= range.end || range.end > self.len() {
            return Err(Error::InvalidParam(format!(
                "population {}..{} is empty or exceeds {} particles",
                range.start,
                range.end,
                self.len()
            )));
        }
        Ok(range)
    }
}

impl PartialEq for Particles {
    /// Same box and same particles; the placement stream is not compared.
    fn eq(&self, other: &Self) -> bool {
        self.sim_box == other.sim_box && self.list == other.list
    }
}

impl fmt::Display for Particles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .diffusion_coeff_counts()
            .iter()
            .map(|(d, n)| format!("#Particles: {n} D: {d:.2e}"))
            .collect();
        write!(f, "{}", parts.join(", "))
    }
}
