//! One chunk of Brownian motion plus emission sampling.

use ndarray::{s, Array1, Array2, Array3, ArrayView1, Axis};
use rand::Rng;
use rand_distr::StandardNormal;
use serde::{Deserialize, Serialize};

use crate::core::boundary::Boundary;
use crate::core::particle::DIM;
use crate::core::rng::RandomStream;
use crate::core::sim::Simulation;
use crate::error::{Error, Result};

/// Which emission array a chunk produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EmissionMode {
    /// One row per particle.
    #[default]
    PerParticle,
    /// Single row summed over particles.
    Total,
}

/// Which trajectory coordinates a chunk keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PathMode {
    #[default]
    None,
    /// x, y, z per step.
    Full,
    /// Radial distance from the optical axis and z per step.
    RadialAxial,
}

impl PathMode {
    /// Coordinates stored per particle and step.
    pub fn coords(self) -> usize {
        match self {
            PathMode::None => 0,
            PathMode::Full => DIM,
            PathMode::RadialAxial => 2,
        }
    }
}

/// Emission produced by one chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum Emission {
    /// Shape (num_particles, chunk_len).
    PerParticle(Array2<f32>),
    /// Shape (chunk_len,).
    Total(Array1<f32>),
}

impl Emission {
    pub fn len(&self) -> usize {
        match self {
            Emission::PerParticle(a) => a.ncols(),
            Emission::Total(a) => a.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Emission as a 2D matrix; `Total` becomes a single row.
    pub fn as_matrix(&self) -> Array2<f32> {
        match self {
            Emission::PerParticle(a) => a.clone(),
            Emission::Total(a) => a.clone().insert_axis(Axis(0)),
        }
    }
}

/// Trajectory coordinates retained from one chunk.
#[derive(Debug, Clone, PartialEq)]
pub enum SavedPath {
    None,
    /// Shape (num_particles, 3, chunk_len).
    Full(Array3<f32>),
    /// Shape (num_particles, 2, chunk_len).
    RadialAxial(Array3<f32>),
}

impl SavedPath {
    /// Path flattened to rows `particle * coords + coord`, or `None` when not saved.
    pub fn to_rows(&self) -> Result<Option<Array2<f32>>> {
        let a = match self {
            SavedPath::None => return Ok(None),
            SavedPath::Full(a) | SavedPath::RadialAxial(a) => a,
        };
        let (n, c, l) = a.dim();
        let rows = a
            .as_standard_layout()
            .into_owned()
            .into_shape_with_order((n * c, l))
            .map_err(|e| Error::Shape(e.to_string()))?;
        Ok(Some(rows))
    }
}

/// Output of [`Simulation::sim_trajectories`].
#[derive(Debug, Clone, PartialEq)]
pub struct TrajectoryChunk {
    pub emission: Emission,
    pub path: SavedPath,
}

/// Convert to f32, clamped to the non-negative finite f32 range.
#[inline]
fn to_f32_clamped(v: f64) -> f32 {
    if v.is_nan() {
        0.0
    } else {
        v.clamp(0.0, f64::from(f32::MAX)) as f32
    }
}

impl Simulation {
    /// Simulate `chunk_len` steps of every particle starting from `start_pos`.
    ///
    /// `start_pos` holds one position per particle and is overwritten with each
    /// particle's last position so the next chunk continues without a gap. The
    /// first step of the chunk is the carried position plus one increment.
    pub fn sim_trajectories(
        &self,
        chunk_len: usize,
        start_pos: &mut [[f64; DIM]],
        stream: &mut RandomStream,
        emission_mode: EmissionMode,
        path_mode: PathMode,
        boundary: Boundary,
    ) -> Result<TrajectoryChunk> {
        let n = self.num_particles();
        if start_pos.len() != n {
            return Err(Error::Shape(format!(
                "start positions hold {} particles, simulation has {}",
                start_pos.len(),
                n
            )));
        }

        let mut em_rows = match emission_mode {
            EmissionMode::PerParticle => Array2::<f32>::zeros((n, chunk_len)),
            EmissionMode::Total => Array2::<f32>::zeros((1, chunk_len)),
        };
        let mut path = Array3::<f32>::zeros((
            if path_mode == PathMode::None { 0 } else { n },
            path_mode.coords(),
            chunk_len,
        ));

        if chunk_len > 0 {
            let sim_box = *self.sim_box();
            for (i, (sigma, r)) in self.sigma_1d().into_iter().zip(start_pos.iter_mut()).enumerate() {
                // 3 x L increments, axis-major, accumulated into a walk
                let mut pos = Array2::<f64>::zeros((DIM, chunk_len));
                for (k, mut row) in pos.axis_iter_mut(Axis(0)).enumerate() {
                    let mut acc = r[k];
                    for x in row.iter_mut() {
                        let step: f64 = stream.sample(StandardNormal);
                        acc += sigma * step;
                        *x = acc;
                    }
                    let (a1, a2) = sim_box.bounds(k);
                    row.mapv_inplace(|x| boundary.apply(x, a1, a2));
                }

                let radial: Array1<f64> = pos
                    .row(0)
                    .iter()
                    .zip(pos.row(1).iter())
                    .map(|(x, y)| (x * x + y * y).sqrt())
                    .collect();
                let axial: ArrayView1<'_, f64> = pos.row(2);
                let psf = self.psf().evaluate(radial.view(), axial);
                let em = psf.mapv(|v| to_f32_clamped(v * v));

                match emission_mode {
                    EmissionMode::PerParticle => em_rows.row_mut(i).assign(&em),
                    EmissionMode::Total => {
                        let mut total = em_rows.row_mut(0);
                        total += &em;
                    }
                }

                match path_mode {
                    PathMode::None => {}
                    PathMode::Full => path
                        .slice_mut(s![i, .., ..])
                        .assign(&pos.mapv(|v| v as f32)),
                    PathMode::RadialAxial => {
                        path.slice_mut(s![i, 0, ..]).assign(&radial.mapv(|v| v as f32));
                        path.slice_mut(s![i, 1, ..]).assign(&axial.mapv(|v| v as f32));
                    }
                }

                for (k, rk) in r.iter_mut().enumerate() {
                    *rk = pos[[k, chunk_len - 1]];
                }
            }
        }

        let emission = match emission_mode {
            EmissionMode::PerParticle => Emission::PerParticle(em_rows),
            EmissionMode::Total => Emission::Total(em_rows.index_axis_move(Axis(0), 0)),
        };
        let path = match path_mode {
            PathMode::None => SavedPath::None,
            PathMode::Full => SavedPath::Full(path),
            PathMode::RadialAxial => SavedPath::RadialAxial(path),
        };
        Ok(TrajectoryChunk { emission, path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::particle::{Particle, Particles, SimBox};
    use crate::core::psf::GaussianPsf;
    use crate::core::sim::SimulationConfig;
    use approx::assert_relative_eq;

    fn make_sim(n: usize) -> Result<Simulation> {
        let b = SimBox::new(-4e-6, 4e-6, -4e-6, 4e-6, -6e-6, 6e-6)?;
        let mut p = Particles::generate(n, 9e-11, b, RandomStream::from_seed(1))?;
        p.add(2, 3e-11)?;
        let cfg = SimulationConfig::new(0.5e-6, 1e-3)?;
        Simulation::new(p, cfg, Box::new(GaussianPsf::default()))
    }

    #[test]
    fn chunk_shapes() -> Result<()> {
        let sim = make_sim(3)?;
        let mut pos = sim.initial_positions();
        let mut rs = RandomStream::from_seed(5);
        let out = sim.sim_trajectories(
            100,
            &mut pos,
            &mut rs,
            EmissionMode::PerParticle,
            PathMode::Full,
            Boundary::Periodic,
        )?;
        match (&out.emission, &out.path) {
            (Emission::PerParticle(e), SavedPath::Full(p)) => {
                assert_eq!(e.dim(), (5, 100));
                assert_eq!(p.dim(), (5, 3, 100));
                // carried position equals last saved step
                for (i, r) in pos.iter().enumerate() {
                    for k in 0..DIM {
                        assert_relative_eq!(p[[i, k, 99]], r[k] as f32);
                    }
                }
            }
            other => panic!("unexpected output variants: {other:?}"),
        }
        assert_eq!(out.path.to_rows()?.map(|r| r.dim()), Some((15, 100)));
        Ok(())
    }

    #[test]
    fn total_emission_is_sum_of_rows() -> Result<()> {
        let sim = make_sim(4)?;
        let mut pos_a = sim.initial_positions();
        let mut pos_b = pos_a.clone();
        let per = sim.sim_trajectories(
            64,
            &mut pos_a,
            &mut RandomStream::from_seed(11),
            EmissionMode::PerParticle,
            PathMode::None,
            Boundary::Mirror,
        )?;
        let tot = sim.sim_trajectories(
            64,
            &mut pos_b,
            &mut RandomStream::from_seed(11),
            EmissionMode::Total,
            PathMode::None,
            Boundary::Mirror,
        )?;
        assert_eq!(pos_a, pos_b);
        let (Emission::PerParticle(rows), Emission::Total(total)) = (per.emission, tot.emission) else {
            panic!("wrong emission variants");
        };
        let summed = rows.sum_axis(Axis(0));
        for (a, b) in summed.iter().zip(total.iter()) {
            assert_relative_eq!(*a, *b, max_relative = 1e-5);
        }
        Ok(())
    }

    #[test]
    fn emission_bounded_by_peak() -> Result<()> {
        let sim = make_sim(5)?;
        let mut pos = sim.initial_positions();
        let out = sim.sim_trajectories(
            200,
            &mut pos,
            &mut RandomStream::from_seed(2),
            EmissionMode::PerParticle,
            PathMode::RadialAxial,
            Boundary::Periodic,
        )?;
        let m = out.emission.as_matrix();
        assert!(m.iter().all(|&v| (0.0..=1.0).contains(&v)));
        let SavedPath::RadialAxial(p) = out.path else {
            panic!("expected radial/axial path");
        };
        assert!(p.slice(s![.., 0, ..]).iter().all(|&r| r >= 0.0));
        Ok(())
    }

    #[test]
    fn particle_at_focus_emits_one() -> Result<()> {
        let b = SimBox::new(-1.0, 1.0, -1.0, 1.0, -1.0, 1.0)?;
        // tiny D keeps the particle at the PSF peak
        let p = Particles::from_particles(
            b,
            vec![Particle::new(1e-30, [0.0, 0.0, 0.0])?],
            RandomStream::from_seed(0),
        )?;
        let sim = Simulation::new(p, SimulationConfig::new(1e-6, 1e-3)?, Box::new(GaussianPsf::default()))?;
        let mut pos = sim.initial_positions();
        let out = sim.sim_trajectories(
            10,
            &mut pos,
            &mut RandomStream::from_seed(0),
            EmissionMode::Total,
            PathMode::None,
            Boundary::Periodic,
        )?;
        for v in out.emission.as_matrix().iter() {
            assert_relative_eq!(*v, 1.0, max_relative = 1e-6);
        }
        Ok(())
    }

    #[test]
    fn zero_length_chunk_keeps_positions() -> Result<()> {
        let sim = make_sim(2)?;
        let mut pos = sim.initial_positions();
        let before = pos.clone();
        let out = sim.sim_trajectories(
            0,
            &mut pos,
            &mut RandomStream::from_seed(0),
            EmissionMode::PerParticle,
            PathMode::None,
            Boundary::Periodic,
        )?;
        assert!(out.emission.is_empty());
        assert_eq!(pos, before);
        Ok(())
    }

    #[test]
    fn wrong_start_buffer_rejected() -> Result<()> {
        let sim = make_sim(2)?;
        let mut pos = vec![[0.0; DIM]; 1];
        let err = sim
            .sim_trajectories(
                4,
                &mut pos,
                &mut RandomStream::from_seed(0),
                EmissionMode::Total,
                PathMode::None,
                Boundary::Periodic,
            )
            .unwrap_err();
        assert!(matches!(err, Error::Shape(_)));
        Ok(())
    }
}
