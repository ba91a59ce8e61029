use numpy::ndarray::Array2;
use numpy::{IntoPyArray, PyArray1, PyArray2, PyArray3};
use pyo3::exceptions::PyValueError;
use pyo3::prelude::*;

use crate::core::particle::DIM;
use crate::core::scheduler::{read_path, EMISSION};
use crate::core::{
    Boundary, ChunkSize, DuplicatePolicy, EmissionMode, GaussianPsf, OverflowPolicy, PathMode,
    Particles, Population, RandomStream, SimBox, Simulation, SimulationConfig, StreamSource,
    TimestampOptions, TrajectoryOptions,
};
use crate::store::{ArrayStore, MemoryStore};

fn py_err<E: ToString>(e: E) -> PyErr {
    PyValueError::new_err(e.to_string())
}

fn path_mode(save_pos: Option<&str>) -> PyResult<PathMode> {
    match save_pos {
        None => Ok(PathMode::None),
        Some("full") => Ok(PathMode::Full),
        Some("radial_axial") => Ok(PathMode::RadialAxial),
        Some(other) => Err(py_err(format!(
            "save_pos must be 'full' or 'radial_axial', got '{other}'"
        ))),
    }
}

fn duplicate_policy(on_duplicate: &str) -> PyResult<DuplicatePolicy> {
    match on_duplicate {
        "fail" => Ok(DuplicatePolicy::Fail),
        "skip" => Ok(DuplicatePolicy::Skip),
        "overwrite" => Ok(DuplicatePolicy::Overwrite),
        other => Err(py_err(format!(
            "on_duplicate must be 'fail', 'skip' or 'overwrite', got '{other}'"
        ))),
    }
}

fn ts_options(scale: i64, saturate: bool, on_duplicate: &str) -> PyResult<TimestampOptions> {
    Ok(TimestampOptions {
        scale,
        overflow: if saturate {
            OverflowPolicy::Saturate
        } else {
            OverflowPolicy::Error
        },
        on_duplicate: duplicate_policy(on_duplicate)?,
        ..Default::default()
    })
}

/// Brownian motion simulation with an in-memory store.
///
/// - __new__(num_particles, d, bounds, t_step, t_max, seed=1, sigma_xy=0.2e-6, sigma_z=0.8e-6, id=0, eid=0)
/// - simulate_diffusion(...) then simulate_timestamps(...) / simulate_timestamps_mix(...)
/// - emission(), position(), timestamps(name), timestamp_names()
#[pyclass]
pub struct BrownianSim {
    sim: Simulation,
    store: MemoryStore,
}

#[pymethods]
impl BrownianSim {
    /// Place `num_particles` particles with diffusion coefficient `d` (m^2/s) uniformly
    /// in `bounds` = (x1, x2, y1, y2, z1, z2) in meters.
    ///
    /// Errors: raises ValueError on invalid parameters.
    #[new]
    #[pyo3(signature = (num_particles, d, bounds, t_step, t_max, seed=1, sigma_xy=0.2e-6, sigma_z=0.8e-6, id=0, eid=0))]
    #[allow(clippy::too_many_arguments)]
    fn new(
        num_particles: usize,
        d: f64,
        bounds: Vec<f64>,
        t_step: f64,
        t_max: f64,
        seed: u64,
        sigma_xy: f64,
        sigma_z: f64,
        id: u32,
        eid: u32,
    ) -> PyResult<Self> {
        let [x1, x2, y1, y2, z1, z2] = <[f64; 2 * DIM]>::try_from(bounds.as_slice())
            .map_err(|_| py_err("bounds must have 6 values (x1, x2, y1, y2, z1, z2)"))?;
        let sim_box = SimBox::new(x1, x2, y1, y2, z1, z2).map_err(py_err)?;
        let particles =
            Particles::generate(num_particles, d, sim_box, RandomStream::from_seed(seed)).map_err(py_err)?;
        let config = SimulationConfig::new(t_step, t_max)
            .map_err(py_err)?
            .with_ids(id, eid);
        let psf = GaussianPsf::new(sigma_xy, sigma_z).map_err(py_err)?;
        let sim = Simulation::new(particles, config, Box::new(psf)).map_err(py_err)?;
        Ok(Self {
            sim,
            store: MemoryStore::new(),
        })
    }

    /// Add particles with a different diffusion coefficient (before any diffusion run).
    fn add_particles(&mut self, num_particles: usize, d: f64) -> PyResult<()> {
        if self.store.exists(EMISSION) {
            return Err(py_err("cannot add particles after trajectories were simulated"));
        }
        self.sim.particles.add(num_particles, d).map_err(py_err)
    }

    /// Simulate trajectories for the whole duration (releases the GIL).
    #[pyo3(signature = (seed=1, total_emission=false, save_pos=None, mirror=false, chunk_steps=None, overwrite=false))]
    fn simulate_diffusion(
        &mut self,
        py: Python<'_>,
        seed: u64,
        total_emission: bool,
        save_pos: Option<&str>,
        mirror: bool,
        chunk_steps: Option<usize>,
        overwrite: bool,
    ) -> PyResult<()> {
        let opts = TrajectoryOptions {
            emission: if total_emission {
                EmissionMode::Total
            } else {
                EmissionMode::PerParticle
            },
            path: path_mode(save_pos)?,
            boundary: if mirror {
                Boundary::Mirror
            } else {
                Boundary::Periodic
            },
            chunk_size: chunk_steps.map_or_else(ChunkSize::default, ChunkSize::Steps),
            overwrite,
        };
        let (sim, store) = (&self.sim, &mut self.store);
        py.detach(|| sim.simulate_diffusion(store, opts, StreamSource::Seed(seed)))
            .map(|_| ())
            .map_err(py_err)
    }

    /// Timestamps for all particles. Returns the stream name, or None if skipped.
    #[pyo3(signature = (max_rate, bg_rate=None, seed=1, scale=10, saturate=false, on_duplicate="fail"))]
    #[allow(clippy::too_many_arguments)]
    fn simulate_timestamps(
        &mut self,
        py: Python<'_>,
        max_rate: f64,
        bg_rate: Option<f64>,
        seed: u64,
        scale: i64,
        saturate: bool,
        on_duplicate: &str,
    ) -> PyResult<Option<String>> {
        let opts = ts_options(scale, saturate, on_duplicate)?;
        let (sim, store) = (&self.sim, &mut self.store);
        py.detach(|| sim.simulate_timestamps(store, max_rate, bg_rate, opts, StreamSource::Seed(seed)))
            .map(|cp| cp.map(|c| c.name))
            .map_err(py_err)
    }

    /// Timestamps for several populations given as (start, end) particle ranges.
    #[pyo3(signature = (ranges, max_rates, bg_rate=None, seed=1, scale=10, saturate=false, on_duplicate="fail"))]
    #[allow(clippy::too_many_arguments)]
    fn simulate_timestamps_mix(
        &mut self,
        py: Python<'_>,
        ranges: Vec<(usize, usize)>,
        max_rates: Vec<f64>,
        bg_rate: Option<f64>,
        seed: u64,
        scale: i64,
        saturate: bool,
        on_duplicate: &str,
    ) -> PyResult<Option<String>> {
        let ranges: Vec<_> = ranges.into_iter().map(|(s, e)| s..e).collect();
        let pops = Population::mixture(&ranges, &max_rates, bg_rate).map_err(py_err)?;
        let opts = ts_options(scale, saturate, on_duplicate)?;
        let (sim, store) = (&self.sim, &mut self.store);
        py.detach(|| sim.simulate_timestamps_mix(store, pops, opts, StreamSource::Seed(seed)))
            .map(|cp| cp.map(|c| c.name))
            .map_err(py_err)
    }

    /// Per-particle emission as a (num_particles, n_samples) float32 array.
    fn emission<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyArray2<f32>>> {
        let n = self.store.len(EMISSION).map_err(py_err)?;
        let em = self.store.read_f32(EMISSION, 0..n).map_err(py_err)?;
        Ok(em.into_pyarray(py))
    }

    /// Saved path as a (num_particles, coords, n_samples) float32 array.
    ///
    /// coords is 3 for `save_pos="full"` and 2 (radial, axial) for `"radial_axial"`.
    fn position<'py>(&self, py: Python<'py>) -> PyResult<Bound<'py, PyArray3<f32>>> {
        let path = read_path(&self.store, self.sim.num_particles()).map_err(py_err)?;
        Ok(path.into_pyarray(py))
    }

    /// (timestamps int64, particle tags uint8) of a stored stream.
    #[allow(clippy::type_complexity)]
    fn timestamps<'py>(
        &self,
        py: Python<'py>,
        name: &str,
    ) -> PyResult<(Bound<'py, PyArray1<i64>>, Bound<'py, PyArray1<u8>>)> {
        let ts = self.store.read_i64(name).map_err(py_err)?;
        let par = self.store.read_u8(&format!("{name}_par")).map_err(py_err)?;
        Ok((ts.into_pyarray(py), par.into_pyarray(py)))
    }

    /// Names of every stored timestamp stream.
    fn timestamp_names(&self) -> Vec<String> {
        self.store
            .names()
            .into_iter()
            .filter(|n| n.starts_with("timestamps/") && !n.ends_with("_par"))
            .collect()
    }

    /// Initial positions as a (num_particles, 3) float64 array.
    fn initial_positions<'py>(&self, py: Python<'py>) -> Bound<'py, PyArray2<f64>> {
        let pos = self.sim.initial_positions();
        let mut arr = Array2::<f64>::zeros((pos.len(), DIM));
        for (i, r) in pos.iter().enumerate() {
            for k in 0..DIM {
                arr[[i, k]] = r[k];
            }
        }
        arr.into_pyarray(py)
    }

    #[getter]
    fn num_particles(&self) -> usize {
        self.sim.num_particles()
    }

    #[getter]
    fn n_samples(&self) -> usize {
        self.sim.n_samples()
    }

    #[getter]
    fn concentration_pm(&self) -> f64 {
        self.sim.concentration_pm()
    }

    fn __repr__(&self) -> String {
        self.sim.to_string()
    }
}

/// The bromosim Python module entry point.
#[pymodule]
fn bromosim(_py: Python<'_>, m: &Bound<'_, PyModule>) -> PyResult<()> {
    m.add_class::<BrownianSim>()?;
    Ok(())
}
