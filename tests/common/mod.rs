#![allow(dead_code)]

use bromosim::core::scheduler::EMISSION;
use bromosim::core::{GaussianPsf, Particles, RandomStream, SimBox, Simulation, SimulationConfig};
use bromosim::error::Result;
use bromosim::store::{ArrayChunk, ArrayKind, ArraySpec, ArrayStore, MemoryStore};
use ndarray::Array2;

pub fn init_logging() {
    env_logger::builder().is_test(true).try_init().ok();
}

/// 8 x 8 x 12 um box centred on the PSF.
pub fn sim_box() -> Result<SimBox> {
    SimBox::new(-4e-6, 4e-6, -4e-6, 4e-6, -6e-6, 6e-6)
}

/// `n` fast particles (D = 9e-11 m^2/s) sampled at 0.5 us for `t_max` seconds.
pub fn make_sim(n: usize, t_max: f64) -> Result<Simulation> {
    let particles = Particles::generate(n, 9e-11, sim_box()?, RandomStream::from_seed(1))?;
    let config = SimulationConfig::new(0.5e-6, t_max)?;
    Simulation::new(particles, config, Box::new(GaussianPsf::default()))
}

/// Store holding a constant per-particle emission for the whole duration.
pub fn constant_emission(sim: &Simulation, value: f32) -> Result<MemoryStore> {
    let mut store = MemoryStore::new();
    let spec = ArraySpec {
        kind: ArrayKind::Float32 {
            rows: sim.num_particles(),
        },
        chunk_len: 256,
    };
    store.create(EMISSION, spec, false)?;
    let em = Array2::<f32>::from_elem((sim.num_particles(), sim.n_samples()), value);
    store.append(EMISSION, ArrayChunk::Float32(em.view()))?;
    Ok(store)
}
