mod common;

use approx::assert_relative_eq;
use bromosim::core::scheduler::{EMISSION, EMISSION_TOT, POSITION};
use bromosim::core::{
    Boundary, ChunkSize, EmissionMode, PathMode, StreamSource, TrajectoryOptions, TrajectoryRun,
};
use bromosim::error::Result;
use bromosim::store::{ArrayStore, MemoryStore};

use common::{init_logging, make_sim};

fn full_path(boundary: Boundary) -> TrajectoryOptions {
    TrajectoryOptions {
        path: PathMode::Full,
        boundary,
        chunk_size: ChunkSize::Steps(500),
        ..Default::default()
    }
}

/// Every stored coordinate must stay inside the box under both boundary policies.
#[test]
fn positions_stay_in_box() -> Result<()> {
    init_logging();
    for boundary in [Boundary::Periodic, Boundary::Mirror] {
        let sim = make_sim(5, 2e-3)?;
        let mut store = MemoryStore::new();
        sim.simulate_diffusion(&mut store, full_path(boundary), StreamSource::Seed(11))?;

        let n = store.len(POSITION)?;
        assert_eq!(n, sim.n_samples());
        let pos = store.read_f32(POSITION, 0..n)?;
        assert_eq!(pos.nrows(), 5 * 3);
        for (row, coords) in pos.outer_iter().enumerate() {
            let (lo, hi) = sim.sim_box().bounds(row % 3);
            // f32 storage rounds at the walls
            let tol = 1e-12;
            for &x in coords.iter() {
                let x = f64::from(x);
                assert!(
                    x >= lo - tol && x <= hi + tol,
                    "{boundary:?}: coordinate {x} outside [{lo}, {hi}] on row {row}"
                );
            }
        }
    }
    Ok(())
}

/// Same seed and same identifiers produce identical emission.
#[test]
fn same_seed_same_emission() -> Result<()> {
    let sim = make_sim(4, 1e-3)?;
    let opts = TrajectoryOptions {
        chunk_size: ChunkSize::Steps(300),
        ..Default::default()
    };
    let mut a = MemoryStore::new();
    let mut b = MemoryStore::new();
    sim.simulate_diffusion(&mut a, opts, StreamSource::Seed(5))?;
    sim.simulate_diffusion(&mut b, opts, StreamSource::Seed(5))?;
    let n = sim.n_samples();
    assert_eq!(a.read_f32(EMISSION, 0..n)?, b.read_f32(EMISSION, 0..n)?);

    let mut c = MemoryStore::new();
    sim.simulate_diffusion(&mut c, opts, StreamSource::Seed(6))?;
    assert_ne!(a.read_f32(EMISSION, 0..n)?, c.read_f32(EMISSION, 0..n)?);
    Ok(())
}

/// Emission is psf^2 and therefore lies in [0, 1].
#[test]
fn emission_is_normalized() -> Result<()> {
    let sim = make_sim(6, 1e-3)?;
    let mut store = MemoryStore::new();
    sim.simulate_diffusion(&mut store, TrajectoryOptions::default(), StreamSource::Seed(2))?;
    let em = store.read_f32(EMISSION, 0..sim.n_samples())?;
    assert_eq!(em.dim(), (6, sim.n_samples()));
    assert!(em.iter().all(|&v| (0.0..=1.0).contains(&v)));
    Ok(())
}

/// The total-emission row equals the sum of the per-particle rows for the same stream.
#[test]
fn total_emission_sums_particles() -> Result<()> {
    let sim = make_sim(3, 5e-4)?;
    let per = TrajectoryOptions {
        chunk_size: ChunkSize::Steps(128),
        ..Default::default()
    };
    let tot = TrajectoryOptions {
        emission: EmissionMode::Total,
        ..per
    };
    let mut a = MemoryStore::new();
    let mut b = MemoryStore::new();
    sim.simulate_diffusion(&mut a, per, StreamSource::Seed(4))?;
    sim.simulate_diffusion(&mut b, tot, StreamSource::Seed(4))?;

    let n = sim.n_samples();
    let em = a.read_f32(EMISSION, 0..n)?;
    let total = b.read_f32(EMISSION_TOT, 0..n)?;
    assert_eq!(total.nrows(), 1);
    for (t, col) in em.columns().into_iter().enumerate() {
        assert_relative_eq!(total[[0, t]], col.sum(), epsilon = 1e-6);
    }
    Ok(())
}

/// A run can be stepped manually and reports its progress.
#[test]
fn manual_stepping() -> Result<()> {
    let sim = make_sim(2, 1e-4)?;
    let mut store = MemoryStore::new();
    let opts = TrajectoryOptions {
        chunk_size: ChunkSize::Steps(50),
        ..Default::default()
    };
    let mut run = TrajectoryRun::new(&sim, &mut store, opts);
    run.open(StreamSource::Seed(1))?;
    let mut chunks = 0;
    while run.step()? {
        chunks += 1;
    }
    assert_eq!(chunks, sim.n_samples().div_ceil(50));
    let cp = run.finalize()?;
    assert_eq!(cp.cursor, sim.n_samples());
    assert_eq!(cp.positions.as_ref().map(Vec::len), Some(2));
    Ok(())
}
