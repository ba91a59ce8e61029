//! Simulation core: particles and their box, the PSF, trajectories, photon
//! counting, timestamp generation and the chunked run scheduler.

pub mod boundary;
pub mod particle;
pub mod photons;
pub mod psf;
pub mod rng;
pub mod scheduler;
pub mod sim;
pub mod timestamps;
pub mod trajectory;

pub use boundary::Boundary;
pub use particle::{Particle, Particles, SimBox};
pub use photons::OverflowPolicy;
pub use psf::{GaussianPsf, Psf};
pub use rng::{RandomStream, StreamCheckpoint};
pub use scheduler::{
    ChunkSize, DuplicatePolicy, Opened, RunCheckpoint, RunPhase, StreamSource, TimestampOptions,
    TimestampRun, TrajectoryOptions, TrajectoryRun,
};
pub use sim::{Simulation, SimulationConfig};
pub use timestamps::{Population, TimestampStream};
pub use trajectory::{EmissionMode, PathMode};
