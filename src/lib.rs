//! Brownian motion of fluorescent particles observed through a confocal PSF.
//!
//! Trajectories are simulated in chunks and their emission stored through an
//! [`store::ArrayStore`]; photon timestamps are then drawn from the stored emission.
//! Every stochastic step consumes a [`core::RandomStream`] whose state is
//! checkpointed so long runs can be split across sessions.

pub mod core;
pub mod error;
pub mod store;

#[cfg(feature = "python")]
mod python;

pub use crate::core::Simulation;
pub use crate::error::{Error, Result};
