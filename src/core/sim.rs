use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::core::particle::{Particles, SimBox};
use crate::core::psf::Psf;
use crate::error::{Error, Result};

/// Avogadro constant (mol^-1).
pub const NA: f64 = 6.022141e23;

/// Time discretization and run identity.
///
/// `id` and `eid` only select the random stream and label artifacts; they carry no
/// simulation semantics.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    /// Simulation time step (s).
    pub t_step: f64,
    /// Simulated duration (s).
    pub t_max: f64,
    /// Run index.
    pub id: u32,
    /// Engine index for parallel runs.
    pub eid: u32,
}

impl SimulationConfig {
    pub fn new(t_step: f64, t_max: f64) -> Result<Self> {
        let cfg = Self {
            t_step,
            t_max,
            id: 0,
            eid: 0,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn with_ids(mut self, id: u32, eid: u32) -> Self {
        self.id = id;
        self.eid = eid;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !self.t_step.is_finite() || self.t_step <= 0.0 {
            return Err(Error::InvalidParam("t_step must be finite and > 0".into()));
        }
        if !self.t_max.is_finite() || self.t_max <= 0.0 {
            return Err(Error::InvalidParam("t_max must be finite and > 0".into()));
        }
        Ok(())
    }

    /// Number of time steps, `floor(t_max / t_step)`.
    pub fn n_samples(&self) -> usize {
        (self.t_max / self.t_step).floor() as usize
    }
}

/// A numeric run parameter with its human-readable description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericParam {
    pub value: f64,
    pub description: String,
}

/// Bytes needed on disk for the float32 arrays of one full run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageEstimate {
    pub n_samples: usize,
    pub emission_one_particle: usize,
    pub emission: usize,
    pub position: usize,
}

/// Brownian motion simulation of a particle set under a PSF.
pub struct Simulation {
    pub particles: Particles,
    pub config: SimulationConfig,
    psf: Box<dyn Psf>,
}

impl Simulation {
    pub fn new(particles: Particles, config: SimulationConfig, psf: Box<dyn Psf>) -> Result<Self> {
        config.validate()?;
        if particles.is_empty() {
            return Err(Error::InvalidParam("num_particles must be > 0".into()));
        }
        Ok(Self {
            particles,
            config,
            psf,
        })
    }

    pub fn sim_box(&self) -> &SimBox {
        self.particles.sim_box()
    }

    pub fn psf(&self) -> &dyn Psf {
        self.psf.as_ref()
    }

    pub fn num_particles(&self) -> usize {
        self.particles.len()
    }

    pub fn n_samples(&self) -> usize {
        self.config.n_samples()
    }

    pub fn diffusion_coeff(&self) -> Vec<f64> {
        self.particles.diffusion_coeff()
    }

    /// Per-step displacement standard deviation `sqrt(2 D t_step)` per particle.
    pub fn sigma_1d(&self) -> Vec<f64> {
        self.particles
            .iter()
            .map(|p| (2.0 * p.d * self.config.t_step).sqrt())
            .collect()
    }

    /// Particle concentration in the box (mol/L).
    pub fn concentration(&self) -> f64 {
        (self.num_particles() as f64 / NA) / self.sim_box().volume_liters()
    }

    /// Particle concentration in the box (pM).
    pub fn concentration_pm(&self) -> f64 {
        self.concentration() * 1e12
    }

    /// Starting positions of every particle, in index order.
    pub fn initial_positions(&self) -> Vec<[f64; 3]> {
        self.particles.iter().map(|p| p.r0).collect()
    }

    /// Numeric run parameters persisted alongside the arrays.
    pub fn numeric_params(&self) -> BTreeMap<String, NumericParam> {
        let d = self.diffusion_coeff();
        let d_mean = d.iter().sum::<f64>() / d.len() as f64;
        let entries = [
            ("D", d_mean, "Diffusion coefficient (m^2/s)"),
            ("np", self.num_particles() as f64, "Number of simulated particles"),
            ("t_step", self.config.t_step, "Simulation time-step (s)"),
            ("t_max", self.config.t_max, "Simulation total time (s)"),
            ("ID", f64::from(self.config.id), "Simulation ID (int)"),
            ("EID", f64::from(self.config.eid), "Engine ID (int)"),
            ("pico_mol", self.concentration_pm(), "Particles concentration (pM)"),
        ];
        entries
            .into_iter()
            .map(|(k, value, desc)| {
                (
                    k.to_string(),
                    NumericParam {
                        value,
                        description: desc.to_string(),
                    },
                )
            })
            .collect()
    }

    /// On-disk sizes of the emission and position arrays for the full duration.
    pub fn storage_estimate(&self) -> StorageEstimate {
        const FLOAT_SIZE: usize = 4;
        let n = self.n_samples();
        let one = n * FLOAT_SIZE;
        let estimate = StorageEstimate {
            n_samples: n,
            emission_one_particle: one,
            emission: one * self.num_particles(),
            position: 3 * one * self.num_particles(),
        };
        const MB: f64 = 1024.0 * 1024.0;
        log::info!(
            "{} particles, {} time steps: emission {:.1} MB, position {:.1} MB",
            self.num_particles(),
            n,
            estimate.emission as f64 / MB,
            estimate.position as f64 / MB
        );
        estimate
    }
}

impl fmt::Debug for Simulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Simulation")
            .field("particles", &self.particles)
            .field("config", &self.config)
            .field("psf", &self.psf.identity_hash())
            .finish()
    }
}

impl fmt::Display for Simulation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", self.sim_box())?;
        write!(
            f,
            "{}, {:.1} pM, t_step {:.1}us, t_max {:.1}s ID_EID {} {}",
            self.particles,
            self.concentration_pm(),
            self.config.t_step * 1e6,
            self.config.t_max,
            self.config.id,
            self.config.eid
        )
    }
}
