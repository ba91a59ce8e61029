//! Point-spread function interface consumed by the trajectory simulator.

use ndarray::{Array1, ArrayView1, Zip};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Spatial sensitivity of the optical system, evaluated at radial/axial coordinates.
///
/// Implementations must return non-negative values with the same length as the
/// inputs. The simulator squares the value to model excitation times detection.
pub trait Psf: Send + Sync {
    /// Elementwise PSF value at `(radial[i], axial[i])`.
    fn evaluate(&self, radial: ArrayView1<'_, f64>, axial: ArrayView1<'_, f64>) -> Array1<f64>;

    /// Stable identifier of the PSF model and its parameters. Used for naming only.
    fn identity_hash(&self) -> String;
}

/// Gaussian PSF centred on the origin, normalized to 1 at its peak.
#[derive(Debug, Clone, PartialEq)]
pub struct GaussianPsf {
    /// Radial standard deviation (m).
    pub sigma_xy: f64,
    /// Axial standard deviation (m).
    pub sigma_z: f64,
}

impl GaussianPsf {
    pub fn new(sigma_xy: f64, sigma_z: f64) -> Result<Self> {
        if !sigma_xy.is_finite() || sigma_xy <= 0.0 {
            return Err(Error::InvalidParam("sigma_xy must be finite and > 0".into()));
        }
        if !sigma_z.is_finite() || sigma_z <= 0.0 {
            return Err(Error::InvalidParam("sigma_z must be finite and > 0".into()));
        }
        Ok(Self { sigma_xy, sigma_z })
    }
}

impl Default for GaussianPsf {
    /// Typical confocal excitation volume: 0.2 um radial, 0.8 um axial.
    fn default() -> Self {
        Self {
            sigma_xy: 0.2e-6,
            sigma_z: 0.8e-6,
        }
    }
}

impl Psf for GaussianPsf {
    fn evaluate(&self, radial: ArrayView1<'_, f64>, axial: ArrayView1<'_, f64>) -> Array1<f64> {
        let kr = 0.5 / (self.sigma_xy * self.sigma_xy);
        let kz = 0.5 / (self.sigma_z * self.sigma_z);
        Zip::from(radial)
            .and(axial)
            .map_collect(|&r, &z| (-(r * r) * kr - (z * z) * kz).exp())
    }

    fn identity_hash(&self) -> String {
        let repr = format!("GaussianPsf(sx={:e}, sz={:e})", self.sigma_xy, self.sigma_z);
        hex::encode(Sha256::digest(repr.as_bytes()))
    }
}
