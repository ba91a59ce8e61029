use thiserror::Error;

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the diffusion and timestamp pipeline.
///
/// Configuration problems are rejected eagerly at construction time; storage and
/// serialization failures propagate unchanged.
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid user or API parameter.
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    /// An artifact with this name is already present in the store.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// A Poisson-sampled photon count does not fit the u8 count storage.
    ///
    /// Timestamp runs report the particle index (background = number of particles)
    /// and the absolute time index; the bare sampler reports its own row and column.
    #[error("photon count overflow: {count} photons in row {row}, bin {bin} (max 255)")]
    CountOverflow { row: usize, bin: usize, count: u64 },

    /// A required array or attribute is not present in the store.
    #[error("missing artifact: {0}")]
    MissingArtifact(String),

    /// Run used out of phase, or checkpoint does not match the run being resumed.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Array dimensions disagree.
    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
