//! Chunked, checkpointed execution of trajectory and timestamp runs.
//!
//! A run moves through [`RunPhase::Uninitialized`] → `Open` → `Running` → `Finalized`.
//! Opening acquires the store arrays and resolves the random stream; every step
//! simulates one chunk, appends it and flushes; finalizing hands back a
//! [`RunCheckpoint`] that a later session can pass to `continue_from` to continue
//! the same artifact bit-exactly. Only a run that covered the whole duration
//! publishes its final stream state as the group's `last_random_state`; a partial
//! run keeps its stream position in the checkpoint alone.

use ndarray::Array3;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::core::boundary::Boundary;
use crate::core::particle::DIM;
use crate::core::photons::OverflowPolicy;
use crate::core::rng::{RandomStream, StreamCheckpoint};
use crate::core::sim::{Simulation, SimulationConfig};
use crate::core::timestamps::{sim_timestamps_chunk, timestamps_name, Population};
use crate::core::trajectory::{Emission, EmissionMode, PathMode};
use crate::error::{Error, Result};
use crate::store::{ArrayChunk, ArrayKind, ArraySpec, ArrayStore};

pub const TRAJ_GROUP: &str = "trajectories";
pub const TS_GROUP: &str = "timestamps";
pub const EMISSION: &str = "trajectories/emission";
pub const EMISSION_TOT: &str = "trajectories/emission_tot";
pub const POSITION: &str = "trajectories/position";

const INIT_STATE: &str = "init_random_state";
const LAST_STATE: &str = "last_random_state";
const COMPLETE: &str = "complete";

fn attr_key(group: &str, key: &str) -> String {
    format!("{group}/{key}")
}

/// Lengths of consecutive chunks covering `total` steps.
pub fn iter_chunksize(total: usize, chunk: usize) -> impl Iterator<Item = usize> {
    iter_chunk_index(total, chunk).map(|(s, e)| e - s)
}

/// Half-open `(start, end)` ranges of consecutive chunks covering `[0, total)`.
///
/// A `chunk` of 0 is treated as 1.
pub fn iter_chunk_index(total: usize, chunk: usize) -> impl Iterator<Item = (usize, usize)> {
    let chunk = chunk.max(1);
    (0..total).step_by(chunk).map(move |s| (s, (s + chunk).min(total)))
}

/// Saved path of a trajectory run as (particles, coords, steps).
pub fn read_path<S: ArrayStore + ?Sized>(store: &S, num_particles: usize) -> Result<Array3<f32>> {
    let n = store.len(POSITION)?;
    let rows = store.read_f32(POSITION, 0..n)?;
    if num_particles == 0 || rows.nrows() % num_particles != 0 {
        return Err(Error::Shape(format!(
            "{} path rows do not split into {num_particles} particles",
            rows.nrows()
        )));
    }
    let coords = rows.nrows() / num_particles;
    rows.as_standard_layout()
        .into_owned()
        .into_shape_with_order((num_particles, coords, n))
        .map_err(|e| Error::Shape(e.to_string()))
}

/// Size of one time chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChunkSize {
    /// Time steps per chunk.
    Steps(usize),
    /// Bytes of float32 data per chunk across all rows.
    Bytes(usize),
}

impl Default for ChunkSize {
    fn default() -> Self {
        ChunkSize::Bytes(1 << 19)
    }
}

impl ChunkSize {
    /// Time steps per chunk for an array with `rows` float32 rows.
    pub fn steps(self, rows: usize) -> usize {
        match self {
            ChunkSize::Steps(n) => n.max(1),
            ChunkSize::Bytes(b) => (b / (4 * rows.max(1))).max(1),
        }
    }
}

/// Where a run's random stream comes from.
///
/// Priority when opening: `Resume` > the artifact's stored last state > `Stream` >
/// `Seed`. An explicit `Stream` is dropped, with a warning, whenever a stored state
/// exists, so that consecutive runs on one artifact form a single stream.
#[derive(Debug, Clone)]
pub enum StreamSource {
    /// Fresh stream for `(seed, config.id, config.eid)`.
    Seed(u64),
    Stream(RandomStream),
    Resume(StreamCheckpoint),
}

/// What to do when a timestamp stream with the same name already exists.
///
/// `Fail` and `Skip` apply to complete streams only; a partial stream left by an
/// aborted or split run is refused with [`Error::InvalidState`] unless overwritten.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DuplicatePolicy {
    #[default]
    Fail,
    Skip,
    Overwrite,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Artifact {
    Trajectories,
    Timestamps,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Uninitialized,
    Open,
    Running,
    Finalized,
}

/// Everything needed to continue a run in another session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunCheckpoint {
    pub artifact: Artifact,
    /// Store path of the main array written by the run.
    pub name: String,
    pub stream: StreamCheckpoint,
    /// Next time index to simulate.
    pub cursor: usize,
    pub chunk_len: usize,
    /// Carried particle positions (trajectory runs only).
    pub positions: Option<Vec<[f64; DIM]>>,
}

impl RunCheckpoint {
    pub fn is_complete(&self, total: usize) -> bool {
        self.cursor >= total
    }
}

/// Options of a trajectory run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrajectoryOptions {
    pub emission: EmissionMode,
    pub path: PathMode,
    pub boundary: Boundary,
    pub chunk_size: ChunkSize,
    /// Replace existing trajectory arrays instead of failing.
    pub overwrite: bool,
}

impl Default for TrajectoryOptions {
    fn default() -> Self {
        Self {
            emission: EmissionMode::PerParticle,
            path: PathMode::None,
            boundary: Boundary::Periodic,
            chunk_size: ChunkSize::default(),
            overwrite: false,
        }
    }
}

/// Options of a timestamp run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampOptions {
    /// Timestamp clock ticks per simulation step.
    pub scale: i64,
    /// Time steps per chunk; `None` follows the emission array's storage chunk.
    pub chunk_len: Option<usize>,
    /// Storage chunk of the timestamp arrays.
    pub array_chunk_len: usize,
    pub overflow: OverflowPolicy,
    pub on_duplicate: DuplicatePolicy,
}

impl Default for TimestampOptions {
    fn default() -> Self {
        Self {
            scale: 10,
            chunk_len: None,
            array_chunk_len: 1 << 16,
            overflow: OverflowPolicy::Error,
            on_duplicate: DuplicatePolicy::Fail,
        }
    }
}

/// Result of opening a timestamp run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Opened {
    Created(String),
    /// A complete stream with this name existed and [`DuplicatePolicy::Skip`] was requested.
    Skipped(String),
}

fn resolve_stream<S: ArrayStore + ?Sized>(
    store: &S,
    group: &str,
    source: StreamSource,
    config: &SimulationConfig,
) -> Result<RandomStream> {
    let stored = store.attr(&attr_key(group, LAST_STATE));
    match (source, stored) {
        (StreamSource::Resume(cp), _) => {
            log::info!("random state resumed from caller checkpoint for '{group}'");
            Ok(RandomStream::restore(&cp))
        }
        (source, Some(value)) => {
            if let StreamSource::Stream(_) = source {
                log::warn!("explicit random stream ignored: '{group}' has a saved last state");
            }
            let cp: StreamCheckpoint = serde_json::from_value(value)?;
            log::info!("random state set to last saved state in '{group}'");
            Ok(RandomStream::restore(&cp))
        }
        (StreamSource::Stream(s), None) => Ok(s),
        (StreamSource::Seed(seed), None) => {
            log::info!("random state initialized from seed ({seed})");
            Ok(RandomStream::new(seed, config.id, config.eid))
        }
    }
}

fn check_phase(phase: RunPhase, what: &str) -> Result<()> {
    match phase {
        RunPhase::Open | RunPhase::Running => Ok(()),
        RunPhase::Uninitialized => Err(Error::InvalidState(format!("{what}: run is not open"))),
        RunPhase::Finalized => Err(Error::InvalidState(format!("{what}: run is finalized"))),
    }
}

/// Chunked Brownian motion run appending emission (and optionally paths) to a store.
pub struct TrajectoryRun<'a, S: ArrayStore + ?Sized> {
    sim: &'a Simulation,
    store: &'a mut S,
    opts: TrajectoryOptions,
    phase: RunPhase,
    stream: Option<RandomStream>,
    positions: Vec<[f64; DIM]>,
    chunk_len: usize,
    cursor: usize,
}

impl<'a, S: ArrayStore + ?Sized> TrajectoryRun<'a, S> {
    pub fn new(sim: &'a Simulation, store: &'a mut S, opts: TrajectoryOptions) -> Self {
        Self {
            sim,
            store,
            opts,
            phase: RunPhase::Uninitialized,
            stream: None,
            positions: sim.initial_positions(),
            chunk_len: 0,
            cursor: 0,
        }
    }

    fn emission_name(&self) -> &'static str {
        match self.opts.emission {
            EmissionMode::PerParticle => EMISSION,
            EmissionMode::Total => EMISSION_TOT,
        }
    }

    fn emission_rows(&self) -> usize {
        match self.opts.emission {
            EmissionMode::PerParticle => self.sim.num_particles(),
            EmissionMode::Total => 1,
        }
    }

    /// Create the arrays and resolve the stream, starting from the particles' initial positions.
    pub fn open(&mut self, source: StreamSource) -> Result<()> {
        if self.phase != RunPhase::Uninitialized {
            return Err(Error::InvalidState("open: run already opened".into()));
        }
        let n = self.sim.num_particles();
        self.chunk_len = self.opts.chunk_size.steps(n);
        if !self.opts.overwrite {
            let mut targets = vec![self.emission_name()];
            if self.opts.path != PathMode::None {
                targets.push(POSITION);
            }
            if let Some(name) = targets.into_iter().find(|t| self.store.exists(t)) {
                return Err(Error::AlreadyExists(name.to_string()));
            }
        }
        let stream = resolve_stream(&*self.store, TRAJ_GROUP, source, &self.sim.config)?;

        let em_spec = ArraySpec {
            kind: ArrayKind::Float32 {
                rows: self.emission_rows(),
            },
            chunk_len: self.chunk_len,
        };
        self.store.create(self.emission_name(), em_spec, self.opts.overwrite)?;
        if self.opts.path != PathMode::None {
            let pos_spec = ArraySpec {
                kind: ArrayKind::Float32 {
                    rows: n * self.opts.path.coords(),
                },
                chunk_len: self.chunk_len,
            };
            self.store.create(POSITION, pos_spec, self.opts.overwrite)?;
        }

        let mut params = serde_json::to_value(self.sim.numeric_params())?;
        params["chunksize"] = json!({"value": self.chunk_len, "description": "Chunksize for arrays"});
        self.store.set_attr(&attr_key(TRAJ_GROUP, "params"), params)?;
        self.store.set_attr(
            &attr_key(TRAJ_GROUP, "options"),
            serde_json::to_value(self.opts)?,
        )?;
        self.store.set_attr(
            &attr_key(TRAJ_GROUP, "psf_name"),
            json!(self.sim.psf().identity_hash()),
        )?;
        self.store.set_attr(
            &attr_key(TRAJ_GROUP, INIT_STATE),
            serde_json::to_value(stream.checkpoint())?,
        )?;

        log::info!(
            "trajectory run opened: {} particles, {} steps in chunks of {}",
            n,
            self.total(),
            self.chunk_len
        );
        self.positions = self.sim.initial_positions();
        self.stream = Some(stream);
        self.phase = RunPhase::Open;
        Ok(())
    }

    /// Continue the run described by `checkpoint` on arrays written by an earlier session.
    pub fn continue_from(&mut self, checkpoint: RunCheckpoint) -> Result<()> {
        if self.phase != RunPhase::Uninitialized {
            return Err(Error::InvalidState("continue_from: run already opened".into()));
        }
        if checkpoint.artifact != Artifact::Trajectories || checkpoint.name != self.emission_name() {
            return Err(Error::InvalidState(format!(
                "checkpoint for '{}' cannot resume '{}'",
                checkpoint.name,
                self.emission_name()
            )));
        }
        let stored = self.store.len(self.emission_name())?;
        if stored != checkpoint.cursor {
            return Err(Error::InvalidState(format!(
                "{} holds {} steps but checkpoint is at {}",
                checkpoint.name, stored, checkpoint.cursor
            )));
        }
        let positions = checkpoint
            .positions
            .ok_or_else(|| Error::InvalidState("trajectory checkpoint without positions".into()))?;
        if positions.len() != self.sim.num_particles() {
            return Err(Error::Shape(format!(
                "checkpoint carries {} positions for {} particles",
                positions.len(),
                self.sim.num_particles()
            )));
        }
        let stored_opts: TrajectoryOptions = serde_json::from_value(
            self.store
                .attr(&attr_key(TRAJ_GROUP, "options"))
                .ok_or_else(|| Error::MissingArtifact(attr_key(TRAJ_GROUP, "options")))?,
        )?;
        if (stored_opts.emission, stored_opts.path, stored_opts.boundary)
            != (self.opts.emission, self.opts.path, self.opts.boundary)
        {
            return Err(Error::InvalidState(format!(
                "run options {:?} differ from the stored options {:?}",
                self.opts, stored_opts
            )));
        }
        if self.opts.path != PathMode::None {
            if !self.store.exists(POSITION) {
                return Err(Error::MissingArtifact(POSITION.to_string()));
            }
            let stored_pos = self.store.len(POSITION)?;
            if stored_pos != checkpoint.cursor {
                return Err(Error::InvalidState(format!(
                    "{POSITION} holds {stored_pos} steps but checkpoint is at {}",
                    checkpoint.cursor
                )));
            }
        }
        log::info!("trajectory run resumed at step {}", checkpoint.cursor);
        self.positions = positions;
        self.cursor = checkpoint.cursor;
        self.chunk_len = checkpoint.chunk_len;
        self.stream = Some(RandomStream::restore(&checkpoint.stream));
        self.phase = RunPhase::Open;
        Ok(())
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn total(&self) -> usize {
        self.sim.n_samples()
    }

    pub fn chunk_len(&self) -> usize {
        self.chunk_len
    }

    /// Current carried positions.
    pub fn positions(&self) -> &[[f64; DIM]] {
        &self.positions
    }

    /// Simulate and append the next chunk. Returns `false` once the duration is covered.
    pub fn step(&mut self) -> Result<bool> {
        check_phase(self.phase, "step")?;
        let total = self.total();
        if self.cursor >= total {
            return Ok(false);
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::InvalidState("step: no random stream".into()))?;
        let end = (self.cursor + self.chunk_len).min(total);
        let out = self.sim.sim_trajectories(
            end - self.cursor,
            &mut self.positions,
            stream,
            self.opts.emission,
            self.opts.path,
            self.opts.boundary,
        )?;

        let emission_name = self.emission_name();
        match &out.emission {
            Emission::PerParticle(m) => self.store.append(emission_name, ArrayChunk::Float32(m.view()))?,
            Emission::Total(v) => {
                let row = v.view().insert_axis(ndarray::Axis(0));
                self.store.append(emission_name, ArrayChunk::Float32(row))?
            }
        }
        if let Some(rows) = out.path.to_rows()? {
            self.store.append(POSITION, ArrayChunk::Float32(rows.view()))?;
        }
        self.store.flush()?;

        log::debug!(
            "diffusion time {:.3}s ({}..{})",
            self.cursor as f64 * self.sim.config.t_step,
            self.cursor,
            end
        );
        self.cursor = end;
        self.phase = RunPhase::Running;
        Ok(true)
    }

    /// Step until the whole duration is simulated.
    pub fn run(&mut self) -> Result<()> {
        while self.step()? {}
        Ok(())
    }

    /// Step until the cursor reaches `index`, stopping at the first chunk boundary at or after it.
    pub fn run_until(&mut self, index: usize) -> Result<()> {
        while self.cursor < index && self.step()? {}
        Ok(())
    }

    /// Flush and return the continuation checkpoint.
    ///
    /// The stream state is published as the group's last state only once the whole
    /// duration is simulated, so no other run can draw the numbers a continuation replays.
    pub fn finalize(&mut self) -> Result<RunCheckpoint> {
        check_phase(self.phase, "finalize")?;
        let stream = self
            .stream
            .take()
            .ok_or_else(|| Error::InvalidState("finalize: no random stream".into()))?;
        let cp = stream.checkpoint();
        if self.cursor >= self.total() {
            self.store
                .set_attr(&attr_key(TRAJ_GROUP, LAST_STATE), serde_json::to_value(&cp)?)?;
        }
        self.store.flush()?;
        self.phase = RunPhase::Finalized;
        log::info!("trajectory run finalized at step {} of {}", self.cursor, self.total());
        Ok(RunCheckpoint {
            artifact: Artifact::Trajectories,
            name: self.emission_name().to_string(),
            stream: cp,
            cursor: self.cursor,
            chunk_len: self.chunk_len,
            positions: Some(self.positions.clone()),
        })
    }
}

/// Chunked conversion of stored per-particle emission into a timestamp stream.
pub struct TimestampRun<'a, S: ArrayStore + ?Sized> {
    sim: &'a Simulation,
    store: &'a mut S,
    populations: Vec<Population>,
    opts: TimestampOptions,
    phase: RunPhase,
    stream: Option<RandomStream>,
    name: String,
    chunk_len: usize,
    cursor: usize,
}

impl<'a, S: ArrayStore + ?Sized> TimestampRun<'a, S> {
    /// Errors:
    /// - `Error::InvalidParam` if a population leaves the particle range, or there are
    ///   more than 255 particles (the background tag must fit in u8).
    pub fn new(
        sim: &'a Simulation,
        store: &'a mut S,
        populations: Vec<Population>,
        opts: TimestampOptions,
    ) -> Result<Self> {
        let n = sim.num_particles();
        if n > usize::from(u8::MAX) {
            return Err(Error::InvalidParam(format!(
                "{n} particles: timestamp tags support at most 255"
            )));
        }
        if populations.is_empty() {
            return Err(Error::InvalidParam("at least one population is required".into()));
        }
        if let Some(p) = populations.iter().find(|p| p.range.end > n) {
            return Err(Error::InvalidParam(format!(
                "population {}..{} exceeds {} particles",
                p.range.start, p.range.end, n
            )));
        }
        if opts.scale <= 0 {
            return Err(Error::InvalidParam("scale must be > 0".into()));
        }
        Ok(Self {
            sim,
            store,
            populations,
            opts,
            phase: RunPhase::Uninitialized,
            stream: None,
            name: String::new(),
            chunk_len: 0,
            cursor: 0,
        })
    }

    fn par_name(&self) -> String {
        format!("{}_par", self.name)
    }

    fn check_emission(&self) -> Result<()> {
        if !self.store.exists(EMISSION) {
            return Err(Error::MissingArtifact(EMISSION.to_string()));
        }
        let stored = self.store.len(EMISSION)?;
        if stored < self.total() {
            return Err(Error::InvalidState(format!(
                "emission holds {stored} of {} steps; finish the trajectory run first",
                self.total()
            )));
        }
        Ok(())
    }

    /// Resolve the stream, derive the stream name and create its arrays.
    pub fn open(&mut self, source: StreamSource) -> Result<Opened> {
        if self.phase != RunPhase::Uninitialized {
            return Err(Error::InvalidState("open: run already opened".into()));
        }
        self.check_emission()?;
        let stream = resolve_stream(&*self.store, TS_GROUP, source, &self.sim.config)?;
        let init = stream.checkpoint();
        let n = self.sim.num_particles();
        self.name = format!(
            "{TS_GROUP}/{}",
            timestamps_name(&self.populations, n, &init)?
        );

        if self.store.exists(&self.name) {
            let complete = self.store.attr(&attr_key(&self.name, COMPLETE)) == Some(json!(true));
            match (self.opts.on_duplicate, complete) {
                (DuplicatePolicy::Overwrite, _) => {
                    log::warn!("overwriting timestamps '{}'", self.name);
                }
                (_, false) => {
                    return Err(Error::InvalidState(format!(
                        "partial artifact '{}': continue it from its checkpoint or overwrite it",
                        self.name
                    )))
                }
                (DuplicatePolicy::Fail, true) => return Err(Error::AlreadyExists(self.name.clone())),
                (DuplicatePolicy::Skip, true) => {
                    log::info!("timestamps '{}' already exist, skipping", self.name);
                    self.phase = RunPhase::Finalized;
                    return Ok(Opened::Skipped(self.name.clone()));
                }
            }
        }
        let overwrite = self.opts.on_duplicate == DuplicatePolicy::Overwrite;
        let ts_spec = ArraySpec {
            kind: ArrayKind::Int64,
            chunk_len: self.opts.array_chunk_len,
        };
        let par_spec = ArraySpec {
            kind: ArrayKind::UInt8,
            chunk_len: self.opts.array_chunk_len,
        };
        self.store.create(&self.name, ts_spec, overwrite)?;
        self.store.create(&self.par_name(), par_spec, overwrite)?;

        self.chunk_len = match self.opts.chunk_len {
            Some(c) => c.max(1),
            None => self.store.chunk_len(EMISSION)?,
        };
        let params = json!({
            "clk_p": self.sim.config.t_step / self.opts.scale as f64,
            "populations": self.populations,
            "num_particles": n,
            "bg_particle": n,
            "scale": self.opts.scale,
        });
        self.store.set_attr(&attr_key(&self.name, "params"), params)?;
        self.store.set_attr(&attr_key(&self.name, COMPLETE), json!(false))?;
        self.store
            .set_attr(&attr_key(TS_GROUP, INIT_STATE), serde_json::to_value(&init)?)?;

        log::info!("timestamp run opened: '{}'", self.name);
        self.stream = Some(stream);
        self.phase = RunPhase::Open;
        Ok(Opened::Created(self.name.clone()))
    }

    /// Continue appending to the stream described by `checkpoint`.
    pub fn continue_from(&mut self, checkpoint: RunCheckpoint) -> Result<()> {
        if self.phase != RunPhase::Uninitialized {
            return Err(Error::InvalidState("continue_from: run already opened".into()));
        }
        if checkpoint.artifact != Artifact::Timestamps {
            return Err(Error::InvalidState(format!(
                "checkpoint for '{}' is not a timestamp run",
                checkpoint.name
            )));
        }
        self.check_emission()?;
        self.name = checkpoint.name;
        if !self.store.exists(&self.name) || !self.store.exists(&self.par_name()) {
            return Err(Error::MissingArtifact(self.name.clone()));
        }
        let params = self
            .store
            .attr(&attr_key(&self.name, "params"))
            .ok_or_else(|| Error::MissingArtifact(attr_key(&self.name, "params")))?;
        if params["populations"] != serde_json::to_value(&self.populations)?
            || params["scale"] != json!(self.opts.scale)
        {
            return Err(Error::InvalidState(format!(
                "populations or scale differ from those '{}' was opened with",
                self.name
            )));
        }
        log::info!("timestamp run '{}' resumed at step {}", self.name, checkpoint.cursor);
        self.cursor = checkpoint.cursor;
        self.chunk_len = checkpoint.chunk_len;
        self.stream = Some(RandomStream::restore(&checkpoint.stream));
        self.phase = RunPhase::Open;
        Ok(())
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn total(&self) -> usize {
        self.sim.n_samples()
    }

    /// Generate and append the timestamps of the next chunk. Returns `false` when done.
    pub fn step(&mut self) -> Result<bool> {
        if self.phase == RunPhase::Finalized {
            // skipped duplicates land here with nothing to do
            return Ok(false);
        }
        check_phase(self.phase, "step")?;
        let total = self.total();
        if self.cursor >= total {
            return Ok(false);
        }
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| Error::InvalidState("step: no random stream".into()))?;
        let end = (self.cursor + self.chunk_len).min(total);
        let em = self.store.read_f32(EMISSION, self.cursor..end)?;
        let ts = sim_timestamps_chunk(
            em.view(),
            &self.populations,
            self.cursor,
            self.sim.config.t_step,
            self.opts.scale,
            self.sim.num_particles(),
            stream,
            self.opts.overflow,
        )?;
        self.store.append(&self.name, ArrayChunk::Int64(&ts.ticks))?;
        let par_name = self.par_name();
        self.store.append(&par_name, ArrayChunk::UInt8(&ts.particles))?;
        self.store.flush()?;

        log::debug!("{} timestamps for steps {}..{}", ts.len(), self.cursor, end);
        self.cursor = end;
        self.phase = RunPhase::Running;
        Ok(true)
    }

    pub fn run(&mut self) -> Result<()> {
        while self.step()? {}
        Ok(())
    }

    /// Step until the cursor reaches `index`, stopping at the first chunk boundary at or after it.
    pub fn run_until(&mut self, index: usize) -> Result<()> {
        while self.cursor < index && self.step()? {}
        Ok(())
    }

    pub fn finalize(&mut self) -> Result<RunCheckpoint> {
        check_phase(self.phase, "finalize")?;
        let stream = self
            .stream
            .take()
            .ok_or_else(|| Error::InvalidState("finalize: no random stream".into()))?;
        let cp = stream.checkpoint();
        if self.cursor >= self.total() {
            self.store
                .set_attr(&attr_key(TS_GROUP, LAST_STATE), serde_json::to_value(&cp)?)?;
            self.store.set_attr(&attr_key(&self.name, COMPLETE), json!(true))?;
        }
        self.store.flush()?;
        self.phase = RunPhase::Finalized;
        log::info!("timestamp run '{}' finalized at step {}", self.name, self.cursor);
        Ok(RunCheckpoint {
            artifact: Artifact::Timestamps,
            name: self.name.clone(),
            stream: cp,
            cursor: self.cursor,
            chunk_len: self.chunk_len,
            positions: None,
        })
    }
}

impl Simulation {
    /// Simulate the whole duration into `store` in one session.
    pub fn simulate_diffusion<S: ArrayStore + ?Sized>(
        &self,
        store: &mut S,
        opts: TrajectoryOptions,
        source: StreamSource,
    ) -> Result<RunCheckpoint> {
        let mut run = TrajectoryRun::new(self, store, opts);
        run.open(source)?;
        run.run()?;
        run.finalize()
    }

    /// Timestamps for all particles with one peak rate and optional background.
    ///
    /// Returns `None` when the stream already exists and `opts.on_duplicate` is `Skip`.
    pub fn simulate_timestamps<S: ArrayStore + ?Sized>(
        &self,
        store: &mut S,
        max_rate: f64,
        bg_rate: Option<f64>,
        opts: TimestampOptions,
        source: StreamSource,
    ) -> Result<Option<RunCheckpoint>> {
        let pop = Population::new(0..self.num_particles(), max_rate, bg_rate)?;
        self.simulate_timestamps_mix(store, vec![pop], opts, source)
    }

    /// Timestamps for several populations merged into one stream.
    pub fn simulate_timestamps_mix<S: ArrayStore + ?Sized>(
        &self,
        store: &mut S,
        populations: Vec<Population>,
        opts: TimestampOptions,
        source: StreamSource,
    ) -> Result<Option<RunCheckpoint>> {
        let mut run = TimestampRun::new(self, store, populations, opts)?;
        if let Opened::Skipped(_) = run.open(source)? {
            return Ok(None);
        }
        run.run()?;
        run.finalize().map(Some)
    }
}
