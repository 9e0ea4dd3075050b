//! Per-tile simulation context and its cycle loop.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use log::Level;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use thiserror::Error;

use crate::erosion::{ConfigError, ErosionParameters, ErosionSettings, EventMap, Particle, PileSolver};
use crate::grid::Tile;
use crate::pipeline::locks::{buffer_name, BufferAlias, BufferLocks, LockGuard, Readiness, TileId};
use crate::pipeline::phase::{CycleContext, CyclePlan, CycleReport, PipelineError};
use crate::pipeline::timing::timed;
use crate::pools::PoolHierarchy;

/// Owns a tile's buffers and the state that survives between cycles.
pub struct ErosionSimulation {
    tile_id: TileId,
    settings: ErosionSettings,
    params: ErosionParameters,
    tile: Tile,
    original: Vec<f32>,
    rng: ChaCha8Rng,
    pending: Vec<Particle>,
    piles: PileSolver,
    pools: Option<PoolHierarchy>,
    plan: CyclePlan,
    cycle: u32,
    locks: BufferLocks,
}

/// Result of [`ErosionSimulation::schedule`].
pub enum Scheduled {
    Started(SimulationHandle),
    /// Inputs were locked or missing. The simulation is handed back untouched.
    NotReady(Box<ErosionSimulation>, Readiness),
}

/// A scheduled run that stopped before its last cycle.
///
/// The simulation comes back with whatever the completed cycles left in the
/// tile, unless the worker thread itself panicked.
#[derive(Error)]
#[error("scheduled run failed: {error}")]
pub struct ScheduleError {
    #[source]
    pub error: PipelineError,
    pub simulation: Option<Box<ErosionSimulation>>,
}

impl fmt::Debug for ScheduleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScheduleError")
            .field("error", &self.error)
            .field("recovered", &self.simulation.is_some())
            .finish()
    }
}

/// A simulation running on a worker thread.
pub struct SimulationHandle {
    worker: JoinHandle<Result<ErosionSimulation, ScheduleError>>,
    progress: Arc<AtomicU32>,
    cycles: u32,
}

impl SimulationHandle {
    /// True once the chain has finished. Never blocks.
    pub fn poll(&self) -> bool {
        self.worker.is_finished()
    }

    /// Cycles completed so far.
    pub fn progress(&self) -> (u32, u32) {
        (self.progress.load(Ordering::Acquire), self.cycles)
    }

    /// Blocks until the chain finishes and returns the simulation.
    pub fn wait(self) -> Result<ErosionSimulation, ScheduleError> {
        match self.worker.join() {
            Ok(result) => result,
            Err(_) => Err(ScheduleError {
                error: PipelineError::PhaseFailed(
                    "worker".to_string(),
                    "simulation thread panicked".to_string(),
                ),
                simulation: None,
            }),
        }
    }
}

impl ErosionSimulation {
    pub fn new(tile_id: TileId, tile: Tile, settings: ErosionSettings) -> Result<Self, ConfigError> {
        Self::with_locks(tile_id, tile, settings, BufferLocks::new())
    }

    /// Builds a simulation that registers its buffers in a shared registry.
    pub fn with_locks(
        tile_id: TileId,
        tile: Tile,
        settings: ErosionSettings,
        locks: BufferLocks,
    ) -> Result<Self, ConfigError> {
        let params = settings.to_parameters(tile.resolution)?;
        let sim = Self {
            tile_id,
            original: tile.height.clone(),
            rng: ChaCha8Rng::seed_from_u64(settings.seed),
            piles: PileSolver::new(settings.piling_radius),
            params,
            settings,
            tile,
            pending: Vec::new(),
            pools: None,
            plan: CyclePlan::standard(),
            cycle: 0,
            locks,
        };
        sim.register_buffers();
        Ok(sim)
    }

    fn aliases(&self) -> Vec<BufferAlias> {
        let mut aliases = BufferAlias::PRODUCED.to_vec();
        if self.tile.plants.is_some() {
            aliases.push(BufferAlias::Plants);
        }
        if self.pools.is_some() {
            aliases.push(BufferAlias::Pools);
        }
        aliases
    }

    fn register_buffers(&self) {
        for alias in self.aliases() {
            self.locks.register(self.buffer_name(alias));
        }
    }

    fn unregister_buffers(&self) {
        for alias in BufferAlias::ALL {
            self.locks.unregister(&self.buffer_name(alias));
        }
    }

    pub fn buffer_name(&self, alias: BufferAlias) -> String {
        buffer_name(self.tile_id, self.tile.resolution, alias)
    }

    pub fn buffer_names(&self) -> Vec<String> {
        self.aliases().into_iter().map(|a| self.buffer_name(a)).collect()
    }

    pub fn tile_id(&self) -> TileId {
        self.tile_id
    }

    pub fn tile(&self) -> &Tile {
        &self.tile
    }

    pub fn settings(&self) -> &ErosionSettings {
        &self.settings
    }

    pub fn params(&self) -> &ErosionParameters {
        &self.params
    }

    pub fn locks(&self) -> &BufferLocks {
        &self.locks
    }

    /// Cycles run since construction or the last reset.
    pub fn cycle(&self) -> u32 {
        self.cycle
    }

    pub fn pools(&self) -> Option<&PoolHierarchy> {
        self.pools.as_ref()
    }

    /// Swaps in a custom phase plan.
    pub fn set_plan(&mut self, plan: CyclePlan) {
        self.plan = plan;
    }

    /// Runs one full cycle of the plan.
    pub fn run_cycle(&mut self) -> Result<CycleReport, PipelineError> {
        let start = Instant::now();
        let cycle = self.cycle;
        log::info!("cycle {} starting", cycle);
        let mut ctx = CycleContext {
            cycle,
            tile: &mut self.tile,
            params: &self.params,
            settings: &self.settings,
            rng: &mut self.rng,
            pending: &mut self.pending,
            piles: &mut self.piles,
            pools: &mut self.pools,
            particles: Vec::new(),
            events: EventMap::new(),
            sediment: Vec::new(),
            report: CycleReport {
                cycle,
                ..Default::default()
            },
        };
        self.plan.run(&mut ctx)?;
        let mut report = ctx.report;
        report.elapsed = start.elapsed();
        self.cycle += 1;
        log::info!(
            "cycle {} done in {}ms: {} events, {} piles, {} drained cells",
            cycle,
            report.elapsed.as_millis(),
            report.events,
            report.piled,
            report.drained_cells
        );
        Ok(report)
    }

    /// Runs `cycles` cycles.
    pub fn run(&mut self, cycles: u32) -> Result<Vec<CycleReport>, PipelineError> {
        self.run_with_callbacks(cycles, |_, _| {}, |_| {})
    }

    pub fn run_with_callbacks<F1, F2>(
        &mut self,
        cycles: u32,
        mut on_cycle_start: F1,
        mut on_cycle_complete: F2,
    ) -> Result<Vec<CycleReport>, PipelineError>
    where
        F1: FnMut(u32, u32),
        F2: FnMut(&CycleReport),
    {
        let mut reports = Vec::with_capacity(cycles as usize);
        for i in 0..cycles {
            on_cycle_start(i, cycles);
            let report = self.run_cycle()?;
            on_cycle_complete(&report);
            reports.push(report);
        }
        Ok(reports)
    }

    /// Solves the pool hierarchy for the current heights.
    pub fn solve_pools(&mut self) -> &PoolHierarchy {
        let hierarchy = timed("pool solve", Level::Info, || PoolHierarchy::solve(&self.tile));
        self.locks.register(self.buffer_name(BufferAlias::Pools));
        self.pools.insert(hierarchy)
    }

    /// Solves the pool hierarchy, gathers the tile's standing water into it
    /// and redraws the pool buffer as level surfaces.
    pub fn settle_pools(&mut self) -> &PoolHierarchy {
        let mut hierarchy = timed("pool solve", Level::Info, || PoolHierarchy::solve(&self.tile));
        let before = self.tile.total_pool();
        let overflow = timed("pool draw", Level::Debug, || hierarchy.settle(&mut self.tile));
        log::debug!(
            "tile {:?} pools settled: {:.4} water in, {:.4} drawn, {:.4} spilled",
            self.tile_id,
            before,
            self.tile.total_pool(),
            overflow
        );
        self.locks.register(self.buffer_name(BufferAlias::Pools));
        self.pools.insert(hierarchy)
    }

    /// Restores the original heights and clears water and pool state.
    pub fn reset(&mut self) {
        self.tile.height.copy_from_slice(&self.original);
        self.tile.clear_water();
        self.pending.clear();
        self.pools = None;
        self.locks.unregister(&self.buffer_name(BufferAlias::Pools));
        self.rng = ChaCha8Rng::seed_from_u64(self.settings.seed);
        self.cycle = 0;
        log::debug!("tile {:?} reset", self.tile_id);
    }

    /// Reallocates every buffer for a new resolution.
    pub fn resize(&mut self, resolution: usize, heights: Vec<f32>) -> Result<(), ConfigError> {
        let params = self.settings.to_parameters(resolution)?;
        let mut tile = self.tile.clone();
        tile.resize(resolution, heights)?;

        self.unregister_buffers();
        self.params = params;
        self.original = tile.height.clone();
        self.tile = tile;
        self.pending.clear();
        self.pools = None;
        self.cycle = 0;
        self.register_buffers();
        log::debug!("tile {:?} resized to {}", self.tile_id, resolution);
        Ok(())
    }

    /// Ready when no produced buffer is locked and every input is registered.
    pub fn is_schedulable(&self) -> Readiness {
        self.locks.readiness(&self.buffer_names())
    }

    fn lock_outputs(&self) -> Option<LockGuard> {
        self.locks.try_lock(&self.buffer_names())
    }

    /// Runs `cycles` cycles on a worker thread.
    ///
    /// Every produced buffer stays locked until the last cycle finishes, then
    /// `on_complete` receives the reports and a snapshot of the tile. A failed
    /// cycle skips `on_complete` and hands the simulation back in the error.
    pub fn schedule<F>(self, cycles: u32, on_complete: F) -> Scheduled
    where
        F: FnOnce(&[CycleReport], &Tile) + Send + 'static,
    {
        let readiness = self.is_schedulable();
        if !readiness.is_ready() {
            return Scheduled::NotReady(Box::new(self), readiness);
        }
        let Some(guard) = self.lock_outputs() else {
            let readiness = self.is_schedulable();
            return Scheduled::NotReady(Box::new(self), readiness);
        };

        let progress = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&progress);
        let mut sim = self;
        let worker = thread::spawn(move || {
            let reports = sim.run_with_callbacks(
                cycles,
                |_, _| {},
                |_| {
                    counter.fetch_add(1, Ordering::Release);
                },
            );
            drop(guard);
            match reports {
                Ok(reports) => {
                    on_complete(&reports, &sim.tile);
                    Ok(sim)
                }
                Err(error) => {
                    log::warn!("tile {:?} stopped at cycle {}: {}", sim.tile_id, sim.cycle, error);
                    Err(ScheduleError {
                        error,
                        simulation: Some(Box::new(sim)),
                    })
                }
            }
        });

        Scheduled::Started(SimulationHandle {
            worker,
            progress,
            cycles,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::phase::{CyclePhase, PhaseId};
    use std::sync::mpsc;

    /// Marks the first cell wet, then fails from cycle 1 on.
    struct Faulty;

    impl CyclePhase for Faulty {
        fn id(&self) -> PhaseId {
            PhaseId::Spawn
        }

        fn execute(&self, ctx: &mut CycleContext<'_>) -> Result<(), PipelineError> {
            if ctx.cycle >= 1 {
                return Err(PipelineError::PhaseFailed("faulty".into(), "boom".into()));
            }
            ctx.tile.pool[0] = 0.25;
            Ok(())
        }
    }

    fn slope(res: usize) -> Tile {
        let heights = (0..res * res)
            .map(|i| {
                let (x, z) = ((i % res) as f32, (i / res) as f32);
                0.3 + 0.02 * x + 0.01 * (z - res as f32 / 2.0).abs()
            })
            .collect();
        Tile::from_heights(res, heights).unwrap()
    }

    fn settings() -> ErosionSettings {
        ErosionSettings {
            particles_per_cycle: 200,
            ..Default::default()
        }
    }

    #[test]
    fn test_new_rejects_bad_settings() {
        let bad = ErosionSettings {
            drag: 0.0,
            ..Default::default()
        };
        assert!(ErosionSimulation::new(TileId::default(), slope(8), bad).is_err());
    }

    #[test]
    fn test_run_changes_terrain_and_reset_restores_it() {
        let tile = slope(24);
        let original = tile.height.clone();
        let mut sim = ErosionSimulation::new(TileId::new(0, 0), tile, settings()).unwrap();

        let mut completed = 0;
        let reports = sim
            .run_with_callbacks(2, |_, _| {}, |_| completed += 1)
            .unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(completed, 2);
        assert_eq!(sim.cycle(), 2);
        assert!(reports.iter().all(|r| r.spawned == 200));
        assert_ne!(sim.tile().height, original);
        assert!(sim.tile().flow.iter().any(|&f| f > 0.0));

        sim.reset();
        assert_eq!(sim.tile().height, original);
        assert!(sim.tile().flow.iter().all(|&f| f == 0.0));
        assert_eq!(sim.cycle(), 0);
    }

    #[test]
    fn test_runs_are_reproducible_for_a_seed() {
        let mut a = ErosionSimulation::new(TileId::default(), slope(16), settings()).unwrap();
        let mut b = ErosionSimulation::new(TileId::default(), slope(16), settings()).unwrap();
        a.run(2).unwrap();
        b.run(2).unwrap();
        assert_eq!(a.tile().height, b.tile().height);
        assert_eq!(a.tile().pool, b.tile().pool);
    }

    #[test]
    fn test_resize_reallocates_buffers() {
        let mut sim = ErosionSimulation::new(TileId::new(2, 3), slope(8), settings()).unwrap();
        let old = sim.buffer_name(BufferAlias::TerrainHeight);
        sim.solve_pools();
        sim.resize(16, vec![0.5; 256]).unwrap();

        assert_eq!(sim.tile().resolution, 16);
        assert_eq!(sim.tile().pool.len(), 256);
        assert!(sim.pools().is_none());
        assert_eq!(sim.params().resolution, 16);
        assert!(!sim.locks().is_registered(&old));
        assert_eq!(sim.buffer_name(BufferAlias::TerrainHeight), "2_3__16__TERRAIN_HEIGHT");
        assert!(sim.is_schedulable().is_ready());

        assert!(sim.resize(3, vec![0.5; 9]).is_err());
        assert_eq!(sim.tile().resolution, 16);
    }

    #[test]
    fn test_locked_buffer_makes_tile_pending() {
        let locks = BufferLocks::new();
        let sim = ErosionSimulation::with_locks(TileId::default(), slope(8), settings(), locks.clone()).unwrap();
        let guard = locks.try_lock(&[sim.buffer_name(BufferAlias::WatermapPool)]).unwrap();
        assert!(!sim.is_schedulable().is_ready());

        let sim = match sim.schedule(1, |_, _| {}) {
            Scheduled::NotReady(sim, Readiness::Pending { locked, .. }) => {
                assert_eq!(locked.len(), 1);
                sim
            }
            _ => panic!("expected the tile to be pending"),
        };
        drop(guard);
        assert!(sim.is_schedulable().is_ready());
    }

    #[test]
    fn test_schedule_locks_until_complete() {
        let locks = BufferLocks::new();
        let sim = ErosionSimulation::with_locks(TileId::new(1, 1), slope(16), settings(), locks.clone()).unwrap();
        let height_name = sim.buffer_name(BufferAlias::TerrainHeight);
        let (tx, rx) = mpsc::channel();

        let handle = match sim.schedule(2, move |reports, tile| {
            tx.send((reports.len(), tile.resolution)).unwrap();
        }) {
            Scheduled::Started(handle) => handle,
            Scheduled::NotReady(..) => panic!("fresh tile should be schedulable"),
        };
        let sim = handle.wait().unwrap();
        assert_eq!(rx.recv().unwrap(), (2, 16));
        assert!(!locks.is_locked(&height_name));
        assert_eq!(sim.cycle(), 2);
    }

    #[test]
    fn test_failed_schedule_returns_the_tile() {
        let locks = BufferLocks::new();
        let mut sim = ErosionSimulation::with_locks(TileId::new(4, 2), slope(8), settings(), locks.clone()).unwrap();
        let height_name = sim.buffer_name(BufferAlias::TerrainHeight);
        let mut plan = CyclePlan::empty();
        plan.add_phase(Faulty);
        sim.set_plan(plan);
        let (tx, rx) = mpsc::channel::<usize>();

        let handle = match sim.schedule(3, move |reports, _| {
            tx.send(reports.len()).unwrap();
        }) {
            Scheduled::Started(handle) => handle,
            Scheduled::NotReady(..) => panic!("fresh tile should be schedulable"),
        };
        let failure = match handle.wait() {
            Err(failure) => failure,
            Ok(_) => panic!("cycle 1 should fail"),
        };
        assert!(matches!(failure.error, PipelineError::PhaseFailed(ref phase, _) if phase == "faulty"));
        let sim = failure.simulation.expect("simulation comes back");
        assert_eq!(sim.cycle(), 1);
        assert_eq!(sim.tile().pool[0], 0.25);
        assert_eq!(sim.tile().resolution, 8);
        assert!(rx.recv().is_err());
        assert!(!locks.is_locked(&height_name));
        assert!(sim.is_schedulable().is_ready());
    }

    #[test]
    fn test_settle_pools_redraws_water_as_a_level_surface() {
        let res = 9;
        let mut heights = vec![0.8; res * res];
        for z in 3..6 {
            for x in 3..6 {
                heights[z * res + x] = 0.5;
            }
        }
        heights[4 * res + 4] = 0.4;
        let mut tile = Tile::from_heights(res, heights).unwrap();
        tile.pool[3 * res + 3] = 0.3;
        let mut sim = ErosionSimulation::new(TileId::default(), tile, settings()).unwrap();

        let roots = sim.settle_pools().roots().len();
        assert_eq!(roots, 1);
        assert!(sim.pools().is_some());
        let centre = 4 * res + 4;
        let surface = sim.pools().unwrap().surface_height(centre).unwrap();
        let tile = sim.tile();
        assert!(tile.pool[centre] > 0.0);
        for (i, &depth) in tile.pool.iter().enumerate() {
            if depth > 0.0 {
                assert!((tile.height[i] + depth - surface).abs() < 1e-5);
            } else {
                assert!(tile.height[i] >= surface - 1e-6);
            }
        }
        assert!(tile.total_pool() > 0.0);
    }
}
