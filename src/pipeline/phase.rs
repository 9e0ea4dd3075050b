//! Cycle phases and the plan that chains them.

use std::time::Duration;

use log::Level;
use rand_chacha::ChaCha8Rng;
use thiserror::Error;

use crate::erosion::events::{aggregate, apply_sediment, descend_all};
use crate::erosion::thermal::apply_thermal;
use crate::erosion::water::{cascade_smooth, spread_pools, update_flow_from_track};
use crate::erosion::{
    ConfigError, ErosionParameters, ErosionSettings, EventMap, Particle, PileSolver,
    SedimentDeposit,
};
use crate::grid::Tile;
use crate::pipeline::timing::timed;
use crate::pools::{HierarchySummary, PoolHierarchy};

/// Drained particles kept for the next cycle, as a multiple of `particles_per_cycle`.
pub const PENDING_LIMIT_FACTOR: usize = 4;

/// Identifies one phase of an erosion cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PhaseId {
    Spawn,
    Descend,
    Aggregate,
    Sediment,
    FlowUpdate,
    PoolSpread,
    Thermal,
    Smooth,
    PoolSolve,
}

impl PhaseId {
    pub fn name(&self) -> &'static str {
        match self {
            PhaseId::Spawn => "spawn",
            PhaseId::Descend => "descend",
            PhaseId::Aggregate => "aggregate",
            PhaseId::Sediment => "sediment",
            PhaseId::FlowUpdate => "flow update",
            PhaseId::PoolSpread => "pool spread",
            PhaseId::Thermal => "thermal",
            PhaseId::Smooth => "smooth",
            PhaseId::PoolSolve => "pool solve",
        }
    }

    /// Phases whose completion this phase waits on.
    pub fn dependencies(&self) -> &'static [PhaseId] {
        match self {
            PhaseId::Spawn => &[],
            PhaseId::Descend => &[PhaseId::Spawn],
            PhaseId::Aggregate => &[PhaseId::Descend],
            PhaseId::Sediment => &[PhaseId::Aggregate],
            PhaseId::FlowUpdate => &[PhaseId::Aggregate],
            PhaseId::PoolSpread => &[PhaseId::FlowUpdate],
            PhaseId::Thermal => &[PhaseId::Sediment],
            PhaseId::Smooth => &[PhaseId::Sediment, PhaseId::PoolSpread],
            PhaseId::PoolSolve => &[PhaseId::Sediment, PhaseId::PoolSpread],
        }
    }
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("phase '{0}' failed: {1}")]
    PhaseFailed(String, String),
    #[error("missing dependency: phase '{0}' requires '{1}'")]
    MissingDependency(String, String),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Issued when a phase finishes, and required by the phases that follow it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseToken {
    pub phase: PhaseId,
    pub cycle: u32,
    /// The phase was disabled by the settings and did nothing.
    pub skipped: bool,
}

/// Counters gathered over one cycle.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub cycle: u32,
    pub spawned: usize,
    /// Particles carried over from drained pools.
    pub recycled: usize,
    pub events: usize,
    pub cells: usize,
    pub pool_added: f32,
    pub track_added: f32,
    pub dispersed: usize,
    pub piled: usize,
    /// Sediment a pile could not place.
    pub leftover: f32,
    pub drained_cells: usize,
    pub drained_water: f32,
    pub thermal_rounds: u32,
    pub pools: Option<HierarchySummary>,
    pub skipped: Vec<PhaseId>,
    pub elapsed: Duration,
}

/// Everything a phase may touch during one cycle.
///
/// Long-lived state is borrowed from the simulation; particles, events and the
/// sediment queue are per-cycle scratch handed from one phase to the next.
pub struct CycleContext<'a> {
    pub cycle: u32,
    pub tile: &'a mut Tile,
    pub params: &'a ErosionParameters,
    pub settings: &'a ErosionSettings,
    pub rng: &'a mut ChaCha8Rng,
    pub pending: &'a mut Vec<Particle>,
    pub piles: &'a mut PileSolver,
    pub pools: &'a mut Option<PoolHierarchy>,
    pub particles: Vec<Particle>,
    pub events: EventMap,
    pub sediment: Vec<SedimentDeposit>,
    pub report: CycleReport,
}

/// One step of an erosion cycle.
pub trait CyclePhase: Send + Sync {
    fn id(&self) -> PhaseId;

    fn name(&self) -> &str {
        self.id().name()
    }

    fn dependencies(&self) -> &[PhaseId] {
        self.id().dependencies()
    }

    /// Disabled phases are skipped but still count as completed.
    fn enabled(&self, _settings: &ErosionSettings) -> bool {
        true
    }

    fn execute(&self, ctx: &mut CycleContext<'_>) -> Result<(), PipelineError>;
}

fn check_finite(phase: PhaseId, heights: &[f32]) -> Result<(), PipelineError> {
    match heights.iter().position(|h| !h.is_finite()) {
        Some(idx) => Err(PipelineError::PhaseFailed(
            phase.name().to_string(),
            format!("non-finite height at cell {idx}"),
        )),
        None => Ok(()),
    }
}

pub struct SpawnPhase;

impl CyclePhase for SpawnPhase {
    fn id(&self) -> PhaseId {
        PhaseId::Spawn
    }

    fn execute(&self, ctx: &mut CycleContext<'_>) -> Result<(), PipelineError> {
        let res = ctx.tile.resolution;
        let mut particles = std::mem::take(ctx.pending);
        ctx.report.recycled = particles.len();
        particles.extend((0..ctx.settings.particles_per_cycle).map(|_| Particle::spawn(&mut *ctx.rng, res)));
        // ids order events within a cell, so they have to be unique per cycle
        let base = u64::from(ctx.cycle) << 32;
        for (i, p) in particles.iter_mut().enumerate() {
            p.id = base + i as u64;
        }
        ctx.report.spawned = particles.len() - ctx.report.recycled;
        log::debug!(
            "cycle {}: {} rain particles, {} recycled",
            ctx.cycle,
            ctx.report.spawned,
            ctx.report.recycled
        );
        ctx.particles = particles;
        Ok(())
    }
}

pub struct DescendPhase;

impl CyclePhase for DescendPhase {
    fn id(&self) -> PhaseId {
        PhaseId::Descend
    }

    fn execute(&self, ctx: &mut CycleContext<'_>) -> Result<(), PipelineError> {
        let particles = std::mem::take(&mut ctx.particles);
        ctx.events = descend_all(particles, &*ctx.tile, ctx.params);
        Ok(())
    }
}

pub struct AggregatePhase;

impl CyclePhase for AggregatePhase {
    fn id(&self) -> PhaseId {
        PhaseId::Aggregate
    }

    fn execute(&self, ctx: &mut CycleContext<'_>) -> Result<(), PipelineError> {
        let (report, queue) = aggregate(&mut ctx.events, &mut *ctx.tile, ctx.params);
        log::debug!(
            "aggregated {} events over {} cells, {} sediment deltas",
            report.events,
            report.cells,
            queue.len()
        );
        ctx.report.events = report.events;
        ctx.report.cells = report.cells;
        ctx.report.pool_added = report.pool_added;
        ctx.report.track_added = report.track_added;
        ctx.sediment = queue;
        Ok(())
    }
}

pub struct SedimentPhase;

impl CyclePhase for SedimentPhase {
    fn id(&self) -> PhaseId {
        PhaseId::Sediment
    }

    fn execute(&self, ctx: &mut CycleContext<'_>) -> Result<(), PipelineError> {
        let queue = std::mem::take(&mut ctx.sediment);
        let report = apply_sediment(&queue, &mut *ctx.tile, ctx.params, &mut *ctx.piles);
        log::debug!("{} deltas dispersed, {} piles", report.dispersed, report.piled);
        ctx.report.dispersed = report.dispersed;
        ctx.report.piled = report.piled;
        ctx.report.leftover = report.leftover;
        check_finite(self.id(), &ctx.tile.height)
    }
}

pub struct FlowUpdatePhase;

impl CyclePhase for FlowUpdatePhase {
    fn id(&self) -> PhaseId {
        PhaseId::FlowUpdate
    }

    fn execute(&self, ctx: &mut CycleContext<'_>) -> Result<(), PipelineError> {
        update_flow_from_track(&mut *ctx.tile, ctx.params);
        Ok(())
    }
}

pub struct PoolSpreadPhase;

impl CyclePhase for PoolSpreadPhase {
    fn id(&self) -> PhaseId {
        PhaseId::PoolSpread
    }

    fn execute(&self, ctx: &mut CycleContext<'_>) -> Result<(), PipelineError> {
        let report = spread_pools(
            &mut *ctx.tile,
            ctx.params,
            ctx.settings.water_steps,
            ctx.settings.drain_particles,
        );
        ctx.report.drained_cells = report.drained_cells;
        ctx.report.drained_water = report.drained_water;

        let limit = PENDING_LIMIT_FACTOR * ctx.settings.particles_per_cycle.max(1);
        ctx.pending.extend(report.drained);
        if ctx.pending.len() > limit {
            log::warn!(
                "{} drained particles queued, keeping the first {}",
                ctx.pending.len(),
                limit
            );
            ctx.pending.truncate(limit);
        }
        Ok(())
    }
}

pub struct ThermalPhase;

impl CyclePhase for ThermalPhase {
    fn id(&self) -> PhaseId {
        PhaseId::Thermal
    }

    fn enabled(&self, settings: &ErosionSettings) -> bool {
        settings.thermal.enabled && settings.thermal.cycles > 0
    }

    fn execute(&self, ctx: &mut CycleContext<'_>) -> Result<(), PipelineError> {
        let rounds = ctx.settings.thermal.cycles;
        apply_thermal(&mut ctx.tile.height, ctx.params, rounds);
        ctx.report.thermal_rounds = rounds;
        check_finite(self.id(), &ctx.tile.height)
    }
}

pub struct SmoothPhase;

impl CyclePhase for SmoothPhase {
    fn id(&self) -> PhaseId {
        PhaseId::Smooth
    }

    fn enabled(&self, settings: &ErosionSettings) -> bool {
        settings.smoothing.enabled
    }

    fn execute(&self, ctx: &mut CycleContext<'_>) -> Result<(), PipelineError> {
        let smoothing = ctx.settings.smoothing;
        cascade_smooth(&mut *ctx.tile, smoothing.max_diff, smoothing.settling);
        Ok(())
    }
}

pub struct PoolSolvePhase;

impl CyclePhase for PoolSolvePhase {
    fn id(&self) -> PhaseId {
        PhaseId::PoolSolve
    }

    fn enabled(&self, settings: &ErosionSettings) -> bool {
        settings.solve_pools_each_cycle
    }

    fn execute(&self, ctx: &mut CycleContext<'_>) -> Result<(), PipelineError> {
        let hierarchy = PoolHierarchy::solve(&*ctx.tile);
        ctx.report.pools = Some(hierarchy.summary());
        *ctx.pools = Some(hierarchy);
        Ok(())
    }
}

/// Ordered phases of one cycle.
pub struct CyclePlan {
    phases: Vec<Box<dyn CyclePhase>>,
}

impl Default for CyclePlan {
    fn default() -> Self {
        Self::standard()
    }
}

impl CyclePlan {
    pub fn empty() -> Self {
        Self { phases: Vec::new() }
    }

    /// spawn, descend, aggregate, sediment, flow update, pool spread, thermal,
    /// smooth, pool solve.
    pub fn standard() -> Self {
        let mut plan = Self::empty();
        plan.add_phase(SpawnPhase)
            .add_phase(DescendPhase)
            .add_phase(AggregatePhase)
            .add_phase(SedimentPhase)
            .add_phase(FlowUpdatePhase)
            .add_phase(PoolSpreadPhase)
            .add_phase(ThermalPhase)
            .add_phase(SmoothPhase)
            .add_phase(PoolSolvePhase);
        plan
    }

    pub fn add_phase<P: CyclePhase + 'static>(&mut self, phase: P) -> &mut Self {
        self.phases.push(Box::new(phase));
        self
    }

    pub fn phase_count(&self) -> usize {
        self.phases.len()
    }

    pub fn phase_ids(&self) -> Vec<PhaseId> {
        self.phases.iter().map(|p| p.id()).collect()
    }

    /// Runs every phase in order. A phase only starts once the tokens of all
    /// its dependencies have been issued in this cycle.
    pub fn run_with_callbacks<F1, F2>(
        &self,
        ctx: &mut CycleContext<'_>,
        mut on_phase_start: F1,
        mut on_phase_complete: F2,
    ) -> Result<Vec<PhaseToken>, PipelineError>
    where
        F1: FnMut(&str, usize, usize),
        F2: FnMut(&PhaseToken, usize, usize),
    {
        let total = self.phases.len();
        let mut tokens: Vec<PhaseToken> = Vec::with_capacity(total);

        for (i, phase) in self.phases.iter().enumerate() {
            on_phase_start(phase.name(), i, total);

            for dep in phase.dependencies() {
                if !tokens.iter().any(|t| t.phase == *dep) {
                    return Err(PipelineError::MissingDependency(
                        phase.name().to_string(),
                        dep.name().to_string(),
                    ));
                }
            }

            let skipped = !phase.enabled(ctx.settings);
            if skipped {
                ctx.report.skipped.push(phase.id());
            } else {
                timed(phase.name(), Level::Trace, || phase.execute(ctx))?;
            }
            let token = PhaseToken {
                phase: phase.id(),
                cycle: ctx.cycle,
                skipped,
            };
            tokens.push(token);
            on_phase_complete(&token, i, total);
        }

        Ok(tokens)
    }

    pub fn run(&self, ctx: &mut CycleContext<'_>) -> Result<Vec<PhaseToken>, PipelineError> {
        self.run_with_callbacks(ctx, |_, _, _| {}, |_, _, _| {})
    }
}
