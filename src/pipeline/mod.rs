//! Cycle orchestration for one tile.
//!
//! A cycle is a fixed chain of phases, each started only once the phases it
//! depends on have issued their completion token. The simulation owns the
//! long-lived buffers and can run the chain inline or on a worker thread
//! while the buffers it produces stay locked.

mod locks;
mod phase;
mod simulation;
mod timing;

pub use locks::{buffer_name, BufferAlias, BufferLocks, LockGuard, LockToken, Readiness, TileId};
pub use phase::{
    AggregatePhase, CycleContext, CyclePhase, CyclePlan, CycleReport, DescendPhase,
    FlowUpdatePhase, PhaseId, PhaseToken, PipelineError, PoolSolvePhase, PoolSpreadPhase,
    SedimentPhase, SmoothPhase, SpawnPhase, ThermalPhase, PENDING_LIMIT_FACTOR,
};
pub use simulation::{ErosionSimulation, ScheduleError, Scheduled, SimulationHandle};
pub use timing::timed;
