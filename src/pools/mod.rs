//! Basin analysis: minima, catchments, drains and the pool hierarchy.
//!
//! Solving runs bottom-up over a height snapshot. Every local minimum floods
//! its own catchment, catchments spill through their lowest boundary cell,
//! and pools that share a spill point merge into a higher-order parent.

pub mod collapse;
pub mod hierarchy;
pub mod minima;
pub mod pool;

pub use collapse::{collapse, plateau_groups, CatchmentOwner, Catchments};
pub use hierarchy::{solve_drains, HierarchySummary, PoolHierarchy, PoolInspection};
pub use minima::{detect_minima, downhill_mask, MinimaMap};
pub use pool::{Pool, PoolKey};
