//! Particle erosion and the terrain/water passes around it.
//!
//! Particles descend against a read-only tile and emit [`ErosiveEvent`]s; the
//! events are summed per cell and committed single-threaded, with sediment
//! routed through kernel dispersal or the [`PileSolver`]. Thermal relaxation
//! and the water automaton run afterwards on disjoint row partitions.

mod config;
pub mod events;
pub mod particle;
pub mod pile;
pub mod thermal;
pub mod water;

pub use config::{
    ConfigError, ErosionMode, ErosionParameters, ErosionSettings, SmoothingSettings,
    ThermalSettings,
};
pub use events::{EventMap, SedimentDeposit};
pub use particle::{ErosiveEvent, Particle};
pub use pile::PileSolver;
