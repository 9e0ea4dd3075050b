//! Erosion configuration.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::grid::{TileError, MIN_RESOLUTION};

/// Which processes a run applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ErosionMode {
    /// Particles erode, deposit and pool; thermal relaxation runs afterwards.
    #[default]
    AllErosion,
    /// Particles only carry water; terrain changes come from the thermal filter.
    OnlyThermalErosion,
}

/// Talus-angle relaxation settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermalSettings {
    pub enabled: bool,
    /// Maximum stable slope in degrees.
    pub talus: f32,
    /// Fraction of each excess moved per rectified pair, in `(0, 1]`.
    pub increment: f32,
    /// Full four-pass rounds per erosion cycle.
    pub cycles: u32,
}

impl Default for ThermalSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            talus: 55.0,
            increment: 0.6,
            cycles: 1,
        }
    }
}

/// Cascade smoothing of dry cells.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothingSettings {
    pub enabled: bool,
    /// Normalized height difference tolerated between neighbors.
    pub max_diff: f32,
    /// Fraction of the excess exchanged per pass.
    pub settling: f32,
}

impl Default for SmoothingSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_diff: 0.0005,
            settling: 0.1,
        }
    }
}

/// User-facing configuration for an erosion run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErosionSettings {
    /// Erosion cycles per `run`.
    pub cycles: u32,
    /// Fresh particles spawned each cycle.
    pub particles_per_cycle: usize,
    pub behavior: ErosionMode,

    /// Share of the previous direction kept at terminal velocity, in `[0, 1]`.
    pub inertia: f32,
    pub gravity: f32,
    /// Quadratic drag, in `(0, 1)`. Terminal velocity is `1 / drag`.
    pub drag: f32,
    pub friction: f32,
    /// Fraction of water lost per step, in `[0, 1)`.
    pub evaporation: f32,
    pub erosion: f32,
    pub deposition: f32,
    pub capacity: f32,
    /// Weight of `flow` in the direction-ranking heights.
    pub flow_height_contribution: f32,

    /// Slope (degrees) below which slow particles settle.
    pub slow_cull_angle: f32,
    pub slow_cull_speed: f32,
    pub max_age: u32,

    /// Pool automaton iterations per cycle.
    pub water_steps: u32,
    pub pool_placement: f32,
    pub track_placement: f32,
    /// Meters of standing water evaporated per flow update.
    pub surface_evaporation: f32,
    pub flow_loss_rate: f32,

    /// Pile radius in cells.
    pub piling_radius: u32,
    /// Meters added per pile ring step.
    pub min_pile_increment: f32,
    /// Deposits above this many meters are piled instead of blurred.
    pub pile_threshold: f32,

    pub thermal: ThermalSettings,
    pub smoothing: SmoothingSettings,

    /// Vertical extent of the tile in meters.
    pub height: f32,
    /// Horizontal extent of the tile in meters.
    pub width: f32,

    pub seed: u64,
    /// Re-solve the pool hierarchy at the end of every cycle.
    pub solve_pools_each_cycle: bool,
    /// Drained pools re-enter the next cycle as particles instead of spilling in place.
    pub drain_particles: bool,
}

impl Default for ErosionSettings {
    fn default() -> Self {
        Self {
            cycles: 3,
            particles_per_cycle: 1000,
            behavior: ErosionMode::default(),

            inertia: 0.7,
            gravity: 1.0,
            drag: 0.001,
            friction: 0.001,
            evaporation: 0.001,
            erosion: 0.2,
            deposition: 0.05,
            capacity: 3.0,
            flow_height_contribution: 25.0,

            slow_cull_angle: 3.0,
            slow_cull_speed: 0.1,
            max_age: 64,

            water_steps: 10,
            pool_placement: 0.5,
            track_placement: 80.0,
            surface_evaporation: 0.1,
            flow_loss_rate: 0.05,

            piling_radius: 15,
            min_pile_increment: 1.0,
            pile_threshold: 2.0,

            thermal: ThermalSettings::default(),
            smoothing: SmoothingSettings::default(),

            height: 100.0,
            width: 1000.0,

            seed: 42,
            solve_pools_each_cycle: false,
            drain_particles: true,
        }
    }
}

/// Rejected settings or tile buffers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error(transparent)]
    Tile(#[from] TileError),
    #[error("{name} = {value} is outside {range}")]
    OutOfRange {
        name: &'static str,
        value: f32,
        range: &'static str,
    },
    #[error("{name} must be at least {min}, got {value}")]
    TooSmall {
        name: &'static str,
        value: u64,
        min: u64,
    },
}

fn check_range(
    name: &'static str,
    value: f32,
    ok: bool,
    range: &'static str,
) -> Result<(), ConfigError> {
    if ok && value.is_finite() {
        Ok(())
    } else {
        Err(ConfigError::OutOfRange { name, value, range })
    }
}

impl ErosionSettings {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("height", self.height, self.height > 0.0, "(0, inf)")?;
        check_range("width", self.width, self.width > 0.0, "(0, inf)")?;
        check_range("drag", self.drag, self.drag > 0.0 && self.drag < 1.0, "(0, 1)")?;
        check_range(
            "evaporation",
            self.evaporation,
            (0.0..1.0).contains(&self.evaporation),
            "[0, 1)",
        )?;
        check_range(
            "inertia",
            self.inertia,
            (0.0..=1.0).contains(&self.inertia),
            "[0, 1]",
        )?;
        check_range("gravity", self.gravity, self.gravity > 0.0, "(0, inf)")?;
        check_range("friction", self.friction, self.friction >= 0.0, "[0, inf)")?;
        check_range("erosion", self.erosion, self.erosion >= 0.0, "[0, inf)")?;
        check_range(
            "deposition",
            self.deposition,
            (0.0..=1.0).contains(&self.deposition),
            "[0, 1]",
        )?;
        check_range("capacity", self.capacity, self.capacity >= 0.0, "[0, inf)")?;
        check_range(
            "thermal.increment",
            self.thermal.increment,
            self.thermal.increment > 0.0 && self.thermal.increment <= 1.0,
            "(0, 1]",
        )?;
        check_range(
            "thermal.talus",
            self.thermal.talus,
            self.thermal.talus > 0.0 && self.thermal.talus < 90.0,
            "(0, 90)",
        )?;
        check_range(
            "smoothing.settling",
            self.smoothing.settling,
            (0.0..=1.0).contains(&self.smoothing.settling),
            "[0, 1]",
        )?;
        check_range(
            "flow_loss_rate",
            self.flow_loss_rate,
            (0.0..=1.0).contains(&self.flow_loss_rate),
            "[0, 1]",
        )?;
        check_range(
            "pile_threshold",
            self.pile_threshold,
            self.pile_threshold >= 0.0,
            "[0, inf)",
        )?;
        check_range(
            "min_pile_increment",
            self.min_pile_increment,
            self.min_pile_increment > 0.0,
            "(0, inf)",
        )?;
        if self.max_age < 1 {
            return Err(ConfigError::TooSmall {
                name: "max_age",
                value: self.max_age as u64,
                min: 1,
            });
        }
        if self.piling_radius < 1 {
            return Err(ConfigError::TooSmall {
                name: "piling_radius",
                value: self.piling_radius as u64,
                min: 1,
            });
        }
        Ok(())
    }

    /// Derives the per-run constants for a tile of `resolution` cells.
    pub fn to_parameters(&self, resolution: usize) -> Result<ErosionParameters, ConfigError> {
        self.validate()?;
        if resolution < MIN_RESOLUTION {
            return Err(TileError::InvalidResolution(resolution).into());
        }
        let all = self.behavior == ErosionMode::AllErosion;
        Ok(ErosionParameters {
            resolution,
            inertia: self.inertia,
            gravity: self.gravity,
            drag: self.drag,
            friction: self.friction,
            evaporation: self.evaporation,
            erosion: self.erosion,
            deposition: self.deposition,
            capacity: if all { self.capacity } else { 0.0 },
            flow_height_contribution: self.flow_height_contribution,
            slow_cull_angle: self.slow_cull_angle,
            slow_cull_speed: self.slow_cull_speed,
            max_age: self.max_age,
            terminal_velocity: 1.0 / self.drag,
            surface_evaporation: self.surface_evaporation,
            flow_loss_rate: self.flow_loss_rate,
            pool_placement: if all { self.pool_placement } else { 0.0 },
            track_placement: self.track_placement,
            piling_radius: self.piling_radius,
            min_pile_increment: self.min_pile_increment,
            pile_threshold: self.pile_threshold,
            height: self.height,
            patch_size: self.width / resolution as f32,
            height_ratio: self.width / self.height,
            talus: self.thermal.talus,
            thermal_increment: self.thermal.increment,
        })
    }
}

/// Immutable simulation constants, copied into every task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ErosionParameters {
    pub resolution: usize,
    pub inertia: f32,
    pub gravity: f32,
    pub drag: f32,
    pub friction: f32,
    pub evaporation: f32,
    pub erosion: f32,
    pub deposition: f32,
    pub capacity: f32,
    pub flow_height_contribution: f32,
    pub slow_cull_angle: f32,
    pub slow_cull_speed: f32,
    pub max_age: u32,
    pub terminal_velocity: f32,
    pub surface_evaporation: f32,
    pub flow_loss_rate: f32,
    pub pool_placement: f32,
    pub track_placement: f32,
    pub piling_radius: u32,
    pub min_pile_increment: f32,
    pub pile_threshold: f32,
    /// Vertical extent in meters; divides meters into normalized height.
    pub height: f32,
    /// Meters per cell.
    pub patch_size: f32,
    /// `width / height`.
    pub height_ratio: f32,
    pub talus: f32,
    pub thermal_increment: f32,
}

impl ErosionParameters {
    /// Normalized height difference allowed between thermal-block neighbors.
    pub fn thermal_max_diff(&self) -> f32 {
        self.talus.to_radians().tan() * self.height_ratio / self.resolution as f32
    }
}
