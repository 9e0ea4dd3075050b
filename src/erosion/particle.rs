//! Water/sediment particles and their one-cell descent step.
//!
//! A step never writes to the tile. Everything a particle would change is
//! returned as an [`ErosiveEvent`] for the aggregation phase to sum.

use glam::{IVec2, Vec2};
use rand::Rng;

use crate::erosion::ErosionParameters;
use crate::grid::{opposite, Heading, ReadableGrid, NEIGHBORS_8};

/// Particles carrying less water than this are dropped.
pub const MIN_WATER: f32 = 1e-8;
/// Speed a fresh particle starts with.
pub const SPAWN_VELOCITY: f32 = 0.01;

/// Per-cell delta produced by one particle step. Deltas are in normalized height units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ErosiveEvent {
    /// Cell the particle departed from (or died on).
    pub idx: usize,
    pub actor: u64,
    pub age: u32,
    pub heading: Heading,
    pub delta_pool: f32,
    pub delta_track: f32,
    /// Positive deposits, negative erodes.
    pub delta_sediment: f32,
}

impl ErosiveEvent {
    fn at(idx: usize, particle: &Particle) -> Self {
        Self {
            idx,
            actor: particle.id,
            age: particle.age,
            heading: particle.heading,
            delta_pool: 0.0,
            delta_track: 0.0,
            delta_sediment: 0.0,
        }
    }
}

/// A unit of water walking downhill, one cell per step.
#[derive(Debug, Clone, PartialEq)]
pub struct Particle {
    /// Orders events within a cell. `new` seeds it from the spawn cell; the
    /// cycle loop renumbers particles so ids are unique per cycle.
    pub id: u64,
    /// Fractional grid coordinate; particles sit at cell centers.
    pub pos: Vec2,
    /// Unit direction of the last move, zero before the first.
    pub dir: Vec2,
    pub heading: Heading,
    pub velocity: f32,
    /// Carried water in volume units (1.0 for a rain particle).
    pub water: f32,
    /// Carried sediment in meters.
    pub sediment: f32,
    pub age: u32,
    pub alive: bool,
}

impl Particle {
    pub fn new(x: i32, z: i32, water: f32) -> Self {
        Self {
            id: 100_000 * x.max(0) as u64 + z.max(0) as u64,
            pos: Vec2::new(x as f32 + 0.5, z as f32 + 0.5),
            dir: Vec2::ZERO,
            heading: Heading::None,
            velocity: SPAWN_VELOCITY,
            water,
            sediment: 0.0,
            age: 0,
            alive: true,
        }
    }

    /// A rain particle at a uniformly random cell.
    pub fn spawn<R: Rng + ?Sized>(rng: &mut R, resolution: usize) -> Self {
        let x = rng.random_range(0..resolution) as i32;
        let z = rng.random_range(0..resolution) as i32;
        Self::new(x, z, 1.0)
    }

    pub fn cell(&self) -> IVec2 {
        self.pos.floor().as_ivec2()
    }

    fn kill(&mut self) {
        self.alive = false;
    }

    /// Advances one cell, returning whether the particle survives and the delta it leaves behind.
    pub fn step<G: ReadableGrid>(
        &mut self,
        grid: &G,
        params: &ErosionParameters,
    ) -> (bool, ErosiveEvent) {
        let cell = self.cell();
        let here = grid.safe_idx(cell.x, cell.y);
        let mut event = ErosiveEvent::at(here, self);
        let h = params.height;

        if !self.alive {
            return (false, event);
        }
        if self.water < MIN_WATER {
            event.delta_sediment = self.sediment / h;
            self.kill();
            return (false, event);
        }
        if self.age >= params.max_age {
            event.delta_pool = self.water / h;
            event.delta_sediment = self.sediment / h;
            self.kill();
            return (false, event);
        }

        let window = Window::sample(grid, cell, params);
        let flow = grid.flow(here).min(1.0);
        let friction = params.friction * (1.0 - flow);
        let drag = params.drag * (1.0 - flow);

        let slot = match self.choose_move(&window, params, friction) {
            Some(slot) => slot,
            None => {
                event.delta_pool = self.water / h;
                event.delta_sediment = self.sediment / h;
                self.kill();
                return (false, event);
            }
        };

        let step = NEIGHBORS_8[slot];
        let target = cell + step;
        if !grid.in_bounds(target.x, target.y) {
            self.kill();
            return (false, event);
        }

        let dist = step_length(slot, params.patch_size);
        let drop = window.here - window.physical[slot];
        let theta = if drop.abs() > 0.0 {
            (drop.abs() / dist).atan()
        } else {
            0.0
        };

        if drop.abs() > 0.0 {
            let sin = theta.sin();
            let accel = if drop < 0.0 {
                -(params.gravity * sin + friction)
            } else {
                params.gravity * sin - friction
            };
            let path = drop.abs() / sin;
            let dv = accel.signum() * (2.0 * accel.abs() * path).sqrt();
            self.velocity = (self.velocity + dv).max(0.0);
        }
        self.velocity = self.velocity.min(params.terminal_velocity);
        self.velocity = (self.velocity - drag * self.velocity * self.velocity).max(0.0);

        if theta.to_degrees() < params.slow_cull_angle && self.velocity < params.slow_cull_speed {
            event.delta_pool = self.water / h;
            event.delta_sediment = self.sediment / h;
            self.kill();
            return (false, event);
        }

        let capacity = self.velocity * self.water * params.capacity;
        let deposit = if self.sediment < capacity {
            let damping = 1.0 - grid.plants(here).min(1.0);
            // capped at the drop to the target cell
            (-params.erosion * damping * (capacity - self.sediment)).max(-drop.max(0.0))
        } else {
            params.deposition * (self.sediment - capacity)
        };
        event.delta_sediment += deposit / h;
        self.sediment -= deposit;

        event.delta_track = self.water / h;
        self.water *= 1.0 - params.evaporation;

        self.heading = Heading::from_ivec2(step);
        self.dir = step.as_vec2().normalize();
        self.pos += step.as_vec2();
        self.age += 1;
        event.heading = self.heading;
        (true, event)
    }

    /// Picks the neighbor slot to move into, or `None` when the particle must pool.
    fn choose_move(
        &self,
        window: &Window,
        params: &ErosionParameters,
        friction: f32,
    ) -> Option<usize> {
        match window.natural_direction(params.patch_size) {
            Some(natural) => {
                let natural_dir = NEIGHBORS_8[natural].as_vec2().normalize();
                let k = params.inertia * (self.velocity / params.terminal_velocity).min(1.0);
                let blended = self.dir * k + natural_dir * (1.0 - k);
                let desired = quantize(blended).unwrap_or(natural);
                if self.can_reach(window, desired, params, friction) {
                    Some(desired)
                } else if desired != natural && self.can_reach(window, natural, params, friction) {
                    Some(natural)
                } else {
                    None
                }
            }
            None => {
                let slot = self.heading.neighbor_slot()?;
                self.can_reach(window, slot, params, friction).then_some(slot)
            }
        }
    }

    /// Level or downhill moves are always possible; uphill ones need enough kinetic energy.
    fn can_reach(
        &self,
        window: &Window,
        slot: usize,
        params: &ErosionParameters,
        friction: f32,
    ) -> bool {
        let rise = window.physical[slot] - window.here;
        if rise <= 0.0 {
            return true;
        }
        let path = step_length(slot, params.patch_size);
        0.5 * self.velocity * self.velocity > params.gravity * rise + friction * path
    }
}

/// Heights in meters around a cell. Off-tile neighbors are extrapolated from the
/// opposite side so edges slope outward the way the terrain does.
#[derive(Debug, Clone, Copy)]
struct Window {
    here: f32,
    physical: [f32; 8],
    ranking_here: f32,
    ranking: [f32; 8],
}

impl Window {
    fn sample<G: ReadableGrid>(grid: &G, cell: IVec2, params: &ErosionParameters) -> Self {
        let h = params.height;
        let fhc = params.flow_height_contribution;
        let here_idx = grid.safe_idx(cell.x, cell.y);
        let here = h * grid.water_inclusive(here_idx);
        let ranking_here = here + grid.flow(here_idx) * fhc;

        let mut physical = [0.0; 8];
        let mut ranking = [0.0; 8];
        for (d, offset) in NEIGHBORS_8.iter().enumerate() {
            let n = cell + *offset;
            match grid.checked_idx(n.x, n.y) {
                Some(idx) => {
                    physical[d] = h * grid.water_inclusive(idx);
                    ranking[d] = physical[d] + grid.flow(idx) * fhc;
                }
                None => {
                    let o = cell + NEIGHBORS_8[opposite(d)];
                    let oidx = grid.safe_idx(o.x, o.y);
                    let other = h * grid.water_inclusive(oidx);
                    physical[d] = 2.0 * here - other;
                    ranking[d] = 2.0 * ranking_here - (other + grid.flow(oidx) * fhc);
                }
            }
        }
        Self {
            here,
            physical,
            ranking_here,
            ranking,
        }
    }

    /// Steepest ranking drop per unit distance; ties go to the first slot.
    fn natural_direction(&self, patch_size: f32) -> Option<usize> {
        let mut best = None;
        let mut best_drop = 0.0;
        for d in 0..8 {
            let drop = (self.ranking_here - self.ranking[d]) / step_length(d, patch_size);
            if drop > best_drop {
                best_drop = drop;
                best = Some(d);
            }
        }
        best
    }
}

fn step_length(slot: usize, patch_size: f32) -> f32 {
    let o = NEIGHBORS_8[slot];
    if o.x != 0 && o.y != 0 {
        patch_size * std::f32::consts::SQRT_2
    } else {
        patch_size
    }
}

/// Snaps a direction to the nearest of the eight neighbor slots.
fn quantize(dir: Vec2) -> Option<usize> {
    let n = dir.normalize_or_zero();
    if n == Vec2::ZERO {
        return None;
    }
    let step = IVec2::new(n.x.round() as i32, n.y.round() as i32);
    Heading::from_ivec2(step).neighbor_slot()
}

/// Runs a particle to completion, collecting every event it emits.
pub fn descend<G: ReadableGrid>(
    mut particle: Particle,
    grid: &G,
    params: &ErosionParameters,
) -> Vec<ErosiveEvent> {
    let mut events = Vec::with_capacity(params.max_age as usize + 1);
    loop {
        let (alive, event) = particle.step(grid, params);
        events.push(event);
        if !alive {
            return events;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::erosion::ErosionSettings;
    use crate::grid::Tile;

    fn params(resolution: usize) -> ErosionParameters {
        ErosionSettings::default().to_parameters(resolution).unwrap()
    }

    fn tilted(resolution: usize, slope: f32) -> Tile {
        let mut heights = Vec::with_capacity(resolution * resolution);
        for _z in 0..resolution {
            for x in 0..resolution {
                heights.push(0.9 - slope * x as f32);
            }
        }
        Tile::from_heights(resolution, heights).unwrap()
    }

    #[test]
    fn test_flat_tile_particle_pools_on_first_step() {
        let tile = Tile::from_heights(8, vec![0.5; 64]).unwrap();
        let p = params(8);
        let mut particle = Particle::new(3, 4, 1.0);
        let (alive, event) = particle.step(&tile, &p);
        assert!(!alive);
        assert!(!particle.alive);
        assert_eq!(event.idx, tile.idx(3, 4));
        assert!((event.delta_pool * p.height - 1.0).abs() < 1e-6);
        assert_eq!(event.delta_track, 0.0);
        assert_eq!(event.delta_sediment, 0.0);
    }

    #[test]
    fn test_particle_in_wet_pit_pools_instead_of_climbing() {
        // flow ranks every rim cell below the pit, but each one is 10 m up
        let mut tile = Tile::from_heights(8, vec![0.6; 64]).unwrap();
        let pit = tile.idx(4, 4);
        tile.height[pit] = 0.5;
        tile.flow[pit] = 1.0;
        let p = params(8);
        let mut particle = Particle::new(4, 4, 1.0);
        particle.sediment = 0.25;
        let (alive, event) = particle.step(&tile, &p);
        assert!(!alive);
        assert_eq!(particle.cell(), IVec2::new(4, 4));
        assert_eq!(event.idx, pit);
        assert!((event.delta_pool * p.height - 1.0).abs() < 1e-6);
        assert!((event.delta_sediment * p.height - 0.25).abs() < 1e-6);
        assert_eq!(event.delta_track, 0.0);
    }

    #[test]
    fn test_fast_particle_coasts_over_a_lip() {
        let mut tile = Tile::from_heights(8, vec![0.6; 64]).unwrap();
        let pit = tile.idx(4, 4);
        tile.height[pit] = 0.5;
        let p = params(8);
        let mut particle = Particle::new(4, 4, 1.0);
        particle.dir = Vec2::X;
        particle.heading = Heading::E;
        particle.velocity = p.terminal_velocity;
        let (alive, _) = particle.step(&tile, &p);
        assert!(alive);
        assert_eq!(particle.cell(), IVec2::new(5, 4));
    }

    #[test]
    fn test_particle_runs_downhill_on_tilted_plane() {
        let tile = tilted(16, 0.05);
        let p = params(16);
        let mut particle = Particle::new(2, 8, 1.0);
        let (alive, event) = particle.step(&tile, &p);
        assert!(alive);
        assert_eq!(particle.cell(), IVec2::new(3, 8));
        assert_eq!(particle.heading, Heading::E);
        assert!(particle.velocity > SPAWN_VELOCITY);
        assert!(event.delta_track > 0.0);
        assert!(event.delta_sediment < 0.0, "fast water should erode");
    }

    #[test]
    fn test_particle_leaving_tile_drops_nothing() {
        let tile = tilted(8, 0.05);
        let p = params(8);
        let mut particle = Particle::new(7, 3, 1.0);
        let (alive, event) = particle.step(&tile, &p);
        assert!(!alive);
        assert_eq!(event.delta_pool, 0.0);
        assert_eq!(event.delta_sediment, 0.0);
    }

    #[test]
    fn test_old_particle_deposits_everything() {
        let tile = tilted(8, 0.05);
        let p = params(8);
        let mut particle = Particle::new(3, 3, 0.5);
        particle.sediment = 2.0;
        particle.age = p.max_age;
        let (alive, event) = particle.step(&tile, &p);
        assert!(!alive);
        assert!((event.delta_pool - 0.5 / p.height).abs() < 1e-7);
        assert!((event.delta_sediment - 2.0 / p.height).abs() < 1e-7);
    }

    #[test]
    fn test_dying_deltas_never_exceed_carried_load() {
        let tile = tilted(32, 0.02);
        let p = params(32);
        let mut particle = Particle::new(1, 16, 1.0);
        loop {
            let water = particle.water;
            let sediment = particle.sediment;
            let (alive, event) = particle.step(&tile, &p);
            if !alive {
                let released = (event.delta_pool + event.delta_sediment) * p.height;
                assert!(released <= water + sediment + 1e-4);
                break;
            }
        }
    }

    #[test]
    fn test_descend_ends_with_dead_event() {
        let tile = tilted(16, 0.03);
        let p = params(16);
        let events = descend(Particle::new(0, 5, 1.0), &tile, &p);
        assert!(!events.is_empty());
        assert!(events.len() <= p.max_age as usize + 1);
        // every step moved one cell east
        for pair in events.windows(2) {
            assert_eq!(pair[1].idx, pair[0].idx + 1);
        }
    }

    #[test]
    fn test_plants_damp_erosion() {
        let bare = tilted(16, 0.05);
        let planted = tilted(16, 0.05).with_plants(vec![1.0; 256]).unwrap();
        let p = params(16);
        let (_, bare_event) = Particle::new(2, 8, 1.0).step(&bare, &p);
        let (_, planted_event) = Particle::new(2, 8, 1.0).step(&planted, &p);
        assert!(bare_event.delta_sediment < 0.0);
        assert_eq!(planted_event.delta_sediment, 0.0);
    }

    #[test]
    fn test_quantize_snaps_to_nearest_slot() {
        assert_eq!(quantize(Vec2::new(0.9, 0.05)), Heading::E.neighbor_slot());
        assert_eq!(quantize(Vec2::new(-1.0, 1.0)), Heading::NW.neighbor_slot());
        assert_eq!(quantize(Vec2::ZERO), None);
    }
}
