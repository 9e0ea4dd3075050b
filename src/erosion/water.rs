//! Standing-water passes that run after aggregation: flow decay from tracks,
//! the pool relaxation automaton and cascade smoothing of dry terrain.

use rayon::prelude::*;

use crate::erosion::particle::Particle;
use crate::erosion::ErosionParameters;
use crate::grid::{ReadableGrid, Tile, NEIGHBORS_4, NEIGHBORS_8};

/// Pools deeper than this slow the flow instead of feeding it.
pub const MIN_FLOW_POOL: f32 = 5e-5;
/// Pools shallower than this do not spread.
pub const MIN_SPREAD_POOL: f32 = 1e-3;

/// Blends `flow` toward the fresh `track`, then clears `track` and evaporates pools.
pub fn update_flow_from_track(tile: &mut Tile, params: &ErosionParameters) {
    let res = tile.resolution;
    let rate = params.flow_loss_rate;
    let evap = params.surface_evaporation / params.height;

    tile.flow
        .par_chunks_mut(res)
        .zip(tile.track.par_chunks_mut(res))
        .zip(tile.pool.par_chunks_mut(res))
        .for_each(|((flow, track), pool)| {
            for x in 0..flow.len() {
                let t = track[x];
                if pool[x] > MIN_FLOW_POOL {
                    flow[x] *= 1.0 - 0.1 * rate;
                } else if t > 0.0 {
                    let target = 50.0 * t / (1.0 + 50.0 * t);
                    flow[x] = (1.0 - rate) * flow[x] + rate * target;
                } else {
                    flow[x] *= 1.0 - rate;
                }
                track[x] = 0.0;
                pool[x] = (pool[x] - evap).max(0.0);
            }
        });
}

#[derive(Debug, Clone, Default)]
pub struct SpreadReport {
    /// Particles carrying released pool water into the next cycle.
    pub drained: Vec<Particle>,
    pub drained_cells: usize,
    /// Normalized water released through drains.
    pub drained_water: f32,
}

/// Relaxes standing water for `steps` iterations.
///
/// A pooled cell next to a dry cell that is no higher releases all of its water
/// at once. When `drain_particles` is set the water leaves as a particle seeded
/// on that neighbor, otherwise it moves into the neighbor. Remaining pools
/// share a quarter of their surface excess with each lower neighbor.
pub fn spread_pools(
    tile: &mut Tile,
    params: &ErosionParameters,
    steps: u32,
    drain_particles: bool,
) -> SpreadReport {
    let res = tile.resolution;
    let mut report = SpreadReport::default();
    let mut read = tile.pool.clone();
    let mut write = vec![0.0f32; read.len()];

    for _ in 0..steps {
        let drains = find_drains(&tile.height, &read, res);

        write
            .par_chunks_mut(res)
            .enumerate()
            .for_each(|(z, row)| {
                for (x, out) in row.iter_mut().enumerate() {
                    let i = z * res + x;
                    *out = gather_pool(&tile.height, &read, &drains, res, i, drain_particles);
                }
            });

        for (i, target) in drains.iter().enumerate() {
            if let Some(n) = target {
                report.drained_cells += 1;
                report.drained_water += read[i];
                if drain_particles {
                    let p = tile.pos(*n);
                    report
                        .drained
                        .push(Particle::new(p.x, p.y, read[i] * params.height));
                }
            }
        }
        std::mem::swap(&mut read, &mut write);
    }

    tile.pool = read;
    report
}

fn surface(height: &[f32], pool: &[f32], i: usize) -> f32 {
    height[i] + pool[i]
}

fn neighbors_4(res: usize, i: usize) -> impl Iterator<Item = usize> {
    let x = (i % res) as i32;
    let z = (i / res) as i32;
    let r = res as i32;
    NEIGHBORS_4.iter().filter_map(move |o| {
        let nx = x + o.x;
        let nz = z + o.y;
        (nx >= 0 && nz >= 0 && nx < r && nz < r).then(|| nz as usize * res + nx as usize)
    })
}

/// Lowest dry neighbor each pooled cell drains into, if any.
fn find_drains(height: &[f32], pool: &[f32], res: usize) -> Vec<Option<usize>> {
    (0..pool.len())
        .into_par_iter()
        .map(|i| {
            if pool[i] <= 0.0 {
                return None;
            }
            neighbors_4(res, i)
                .filter(|&n| pool[n] <= 0.0 && height[n] <= height[i])
                .fold(None, |best: Option<usize>, n| match best {
                    Some(b) if height[b] <= height[n] => Some(b),
                    _ => Some(n),
                })
        })
        .collect()
}

/// Share of `from`'s water that flows into `to` during one exchange.
fn exchange(height: &[f32], pool: &[f32], from: usize, to: usize) -> f32 {
    if pool[from] < MIN_SPREAD_POOL {
        return 0.0;
    }
    let drop = surface(height, pool, from) - surface(height, pool, to);
    if drop <= 0.0 {
        return 0.0;
    }
    0.25 * pool[from].min(drop)
}

/// New pool depth of cell `i`, gathered from its own outflow and its neighbors' inflow.
fn gather_pool(
    height: &[f32],
    pool: &[f32],
    drains: &[Option<usize>],
    res: usize,
    i: usize,
    drain_particles: bool,
) -> f32 {
    let mut next = pool[i];
    if drains[i].is_some() {
        next = 0.0;
    } else {
        for n in neighbors_4(res, i) {
            next -= exchange(height, pool, i, n);
        }
    }
    for n in neighbors_4(res, i) {
        match drains[n] {
            Some(target) if target == i => {
                if !drain_particles {
                    next += pool[n];
                }
            }
            Some(_) => {}
            None => next += exchange(height, pool, n, i),
        }
    }
    next.max(0.0)
}

/// Nudges dry cells toward their dry 8-neighbors where the step exceeds `max_diff`.
/// Mass-conserving; pooled cells neither give nor receive.
pub fn cascade_smooth(tile: &mut Tile, max_diff: f32, settling: f32) {
    let res = tile.resolution as i32;
    let height = &tile.height;
    let pool = &tile.pool;
    let mut next = height.clone();

    next.par_chunks_mut(res as usize)
        .enumerate()
        .for_each(|(z, row)| {
            let z = z as i32;
            for (x, out) in row.iter_mut().enumerate() {
                let x = x as i32;
                let i = (z * res + x) as usize;
                if pool[i] > 0.0 {
                    continue;
                }
                let mut delta = 0.0;
                for o in NEIGHBORS_8 {
                    let nx = x + o.x;
                    let nz = z + o.y;
                    if nx < 0 || nz < 0 || nx >= res || nz >= res {
                        continue;
                    }
                    let n = (nz * res + nx) as usize;
                    if pool[n] > 0.0 {
                        continue;
                    }
                    let diff = height[n] - height[i];
                    if diff.abs() > max_diff {
                        delta += diff.signum() * settling * 0.5 * (diff.abs() - max_diff) / 8.0;
                    }
                }
                *out += delta;
            }
        });

    tile.height = next;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::erosion::ErosionSettings;

    fn params(res: usize) -> ErosionParameters {
        ErosionSettings::default().to_parameters(res).unwrap()
    }

    fn bowl(res: usize) -> Tile {
        let c = (res as f32 - 1.0) / 2.0;
        let mut heights = Vec::with_capacity(res * res);
        for z in 0..res {
            for x in 0..res {
                let dx = x as f32 - c;
                let dz = z as f32 - c;
                heights.push(0.1 + 0.02 * (dx * dx + dz * dz));
            }
        }
        Tile::from_heights(res, heights).unwrap()
    }

    #[test]
    fn test_flow_rises_with_track_and_decays_without() {
        let mut tile = Tile::new(4).unwrap();
        let p = params(4);
        tile.track[5] = 2.0;
        tile.flow[6] = 0.5;
        update_flow_from_track(&mut tile, &p);
        let target = 100.0 / 101.0;
        assert!((tile.flow[5] - p.flow_loss_rate * target).abs() < 1e-6);
        assert!((tile.flow[6] - 0.5 * (1.0 - p.flow_loss_rate)).abs() < 1e-6);
        assert!(tile.track.iter().all(|&t| t == 0.0));
    }

    #[test]
    fn test_pooled_cells_decay_slowly_and_evaporate() {
        let mut tile = Tile::new(4).unwrap();
        let p = params(4);
        tile.pool[5] = 0.01;
        tile.flow[5] = 0.8;
        tile.pool[6] = 0.0001;
        update_flow_from_track(&mut tile, &p);
        assert!((tile.flow[5] - 0.8 * (1.0 - 0.1 * p.flow_loss_rate)).abs() < 1e-6);
        assert!((tile.pool[5] - (0.01 - p.surface_evaporation / p.height)).abs() < 1e-7);
        assert_eq!(tile.pool[6], 0.0);
    }

    #[test]
    fn test_pool_in_bowl_spreads_and_conserves() {
        let mut tile = bowl(7);
        let p = params(7);
        let center = tile.idx(3, 3);
        for n in [tile.idx(2, 3), tile.idx(4, 3), tile.idx(3, 2), tile.idx(3, 4)] {
            tile.pool[n] = 0.001;
        }
        tile.pool[center] = 0.2;
        let before = tile.total_pool();
        let report = spread_pools(&mut tile, &p, 3, true);
        assert_eq!(report.drained_cells, 0);
        assert!((tile.total_pool() - before).abs() < 1e-5);
        assert!(tile.pool[center] < 0.2);
        assert!(tile.pool[tile.idx(2, 3)] > 0.001);
    }

    #[test]
    fn test_pool_on_slope_drains_as_particle() {
        let mut heights = Vec::new();
        for _z in 0..6 {
            for x in 0..6 {
                heights.push(0.8 - 0.1 * x as f32);
            }
        }
        let mut tile = Tile::from_heights(6, heights).unwrap();
        let p = params(6);
        let at = tile.idx(2, 2);
        tile.pool[at] = 0.05;

        let report = spread_pools(&mut tile, &p, 1, true);
        assert_eq!(report.drained_cells, 1);
        assert_eq!(report.drained.len(), 1);
        assert_eq!(tile.pool[at], 0.0);
        assert!((report.drained[0].water - 0.05 * p.height).abs() < 1e-5);
        assert_eq!(report.drained[0].cell(), glam::IVec2::new(3, 2));
    }

    #[test]
    fn test_drain_without_particles_moves_water() {
        let mut tile = Tile::from_heights(5, vec![0.5; 25]).unwrap();
        let p = params(5);
        let at = tile.idx(2, 2);
        tile.pool[at] = 0.04;
        let report = spread_pools(&mut tile, &p, 1, false);
        assert!(report.drained.is_empty());
        assert_eq!(tile.pool[at], 0.0);
        assert!((tile.total_pool() - 0.04).abs() < 1e-7);
    }

    #[test]
    fn test_cascade_smoothing_conserves_dry_mass() {
        let mut tile = Tile::from_heights(6, vec![0.2; 36]).unwrap();
        tile.height[14] = 0.6;
        tile.pool[0] = 0.1;
        let before: f32 = tile.height.iter().sum();
        cascade_smooth(&mut tile, 0.0005, 0.1);
        let after: f32 = tile.height.iter().sum();
        assert!((before - after).abs() < 1e-5);
        assert!(tile.height[14] < 0.6);
        assert_eq!(tile.height[0], 0.2);
    }
}
