//! Parallel particle descent and the single-threaded commit of its events.

use std::collections::HashMap;

use glam::IVec2;
use rayon::prelude::*;

use crate::erosion::particle::{descend, ErosiveEvent, Particle};
use crate::erosion::pile::PileSolver;
use crate::erosion::ErosionParameters;
use crate::grid::{ReadWriteGrid, ReadableGrid};

/// Separable 3-tap Gaussian used to blur small sediment deltas.
pub const KERNEL3: [f32; 3] = [0.307_801_33, 0.384_397_34, 0.307_801_33];
/// Wider 5-tap variant.
pub const KERNEL5: [f32; 5] = [
    0.120_078_38,
    0.233_880_76,
    0.292_081_72,
    0.233_880_76,
    0.120_078_38,
];

/// Events grouped by the cell they target.
pub type EventMap = HashMap<usize, Vec<ErosiveEvent>>;

/// Summed deltas for one cell.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CellDelta {
    pub pool: f32,
    pub track: f32,
    pub sediment: f32,
}

/// Sediment waiting to be placed on the terrain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SedimentDeposit {
    pub idx: usize,
    pub amount: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct AggregateReport {
    pub events: usize,
    pub cells: usize,
    pub pool_added: f32,
    pub track_added: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SedimentReport {
    pub dispersed: usize,
    pub piled: usize,
    /// Deposit that did not fit inside the pile radius.
    pub leftover: f32,
}

/// Descends every particle against a read-only grid, grouping events by cell.
pub fn descend_all<G: ReadableGrid + Sync>(
    particles: Vec<Particle>,
    grid: &G,
    params: &ErosionParameters,
) -> EventMap {
    particles
        .into_par_iter()
        .fold(EventMap::new, |mut map, particle| {
            for event in descend(particle, grid, params) {
                map.entry(event.idx).or_default().push(event);
            }
            map
        })
        .reduce(EventMap::new, |mut a, b| {
            for (idx, mut events) in b {
                a.entry(idx).or_default().append(&mut events);
            }
            a
        })
}

/// Sums one cell's events in a fixed order so results do not depend on thread timing.
pub fn sum_events(events: &mut [ErosiveEvent]) -> CellDelta {
    events.sort_by_key(|e| (e.actor, e.age));
    events.iter().fold(CellDelta::default(), |acc, e| CellDelta {
        pool: acc.pool + e.delta_pool,
        track: acc.track + e.delta_track,
        sediment: acc.sediment + e.delta_sediment,
    })
}

/// Applies summed pool and track deltas to the grid and drains `events`.
///
/// Sediment is returned as a queue instead of being written, since it has to be
/// dispersed or piled.
pub fn aggregate<G: ReadWriteGrid>(
    events: &mut EventMap,
    grid: &mut G,
    params: &ErosionParameters,
) -> (AggregateReport, Vec<SedimentDeposit>) {
    let mut report = AggregateReport::default();
    let mut queue = Vec::new();

    let mut cells: Vec<(usize, Vec<ErosiveEvent>)> = events.drain().collect();
    cells.sort_unstable_by_key(|(idx, _)| *idx);

    for (idx, mut cell_events) in cells {
        report.events += cell_events.len();
        report.cells += 1;
        let delta = sum_events(&mut cell_events);

        let pool = delta.pool * params.pool_placement;
        if pool != 0.0 {
            grid.set_pool(idx, (grid.pool(idx) + pool).max(0.0));
            report.pool_added += pool;
        }
        let track = delta.track * params.track_placement;
        if track != 0.0 {
            grid.set_track(idx, grid.track(idx) + track);
            report.track_added += track;
        }
        if delta.sediment != 0.0 {
            queue.push(SedimentDeposit {
                idx,
                amount: delta.sediment,
            });
        }
    }
    (report, queue)
}

/// Places queued sediment: erosion and small deposits are blurred in, large
/// deposits become piles.
pub fn apply_sediment<G: ReadWriteGrid>(
    queue: &[SedimentDeposit],
    grid: &mut G,
    params: &ErosionParameters,
    piles: &mut PileSolver,
) -> SedimentReport {
    let mut report = SedimentReport::default();
    let threshold = params.pile_threshold / params.height;
    let increment = params.min_pile_increment / params.height;

    for deposit in queue {
        let at = grid.pos(deposit.idx);
        if deposit.amount < 0.0 || deposit.amount <= threshold {
            disperse(grid, at, deposit.amount, &KERNEL3);
            report.dispersed += 1;
        } else {
            let placed = piles.deposit(grid, at, deposit.amount, increment);
            report.leftover += deposit.amount - placed;
            report.piled += 1;
        }
    }
    report
}

/// Spreads `amount` over the separable kernel around `at`, clamping neighbor
/// coordinates. Taps that would leave `[0, 1]` are skipped.
pub fn disperse<G: ReadWriteGrid>(grid: &mut G, at: IVec2, amount: f32, kernel: &[f32]) {
    let r = (kernel.len() / 2) as i32;
    for (j, wz) in kernel.iter().enumerate() {
        for (i, wx) in kernel.iter().enumerate() {
            let idx = grid.safe_idx(at.x + i as i32 - r, at.y + j as i32 - r);
            let next = grid.height(idx) + amount * wx * wz;
            if (0.0..=1.0).contains(&next) {
                grid.set_height(idx, next);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::erosion::ErosionSettings;
    use crate::grid::{Heading, Tile};

    fn event(idx: usize, actor: u64, pool: f32, track: f32, sediment: f32) -> ErosiveEvent {
        ErosiveEvent {
            idx,
            actor,
            age: 0,
            heading: Heading::None,
            delta_pool: pool,
            delta_track: track,
            delta_sediment: sediment,
        }
    }

    #[test]
    fn test_kernels_are_normalized() {
        let s3: f32 = KERNEL3.iter().sum();
        let s5: f32 = KERNEL5.iter().sum();
        assert!((s3 - 1.0).abs() < 1e-5);
        assert!((s5 - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_empty_event_set_changes_nothing() {
        let mut tile = Tile::from_heights(6, vec![0.3; 36]).unwrap();
        tile.pool[7] = 0.25;
        tile.track[9] = 1.5;
        let before = tile.clone();
        let params = ErosionSettings::default().to_parameters(6).unwrap();
        let (report, queue) = aggregate(&mut EventMap::new(), &mut tile, &params);
        assert_eq!(report, AggregateReport::default());
        assert!(queue.is_empty());
        assert_eq!(tile.pool, before.pool);
        assert_eq!(tile.track, before.track);
    }

    #[test]
    fn test_aggregate_sums_and_scales_per_cell() {
        let mut tile = Tile::new(6).unwrap();
        let params = ErosionSettings::default().to_parameters(6).unwrap();
        let mut events = EventMap::new();
        events
            .entry(4)
            .or_default()
            .extend([event(4, 1, 0.01, 0.0, 0.002), event(4, 2, 0.03, 0.0, -0.001)]);
        events
            .entry(10)
            .or_default()
            .push(event(10, 3, 0.0, 0.02, 0.0));

        let (report, queue) = aggregate(&mut events, &mut tile, &params);
        assert!(events.is_empty());
        assert_eq!(report.events, 3);
        assert_eq!(report.cells, 2);
        assert!((tile.pool[4] - 0.04 * params.pool_placement).abs() < 1e-7);
        assert!((tile.track[10] - 0.02 * params.track_placement).abs() < 1e-6);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].idx, 4);
        assert!((queue[0].amount - 0.001).abs() < 1e-7);
    }

    #[test]
    fn test_small_deposits_blur_and_large_ones_pile() {
        let mut tile = Tile::from_heights(16, vec![0.4; 256]).unwrap();
        let params = ErosionSettings::default().to_parameters(16).unwrap();
        let mut piles = PileSolver::new(params.piling_radius);
        let small = SedimentDeposit {
            idx: tile.idx(3, 3),
            amount: 0.01,
        };
        let large = SedimentDeposit {
            idx: tile.idx(10, 10),
            amount: 0.05,
        };
        let report = apply_sediment(&[small, large], &mut tile, &params, &mut piles);
        assert_eq!(report.dispersed, 1);
        assert_eq!(report.piled, 1);

        let blurred = tile.height[tile.idx(3, 3)] - 0.4;
        assert!((blurred - 0.01 * KERNEL3[1] * KERNEL3[1]).abs() < 1e-6);
        assert!(tile.height[tile.idx(10, 10)] > tile.height[tile.idx(12, 10)]);

        let added: f32 = tile.height.iter().map(|h| h - 0.4).sum();
        assert!((added - 0.06).abs() < 1e-4);
    }

    #[test]
    fn test_disperse_skips_taps_leaving_unit_range() {
        let mut tile = Tile::from_heights(6, vec![0.001; 36]).unwrap();
        disperse(&mut tile, IVec2::new(2, 2), -0.05, &KERNEL3);
        assert!(tile.height.iter().all(|&h| (h - 0.001).abs() < 1e-9));
    }

    #[test]
    fn test_descend_all_groups_by_cell() {
        let tile = Tile::from_heights(8, vec![0.5; 64]).unwrap();
        let params = ErosionSettings::default().to_parameters(8).unwrap();
        let particles = vec![
            Particle::new(2, 2, 1.0),
            Particle::new(2, 2, 1.0),
            Particle::new(5, 1, 1.0),
        ];
        let mut events = descend_all(particles, &tile, &params);
        assert_eq!(events.len(), 2);
        assert_eq!(events[&tile.idx(2, 2)].len(), 2);
        let delta = sum_events(events.get_mut(&tile.idx(5, 1)).unwrap());
        assert!((delta.pool * params.height - 1.0).abs() < 1e-6);
    }
}
