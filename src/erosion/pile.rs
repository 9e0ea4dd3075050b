//! Sediment piles: large deposits spread as a mound over Manhattan rings.

use glam::IVec2;

use crate::grid::{ReadWriteGrid, ReadableGrid};

/// Quadrant walks used to lay out a ring: each starts on `a` and turns toward `b`.
const QUADRANTS: [(IVec2, IVec2); 4] = [
    (IVec2::new(0, 1), IVec2::new(1, 0)),   // NE: up, right
    (IVec2::new(1, 0), IVec2::new(0, -1)),  // SE: right, down
    (IVec2::new(0, -1), IVec2::new(-1, 0)), // SW: down, left
    (IVec2::new(-1, 0), IVec2::new(0, 1)),  // NW: left, up
];

#[derive(Debug, Clone, Copy)]
struct PileVertex {
    offset: IVec2,
    ring: u32,
    idx: usize,
    value: f32,
    valid: bool,
    modified: bool,
}

/// Reusable vertex pattern for one pile radius.
///
/// Vertices are stored ring by ring, innermost first; each ring `d` holds the
/// `4d` cells at Manhattan distance `d` (one for the center).
#[derive(Debug, Clone)]
pub struct PileSolver {
    radius: u32,
    vertices: Vec<PileVertex>,
}

impl PileSolver {
    pub fn new(radius: u32) -> Self {
        let mut vertices = Vec::with_capacity(Self::vertex_count_for(radius));
        vertices.push(PileVertex::new(IVec2::ZERO, 0));
        for d in 1..=radius as i32 {
            for (a, b) in QUADRANTS {
                for i in 0..d {
                    let offset = a * d + (b - a) * i;
                    vertices.push(PileVertex::new(offset, d as u32));
                }
            }
        }
        Self { radius, vertices }
    }

    /// `2r^2 + 2r + 1`.
    pub fn vertex_count_for(radius: u32) -> usize {
        let r = radius as usize;
        2 * r * r + 2 * r + 1
    }

    pub fn radius(&self) -> u32 {
        self.radius
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    /// Centers the pattern on `center`, caching current heights. Vertices that
    /// fall off the tile are marked invalid and never touched.
    pub fn set_pile<G: ReadableGrid>(&mut self, grid: &G, center: IVec2) {
        for v in &mut self.vertices {
            let p = center + v.offset;
            v.modified = false;
            match grid.checked_idx(p.x, p.y) {
                Some(idx) => {
                    v.idx = idx;
                    v.value = grid.height(idx);
                    v.valid = true;
                }
                None => {
                    v.valid = false;
                }
            }
        }
    }

    /// Lays `amount` of normalized height around `center` in steps of `increment`
    /// and commits the touched cells. Returns the amount actually placed.
    ///
    /// Round `k` lifts ring `d < k` toward `base + (k - d) * increment`, so every
    /// ring stays at or below the one inside it.
    pub fn deposit<G: ReadWriteGrid>(
        &mut self,
        grid: &mut G,
        center: IVec2,
        amount: f32,
        increment: f32,
    ) -> f32 {
        if amount <= 0.0 || increment <= 0.0 {
            return 0.0;
        }
        self.set_pile(grid, center);
        let base = self.vertices[0].value;
        let mut remaining = amount;

        'rounds: for round in 1..=self.radius + 1 {
            for v in self.vertices.iter_mut().filter(|v| v.valid && v.ring < round) {
                let level = base + (round - v.ring) as f32 * increment;
                if v.value >= level {
                    continue;
                }
                let lift = increment.min(level - v.value).min(remaining);
                v.value += lift;
                v.modified = true;
                remaining -= lift;
                if remaining <= 0.0 {
                    break 'rounds;
                }
            }
        }

        self.commit(grid);
        amount - remaining.max(0.0)
    }

    fn commit<G: ReadWriteGrid>(&mut self, grid: &mut G) {
        for v in self.vertices.iter_mut().filter(|v| v.valid && v.modified) {
            grid.set_height(v.idx, v.value);
            v.modified = false;
        }
    }
}

impl PileVertex {
    fn new(offset: IVec2, ring: u32) -> Self {
        Self {
            offset,
            ring,
            idx: 0,
            value: 0.0,
            valid: false,
            modified: false,
        }
    }
}
