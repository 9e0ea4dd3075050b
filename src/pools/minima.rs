//! Downhill bitmasks and local minima.

use rayon::prelude::*;

use crate::grid::{Cardinal, ReadableGrid, NEIGHBORS_8};

/// Bit `d` is set when `NEIGHBORS_8[d]` is off the tile or strictly lower.
pub fn downhill_mask<G: ReadableGrid>(grid: &G, idx: usize) -> Cardinal {
    let p = grid.pos(idx);
    let h = grid.height(idx);
    let mut mask = Cardinal::NONE;
    for (d, o) in NEIGHBORS_8.iter().enumerate() {
        let n = p + *o;
        match grid.checked_idx(n.x, n.y) {
            Some(ni) if grid.height(ni) >= h => {}
            _ => mask = mask.with(d),
        }
    }
    mask
}

/// Per-cell masks plus the cells whose mask is empty.
#[derive(Debug, Clone, Default)]
pub struct MinimaMap {
    pub masks: Vec<Cardinal>,
    /// Ascending cell indices.
    pub minima: Vec<usize>,
}

impl MinimaMap {
    pub fn is_minimum(&self, idx: usize) -> bool {
        self.masks[idx].is_empty()
    }
}

/// Computes every mask row by row in parallel and merges the per-row minima.
pub fn detect_minima<G: ReadableGrid + Sync>(grid: &G) -> MinimaMap {
    let res = grid.resolution();
    let rows: Vec<(Vec<Cardinal>, Vec<usize>)> = (0..res)
        .into_par_iter()
        .map(|z| {
            let mut masks = Vec::with_capacity(res);
            let mut minima = Vec::new();
            for x in 0..res {
                let idx = z * res + x;
                let mask = downhill_mask(grid, idx);
                if mask.is_empty() {
                    minima.push(idx);
                }
                masks.push(mask);
            }
            (masks, minima)
        })
        .collect();

    let mut map = MinimaMap {
        masks: Vec::with_capacity(res * res),
        minima: Vec::new(),
    };
    for (masks, minima) in rows {
        map.masks.extend(masks);
        map.minima.extend(minima);
    }
    map
}
