//! Basin flooding from each minimum and the reduction into a catchment partition.

use std::collections::{HashMap, HashSet};

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::grid::{opposite, Cardinal, ReadableGrid, NEIGHBORS_8};
use crate::pools::minima::MinimaMap;

/// Who a cell's water ends up with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CatchmentOwner {
    Minimum(usize),
    /// Boundary cell claimed by several basins and owned by none.
    Contested(Vec<usize>),
    /// Drains off the tile.
    OffTile,
}

impl CatchmentOwner {
    pub fn minimum(&self) -> Option<usize> {
        match self {
            CatchmentOwner::Minimum(m) => Some(*m),
            _ => None,
        }
    }
}

/// Result of flooding one minimum on its own.
#[derive(Debug, Clone, Default)]
pub struct BasinFlood {
    pub minimum: usize,
    /// Cells whose every downhill neighbor lies in the basin, minimum first.
    pub members: Vec<usize>,
    /// Neighbors of the basin that also drain elsewhere.
    pub boundary: Vec<usize>,
}

/// Grows the basin of `minimum` over the downhill masks.
///
/// A cell joins once every bit of its mask points into the basin; cells left
/// with bits pointing elsewhere (or off the tile) form the boundary.
pub fn flood_basin<G: ReadableGrid>(grid: &G, masks: &[Cardinal], minimum: usize) -> BasinFlood {
    let mut basin: HashSet<usize> = HashSet::new();
    let mut members = Vec::new();
    let mut frontier: HashMap<usize, Cardinal> = HashMap::new();
    let mut queue = vec![minimum];

    while let Some(cell) = queue.pop() {
        if !basin.insert(cell) {
            continue;
        }
        members.push(cell);
        frontier.remove(&cell);

        let p = grid.pos(cell);
        for (d, o) in NEIGHBORS_8.iter().enumerate() {
            let n = p + *o;
            let Some(ni) = grid.checked_idx(n.x, n.y) else {
                continue;
            };
            if basin.contains(&ni) {
                continue;
            }
            let mask = frontier.entry(ni).or_insert(masks[ni]);
            // bit of `ni` that points back at `cell`
            mask.prune(opposite(d));
            if mask.is_empty() {
                queue.push(ni);
            }
        }
    }

    let mut boundary: Vec<usize> = frontier
        .into_iter()
        .filter(|(c, _)| !basin.contains(c))
        .map(|(c, _)| c)
        .collect();
    boundary.sort_unstable();

    BasinFlood {
        minimum,
        members,
        boundary,
    }
}

/// The catchment partition of a tile.
#[derive(Debug, Clone, Default)]
pub struct Catchments {
    pub resolution: usize,
    /// Representative minima, ordered by `(height, index)`.
    pub minima: Vec<usize>,
    /// Flooded basin cells per representative.
    pub members: HashMap<usize, Vec<usize>>,
    /// Minimum -> its boundary cells.
    pub boundary_mb: HashMap<usize, Vec<usize>>,
    /// Boundary cell -> every minimum claiming it.
    pub boundary_bm: HashMap<usize, Vec<usize>>,
    /// Owner of every cell.
    pub owner: Vec<CatchmentOwner>,
    /// Minima dropped because an equal-height neighbor already owned them.
    pub plateau_aliases: HashMap<usize, usize>,
}

impl Catchments {
    pub fn owner(&self, idx: usize) -> &CatchmentOwner {
        &self.owner[idx]
    }

    /// Every cell owned by `minimum`.
    pub fn catchment_of(&self, minimum: usize) -> Vec<usize> {
        self.owner
            .iter()
            .enumerate()
            .filter(|(_, o)| o.minimum() == Some(minimum))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn contested(&self) -> Vec<usize> {
        self.owner
            .iter()
            .enumerate()
            .filter(|(_, o)| matches!(o, CatchmentOwner::Contested(_)))
            .map(|(i, _)| i)
            .collect()
    }

    pub fn off_tile(&self) -> Vec<usize> {
        self.owner
            .iter()
            .enumerate()
            .filter(|(_, o)| **o == CatchmentOwner::OffTile)
            .map(|(i, _)| i)
            .collect()
    }

    /// Representative minimum for any detected minimum, following plateau aliases.
    pub fn representative(&self, minimum: usize) -> Option<usize> {
        if self.members.contains_key(&minimum) {
            Some(minimum)
        } else {
            self.plateau_aliases.get(&minimum).copied()
        }
    }
}

/// Connected runs of equal-height minima, each sorted so its first cell is the lowest index.
pub fn plateau_groups<G: ReadableGrid>(grid: &G, minima: &MinimaMap) -> Vec<Vec<usize>> {
    let mut seen = vec![false; minima.masks.len()];
    let mut groups = Vec::new();
    for &start in &minima.minima {
        if seen[start] {
            continue;
        }
        seen[start] = true;
        let h = grid.height(start);
        let mut group = vec![start];
        let mut queue = vec![start];
        while let Some(cell) = queue.pop() {
            let p = grid.pos(cell);
            for o in NEIGHBORS_8.iter() {
                let n = p + *o;
                let Some(ni) = grid.checked_idx(n.x, n.y) else {
                    continue;
                };
                if !seen[ni] && minima.is_minimum(ni) && grid.height(ni) == h {
                    seen[ni] = true;
                    group.push(ni);
                    queue.push(ni);
                }
            }
        }
        group.sort_unstable();
        groups.push(group);
    }
    groups
}

/// Floods one minimum per plateau in parallel, then resolves overlaps and assigns an owner to every cell.
pub fn collapse<G: ReadableGrid + Sync>(grid: &G, minima: &MinimaMap) -> Catchments {
    let res = grid.resolution();
    let groups = plateau_groups(grid, minima);
    let mut floods: Vec<(BasinFlood, &[usize])> = groups
        .par_iter()
        .map(|group| (flood_basin(grid, &minima.masks, group[0]), &group[1..]))
        .collect();
    floods.sort_by(|(a, _), (b, _)| {
        grid.height(a.minimum)
            .total_cmp(&grid.height(b.minimum))
            .then(a.minimum.cmp(&b.minimum))
    });

    let mut basin_of: Vec<Option<usize>> = vec![None; res * res];
    let mut out = Catchments {
        resolution: res,
        ..Default::default()
    };

    for (flood, flat) in floods {
        if let Some(rep) = basin_of[flood.minimum] {
            out.plateau_aliases.insert(flood.minimum, rep);
            out.plateau_aliases.extend(flat.iter().map(|&m| (m, rep)));
            continue;
        }
        let rep = flood.minimum;
        out.plateau_aliases.extend(flat.iter().map(|&m| (m, rep)));
        let mut claimed = Vec::with_capacity(flood.members.len());
        for &c in &flood.members {
            if basin_of[c].is_none() {
                basin_of[c] = Some(rep);
                claimed.push(c);
            }
        }
        for &b in &flood.boundary {
            out.boundary_bm.entry(b).or_default().push(rep);
        }
        out.boundary_mb.insert(rep, flood.boundary);
        out.members.insert(rep, claimed);
        out.minima.push(rep);
    }

    let mut owner: Vec<Option<CatchmentOwner>> = basin_of
        .iter()
        .map(|b| b.map(CatchmentOwner::Minimum))
        .collect();
    for (&cell, claims) in &out.boundary_bm {
        if owner[cell].is_some() {
            continue;
        }
        owner[cell] = Some(match claims.as_slice() {
            [single] => CatchmentOwner::Minimum(*single),
            many => {
                let mut many = many.to_vec();
                many.sort_unstable();
                many.dedup();
                CatchmentOwner::Contested(many)
            }
        });
    }

    for start in 0..owner.len() {
        if owner[start].is_some() {
            continue;
        }
        let resolved = walk_downhill(grid, &minima.masks, &mut owner, start);
        owner[start] = Some(resolved);
    }

    out.owner = owner
        .into_iter()
        .map(|o| o.unwrap_or(CatchmentOwner::OffTile))
        .collect();
    out
}

/// Follows the steepest strictly-lower neighbor until an owned cell or the tile edge.
/// Every cell on the path receives the result.
fn walk_downhill<G: ReadableGrid>(
    grid: &G,
    masks: &[Cardinal],
    owner: &mut [Option<CatchmentOwner>],
    start: usize,
) -> CatchmentOwner {
    let mut path = vec![start];
    let mut cell = start;
    let resolved = loop {
        match steepest_lower(grid, masks[cell], cell) {
            None => break CatchmentOwner::OffTile,
            Some(next) => match &owner[next] {
                Some(CatchmentOwner::Contested(_)) => {
                    cell = next;
                }
                Some(found) => break found.clone(),
                None => {
                    path.push(next);
                    cell = next;
                }
            },
        }
    };
    for c in path {
        owner[c] = Some(resolved.clone());
    }
    resolved
}

/// Steepest in-bounds lower neighbor. `None` when only off-tile bits remain.
fn steepest_lower<G: ReadableGrid>(grid: &G, mask: Cardinal, cell: usize) -> Option<usize> {
    let p = grid.pos(cell);
    let h = grid.height(cell);
    let mut best: Option<(usize, f32)> = None;
    for (d, o) in NEIGHBORS_8.iter().enumerate() {
        if !mask.contains(d) {
            continue;
        }
        let n = p + *o;
        let Some(ni) = grid.checked_idx(n.x, n.y) else {
            continue;
        };
        let dist = if o.x != 0 && o.y != 0 {
            std::f32::consts::SQRT_2
        } else {
            1.0
        };
        let slope = (h - grid.height(ni)) / dist;
        if best.map_or(true, |(_, s)| slope > s) {
            best = Some((ni, slope));
        }
    }
    best.map(|(ni, _)| ni)
}
