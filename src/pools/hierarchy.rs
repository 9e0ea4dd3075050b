//! Drains, first-order pools and the merge hierarchy built on top of them.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fmt;

use rayon::prelude::*;

use crate::grid::{ReadableGrid, Tile};
use crate::pools::collapse::{collapse, CatchmentOwner, Catchments};
use crate::pools::minima::{detect_minima, MinimaMap};
use crate::pools::pool::{Pool, PoolKey};

/// Constituents merged at one drain, the pool that spills plus its partners.
const MAX_CONSTITUENTS: usize = 3;

/// A pending drain on the merge queue.
#[derive(Clone, Copy, Debug)]
struct DrainItem {
    height: f32,
    drain: usize,
    group: usize,
}

impl PartialEq for DrainItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for DrainItem {}

impl PartialOrd for DrainItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Min-heap on (height, drain, group) via reversed ordering.
impl Ord for DrainItem {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .height
            .total_cmp(&self.height)
            .then(other.drain.cmp(&self.drain))
            .then(other.group.cmp(&self.group))
    }
}

/// Working state of one current pool while linking.
#[derive(Debug, Clone)]
struct Group {
    key: PoolKey,
    minimum: usize,
    minima_height: f32,
    minima: Vec<usize>,
    members: HashSet<usize>,
    boundary: HashSet<usize>,
    drain: Option<usize>,
    drain_height: f32,
    active: bool,
}

/// What the tooling sees when it points at one cell.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolInspection {
    pub cell: usize,
    pub height: f32,
    pub owner: CatchmentOwner,
    /// Minima the cell drains to.
    pub minima: Vec<usize>,
    /// Every pool from the first-order basins up to their roots.
    pub chain: Vec<PoolKey>,
    /// Peers met along the chain.
    pub peers: Vec<PoolKey>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HierarchySummary {
    pub minima: usize,
    pub pools: usize,
    pub roots: usize,
    pub max_order: u8,
    pub contested: usize,
    pub off_tile: usize,
}

impl fmt::Display for HierarchySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} minima, {} pools ({} roots, max order {}), {} contested cells, {} off-tile cells",
            self.minima, self.pools, self.roots, self.max_order, self.contested, self.off_tile
        )
    }
}

/// Pool arena for one tile, keyed by [`PoolKey`] with parent links stored as keys.
#[derive(Debug, Clone, Default)]
pub struct PoolHierarchy {
    resolution: usize,
    heights: Vec<f32>,
    pub minima: MinimaMap,
    pub catchments: Catchments,
    /// Minimum -> key of its first-order drain.
    pub drain_keys: HashMap<usize, PoolKey>,
    /// Drain key -> every minimum spilling through it.
    pub drain_to_minima: HashMap<PoolKey, Vec<usize>>,
    pools: HashMap<PoolKey, Pool>,
    roots: Vec<PoolKey>,
}

/// Lowest `(height, index)` cell of `cells`.
fn lowest_cell<'a>(cells: impl IntoIterator<Item = &'a usize>, heights: &[f32]) -> Option<usize> {
    cells
        .into_iter()
        .copied()
        .min_by(|&a, &b| heights[a].total_cmp(&heights[b]).then(a.cmp(&b)))
}

/// Picks each representative minimum's drain: its lowest boundary cell.
pub fn solve_drains(
    catchments: &Catchments,
    heights: &[f32],
) -> (HashMap<usize, PoolKey>, HashMap<PoolKey, Vec<usize>>) {
    let mut drain_keys = HashMap::new();
    let mut drain_to_minima: HashMap<PoolKey, Vec<usize>> = HashMap::new();
    for &m in &catchments.minima {
        let Some(boundary) = catchments.boundary_mb.get(&m) else {
            continue;
        };
        if let Some(drain) = lowest_cell(boundary, heights) {
            let key = PoolKey::new(drain, 1, 0);
            drain_keys.insert(m, key);
            drain_to_minima.entry(key).or_default().push(m);
        }
    }
    (drain_keys, drain_to_minima)
}

impl PoolHierarchy {
    /// Runs the whole solve: minima, collapse, drains, first-order pools, linking.
    pub fn solve<G: ReadableGrid + Sync>(grid: &G) -> Self {
        let res = grid.resolution();
        let heights: Vec<f32> = (0..grid.cell_count()).map(|i| grid.height(i)).collect();

        let minima = detect_minima(grid);
        log::debug!("pool solve: {} minima", minima.minima.len());
        let catchments = collapse(grid, &minima);
        let (drain_keys, drain_to_minima) = solve_drains(&catchments, &heights);

        let first: Vec<Pool> = catchments
            .minima
            .par_iter()
            .map(|&m| {
                let drain = drain_keys.get(&m).and_then(PoolKey::cell).unwrap_or(m);
                let mut pool = Pool::new(PoolKey::first_order(m), m, heights[m], drain, heights[drain]);
                let member_heights: Vec<f32> = catchments
                    .members
                    .get(&m)
                    .map(|cells| cells.iter().map(|&c| heights[c]).collect())
                    .unwrap_or_default();
                pool.solve(&member_heights);
                pool
            })
            .collect();

        let mut hierarchy = Self {
            resolution: res,
            heights,
            minima,
            catchments,
            drain_keys,
            drain_to_minima,
            pools: first.iter().map(|p| (p.key, p.clone())).collect(),
            roots: Vec::new(),
        };
        hierarchy.link(first);
        log::info!("pool solve: {}", hierarchy.summary());
        hierarchy
    }

    fn on_edge(&self, idx: usize) -> bool {
        let res = self.resolution;
        let (x, z) = (idx % res, idx / res);
        x == 0 || z == 0 || x == res - 1 || z == res - 1
    }

    /// Merges pools lowest drain first until every current pool is a root.
    fn link(&mut self, first: Vec<Pool>) {
        let mut groups: Vec<Group> = first
            .into_iter()
            .map(|p| {
                let m = p.index_minima;
                Group {
                    key: p.key,
                    minimum: m,
                    minima_height: p.minima_height,
                    minima: vec![m],
                    members: self
                        .catchments
                        .members
                        .get(&m)
                        .map(|c| c.iter().copied().collect())
                        .unwrap_or_default(),
                    boundary: self
                        .catchments
                        .boundary_mb
                        .get(&m)
                        .map(|c| c.iter().copied().collect())
                        .unwrap_or_default(),
                    drain: (p.index_drain != m).then_some(p.index_drain),
                    drain_height: p.drain_height,
                    active: true,
                }
            })
            .collect();

        let mut heap: BinaryHeap<DrainItem> = groups
            .iter()
            .enumerate()
            .filter_map(|(gid, g)| {
                g.drain.map(|drain| DrainItem {
                    height: g.drain_height,
                    drain,
                    group: gid,
                })
            })
            .collect();

        while let Some(item) = heap.pop() {
            let current = &groups[item.group];
            if !current.active || current.drain != Some(item.drain) {
                continue;
            }
            let d = item.drain;
            if self.on_edge(d) {
                continue;
            }

            let mut partners: Vec<usize> = groups
                .iter()
                .enumerate()
                .filter(|(gid, t)| {
                    *gid != item.group
                        && t.active
                        && t.drain_height >= current.drain_height
                        && (t.members.contains(&d) || t.boundary.contains(&d))
                })
                .map(|(gid, _)| gid)
                .collect();
            if partners.is_empty() {
                continue;
            }
            partners.sort_by(|&a, &b| {
                groups[a]
                    .minima_height
                    .total_cmp(&groups[b].minima_height)
                    .then(groups[a].minimum.cmp(&groups[b].minimum))
            });
            if partners.len() > MAX_CONSTITUENTS - 1 {
                log::warn!(
                    "drain {} joins {} pools, merging the lowest {}",
                    d,
                    partners.len() + 1,
                    MAX_CONSTITUENTS
                );
                partners.truncate(MAX_CONSTITUENTS - 1);
            }

            let mut constituents = vec![item.group];
            constituents.extend(partners);
            let merged = self.merge(&mut groups, &constituents, d);
            let gid = groups.len();
            if let Some(drain) = merged.drain {
                heap.push(DrainItem {
                    height: merged.drain_height,
                    drain,
                    group: gid,
                });
            }
            groups.push(merged);
        }

        let mut roots: Vec<PoolKey> = groups.iter().filter(|g| g.active).map(|g| g.key).collect();
        roots.sort();
        self.roots = roots;
    }

    /// Builds the parent pool for `constituents` spilling together through `d`.
    fn merge(&mut self, groups: &mut [Group], constituents: &[usize], d: usize) -> Group {
        let heights = &self.heights;
        let confluence = heights[d];

        let mut members: HashSet<usize> = HashSet::new();
        let mut boundary: HashSet<usize> = HashSet::new();
        let mut minima = Vec::new();
        for &gid in constituents {
            members.extend(groups[gid].members.iter().copied());
            boundary.extend(groups[gid].boundary.iter().copied());
            minima.extend(groups[gid].minima.iter().copied());
        }
        members.insert(d);
        let flooded: Vec<usize> = boundary
            .iter()
            .copied()
            .filter(|&b| heights[b] <= confluence && !self.on_edge(b))
            .collect();
        members.extend(flooded);
        boundary.retain(|b| !members.contains(b));
        minima.sort_unstable();

        let lowest = constituents
            .iter()
            .copied()
            .min_by(|&a, &b| {
                groups[a]
                    .minima_height
                    .total_cmp(&groups[b].minima_height)
                    .then(groups[a].minimum.cmp(&groups[b].minimum))
            })
            .unwrap_or(constituents[0]);
        let minimum = groups[lowest].minimum;
        let minima_height = groups[lowest].minima_height;
        let order = constituents
            .iter()
            .map(|&gid| groups[gid].key.order)
            .max()
            .unwrap_or(1)
            .saturating_add(1);
        let mut key = PoolKey::new(minimum, order, 0);
        while self.pools.contains_key(&key) {
            key.n += 1;
        }

        let drain = lowest_cell(&boundary, heights);
        let (drain_idx, drain_height) = match drain {
            Some(cell) => (cell, heights[cell]),
            None => (d, confluence),
        };

        let mut parent = Pool::new(key, minimum, minima_height, drain_idx, drain_height);
        let member_heights: Vec<f32> = members.iter().map(|&c| heights[c]).collect();
        parent.solve(&member_heights);
        parent.set_minimum_volume(confluence);

        for &gid in constituents {
            let child = groups[gid].key;
            groups[gid].active = false;
            parent.add_peer(child);
            if let Some(pool) = self.pools.get_mut(&child) {
                pool.superceded_by = key;
            }
        }
        if drain.is_some() {
            self.drain_to_minima
                .entry(PoolKey::new(drain_idx, order, 0))
                .or_default()
                .extend(minima.iter().copied());
        }
        log::debug!(
            "merged {} pools at drain {} into {} (capacity {:.4})",
            constituents.len(),
            d,
            key,
            parent.capacity
        );
        self.pools.insert(key, parent);

        Group {
            key,
            minimum,
            minima_height,
            minima,
            members,
            boundary,
            drain,
            drain_height,
            active: true,
        }
    }

    pub fn resolution(&self) -> usize {
        self.resolution
    }

    pub fn pool(&self, key: PoolKey) -> Option<&Pool> {
        self.pools.get(&key)
    }

    pub fn pools(&self) -> impl Iterator<Item = &Pool> {
        self.pools.values()
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Pools with no parent, sorted by key.
    pub fn roots(&self) -> &[PoolKey] {
        &self.roots
    }

    /// First-order pool of a minimum, following plateau aliases.
    pub fn first_order_key(&self, minimum: usize) -> Option<PoolKey> {
        let rep = self.catchments.representative(minimum)?;
        let key = PoolKey::first_order(rep);
        self.pools.contains_key(&key).then_some(key)
    }

    fn pool_ref(&self, key: PoolKey) -> &Pool {
        match self.pools.get(&key) {
            Some(pool) => pool,
            None => panic!("pool {key} is referenced but missing from the hierarchy"),
        }
    }

    fn pool_mut(&mut self, key: PoolKey) -> &mut Pool {
        match self.pools.get_mut(&key) {
            Some(pool) => pool,
            None => panic!("pool {key} is referenced but missing from the hierarchy"),
        }
    }

    /// Follows `superceded_by` while the pool is full, returning the pool that
    /// currently holds the water.
    pub fn roll_up_to_current(&self, key: PoolKey) -> PoolKey {
        let mut current = key;
        let mut hops = 0;
        loop {
            let pool = self.pool_ref(current);
            if !(pool.is_full() && pool.has_parent()) {
                return current;
            }
            current = pool.superceded_by;
            hops += 1;
            assert!(
                hops <= self.pools.len(),
                "superceded_by chain from {key} does not terminate"
            );
        }
    }

    /// Every key from `key` up to its root.
    pub fn chain(&self, key: PoolKey) -> Vec<PoolKey> {
        let mut chain = vec![key];
        let mut current = key;
        while self.pool_ref(current).has_parent() {
            current = self.pool_ref(current).superceded_by;
            chain.push(current);
            assert!(
                chain.len() <= self.pools.len(),
                "superceded_by chain from {key} does not terminate"
            );
        }
        chain
    }

    /// The unfilled pool deepest under `key`, children first.
    fn first_unfilled(&self, key: PoolKey) -> Option<PoolKey> {
        let pool = self.pool_ref(key);
        if pool.is_full() {
            return None;
        }
        pool.peers()
            .find_map(|child| self.first_unfilled(child))
            .or(Some(key))
    }

    /// Pours `amount` of normalized water into the basin at `minimum`.
    ///
    /// Full pools spill into an unfilled sibling, then into their parent.
    /// Returns whatever overflows the root.
    pub fn add_volume(&mut self, minimum: usize, amount: f32) -> f32 {
        match self.first_order_key(minimum) {
            Some(start) => self.pour(start, amount),
            None => amount,
        }
    }

    /// Applies a batch of volume changes keyed by pool and returns the total
    /// overflow. Positive amounts pour in like [`Self::add_volume`]; negative
    /// ones drain the pool currently holding the water, never below empty.
    /// Amounts for unknown keys count as overflow.
    pub fn apply_updates(&mut self, updates: &[(PoolKey, f32)]) -> f32 {
        let mut overflow = 0.0;
        for &(key, amount) in updates {
            if !self.pools.contains_key(&key) {
                log::debug!("volume update for unknown pool {key}");
                overflow += amount.max(0.0);
                continue;
            }
            if amount >= 0.0 {
                overflow += self.pour(key, amount);
            } else {
                let current = self.roll_up_to_current(key);
                let pool = self.pool_mut(current);
                pool.volume = (pool.volume + amount).max(0.0);
            }
        }
        overflow
    }

    /// Standing water per basin, summed from a pool-depth buffer. Contested
    /// and off-tile cells contribute nothing.
    pub fn volume_updates(&self, water: &[f32]) -> Vec<(PoolKey, f32)> {
        let mut totals: HashMap<PoolKey, f32> = HashMap::new();
        for (owner, &depth) in self.catchments.owner.iter().zip(water) {
            if depth <= 0.0 {
                continue;
            }
            let Some(key) = owner.minimum().and_then(|m| self.first_order_key(m)) else {
                continue;
            };
            *totals.entry(key).or_insert(0.0) += depth;
        }
        let mut updates: Vec<_> = totals.into_iter().collect();
        updates.sort_by_key(|(key, _)| *key);
        updates
    }

    /// Writes the water depth of every cell's current pool into `tile.pool`.
    pub fn draw_pools(&self, tile: &mut Tile) {
        let depths: Vec<f32> = (0..tile.pool.len())
            .into_par_iter()
            .map(|i| self.water_depth(i))
            .collect();
        tile.pool = depths;
    }

    /// Gathers the tile's standing water into its basins and redraws it as
    /// level pool surfaces. Returns the water that spilled off the roots.
    pub fn settle(&mut self, tile: &mut Tile) -> f32 {
        self.clear_volumes();
        let updates = self.volume_updates(&tile.pool);
        let overflow = self.apply_updates(&updates);
        self.draw_pools(tile);
        overflow
    }

    /// Pours `amount` into the pool holding `start`'s water, spilling upward.
    fn pour(&mut self, start: PoolKey, amount: f32) -> f32 {
        let mut key = self.roll_up_to_current(start);
        let mut remaining = amount;
        let mut steps = 0;
        while remaining > 0.0 {
            steps += 1;
            assert!(
                steps <= 4 * self.pools.len() + 4,
                "volume from {start} never settles"
            );
            let pool = self.pool_mut(key);
            let space = (pool.capacity - pool.volume).max(0.0);
            if remaining <= space {
                pool.volume += remaining;
                return 0.0;
            }
            pool.volume = pool.capacity;
            remaining -= space;
            let parent = pool.superceded_by;
            if parent.is_none() {
                return remaining;
            }

            let sibling = self
                .pool_ref(parent)
                .peers()
                .filter(|&p| p != key)
                .find_map(|p| self.first_unfilled(p));
            key = match sibling {
                Some(s) => s,
                None => {
                    let p = self.pool_mut(parent);
                    p.volume = p.volume.max(p.min_volume);
                    parent
                }
            };
        }
        0.0
    }

    /// Empties every pool.
    pub fn clear_volumes(&mut self) {
        for pool in self.pools.values_mut() {
            pool.volume = 0.0;
        }
    }

    /// Water surface over `cell`, if its basin holds any water. Contested
    /// cells take the highest surface among their claimants.
    pub fn surface_height(&self, cell: usize) -> Option<f32> {
        let minima = match self.catchments.owner.get(cell)? {
            CatchmentOwner::Minimum(m) => vec![*m],
            CatchmentOwner::Contested(ms) => ms.clone(),
            CatchmentOwner::OffTile => return None,
        };
        minima
            .into_iter()
            .filter_map(|m| {
                let key = self.roll_up_to_current(self.first_order_key(m)?);
                let pool = self.pool_ref(key);
                (pool.volume > 0.0).then(|| pool.surface_height())
            })
            .max_by(f32::total_cmp)
    }

    /// Depth of water standing on `cell`.
    pub fn water_depth(&self, cell: usize) -> f32 {
        self.surface_height(cell)
            .map_or(0.0, |s| (s - self.heights[cell]).max(0.0))
    }

    /// Debug view of one cell; coordinates are clamped into the tile.
    pub fn inspect(&self, x: i32, z: i32) -> PoolInspection {
        let max = self.resolution as i32 - 1;
        let cell = z.clamp(0, max) as usize * self.resolution + x.clamp(0, max) as usize;
        let owner = self
            .catchments
            .owner
            .get(cell)
            .cloned()
            .unwrap_or(CatchmentOwner::OffTile);
        let minima = match &owner {
            CatchmentOwner::Minimum(m) => vec![*m],
            CatchmentOwner::Contested(ms) => ms.clone(),
            CatchmentOwner::OffTile => Vec::new(),
        };

        let mut chain = Vec::new();
        let mut peers = Vec::new();
        for &m in &minima {
            let Some(first) = self.first_order_key(m) else {
                continue;
            };
            for key in self.chain(first) {
                if !chain.contains(&key) {
                    chain.push(key);
                }
                for peer in self.pool_ref(key).peers() {
                    if !peers.contains(&peer) {
                        peers.push(peer);
                    }
                }
            }
        }

        PoolInspection {
            cell,
            height: self.heights.get(cell).copied().unwrap_or(0.0),
            owner,
            minima,
            chain,
            peers,
        }
    }

    pub fn summary(&self) -> HierarchySummary {
        HierarchySummary {
            minima: self.catchments.minima.len(),
            pools: self.pools.len(),
            roots: self.roots.len(),
            max_order: self.pools.values().map(|p| p.order).max().unwrap_or(0),
            contested: self.catchments.contested().len(),
            off_tile: self.catchments.off_tile().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::HeightField;

    fn pit_5x5() -> Vec<f32> {
        let mut heights = vec![1.0; 25];
        heights[12] = 0.0;
        heights
    }

    /// 11x11 cones at (3,5) and (7,5); the right one is deeper. The ridge
    /// between them bottoms out at (5,5), below every edge cell.
    fn twin_pits() -> Vec<f32> {
        let res = 11;
        let mut heights = vec![0.0; res * res];
        for z in 0..res {
            for x in 0..res {
                let dz = (z as f32 - 5.0).powi(2);
                let left = ((x as f32 - 3.0).powi(2) + dz).sqrt();
                let right = ((x as f32 - 7.0).powi(2) + dz).sqrt();
                heights[z * res + x] = 0.1 + 0.05 * left.min(right);
            }
        }
        heights[5 * res + 7] = 0.05;
        heights
    }

    fn noisy(res: usize) -> Vec<f32> {
        (0..res * res)
            .map(|i| {
                let v = (i as f32 * 12.9898).sin() * 43758.547;
                v - v.floor()
            })
            .collect()
    }

    #[test]
    fn test_single_pit_example() {
        let heights = pit_5x5();
        let field = HeightField::new(5, &heights).unwrap();
        let hierarchy = PoolHierarchy::solve(&field);

        assert_eq!(hierarchy.catchments.minima, vec![12]);
        assert!(hierarchy
            .catchments
            .owner
            .iter()
            .all(|o| *o == CatchmentOwner::Minimum(12)));

        let pool = hierarchy.pool(PoolKey::first_order(12)).unwrap();
        assert_eq!(pool.drain_height, 1.0);
        assert!((pool.capacity - 1.0).abs() < 1e-6);
        assert_eq!(hierarchy.drain_to_minima[&PoolKey::new(pool.index_drain, 1, 0)], vec![12]);
        assert_eq!(hierarchy.roots(), &[PoolKey::first_order(12)]);
    }

    #[test]
    fn test_twin_pits_merge_at_the_ridge() {
        let heights = twin_pits();
        let field = HeightField::new(11, &heights).unwrap();
        let hierarchy = PoolHierarchy::solve(&field);
        let left = field.idx(3, 5);
        let right = field.idx(7, 5);
        let ridge = field.idx(5, 5);

        assert_eq!(hierarchy.drain_keys[&left], PoolKey::new(ridge, 1, 0));
        assert_eq!(hierarchy.drain_keys[&right], PoolKey::new(ridge, 1, 0));
        let mut through_ridge = hierarchy.drain_to_minima[&PoolKey::new(ridge, 1, 0)].clone();
        through_ridge.sort();
        assert_eq!(through_ridge, vec![left, right]);

        let parent_key = PoolKey::new(right, 2, 0);
        assert_eq!(hierarchy.pool_count(), 3);
        assert_eq!(hierarchy.roots(), &[parent_key]);

        let parent = hierarchy.pool(parent_key).unwrap();
        assert_eq!(parent.peer_count(), 2);
        assert!(parent.has_peer(PoolKey::first_order(left)));
        assert!(parent.drain_height > heights[ridge]);

        for m in [left, right] {
            let child = hierarchy.pool(PoolKey::first_order(m)).unwrap();
            assert_eq!(child.superceded_by, parent_key);
            assert!(child.capacity > 0.0);
        }
        let children: f32 = [left, right]
            .iter()
            .map(|&m| hierarchy.pool(PoolKey::first_order(m)).unwrap().capacity)
            .sum();
        assert!(parent.capacity > children);
        assert!(parent.min_volume >= 0.0 && parent.min_volume <= parent.capacity);
    }

    #[test]
    fn test_add_volume_spills_to_sibling_then_parent() {
        let heights = twin_pits();
        let field = HeightField::new(11, &heights).unwrap();
        let mut hierarchy = PoolHierarchy::solve(&field);
        let left = field.idx(3, 5);
        let right = field.idx(7, 5);
        let left_key = PoolKey::first_order(left);
        let right_key = PoolKey::first_order(right);
        let left_cap = hierarchy.pool(left_key).unwrap().capacity;

        assert_eq!(hierarchy.add_volume(left, left_cap * 0.5), 0.0);
        assert_eq!(hierarchy.roll_up_to_current(left_key), left_key);
        let surface = hierarchy.surface_height(left).unwrap();
        assert!(surface > heights[left] && surface < heights[field.idx(5, 5)]);

        assert_eq!(hierarchy.add_volume(left, left_cap), 0.0);
        assert!(hierarchy.pool(left_key).unwrap().is_full());
        assert!(hierarchy.pool(right_key).unwrap().volume > 0.0);

        let overflow = hierarchy.add_volume(right, 1.0e3);
        assert!(overflow > 0.0);
        let parent_key = PoolKey::new(right, 2, 0);
        assert_eq!(hierarchy.roll_up_to_current(left_key), parent_key);
        assert!(hierarchy.pool(parent_key).unwrap().is_full());
        assert!(hierarchy.water_depth(field.idx(5, 5)) > 0.0);
    }

    #[test]
    fn test_apply_updates_matches_add_volume() {
        let heights = twin_pits();
        let field = HeightField::new(11, &heights).unwrap();
        let left = field.idx(3, 5);
        let right = field.idx(7, 5);
        let left_key = PoolKey::first_order(left);
        let right_key = PoolKey::first_order(right);

        let mut batched = PoolHierarchy::solve(&field);
        let mut single = batched.clone();
        let cap = batched.pool(left_key).unwrap().capacity;

        let overflow = batched.apply_updates(&[(left_key, cap * 1.5), (right_key, 0.01)]);
        assert_eq!(overflow, 0.0);
        single.add_volume(left, cap * 1.5);
        single.add_volume(right, 0.01);
        for key in [left_key, right_key, PoolKey::new(right, 2, 0)] {
            let a = batched.pool(key).unwrap().volume;
            let b = single.pool(key).unwrap().volume;
            assert!((a - b).abs() < 1e-6, "{key}: {a} vs {b}");
        }

        batched.apply_updates(&[(left_key, -1.0e3)]);
        assert!(batched.pool(left_key).unwrap().volume >= 0.0);
        assert_eq!(batched.apply_updates(&[(PoolKey::first_order(0), 2.0)]), 2.0);
    }

    #[test]
    fn test_draw_pools_fills_the_basin_below_its_surface() {
        let heights = twin_pits();
        let mut tile = Tile::from_heights(11, heights.clone()).unwrap();
        let mut hierarchy = PoolHierarchy::solve(&tile);
        let left = tile.idx(3, 5);
        let right = tile.idx(7, 5);
        let ridge = tile.idx(5, 5);
        let cap = hierarchy.pool(PoolKey::first_order(left)).unwrap().capacity;

        hierarchy.add_volume(left, cap * 0.5);
        hierarchy.draw_pools(&mut tile);
        assert!(tile.pool[left] > 0.0);
        assert_eq!(tile.pool[right], 0.0);
        assert_eq!(tile.pool[ridge], 0.0);
        let surface = hierarchy.surface_height(left).unwrap();
        assert!((tile.pool[left] + heights[left] - surface).abs() < 1e-6);
        for (i, &depth) in tile.pool.iter().enumerate() {
            assert!(depth >= 0.0);
            if depth > 0.0 {
                assert_eq!(hierarchy.catchments.owner(i).minimum(), Some(left));
            }
        }
    }

    #[test]
    fn test_settle_gathers_scattered_water_into_the_pit() {
        let mut tile = Tile::from_heights(5, pit_5x5()).unwrap();
        let a = tile.idx(1, 1);
        let b = tile.idx(3, 2);
        tile.pool[a] = 0.2;
        tile.pool[b] = 0.2;
        let mut hierarchy = PoolHierarchy::solve(&tile);
        let overflow = hierarchy.settle(&mut tile);

        assert_eq!(overflow, 0.0);
        let volume = hierarchy.pool(PoolKey::first_order(12)).unwrap().volume;
        assert!((volume - 0.4).abs() < 1e-6);
        assert!(tile.pool[12] > 0.0);
        assert_eq!(tile.pool[tile.idx(1, 1)], 0.0);
        assert_eq!(tile.pool[tile.idx(3, 2)], 0.0);
    }

    #[test]
    fn test_inspect_reports_chain_and_peers() {
        let heights = twin_pits();
        let field = HeightField::new(11, &heights).unwrap();
        let hierarchy = PoolHierarchy::solve(&field);
        let left = field.idx(3, 5);
        let right = field.idx(7, 5);

        let view = hierarchy.inspect(3, 5);
        assert_eq!(view.owner, CatchmentOwner::Minimum(left));
        assert_eq!(view.chain, vec![PoolKey::first_order(left), PoolKey::new(right, 2, 0)]);
        assert!(view.peers.contains(&PoolKey::first_order(right)));

        // out-of-range coordinates clamp into the tile
        assert_eq!(hierarchy.inspect(-4, 99).cell, field.idx(0, 10));
    }

    #[test]
    fn test_noisy_tile_hierarchy_invariants() {
        let res = 24;
        let heights = noisy(res);
        let field = HeightField::new(res, &heights).unwrap();
        let hierarchy = PoolHierarchy::solve(&field);
        assert!(hierarchy.summary().minima > 1);

        for pool in hierarchy.pools() {
            assert!(pool.capacity >= 0.0);
            let chain = hierarchy.chain(pool.key);
            assert!(chain.len() <= hierarchy.summary().minima.max(1));
            let root = *chain.last().unwrap();
            assert!(hierarchy.roots().contains(&root));
            for pair in chain.windows(2) {
                let child = hierarchy.pool(pair[0]).unwrap();
                let parent = hierarchy.pool(pair[1]).unwrap();
                assert!(parent.order > child.order);
                assert!(parent.has_peer(child.key));
            }
            let mut last = f32::MIN;
            for i in 0..=20 {
                let h = pool.estimate_height(pool.capacity * i as f32 / 20.0);
                assert!(h >= last);
                last = h;
            }
        }
        for &root in hierarchy.roots() {
            assert!(!hierarchy.pool(root).unwrap().has_parent());
        }
    }
}
