//! Pool records and the volume -> water-surface regression.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Volume assigned to the lowest member so `ln(v + 1)` stays defined.
const FIRST_VOLUME: f64 = 1e-7;
const EPSILON: f64 = 1e-12;

/// Identifies one basin instance anchored at a minimum cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PoolKey {
    pub idx: i32,
    pub order: u8,
    pub n: u8,
}

impl PoolKey {
    pub const NONE: PoolKey = PoolKey {
        idx: -1,
        order: 0,
        n: 0,
    };

    pub fn new(idx: usize, order: u8, n: u8) -> Self {
        Self {
            idx: idx as i32,
            order,
            n,
        }
    }

    /// Key of the first basin that forms at `minimum`.
    pub fn first_order(minimum: usize) -> Self {
        Self::new(minimum, 1, 0)
    }

    pub fn is_none(&self) -> bool {
        self.idx < 0
    }

    pub fn cell(&self) -> Option<usize> {
        (!self.is_none()).then_some(self.idx as usize)
    }
}

impl Default for PoolKey {
    fn default() -> Self {
        Self::NONE
    }
}

impl fmt::Display for PoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "-")
        } else {
            write!(f, "{}:{}.{}", self.idx, self.order, self.n)
        }
    }
}

/// A basin and its fill state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pool {
    pub key: PoolKey,
    pub index_minima: usize,
    pub minima_height: f32,
    pub index_drain: usize,
    pub drain_height: f32,
    pub order: u8,
    peers: [PoolKey; 3],
    /// Parent pool, or [`PoolKey::NONE`] for a root.
    pub superceded_by: PoolKey,
    pub member_count: usize,
    /// Volume at which the surface reaches the drain.
    pub capacity: f32,
    pub volume: f32,
    /// Volume below which the constituents of a merged pool are not yet full.
    pub min_volume: f32,
    /// Regression intercept.
    pub b1: f32,
    /// Regression slope against `ln(volume + 1)`.
    pub b2: f32,
}

impl Pool {
    pub fn new(key: PoolKey, minimum: usize, minima_height: f32, drain: usize, drain_height: f32) -> Self {
        Self {
            key,
            index_minima: minimum,
            minima_height,
            index_drain: drain,
            drain_height,
            order: key.order,
            peers: [PoolKey::NONE; 3],
            superceded_by: PoolKey::NONE,
            member_count: 0,
            capacity: 0.0,
            volume: 0.0,
            min_volume: 0.0,
            b1: drain_height,
            b2: 0.0,
        }
    }

    /// Computes capacity and fits the surface model from member heights.
    ///
    /// Only members at or below the drain count. The fit is pinned so a full
    /// pool reports exactly the drain height.
    pub fn solve(&mut self, member_heights: &[f32]) {
        let drain = self.drain_height as f64;
        let mut heights: Vec<f64> = member_heights
            .iter()
            .map(|&h| h as f64)
            .filter(|&h| h <= drain)
            .collect();
        heights.sort_by(|a, b| a.total_cmp(b));
        self.member_count = heights.len();

        let capacity: f64 = heights.iter().map(|h| drain - h).sum();
        self.capacity = capacity as f32;

        let mut xs = Vec::with_capacity(heights.len() + 1);
        let mut ys = Vec::with_capacity(heights.len() + 1);
        let mut volume = FIRST_VOLUME;
        for (i, &h) in heights.iter().enumerate() {
            if i > 0 {
                volume += (h - heights[i - 1]) * i as f64;
            }
            xs.push((volume + 1.0).ln());
            ys.push(h);
        }
        let full_x = (capacity + 1.0).ln();
        xs.push(full_x);
        ys.push(drain);

        let n = xs.len() as f64;
        let mean_x = xs.iter().sum::<f64>() / n;
        let mean_y = ys.iter().sum::<f64>() / n;
        let mut sxx = 0.0;
        let mut sxy = 0.0;
        for (x, y) in xs.iter().zip(&ys) {
            sxx += (x - mean_x) * (x - mean_x);
            sxy += (x - mean_x) * (y - mean_y);
        }
        let b2 = if sxx.abs() < EPSILON {
            0.0
        } else {
            (sxy / sxx).max(0.0)
        };
        self.b2 = b2 as f32;
        self.b1 = (drain - b2 * full_x) as f32;
    }

    /// Water-surface height at `volume`, kept between the minimum and the drain.
    pub fn estimate_height(&self, volume: f32) -> f32 {
        let x = (volume.max(0.0) + 1.0).ln();
        (self.b1 + self.b2 * x)
            .max(self.minima_height)
            .min(self.drain_height)
    }

    /// Current surface height.
    pub fn surface_height(&self) -> f32 {
        self.estimate_height(self.volume)
    }

    /// Depth of water over ground at `ground_height`.
    pub fn water_depth(&self, ground_height: f32) -> f32 {
        if self.volume <= 0.0 {
            return 0.0;
        }
        (self.surface_height() - ground_height).max(0.0)
    }

    /// Records the volume at which the surface reaches `confluence`.
    pub fn set_minimum_volume(&mut self, confluence: f32) {
        self.min_volume = if self.b2.abs() < 1e-9 {
            if confluence >= self.b1 {
                self.capacity
            } else {
                0.0
            }
        } else {
            ((confluence - self.b1) / self.b2).exp() - 1.0
        }
        .max(0.0)
        .min(self.capacity);
    }

    pub fn is_full(&self) -> bool {
        self.volume >= self.capacity - 1e-7
    }

    pub fn has_parent(&self) -> bool {
        !self.superceded_by.is_none()
    }

    /// Adds a peer, returning false when already present or all three slots are taken.
    pub fn add_peer(&mut self, key: PoolKey) -> bool {
        if key.is_none() || self.has_peer(key) {
            return false;
        }
        match self.peers.iter_mut().find(|p| p.is_none()) {
            Some(slot) => {
                *slot = key;
                true
            }
            None => false,
        }
    }

    pub fn get_peer(&self, i: usize) -> Option<PoolKey> {
        self.peers.get(i).copied().filter(|p| !p.is_none())
    }

    pub fn peer_count(&self) -> usize {
        self.peers.iter().filter(|p| !p.is_none()).count()
    }

    pub fn has_peer(&self, key: PoolKey) -> bool {
        self.peers.contains(&key)
    }

    pub fn peers(&self) -> impl Iterator<Item = PoolKey> + '_ {
        self.peers.iter().copied().filter(|p| !p.is_none())
    }
}
