//! Static neighbor tables, the downhill bitmask and particle headings.

use std::fmt;

use glam::{IVec2, Vec2};
use serde::{Deserialize, Serialize};

/// Eight-neighbor offsets in bitmask order. Opposing directions sit in adjacent
/// slots, so `d ^ 1` is the direction pointing back.
pub const NEIGHBORS_8: [IVec2; 8] = [
    IVec2::new(-1, 1),  // NW
    IVec2::new(1, -1),  // SE
    IVec2::new(0, 1),   // N
    IVec2::new(0, -1),  // S
    IVec2::new(1, 1),   // NE
    IVec2::new(-1, -1), // SW
    IVec2::new(1, 0),   // E
    IVec2::new(-1, 0),  // W
];

/// Four-neighbor offsets: up, right, down, left.
pub const NEIGHBORS_4: [IVec2; 4] = [
    IVec2::new(0, 1),
    IVec2::new(1, 0),
    IVec2::new(0, -1),
    IVec2::new(-1, 0),
];

/// Slot of the direction opposite to `d` in [`NEIGHBORS_8`].
#[inline]
pub const fn opposite(d: usize) -> usize {
    d ^ 1
}

/// Per-cell mask of neighbors that are strictly lower or off the tile.
///
/// Bit `d` refers to `NEIGHBORS_8[d]`. An empty mask marks a local minimum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Cardinal(pub u8);

impl Cardinal {
    pub const NONE: Cardinal = Cardinal(0);
    pub const ALL: Cardinal = Cardinal(0xFF);
    pub const NW: Cardinal = Cardinal(1 << 0);
    pub const SE: Cardinal = Cardinal(1 << 1);
    pub const N: Cardinal = Cardinal(1 << 2);
    pub const S: Cardinal = Cardinal(1 << 3);
    pub const NE: Cardinal = Cardinal(1 << 4);
    pub const SW: Cardinal = Cardinal(1 << 5);
    pub const E: Cardinal = Cardinal(1 << 6);
    pub const W: Cardinal = Cardinal(1 << 7);

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub fn contains(self, d: usize) -> bool {
        self.0 & (1 << d) != 0
    }

    #[inline]
    pub fn with(self, d: usize) -> Cardinal {
        Cardinal(self.0 | (1 << d))
    }

    /// Clears bit `d`, reporting whether it was set.
    #[inline]
    pub fn prune(&mut self, d: usize) -> bool {
        let had = self.contains(d);
        self.0 &= !(1 << d);
        had
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }
}

/// Compass heading of a moving particle, packed as N/S/E/W bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum Heading {
    #[default]
    None = 0b0000,
    N = 0b0001,
    S = 0b0010,
    E = 0b0100,
    W = 0b1000,
    NE = 0b0101,
    NW = 0b1001,
    SE = 0b0110,
    SW = 0b1010,
}

impl Heading {
    /// Heading from the signs of a direction vector. Zero components contribute nothing.
    pub fn from_vec2(dir: Vec2) -> Heading {
        let ew = if dir.x > 0.0 {
            1
        } else if dir.x < 0.0 {
            -1
        } else {
            0
        };
        let ns = if dir.y > 0.0 {
            1
        } else if dir.y < 0.0 {
            -1
        } else {
            0
        };
        Self::from_ivec2(IVec2::new(ew, ns))
    }

    pub fn from_ivec2(dir: IVec2) -> Heading {
        match (dir.x.signum(), dir.y.signum()) {
            (0, 1) => Heading::N,
            (0, -1) => Heading::S,
            (1, 0) => Heading::E,
            (-1, 0) => Heading::W,
            (1, 1) => Heading::NE,
            (-1, 1) => Heading::NW,
            (1, -1) => Heading::SE,
            (-1, -1) => Heading::SW,
            _ => Heading::None,
        }
    }

    /// Unit grid step, `x` east and `y` north.
    pub fn to_ivec2(self) -> IVec2 {
        let b = self as u8;
        let x = if b & Heading::E as u8 != 0 {
            1
        } else if b & Heading::W as u8 != 0 {
            -1
        } else {
            0
        };
        let z = if b & Heading::N as u8 != 0 {
            1
        } else if b & Heading::S as u8 != 0 {
            -1
        } else {
            0
        };
        IVec2::new(x, z)
    }

    /// Slot of this heading in [`NEIGHBORS_8`].
    pub fn neighbor_slot(self) -> Option<usize> {
        let step = self.to_ivec2();
        NEIGHBORS_8.iter().position(|&n| n == step)
    }

    /// The two perpendicular steps.
    pub fn orthogonal(self) -> (IVec2, IVec2) {
        match self {
            Heading::None | Heading::N | Heading::S => (IVec2::new(1, 0), IVec2::new(-1, 0)),
            Heading::E | Heading::W => (IVec2::new(0, 1), IVec2::new(0, -1)),
            Heading::NW | Heading::SE => (IVec2::new(1, 1), IVec2::new(-1, -1)),
            Heading::NE | Heading::SW => (IVec2::new(1, -1), IVec2::new(-1, 1)),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Heading::None => "NONE",
            Heading::N => "N",
            Heading::S => "S",
            Heading::E => "E",
            Heading::W => "W",
            Heading::NE => "NE",
            Heading::NW => "NW",
            Heading::SE => "SE",
            Heading::SW => "SW",
        }
    }
}

impl fmt::Display for Heading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opposite_slots_point_back() {
        for d in 0..8 {
            assert_eq!(NEIGHBORS_8[d] + NEIGHBORS_8[opposite(d)], IVec2::ZERO);
        }
    }

    #[test]
    fn test_cardinal_prune() {
        let mut mask = Cardinal::NONE.with(2).with(6);
        assert_eq!(mask.count(), 2);
        assert!(mask.prune(2));
        assert!(!mask.prune(2));
        assert!(mask.contains(6));
        assert!(mask.prune(6));
        assert!(mask.is_empty());
    }

    #[test]
    fn test_heading_from_vec2_uses_signs() {
        assert_eq!(Heading::from_vec2(Vec2::new(0.3, 0.9)), Heading::NE);
        assert_eq!(Heading::from_vec2(Vec2::new(-0.1, 0.0)), Heading::W);
        assert_eq!(Heading::from_vec2(Vec2::new(0.0, -2.0)), Heading::S);
        assert_eq!(Heading::from_vec2(Vec2::ZERO), Heading::None);
    }

    #[test]
    fn test_heading_round_trips_through_slots() {
        for (slot, &step) in NEIGHBORS_8.iter().enumerate() {
            let heading = Heading::from_ivec2(step);
            assert_eq!(heading.to_ivec2(), step);
            assert_eq!(heading.neighbor_slot(), Some(slot));
        }
        assert_eq!(Heading::None.neighbor_slot(), None);
    }

    #[test]
    fn test_orthogonal_is_perpendicular() {
        for heading in [Heading::N, Heading::E, Heading::NE, Heading::SW] {
            let step = heading.to_ivec2();
            let (a, b) = heading.orthogonal();
            assert_eq!(step.dot(a), 0);
            assert_eq!(a + b, IVec2::ZERO);
        }
    }
}
