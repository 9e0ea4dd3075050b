//! Named tile buffers and the lock registry shared with external consumers.
//!
//! A buffer is locked from the moment the task producing it is scheduled
//! until that task completes. Consumers poll and skip; nothing here blocks
//! beyond the registry's own short critical sections.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

/// Tile coordinate within the terrain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TileId {
    pub x: i32,
    pub z: i32,
}

impl TileId {
    pub fn new(x: i32, z: i32) -> Self {
        Self { x, z }
    }
}

/// Buffers a tile simulation reads or produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferAlias {
    TerrainHeight,
    WatermapPool,
    WatermapStream,
    ParticleTrack,
    Plants,
    BoundaryBm,
    BoundaryMb,
    DrainToMinima,
    Catchment,
    Pools,
}

impl BufferAlias {
    pub const ALL: [BufferAlias; 10] = [
        BufferAlias::TerrainHeight,
        BufferAlias::WatermapPool,
        BufferAlias::WatermapStream,
        BufferAlias::ParticleTrack,
        BufferAlias::Plants,
        BufferAlias::BoundaryBm,
        BufferAlias::BoundaryMb,
        BufferAlias::DrainToMinima,
        BufferAlias::Catchment,
        BufferAlias::Pools,
    ];

    /// Buffers written by an erosion run.
    pub const PRODUCED: [BufferAlias; 8] = [
        BufferAlias::TerrainHeight,
        BufferAlias::WatermapPool,
        BufferAlias::WatermapStream,
        BufferAlias::ParticleTrack,
        BufferAlias::BoundaryBm,
        BufferAlias::BoundaryMb,
        BufferAlias::DrainToMinima,
        BufferAlias::Catchment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BufferAlias::TerrainHeight => "TERRAIN_HEIGHT",
            BufferAlias::WatermapPool => "PARTERO_WATERMAP_POOL",
            BufferAlias::WatermapStream => "PARTERO_WATERMAP_STREAM",
            BufferAlias::ParticleTrack => "PARTERO_PARTICLE_TRACK",
            BufferAlias::Plants => "PARTERO_PLANTS",
            BufferAlias::BoundaryBm => "PARTERO_BOUNDARY_BM",
            BufferAlias::BoundaryMb => "PARTERO_BOUNDARY_MB",
            BufferAlias::DrainToMinima => "PARTERO_DRAIN_TO_MINIMA",
            BufferAlias::Catchment => "PARTERO_CATCHMENT",
            BufferAlias::Pools => "PARTERO_POOLS",
        }
    }
}

impl fmt::Display for BufferAlias {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `{x}_{z}__{resolution}__{ALIAS}`
pub fn buffer_name(tile: TileId, resolution: usize, alias: BufferAlias) -> String {
    format!("{}_{}__{}__{}", tile.x, tile.z, resolution, alias)
}

/// Whether a set of buffers can be consumed right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Pending {
        locked: Vec<String>,
        missing: Vec<String>,
    },
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

/// Proof that one buffer was locked by this holder.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockToken {
    pub name: String,
    pub id: u64,
}

#[derive(Debug, Default)]
struct LockState {
    registered: HashSet<String>,
    locked: HashMap<String, u64>,
    next_id: u64,
}

/// Shared registry of buffer names and their lock holders.
#[derive(Debug, Clone, Default)]
pub struct BufferLocks {
    state: Arc<Mutex<LockState>>,
}

impl BufferLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, LockState> {
        // A panicking holder leaves the maps consistent, so poisoning is ignored.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Marks `name` as allocated.
    pub fn register(&self, name: impl Into<String>) {
        self.state().registered.insert(name.into());
    }

    /// Forgets `name`, e.g. when its tile is torn down or resized.
    pub fn unregister(&self, name: &str) {
        let mut state = self.state();
        state.registered.remove(name);
        state.locked.remove(name);
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.state().registered.contains(name)
    }

    pub fn is_locked(&self, name: &str) -> bool {
        self.state().locked.contains_key(name)
    }

    pub fn readiness<S: AsRef<str>>(&self, names: &[S]) -> Readiness {
        let state = self.state();
        let mut locked = Vec::new();
        let mut missing = Vec::new();
        for name in names {
            let name = name.as_ref();
            if !state.registered.contains(name) {
                missing.push(name.to_string());
            } else if state.locked.contains_key(name) {
                locked.push(name.to_string());
            }
        }
        if locked.is_empty() && missing.is_empty() {
            Readiness::Ready
        } else {
            Readiness::Pending { locked, missing }
        }
    }

    /// Locks every name or none of them. Unregistered names are registered.
    pub fn try_lock<S: AsRef<str>>(&self, names: &[S]) -> Option<LockGuard> {
        let mut state = self.state();
        if names.iter().any(|n| state.locked.contains_key(n.as_ref())) {
            return None;
        }
        let mut tokens = Vec::with_capacity(names.len());
        for name in names {
            let name = name.as_ref().to_string();
            let id = state.next_id;
            state.next_id += 1;
            state.registered.insert(name.clone());
            state.locked.insert(name.clone(), id);
            tokens.push(LockToken { name, id });
        }
        Some(LockGuard {
            locks: self.clone(),
            tokens,
        })
    }

    fn release(&self, token: &LockToken) {
        let mut state = self.state();
        if state.locked.get(&token.name) == Some(&token.id) {
            state.locked.remove(&token.name);
        }
    }
}

/// Holds a set of locks and releases them on drop.
#[derive(Debug)]
pub struct LockGuard {
    locks: BufferLocks,
    tokens: Vec<LockToken>,
}

impl LockGuard {
    pub fn tokens(&self) -> &[LockToken] {
        &self.tokens
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        for token in &self.tokens {
            self.locks.release(token);
        }
    }
}
