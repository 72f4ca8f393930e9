use crate::world::position::Position;
use crate::world::region::{RegionId, RegionLayout};
use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Opaque per-cell state token. `CellState(0)` is the conventional empty value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellState(pub u32);

impl CellState {
    pub const EMPTY: CellState = CellState(0);
}

/// The surface the host runtime provides to the engine.
///
/// All methods are called from the mutation thread only.
pub trait Host {
    fn is_region_resident(&self, region: RegionId) -> bool;
    /// Keep `region` resident until `unmark_resident`. Idempotent.
    fn mark_resident(&mut self, region: RegionId);
    fn unmark_resident(&mut self, region: RegionId);
    fn read_cell(&mut self, position: Position) -> CellState;
    fn write_cell(&mut self, position: Position, state: CellState);
    /// Live load metric, e.g. measured ticks per second.
    fn sample_load_metric(&mut self) -> f64;
}

type RegionCells = HashMap<Position, CellState>;

/// Grid statistics
#[derive(Debug, Clone, Default)]
pub struct GridStats {
    pub reads: u64,
    pub writes: u64,
    pub loads: u64,
    pub evictions: u64,
}

/// In-process host: sparse cells per region, residency tracked as an LRU of
/// resident regions. Pinned regions are never chosen for eviction; evicted
/// regions keep their cells in cold storage and reload on the next access.
pub struct MemoryGrid {
    layout: RegionLayout,
    capacity: usize,
    resident: LruCache<RegionId, RegionCells>,
    cold: HashMap<RegionId, RegionCells>,
    pinned: HashSet<RegionId>,
    load: f64,
    stats: GridStats,
}

impl MemoryGrid {
    pub fn new(layout: RegionLayout, capacity: usize) -> Self {
        MemoryGrid {
            layout,
            capacity: capacity.max(1),
            resident: LruCache::unbounded(),
            cold: HashMap::new(),
            pinned: HashSet::new(),
            load: 20.0,
            stats: GridStats::default(),
        }
    }

    pub fn layout(&self) -> RegionLayout {
        self.layout
    }

    pub fn set_load(&mut self, load: f64) {
        self.load = load;
    }

    pub fn stats(&self) -> &GridStats {
        &self.stats
    }

    pub fn resident_count(&self) -> usize {
        self.resident.len()
    }

    pub fn is_pinned(&self, region: RegionId) -> bool {
        self.pinned.contains(&region)
    }

    /// Cell value without touching residency or statistics.
    pub fn peek(&self, position: Position) -> CellState {
        let region = self.layout.region_of(position);
        self.resident
            .peek(&region)
            .or_else(|| self.cold.get(&region))
            .and_then(|cells| cells.get(&position))
            .copied()
            .unwrap_or(CellState::EMPTY)
    }

    /// Number of non-empty cells, resident or cold.
    pub fn occupied(&self) -> usize {
        self.resident.iter().map(|(_, cells)| cells.len()).sum::<usize>()
            + self.cold.values().map(|cells| cells.len()).sum::<usize>()
    }

    /// Evict a region regardless of pins, as a misbehaving host would.
    pub fn force_evict(&mut self, region: RegionId) {
        if let Some(cells) = self.resident.pop(&region) {
            self.cold.insert(region, cells);
            self.stats.evictions += 1;
        }
    }

    fn load_region(&mut self, region: RegionId) {
        if self.resident.get(&region).is_some() {
            return;
        }
        let cells = self.cold.remove(&region).unwrap_or_default();
        self.resident.put(region, cells);
        self.stats.loads += 1;
        self.evict_excess(Some(region));
    }

    fn evict_excess(&mut self, keep: Option<RegionId>) {
        while self.resident.len() > self.capacity {
            let victim = self
                .resident
                .iter()
                .rev()
                .map(|(region, _)| *region)
                .find(|region| !self.pinned.contains(region) && Some(*region) != keep);
            let Some(victim) = victim else {
                break;
            };
            if let Some(cells) = self.resident.pop(&victim) {
                self.cold.insert(victim, cells);
                self.stats.evictions += 1;
            }
        }
    }
}

impl Host for MemoryGrid {
    fn is_region_resident(&self, region: RegionId) -> bool {
        self.resident.contains(&region)
    }

    fn mark_resident(&mut self, region: RegionId) {
        self.pinned.insert(region);
        self.load_region(region);
    }

    fn unmark_resident(&mut self, region: RegionId) {
        self.pinned.remove(&region);
        self.evict_excess(None);
    }

    fn read_cell(&mut self, position: Position) -> CellState {
        let region = self.layout.region_of(position);
        self.load_region(region);
        self.stats.reads += 1;
        self.resident
            .peek(&region)
            .and_then(|cells| cells.get(&position))
            .copied()
            .unwrap_or(CellState::EMPTY)
    }

    fn write_cell(&mut self, position: Position, state: CellState) {
        let region = self.layout.region_of(position);
        self.load_region(region);
        if let Some(cells) = self.resident.get_mut(&region) {
            if state == CellState::EMPTY {
                cells.remove(&position);
            } else {
                cells.insert(position, state);
            }
            self.stats.writes += 1;
        }
    }

    fn sample_load_metric(&mut self) -> f64 {
        self.load
    }
}
