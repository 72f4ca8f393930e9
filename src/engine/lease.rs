use crate::telemetry::logging;
use crate::world::grid::Host;
use crate::world::position::BoundingBox;
use crate::world::region::{RegionId, RegionLayout};
use std::collections::{HashMap, HashSet};

/// A pinned region and the number of jobs holding it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLease {
    pub region: RegionId,
    pub refcount: u32,
}

/// The regions one job holds. Only `RegionLeaseManager::release` consumes it,
/// so a set cannot be released twice.
#[derive(Debug, Default)]
#[must_use = "leases must be released through RegionLeaseManager::release"]
pub struct LeaseSet {
    regions: HashSet<RegionId>,
}

impl LeaseSet {
    pub fn contains(&self, region: RegionId) -> bool {
        self.regions.contains(&region)
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

/// Reference-counted residency pins over grid regions.
#[derive(Debug)]
pub struct RegionLeaseManager {
    layout: RegionLayout,
    grid: BoundingBox,
    leases: HashMap<RegionId, RegionLease>,
}

impl RegionLeaseManager {
    pub fn new(layout: RegionLayout, grid: BoundingBox) -> Self {
        RegionLeaseManager {
            layout,
            grid,
            leases: HashMap::new(),
        }
    }

    pub fn check(&self, region: RegionId) -> Result<(), LeaseError> {
        if self.layout.region_bounds(region).intersects(&self.grid) {
            Ok(())
        } else {
            Err(LeaseError::OutsideGrid(region))
        }
    }

    /// Counts one reference per distinct region in `regions`. The host is asked
    /// to keep a region resident when its count leaves zero. Regions outside the
    /// grid are logged and left out of the returned set.
    pub fn acquire<H: Host + ?Sized>(&mut self, host: &mut H, regions: &[RegionId]) -> LeaseSet {
        let mut set = LeaseSet::default();
        for &region in regions {
            if set.regions.contains(&region) {
                continue;
            }
            if let Err(err) = self.check(region) {
                logging::log_error(&format!("lease skipped: {}", err));
                continue;
            }
            let lease = self.leases.entry(region).or_insert(RegionLease {
                region,
                refcount: 0,
            });
            lease.refcount += 1;
            if lease.refcount == 1 {
                host.mark_resident(region);
            }
            set.regions.insert(region);
        }
        set
    }

    pub fn release<H: Host + ?Sized>(&mut self, host: &mut H, set: LeaseSet) {
        for region in set.regions {
            let Some(lease) = self.leases.get_mut(&region) else {
                logging::log_error(&format!("release of unleased {}", region));
                continue;
            };
            lease.refcount -= 1;
            if lease.refcount == 0 {
                self.leases.remove(&region);
                host.unmark_resident(region);
            }
        }
    }

    pub fn refcount(&self, region: RegionId) -> u32 {
        self.leases.get(&region).map_or(0, |lease| lease.refcount)
    }

    /// Number of regions currently pinned.
    pub fn len(&self) -> usize {
        self.leases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    pub fn leases(&self) -> impl Iterator<Item = &RegionLease> {
        self.leases.values()
    }
}

/// Errors that can occur while leasing regions
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseError {
    OutsideGrid(RegionId),
}

impl std::fmt::Display for LeaseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LeaseError::OutsideGrid(region) => write!(f, "{} is outside the addressable grid", region),
        }
    }
}

impl std::error::Error for LeaseError {}
