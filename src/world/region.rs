use crate::world::position::{BoundingBox, Position};

pub const DEFAULT_REGION_EDGE: i32 = 16;

/// Coordinates of a coarse cubic region of the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionId {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl RegionId {
    pub fn new(x: i32, y: i32, z: i32) -> Self {
        RegionId { x, y, z }
    }
}

impl std::fmt::Display for RegionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "region {}/{}/{}", self.x, self.y, self.z)
    }
}

/// Maps cells onto regions of `edge`³ cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    edge: i32,
}

impl RegionLayout {
    pub fn new(edge: i32) -> Self {
        RegionLayout { edge: edge.max(1) }
    }

    pub fn edge(&self) -> i32 {
        self.edge
    }

    pub fn region_of(&self, position: Position) -> RegionId {
        RegionId {
            x: position.x.div_euclid(self.edge),
            y: position.y.div_euclid(self.edge),
            z: position.z.div_euclid(self.edge),
        }
    }

    /// Cell extent of a region. Saturates at the edge of the `i32` range.
    pub fn region_bounds(&self, region: RegionId) -> BoundingBox {
        let lo = |c: i32| i64::from(c) * i64::from(self.edge);
        let clamp = |v: i64| v.clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32;
        BoundingBox {
            min: Position::new(clamp(lo(region.x)), clamp(lo(region.y)), clamp(lo(region.z))),
            max: Position::new(
                clamp(lo(region.x) + i64::from(self.edge) - 1),
                clamp(lo(region.y) + i64::from(self.edge) - 1),
                clamp(lo(region.z) + i64::from(self.edge) - 1),
            ),
        }
    }

    /// Every region overlapping `bounds`, i.e. the box rounded outward to whole regions.
    pub fn regions_covering(&self, bounds: &BoundingBox) -> Vec<RegionId> {
        let min = self.region_of(bounds.min);
        let max = self.region_of(bounds.max);
        let mut regions = Vec::new();
        for y in min.y..=max.y {
            for z in min.z..=max.z {
                for x in min.x..=max.x {
                    regions.push(RegionId { x, y, z });
                }
            }
        }
        regions
    }
}

impl Default for RegionLayout {
    fn default() -> Self {
        Self::new(DEFAULT_REGION_EDGE)
    }
}
