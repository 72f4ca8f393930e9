use serde::{Deserialize, Serialize};

/// Absolute or template-local cell coordinate. Serialized as `[x, y, z]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "[i32; 3]", into = "[i32; 3]")]
pub struct Position {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PositionDelta {
    pub dx: i32,
    pub dy: i32,
    pub dz: i32,
}

impl Position {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    pub fn offset(self, delta: PositionDelta) -> Option<Self> {
        Some(Self {
            x: self.x.checked_add(delta.dx)?,
            y: self.y.checked_add(delta.dy)?,
            z: self.z.checked_add(delta.dz)?,
        })
    }

    /// Delta that moves `from` onto `self`.
    pub fn delta_from(self, from: Position) -> Option<PositionDelta> {
        Some(PositionDelta {
            dx: self.x.checked_sub(from.x)?,
            dy: self.y.checked_sub(from.y)?,
            dz: self.z.checked_sub(from.z)?,
        })
    }
}

impl From<[i32; 3]> for Position {
    fn from(value: [i32; 3]) -> Self {
        Position::new(value[0], value[1], value[2])
    }
}

impl From<Position> for [i32; 3] {
    fn from(value: Position) -> Self {
        [value.x, value.y, value.z]
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{},{})", self.x, self.y, self.z)
    }
}

/// Inclusive axis-aligned box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min: Position,
    pub max: Position,
}

impl BoundingBox {
    pub fn new(a: Position, b: Position) -> Self {
        BoundingBox {
            min: Position::new(a.x.min(b.x), a.y.min(b.y), a.z.min(b.z)),
            max: Position::new(a.x.max(b.x), a.y.max(b.y), a.z.max(b.z)),
        }
    }

    pub fn point(position: Position) -> Self {
        BoundingBox {
            min: position,
            max: position,
        }
    }

    pub fn include(&mut self, position: Position) {
        self.min.x = self.min.x.min(position.x);
        self.min.y = self.min.y.min(position.y);
        self.min.z = self.min.z.min(position.z);
        self.max.x = self.max.x.max(position.x);
        self.max.y = self.max.y.max(position.y);
        self.max.z = self.max.z.max(position.z);
    }

    pub fn contains(&self, position: Position) -> bool {
        position.x >= self.min.x
            && position.x <= self.max.x
            && position.y >= self.min.y
            && position.y <= self.max.y
            && position.z >= self.min.z
            && position.z <= self.max.z
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min.x <= other.max.x
            && other.min.x <= self.max.x
            && self.min.y <= other.max.y
            && other.min.y <= self.max.y
            && self.min.z <= other.max.z
            && other.min.z <= self.max.z
    }

    pub fn is_ordered(&self) -> bool {
        self.min.x <= self.max.x && self.min.y <= self.max.y && self.min.z <= self.max.z
    }

    /// Cell count, or `None` when it does not fit in a `u64`.
    pub fn volume(&self) -> Option<u64> {
        let span = |lo: i32, hi: i32| (i64::from(hi) - i64::from(lo) + 1).max(0) as u64;
        span(self.min.x, self.max.x)
            .checked_mul(span(self.min.y, self.max.y))?
            .checked_mul(span(self.min.z, self.max.z))
    }
}
