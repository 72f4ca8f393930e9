//! Immutable templates and the process-lifetime template cache.
//!
//! A template file is YAML:
//!
//! ```yaml
//! origin: [0, 0, 0]
//! bounds: { min: [0, 0, 0], max: [9, 9, 9] }
//! empty: 0
//! cells:
//!   - [1, 0, 1, 5]
//!   - { min: [0, 0, 0], max: [9, 0, 9], state: 3 }
//! ```
//!
//! Entries are kept in declared order; later entries may overwrite earlier ones.

use crate::telemetry::logging;
use crate::world::grid::CellState;
use crate::world::position::{BoundingBox, Position};
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub const TEMPLATE_EXTENSION: &str = "yaml";

/// Upper bound on the cells a template may expand to, overwrites included.
pub const MAX_TEMPLATE_CELLS: u64 = 1 << 26;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CellEntry {
    Single(i32, i32, i32, CellState),
    Fill {
        min: Position,
        max: Position,
        state: CellState,
    },
}

impl CellEntry {
    fn extent(&self) -> BoundingBox {
        match *self {
            CellEntry::Single(x, y, z, _) => BoundingBox::point(Position::new(x, y, z)),
            CellEntry::Fill { min, max, .. } => BoundingBox { min, max },
        }
    }
}

#[derive(Debug, Deserialize)]
struct TemplateFile {
    origin: Position,
    bounds: BoundingBox,
    #[serde(default)]
    empty: CellState,
    #[serde(default)]
    cells: Vec<CellEntry>,
}

#[derive(Debug, Clone)]
pub struct Template {
    name: String,
    origin: Position,
    bounds: BoundingBox,
    empty: CellState,
    entries: Vec<CellEntry>,
    cell_count: u64,
    fingerprint: String,
}

impl Template {
    pub fn from_yaml(name: &str, content: &str) -> Result<Self, TemplateError> {
        let file: TemplateFile = serde_yaml::from_str(content)
            .map_err(|e| TemplateError::ParseError(name.to_string(), e.to_string()))?;
        let mut template = Self::new(name, file.origin, file.bounds, file.empty, file.cells)?;
        template.fingerprint = fingerprint(content.as_bytes());
        Ok(template)
    }

    pub fn new(
        name: &str,
        origin: Position,
        bounds: BoundingBox,
        empty: CellState,
        entries: Vec<CellEntry>,
    ) -> Result<Self, TemplateError> {
        if !bounds.is_ordered() {
            return Err(TemplateError::Invalid(format!(
                "template '{}' bounds min {} exceeds max {}",
                name, bounds.min, bounds.max
            )));
        }
        let mut cell_count = 0u64;
        let mut digest = Sha1::new();
        for (index, entry) in entries.iter().enumerate() {
            let extent = entry.extent();
            if !extent.is_ordered() {
                return Err(TemplateError::Invalid(format!(
                    "template '{}' entry {} has min {} above max {}",
                    name, index, extent.min, extent.max
                )));
            }
            if !bounds.contains(extent.min) || !bounds.contains(extent.max) {
                return Err(TemplateError::Invalid(format!(
                    "template '{}' entry {} lies outside bounds",
                    name, index
                )));
            }
            let Some(total) = extent
                .volume()
                .and_then(|volume| cell_count.checked_add(volume))
                .filter(|total| *total <= MAX_TEMPLATE_CELLS)
            else {
                return Err(TemplateError::Invalid(format!(
                    "template '{}' entry {} exceeds {} cells",
                    name, index, MAX_TEMPLATE_CELLS
                )));
            };
            cell_count = total;
            for value in [extent.min.x, extent.min.y, extent.min.z, extent.max.x, extent.max.y, extent.max.z] {
                digest.update(value.to_le_bytes());
            }
            let state = match entry {
                CellEntry::Single(.., state) | CellEntry::Fill { state, .. } => *state,
            };
            digest.update(state.0.to_le_bytes());
        }
        Ok(Template {
            name: name.to_string(),
            origin,
            bounds,
            empty,
            entries,
            cell_count,
            fingerprint: base64::engine::general_purpose::STANDARD.encode(digest.finalize()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn origin(&self) -> Position {
        self.origin
    }

    pub fn bounds(&self) -> BoundingBox {
        self.bounds
    }

    /// The value treated as "nothing here" and written by clear jobs.
    pub fn empty(&self) -> CellState {
        self.empty
    }

    /// Number of cells `cells()` yields, counting overwrites.
    pub fn cell_count(&self) -> u64 {
        self.cell_count
    }

    /// `base64(sha1(..))` of the source file, or of the entries for in-memory templates.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Every `(relative position, state)` pair in declared order. Each call
    /// starts over from the first entry.
    pub fn cells(&self) -> Cells<'_> {
        Cells {
            entries: self.entries.iter(),
            fill: None,
        }
    }
}

fn fingerprint(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(Sha1::digest(bytes))
}

pub struct Cells<'a> {
    entries: std::slice::Iter<'a, CellEntry>,
    fill: Option<FillCursor>,
}

/// Walks a fill box x-fastest, then z, then y.
struct FillCursor {
    min: Position,
    max: Position,
    next: Option<Position>,
    state: CellState,
}

impl FillCursor {
    fn advance(&mut self) -> Option<(Position, CellState)> {
        let current = self.next?;
        let mut next = current;
        if next.x < self.max.x {
            next.x += 1;
        } else if next.z < self.max.z {
            next.x = self.min.x;
            next.z += 1;
        } else if next.y < self.max.y {
            next.x = self.min.x;
            next.z = self.min.z;
            next.y += 1;
        } else {
            self.next = None;
            return Some((current, self.state));
        }
        self.next = Some(next);
        Some((current, self.state))
    }
}

impl<'a> Iterator for Cells<'a> {
    type Item = (Position, CellState);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(fill) = self.fill.as_mut() {
                if let Some(cell) = fill.advance() {
                    return Some(cell);
                }
                self.fill = None;
            }
            match *self.entries.next()? {
                CellEntry::Single(x, y, z, state) => return Some((Position::new(x, y, z), state)),
                CellEntry::Fill { min, max, state } => {
                    self.fill = Some(FillCursor {
                        min,
                        max,
                        next: Some(min),
                        state,
                    });
                }
            }
        }
    }
}

type TemplateSlot = Arc<Mutex<Option<Arc<Template>>>>;

/// Name-keyed template cache shared between the mutation thread and the
/// precompute workers. Concurrent first requests for one name share a single
/// load; failed loads are not cached.
pub struct TemplateStore {
    dir: PathBuf,
    slots: Mutex<HashMap<String, TemplateSlot>>,
    loads: AtomicU64,
}

impl TemplateStore {
    pub fn new(dir: PathBuf) -> Self {
        TemplateStore {
            dir,
            slots: Mutex::new(HashMap::new()),
            loads: AtomicU64::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn get(&self, name: &str) -> Result<Arc<Template>, TemplateError> {
        validate_name(name)?;
        let slot = {
            let mut slots = self.slots.lock().map_err(|_| TemplateError::Poisoned)?;
            Arc::clone(slots.entry(name.to_string()).or_default())
        };
        let mut cached = slot.lock().map_err(|_| TemplateError::Poisoned)?;
        if let Some(template) = cached.as_ref() {
            return Ok(Arc::clone(template));
        }
        let path = self.dir.join(format!("{}.{}", name, TEMPLATE_EXTENSION));
        let template = match load_template_file(name, &path) {
            Ok(template) => Arc::new(template),
            Err(err) => {
                drop(cached);
                self.forget_empty_slot(name, &slot);
                return Err(err);
            }
        };
        self.loads.fetch_add(1, Ordering::Relaxed);
        logging::log_engine(&format!(
            "template '{}' loaded: {} cells, fingerprint {}",
            name,
            template.cell_count(),
            template.fingerprint()
        ));
        *cached = Some(Arc::clone(&template));
        Ok(template)
    }

    /// Drops `slot` if it is still the registered, empty slot for `name`. A
    /// slot another caller is loading into is left alone.
    fn forget_empty_slot(&self, name: &str, slot: &TemplateSlot) {
        let Ok(mut slots) = self.slots.lock() else {
            return;
        };
        let unused = match slots.get(name) {
            Some(current) if Arc::ptr_eq(current, slot) => {
                matches!(current.try_lock(), Ok(cached) if cached.is_none())
            }
            _ => false,
        };
        if unused {
            slots.remove(name);
        }
    }

    /// Registers an in-memory template, replacing any cached one of the same name.
    pub fn insert(&self, template: Template) -> Result<(), TemplateError> {
        validate_name(template.name())?;
        let mut slots = self.slots.lock().map_err(|_| TemplateError::Poisoned)?;
        let name = template.name().to_string();
        slots.insert(name, Arc::new(Mutex::new(Some(Arc::new(template)))));
        Ok(())
    }

    pub fn is_cached(&self, name: &str) -> bool {
        let Ok(slots) = self.slots.lock() else {
            return false;
        };
        slots
            .get(name)
            .and_then(|slot| slot.lock().ok().map(|cached| cached.is_some()))
            .unwrap_or(false)
    }

    /// Disk loads performed so far.
    pub fn load_count(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    /// Names of the template files in the store directory, sorted.
    pub fn list(&self) -> Result<Vec<String>, TemplateError> {
        let entries = std::fs::read_dir(&self.dir)
            .map_err(|e| TemplateError::ReadError(self.dir.clone(), e.to_string()))?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| TemplateError::ReadError(self.dir.clone(), e.to_string()))?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(TEMPLATE_EXTENSION) {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }
}

pub fn load_template_file(name: &str, path: &Path) -> Result<Template, TemplateError> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return Err(TemplateError::NotFound(name.to_string()));
        }
        Err(err) => return Err(TemplateError::ReadError(path.to_path_buf(), err.to_string())),
    };
    Template::from_yaml(name, &content)
}

fn validate_name(name: &str) -> Result<(), TemplateError> {
    let valid = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(TemplateError::InvalidName(name.to_string()))
    }
}

/// Errors that can occur while loading templates
#[derive(Debug, Clone)]
pub enum TemplateError {
    NotFound(String),
    InvalidName(String),
    ReadError(PathBuf, String),
    ParseError(String, String),
    Invalid(String),
    Poisoned,
}

impl std::fmt::Display for TemplateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TemplateError::NotFound(name) => write!(f, "Template '{}' not found", name),
            TemplateError::InvalidName(name) => write!(f, "Invalid template name '{}'", name),
            TemplateError::ReadError(path, msg) => {
                write!(f, "Failed to read {}: {}", path.display(), msg)
            }
            TemplateError::ParseError(name, msg) => {
                write!(f, "Template '{}' parse error: {}", name, msg)
            }
            TemplateError::Invalid(msg) => write!(f, "Invalid template: {}", msg),
            TemplateError::Poisoned => write!(f, "Template cache lock poisoned"),
        }
    }
}

impl std::error::Error for TemplateError {}
