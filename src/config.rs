use crate::world::position::{BoundingBox, Position};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENGINE_CONFIG_FILE: &str = "engine.yaml";

#[derive(Debug)]
pub struct AppConfig {
    pub root: PathBuf,
    pub template: String,
    pub origin: Position,
    pub max_ticks: u64,
    pub tick_millis: u64,
    pub resident_regions: usize,
    pub clear_after: bool,
}

impl AppConfig {
    pub fn from_args(args: &[String]) -> Result<Self, String> {
        if args.len() < 3 {
            return Err(
                "usage: gridstamp <root> <template> [x,y,z] [max_ticks]".to_string(),
            );
        }

        let root = Path::new(&args[1]).to_path_buf();
        let template = args[2].clone();
        let origin = if args.len() > 3 {
            parse_position(&args[3])?
        } else {
            Position::new(0, 64, 0)
        };
        let max_ticks = if args.len() > 4 {
            args[4]
                .trim()
                .parse::<u64>()
                .map_err(|_| format!("invalid max_ticks '{}'", args[4]))?
        } else {
            10_000
        };
        let tick_millis = env_parse("GRIDSTAMP_TICK_MS").unwrap_or(50).max(1);
        let resident_regions = env_parse("GRIDSTAMP_RESIDENT_REGIONS").unwrap_or(256);
        let clear_after = std::env::var("GRIDSTAMP_CLEAR_AFTER")
            .map(|value| matches!(value.trim(), "1" | "true" | "yes"))
            .unwrap_or(false);
        Ok(Self {
            root,
            template,
            origin,
            max_ticks,
            tick_millis,
            resident_regions,
            clear_after,
        })
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    let value = std::env::var(name).ok()?;
    match value.trim().parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            eprintln!("gridstamp: invalid {} '{}', using default", name, value);
            None
        }
    }
}

fn parse_position(value: &str) -> Result<Position, String> {
    let parts: Vec<&str> = value.split(',').map(|part| part.trim()).collect();
    if parts.len() != 3 {
        return Err(format!("invalid position '{}', expected x,y,z", value));
    }
    let mut coords = [0i32; 3];
    for (slot, part) in coords.iter_mut().zip(parts) {
        *slot = part
            .parse()
            .map_err(|_| format!("invalid coordinate '{}' in '{}'", part, value))?;
    }
    Ok(Position::from(coords))
}

/// Engine tuning, read from `<root>/engine.yaml`. Every field has a default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub budget: BudgetConfig,
    pub scheduler: SchedulerConfig,
    pub regions: RegionConfig,
    pub precompute: PrecomputeConfig,
    pub templates: TemplateConfig,
}

/// Step function from load ratio to per-tick budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Load metric value that counts as 100%, e.g. 20 ticks per second.
    pub nominal_load: f64,
    /// At or above this ratio of nominal the full budget applies.
    pub healthy_ratio: f64,
    /// At or above this ratio (and below healthy) the reduced budget applies.
    pub degraded_ratio: f64,
    pub full_nanos: i64,
    pub reduced_nanos: i64,
    pub minimal_nanos: i64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        BudgetConfig {
            nominal_load: 20.0,
            healthy_ratio: 0.975,
            degraded_ratio: 0.75,
            full_nanos: 25_000_000,
            reduced_nanos: 5_000_000,
            minimal_nanos: 1_000_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Operations applied between two clock reads.
    pub batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig { batch_size: 32 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionConfig {
    pub edge: i32,
    /// Addressable cells. Regions entirely outside are never leased.
    pub grid: BoundingBox,
}

impl Default for RegionConfig {
    fn default() -> Self {
        RegionConfig {
            edge: crate::world::region::DEFAULT_REGION_EDGE,
            grid: BoundingBox {
                min: Position::new(-30_000_000, -64, -30_000_000),
                max: Position::new(30_000_000, 319, 30_000_000),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PrecomputeConfig {
    /// Background worker threads; 0 resolves on the requesting thread.
    pub workers: usize,
}

impl Default for PrecomputeConfig {
    fn default() -> Self {
        PrecomputeConfig { workers: 2 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TemplateConfig {
    /// Template directory, relative to the root.
    pub dir: PathBuf,
}

impl Default for TemplateConfig {
    fn default() -> Self {
        TemplateConfig {
            dir: PathBuf::from("templates"),
        }
    }
}

impl EngineConfig {
    /// Loads `<root>/engine.yaml`; a missing file yields the defaults.
    pub fn load(root: &Path) -> Result<Self, ConfigError> {
        let path = root.join(ENGINE_CONFIG_FILE);
        if !path.exists() {
            return Ok(EngineConfig::default());
        }
        let content = std::fs::read_to_string(&path)
            .map_err(|e| ConfigError::ReadError(path.clone(), e.to_string()))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = if content.trim().is_empty() {
            EngineConfig::default()
        } else {
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let budget = &self.budget;
        if !(budget.nominal_load > 0.0) {
            return Err(ConfigError::Invalid("budget.nominal_load must be positive".into()));
        }
        if !(budget.degraded_ratio > 0.0 && budget.degraded_ratio <= budget.healthy_ratio) {
            return Err(ConfigError::Invalid(
                "budget ratios must satisfy 0 < degraded_ratio <= healthy_ratio".into(),
            ));
        }
        if budget.minimal_nanos <= 0 || budget.reduced_nanos <= 0 || budget.full_nanos <= 0 {
            return Err(ConfigError::Invalid("budget nanos must be positive".into()));
        }
        if budget.minimal_nanos > budget.reduced_nanos || budget.reduced_nanos > budget.full_nanos {
            return Err(ConfigError::Invalid(
                "budget nanos must satisfy minimal <= reduced <= full".into(),
            ));
        }
        if self.scheduler.batch_size == 0 {
            return Err(ConfigError::Invalid("scheduler.batch_size must be at least 1".into()));
        }
        if self.regions.edge <= 0 {
            return Err(ConfigError::Invalid("regions.edge must be positive".into()));
        }
        if !self.regions.grid.is_ordered() {
            return Err(ConfigError::Invalid("regions.grid min must not exceed max".into()));
        }
        Ok(())
    }
}

/// Errors that can occur while loading configuration
#[derive(Debug, Clone)]
pub enum ConfigError {
    ReadError(PathBuf, String),
    ParseError(String),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::ReadError(path, msg) => {
                write!(f, "Failed to read {}: {}", path.display(), msg)
            }
            ConfigError::ParseError(msg) => write!(f, "Config parse error: {}", msg),
            ConfigError::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn from_args_requires_root_and_template() {
        assert!(AppConfig::from_args(&args(&["gridstamp", "/tmp"])).is_err());
        let config = AppConfig::from_args(&args(&["gridstamp", "/tmp", "tower"])).unwrap();
        assert_eq!(config.template, "tower");
        assert_eq!(config.origin, Position::new(0, 64, 0));
    }

    #[test]
    fn from_args_parses_origin_and_ticks() {
        let config =
            AppConfig::from_args(&args(&["gridstamp", "/tmp", "tower", "10, -4,7", "25"]))
                .unwrap();
        assert_eq!(config.origin, Position::new(10, -4, 7));
        assert_eq!(config.max_ticks, 25);
        assert!(AppConfig::from_args(&args(&["gridstamp", "/tmp", "tower", "1,2"])).is_err());
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = EngineConfig::from_yaml("scheduler:\n  batch_size: 8\n").unwrap();
        assert_eq!(config.scheduler.batch_size, 8);
        assert_eq!(config.budget, BudgetConfig::default());
        assert_eq!(config.precompute.workers, 2);
    }

    #[test]
    fn grid_bounds_parse_as_triples() {
        let yaml = "regions:\n  edge: 32\n  grid:\n    min: [0, 0, 0]\n    max: [1023, 15, 1023]\n";
        let config = EngineConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.regions.edge, 32);
        assert_eq!(config.regions.grid.max, Position::new(1023, 15, 1023));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(EngineConfig::from_yaml("scheduler:\n  batch_size: 0\n").is_err());
        assert!(EngineConfig::from_yaml("regions:\n  edge: 0\n").is_err());
        assert!(EngineConfig::from_yaml("budget:\n  minimal_nanos: 0\n").is_err());
        assert!(EngineConfig::from_yaml("budget:\n  healthy_ratio: 0.5\n").is_err());
        assert!(EngineConfig::from_yaml("budget: [1, 2]\n").is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = std::env::temp_dir().join(format!("gridstamp-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let config = EngineConfig::load(&dir).unwrap();
        assert_eq!(config, EngineConfig::default());
    }
}
