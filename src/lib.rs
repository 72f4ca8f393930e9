mod config;
pub mod engine;
pub mod telemetry;
pub mod world;

pub use config::{
    AppConfig, BudgetConfig, ConfigError, EngineConfig, PrecomputeConfig, RegionConfig,
    SchedulerConfig, TemplateConfig, ENGINE_CONFIG_FILE,
};
pub use engine::context::{EngineStats, SchedulerContext};
pub use engine::precompute::JobKind;
pub use engine::scheduler::{JobHandle, JobId, JobStatus, SchedulePolicy, TickReport};
pub use engine::template::{Template, TemplateError, TemplateStore};
pub use world::grid::{CellState, Host, MemoryGrid};
pub use world::position::{BoundingBox, Position};
pub use world::region::{RegionId, RegionLayout};

use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub fn run(args: &[String]) -> Result<(), String> {
    let config = config::AppConfig::from_args(args)?;
    telemetry::logging::init(&config.root)?;
    let engine_config = EngineConfig::load(&config.root).map_err(|err| err.to_string())?;
    let store = Arc::new(TemplateStore::new(
        config.root.join(&engine_config.templates.dir),
    ));

    println!("gridstamp: engine");
    println!("- root: {}", config.root.display());
    println!("- templates: {}", store.dir().display());
    println!(
        "- budget: full={}ns reduced={}ns minimal={}ns",
        engine_config.budget.full_nanos,
        engine_config.budget.reduced_nanos,
        engine_config.budget.minimal_nanos
    );
    println!(
        "- batch size: {}, region edge: {}, precompute workers: {}",
        engine_config.scheduler.batch_size,
        engine_config.regions.edge,
        engine_config.precompute.workers
    );
    telemetry::logging::log_engine(&format!(
        "start: template '{}' at {}, tick {}ms, max {} ticks",
        config.template, config.origin, config.tick_millis, config.max_ticks
    ));

    let mut context = SchedulerContext::new(&engine_config, Arc::clone(&store));
    let mut grid = MemoryGrid::new(context.layout(), config.resident_regions);
    let nominal_load = engine_config.budget.nominal_load;
    let period = Duration::from_millis(config.tick_millis);

    let build_status = Rc::new(Cell::new(None));
    let clear_status = Rc::new(Cell::new(None));
    {
        let build_status = Rc::clone(&build_status);
        context.request_build(&config.template, config.origin, move |status| {
            build_status.set(Some(status));
        });
    }
    let mut clear_requested = !config.clear_after;
    let mut totals = RunTotals::default();

    let mut tick = 0;
    let mut last = Instant::now();
    while tick < config.max_ticks {
        tick += 1;
        let report = context.tick(tick, &mut grid);
        totals.record(&report);

        if !clear_requested {
            if let Some(JobStatus::Completed) = build_status.get() {
                let clear_status = Rc::clone(&clear_status);
                context.request_clear(&config.template, config.origin, move |status| {
                    clear_status.set(Some(status));
                });
                clear_requested = true;
            }
        }
        // A requested clear keeps the context busy until it finishes.
        if build_status.get().is_some() && context.is_idle() {
            break;
        }

        let elapsed = last.elapsed();
        if elapsed < period {
            std::thread::sleep(period - elapsed);
        }
        let actual = last.elapsed();
        last = Instant::now();
        grid.set_load(estimate_load(nominal_load, period, actual));
    }

    let cancelled = context.shutdown(&mut grid);
    if !cancelled.is_empty() {
        println!("gridstamp: tick limit reached, cancelled {} jobs", cancelled.len());
    }

    let stats = context.executor_stats();
    println!("gridstamp: summary");
    println!("- ticks: {}", tick);
    println!("- build: {}", describe(build_status.get()));
    if config.clear_after {
        println!("- clear: {}", describe(clear_status.get()));
    }
    println!(
        "- operations: applied={}, writes={}, unchanged={}, deferrals={}",
        totals.applied, stats.writes, stats.unchanged, stats.deferrals
    );
    println!(
        "- batches: {}, over budget ticks: {}, starved ticks: {}",
        totals.batches, totals.overruns, totals.starved
    );
    println!(
        "- grid: occupied={}, resident regions={}, loads={}, evictions={}",
        grid.occupied(),
        grid.resident_count(),
        grid.stats().loads,
        grid.stats().evictions
    );
    telemetry::logging::log_engine(&format!(
        "stop after {} ticks: build {}, {} writes",
        tick,
        describe(build_status.get()),
        stats.writes
    ));
    Ok(())
}

#[derive(Debug, Default)]
struct RunTotals {
    applied: u64,
    batches: u64,
    overruns: u64,
    starved: u64,
}

impl RunTotals {
    fn record(&mut self, report: &TickReport) {
        self.applied += report.applied;
        self.batches += u64::from(report.batches);
        if report.spent_nanos > report.budget_nanos {
            self.overruns += 1;
        }
        if report.starved {
            self.starved += 1;
        }
    }
}

/// Ticks per second the loop would reach at `actual`, capped at nominal.
fn estimate_load(nominal: f64, period: Duration, actual: Duration) -> f64 {
    if actual.is_zero() {
        return nominal;
    }
    let ratio = period.as_secs_f64() / actual.as_secs_f64();
    (nominal * ratio).min(nominal)
}

fn describe(status: Option<JobStatus>) -> String {
    match status {
        Some(status) => format!("{:?}", status).to_ascii_lowercase(),
        None => "unfinished".to_string(),
    }
}
