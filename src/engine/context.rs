use crate::config::EngineConfig;
use crate::engine::budget::{BudgetController, Clock, MonotonicClock};
use crate::engine::executor::{ExecutorStats, MutationExecutor};
use crate::engine::lease::RegionLeaseManager;
use crate::engine::precompute::{JobKind, PrecomputeDone, PrecomputeRequest, Precomputer};
use crate::engine::scheduler::{
    Completion, Job, JobHandle, JobId, JobState, JobStatus, MutationScheduler, SchedulePolicy,
    TickEnv, TickReport,
};
use crate::engine::template::TemplateStore;
use crate::telemetry::logging;
use crate::world::grid::Host;
use crate::world::position::Position;
use crate::world::region::RegionLayout;
use std::collections::HashMap;
use std::sync::Arc;

/// A request waiting for its precompute result.
struct Waiting {
    template: String,
    kind: JobKind,
    policy: SchedulePolicy,
    handle: JobHandle,
    completion: Completion,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EngineStats {
    pub precomputing: usize,
    pub pending: usize,
    pub active: usize,
    pub leased_regions: usize,
    pub last_tick: Option<TickReport>,
}

/// Owns every engine component. Construct once per host and drive it with
/// `tick` from the host's periodic callback.
pub struct SchedulerContext<C: Clock = MonotonicClock> {
    layout: RegionLayout,
    clock: C,
    budget: BudgetController,
    leases: RegionLeaseManager,
    executor: MutationExecutor,
    scheduler: MutationScheduler,
    precomputer: Precomputer,
    waiting: HashMap<JobId, Waiting>,
    next_job: u64,
    last_tick: Option<TickReport>,
}

impl SchedulerContext<MonotonicClock> {
    pub fn new(config: &EngineConfig, store: Arc<TemplateStore>) -> Self {
        Self::with_clock(config, store, MonotonicClock::new())
    }
}

impl<C: Clock> SchedulerContext<C> {
    pub fn with_clock(config: &EngineConfig, store: Arc<TemplateStore>, clock: C) -> Self {
        let layout = RegionLayout::new(config.regions.edge);
        SchedulerContext {
            layout,
            clock,
            budget: BudgetController::new(config.budget.clone()),
            leases: RegionLeaseManager::new(layout, config.regions.grid),
            executor: MutationExecutor::new(layout),
            scheduler: MutationScheduler::new(config.scheduler.batch_size),
            precomputer: Precomputer::new(store, layout, config.precompute.workers),
            waiting: HashMap::new(),
            next_job: 1,
            last_tick: None,
        }
    }

    pub fn request_build(
        &mut self,
        template: &str,
        origin: Position,
        on_complete: impl FnOnce(JobStatus) + 'static,
    ) -> JobHandle {
        self.request(template, origin, JobKind::Build, SchedulePolicy::Shared, on_complete)
    }

    pub fn request_clear(
        &mut self,
        template: &str,
        origin: Position,
        on_complete: impl FnOnce(JobStatus) + 'static,
    ) -> JobHandle {
        self.request(template, origin, JobKind::Clear, SchedulePolicy::Shared, on_complete)
    }

    /// Queues `template` at `origin`. Returns immediately; `on_complete` runs
    /// exactly once, from a later `tick`.
    pub fn request(
        &mut self,
        template: &str,
        origin: Position,
        kind: JobKind,
        policy: SchedulePolicy,
        on_complete: impl FnOnce(JobStatus) + 'static,
    ) -> JobHandle {
        let id = JobId(self.next_job);
        self.next_job += 1;
        let handle = JobHandle::new(id);
        self.waiting.insert(
            id,
            Waiting {
                template: template.to_string(),
                kind,
                policy,
                handle: handle.clone(),
                completion: Box::new(on_complete),
            },
        );
        self.precomputer.submit(PrecomputeRequest {
            job: id,
            template: template.to_string(),
            origin,
            kind,
        });
        handle
    }

    /// One host callback: turns finished precomputes into jobs, then spends
    /// this tick's budget on them.
    pub fn tick<H: Host + ?Sized>(&mut self, tick: u64, host: &mut H) -> TickReport {
        let mut admitted = Vec::new();
        for done in self.precomputer.drain() {
            if let Some(status) = self.admit(done, &mut *host) {
                admitted.push(status);
            }
        }

        let mut env = TickEnv {
            host: &mut *host,
            clock: &self.clock,
            budget: &mut self.budget,
            leases: &mut self.leases,
            executor: &mut self.executor,
        };
        let mut report = self.scheduler.run_tick(tick, &mut env);
        admitted.append(&mut report.finished);
        report.finished = admitted;

        if report.writes > 0 {
            logging::log_load(report.writes);
        }
        if report.spent_nanos > report.budget_nanos {
            logging::log_lag(&format!(
                "tick {} overran budget: {} ns spent of {} ns",
                tick, report.spent_nanos, report.budget_nanos
            ));
        }
        self.last_tick = Some(report.clone());
        report
    }

    /// The rendezvous point: a precompute result becomes a job on the mutation
    /// thread. Returns the status of requests that end here.
    fn admit<H: Host + ?Sized>(
        &mut self,
        done: PrecomputeDone,
        host: &mut H,
    ) -> Option<(JobId, JobStatus)> {
        let Some(waiting) = self.waiting.remove(&done.job) else {
            logging::log_error(&format!("precompute result for unknown {}", done.job));
            return None;
        };
        let status = if waiting.handle.is_cancelled() {
            JobStatus::Cancelled
        } else if done.result.is_empty() {
            JobStatus::Empty
        } else {
            let regions = done
                .result
                .footprint
                .as_ref()
                .map(|footprint| footprint.regions.clone())
                .unwrap_or_default();
            let leases = self.leases.acquire(host, &regions);
            logging::log_engine(&format!(
                "{} {:?} '{}' admitted: {} operations over {} regions",
                done.job,
                waiting.kind,
                waiting.template,
                done.result.operations.len(),
                leases.len()
            ));
            self.scheduler.submit(Job::new(
                done.job,
                waiting.kind,
                waiting.policy,
                done.result.operations,
                leases,
                waiting.handle.flag(),
                waiting.completion,
            ));
            return None;
        };
        logging::log_engine(&format!(
            "{} {:?} '{}' ended before scheduling: {:?}",
            done.job, waiting.kind, waiting.template, status
        ));
        (waiting.completion)(status);
        Some((done.job, status))
    }

    /// Cancels all work, including requests still in precompute. Every
    /// outstanding callback fires with `Cancelled`.
    pub fn shutdown<H: Host + ?Sized>(&mut self, host: &mut H) -> Vec<JobId> {
        let mut cancelled = self.scheduler.cancel_all(&mut *host, &mut self.leases);
        for (id, waiting) in self.waiting.drain() {
            (waiting.completion)(JobStatus::Cancelled);
            cancelled.push(id);
        }
        cancelled.sort();
        cancelled
    }

    pub fn is_idle(&self) -> bool {
        self.waiting.is_empty() && self.scheduler.is_empty()
    }

    pub fn layout(&self) -> RegionLayout {
        self.layout
    }

    pub fn leases(&self) -> &RegionLeaseManager {
        &self.leases
    }

    pub fn scheduler(&self) -> &MutationScheduler {
        &self.scheduler
    }

    pub fn budget(&self) -> &BudgetController {
        &self.budget
    }

    pub fn executor_stats(&self) -> &ExecutorStats {
        self.executor.stats()
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            precomputing: self.waiting.len(),
            pending: self.scheduler.count_in_state(JobState::Pending),
            active: self.scheduler.count_in_state(JobState::Active),
            leased_regions: self.leases.len(),
            last_tick: self.last_tick.clone(),
        }
    }
}
