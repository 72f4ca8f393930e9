//! Cooperative tick-sliced executor for mutation jobs.
//!
//! Each tick the scheduler asks the budget controller for the tick's budget
//! and then runs jobs in batches of `batch_size` operations, reading the clock
//! once per batch. The budget is checked between batches only, so a tick may
//! overrun by at most one batch.
//!
//! Exclusive jobs run first, one at a time, with the whole budget. Shared jobs
//! are serviced round-robin: jobs that ran in a pass are staged and appended
//! behind the jobs that did not get a turn, so nobody is skipped or run twice
//! out of order.

use crate::engine::budget::{BudgetController, Clock};
use crate::engine::executor::{ApplyOutcome, MutationExecutor};
use crate::engine::lease::{LeaseSet, RegionLeaseManager};
use crate::engine::precompute::{JobKind, MutationOperation};
use crate::telemetry::logging;
use crate::world::grid::Host;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "job #{}", self.0)
    }
}

/// Outcome reported to a job's completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Completed,
    /// Nothing to do: missing template or no operations.
    Empty,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Active,
    Done,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulePolicy {
    /// Runs alone with the whole per-tick budget, ahead of shared jobs.
    Exclusive,
    /// Shares the per-tick budget round-robin with other shared jobs.
    Shared,
}

pub type Completion = Box<dyn FnOnce(JobStatus)>;

/// Caller-side handle; `cancel` may be called from any thread.
#[derive(Debug, Clone)]
pub struct JobHandle {
    id: JobId,
    cancel: Arc<AtomicBool>,
}

impl JobHandle {
    pub(crate) fn new(id: JobId) -> Self {
        JobHandle {
            id,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    /// Takes effect at the job's next batch boundary.
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub(crate) fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }
}

pub struct Job {
    id: JobId,
    kind: JobKind,
    policy: SchedulePolicy,
    operations: Vec<MutationOperation>,
    cursor: usize,
    leases: Option<LeaseSet>,
    completion: Option<Completion>,
    cancel: Arc<AtomicBool>,
    state: JobState,
    written: u64,
}

impl Job {
    pub fn new(
        id: JobId,
        kind: JobKind,
        policy: SchedulePolicy,
        operations: Vec<MutationOperation>,
        leases: LeaseSet,
        cancel: Arc<AtomicBool>,
        completion: Completion,
    ) -> Self {
        Job {
            id,
            kind,
            policy,
            operations,
            cursor: 0,
            leases: Some(leases),
            completion: Some(completion),
            cancel,
            state: JobState::Pending,
            written: 0,
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn policy(&self) -> SchedulePolicy {
        self.policy
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    /// Terminal transition. Consumes the job, so leases are released and the
    /// callback fires at most once.
    fn finish<H: Host + ?Sized>(
        mut self,
        status: JobStatus,
        host: &mut H,
        leases: &mut RegionLeaseManager,
    ) {
        self.state = match status {
            JobStatus::Cancelled => JobState::Cancelled,
            JobStatus::Completed | JobStatus::Empty => JobState::Done,
        };
        if let Some(set) = self.leases.take() {
            leases.release(host, set);
        }
        logging::log_engine(&format!(
            "{} {:?} {:?}: {}/{} operations, {} writes",
            self.id,
            self.kind,
            status,
            self.cursor,
            self.operations.len(),
            self.written
        ));
        if let Some(done) = self.completion.take() {
            done(status);
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("policy", &self.policy)
            .field("state", &self.state)
            .field("cursor", &self.cursor)
            .field("len", &self.operations.len())
            .finish()
    }
}

/// Everything a tick needs besides the job queues.
pub struct TickEnv<'a, H: Host + ?Sized, C: Clock + ?Sized> {
    pub host: &'a mut H,
    pub clock: &'a C,
    pub budget: &'a mut BudgetController,
    pub leases: &'a mut RegionLeaseManager,
    pub executor: &'a mut MutationExecutor,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TickReport {
    pub tick: u64,
    pub budget_nanos: i64,
    pub spent_nanos: i64,
    pub batches: u32,
    /// Operations the cursors advanced over, written or unchanged.
    pub applied: u64,
    pub writes: u64,
    pub finished: Vec<(JobId, JobStatus)>,
    /// Jobs still queued when the tick ended.
    pub waiting: usize,
    /// True when the budget was already spent on entry.
    pub starved: bool,
}

enum BatchOutcome {
    Finished,
    Yielded { job: Job, progressed: bool },
}

#[derive(Debug)]
pub struct MutationScheduler {
    batch_size: usize,
    exclusive: VecDeque<Job>,
    shared: VecDeque<Job>,
}

impl MutationScheduler {
    pub fn new(batch_size: usize) -> Self {
        MutationScheduler {
            batch_size: batch_size.max(1),
            exclusive: VecDeque::new(),
            shared: VecDeque::new(),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn submit(&mut self, job: Job) {
        match job.policy {
            SchedulePolicy::Exclusive => self.exclusive.push_back(job),
            SchedulePolicy::Shared => self.shared.push_back(job),
        }
    }

    pub fn len(&self) -> usize {
        self.exclusive.len() + self.shared.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.exclusive.iter().chain(self.shared.iter())
    }

    pub fn job(&self, id: JobId) -> Option<&Job> {
        self.jobs().find(|job| job.id == id)
    }

    pub fn count_in_state(&self, state: JobState) -> usize {
        self.jobs().filter(|job| job.state == state).count()
    }

    pub fn run_tick<H: Host + ?Sized, C: Clock + ?Sized>(
        &mut self,
        tick: u64,
        env: &mut TickEnv<'_, H, C>,
    ) -> TickReport {
        let host = &mut *env.host;
        let budget_nanos = env
            .budget
            .current_budget_nanos(tick, || host.sample_load_metric());
        let spent_before = env.budget.sample().map_or(0, |sample| sample.spent_nanos);
        let mut report = TickReport {
            tick,
            budget_nanos,
            ..TickReport::default()
        };

        if env.budget.is_exhausted() {
            report.starved = true;
        } else {
            self.run_exclusive(env, &mut report);
            self.run_shared(env, &mut report);
        }

        let spent_after = env.budget.sample().map_or(0, |sample| sample.spent_nanos);
        report.spent_nanos = spent_after - spent_before;
        report.waiting = self.len();
        report
    }

    fn run_exclusive<H: Host + ?Sized, C: Clock + ?Sized>(
        &mut self,
        env: &mut TickEnv<'_, H, C>,
        report: &mut TickReport,
    ) {
        while !env.budget.is_exhausted() {
            let Some(mut job) = self.exclusive.pop_front() else {
                return;
            };
            loop {
                match self.run_batch(job, env, report) {
                    BatchOutcome::Finished => break,
                    BatchOutcome::Yielded { job: yielded, progressed } => {
                        if !progressed || env.budget.is_exhausted() {
                            self.exclusive.push_front(yielded);
                            return;
                        }
                        job = yielded;
                    }
                }
            }
        }
    }

    fn run_shared<H: Host + ?Sized, C: Clock + ?Sized>(
        &mut self,
        env: &mut TickEnv<'_, H, C>,
        report: &mut TickReport,
    ) {
        while !env.budget.is_exhausted() && !self.shared.is_empty() {
            let mut staging = Vec::with_capacity(self.shared.len());
            let mut progressed_any = false;
            while !env.budget.is_exhausted() {
                let Some(job) = self.shared.pop_front() else {
                    break;
                };
                match self.run_batch(job, env, report) {
                    BatchOutcome::Finished => progressed_any = true,
                    BatchOutcome::Yielded { job, progressed } => {
                        progressed_any |= progressed;
                        staging.push(job);
                    }
                }
            }
            // Jobs that missed this pass stay ahead of the ones that ran.
            self.shared.extend(staging);
            if !progressed_any {
                return;
            }
        }
    }

    fn run_batch<H: Host + ?Sized, C: Clock + ?Sized>(
        &self,
        mut job: Job,
        env: &mut TickEnv<'_, H, C>,
        report: &mut TickReport,
    ) -> BatchOutcome {
        if job.is_cancelled() {
            report.finished.push((job.id, JobStatus::Cancelled));
            job.finish(JobStatus::Cancelled, &mut *env.host, &mut *env.leases);
            return BatchOutcome::Finished;
        }
        job.state = JobState::Active;

        let start = env.clock.now_nanos();
        let before = job.cursor;
        let end = job.cursor.saturating_add(self.batch_size).min(job.operations.len());
        let unleased = LeaseSet::default();
        let leases = job.leases.as_ref().unwrap_or(&unleased);
        while job.cursor < end {
            let op = job.operations[job.cursor];
            match env.executor.apply(&mut *env.host, &op, leases) {
                ApplyOutcome::Written => {
                    job.written += 1;
                    report.writes += 1;
                    job.cursor += 1;
                }
                ApplyOutcome::Unchanged => job.cursor += 1,
                ApplyOutcome::Deferred => break,
            }
        }
        let elapsed = env.clock.now_nanos().saturating_sub(start);
        env.budget.record_spend(elapsed);
        report.batches += 1;
        report.applied += (job.cursor - before) as u64;

        if job.cursor >= job.operations.len() {
            report.finished.push((job.id, JobStatus::Completed));
            job.finish(JobStatus::Completed, &mut *env.host, &mut *env.leases);
            return BatchOutcome::Finished;
        }
        let progressed = job.cursor > before;
        BatchOutcome::Yielded { job, progressed }
    }

    /// Cancels every queued job immediately, releasing leases and firing callbacks.
    pub fn cancel_all<H: Host + ?Sized>(
        &mut self,
        host: &mut H,
        leases: &mut RegionLeaseManager,
    ) -> Vec<JobId> {
        let mut cancelled = Vec::with_capacity(self.len());
        let jobs: Vec<Job> = self.exclusive.drain(..).chain(self.shared.drain(..)).collect();
        for job in jobs {
            cancelled.push(job.id);
            job.finish(JobStatus::Cancelled, &mut *host, &mut *leases);
        }
        cancelled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BudgetConfig;
    use crate::engine::budget::ManualClock;
    use crate::engine::precompute::OpKind;
    use crate::world::grid::{CellState, MemoryGrid};
    use crate::world::position::{BoundingBox, Position};
    use crate::world::region::{RegionId, RegionLayout};
    use std::cell::RefCell;
    use std::rc::Rc;

    struct Fixture {
        host: MemoryGrid,
        clock: ManualClock,
        budget: BudgetController,
        leases: RegionLeaseManager,
        executor: MutationExecutor,
    }

    impl Fixture {
        fn new() -> Self {
            let layout = RegionLayout::new(16);
            Fixture {
                host: MemoryGrid::new(layout, 16),
                clock: ManualClock::new(),
                budget: BudgetController::new(BudgetConfig::default()),
                leases: RegionLeaseManager::new(
                    layout,
                    BoundingBox::new(Position::new(-512, -512, -512), Position::new(511, 511, 511)),
                ),
                executor: MutationExecutor::new(layout),
            }
        }

        fn tick(&mut self, scheduler: &mut MutationScheduler, tick: u64) -> TickReport {
            let mut env = TickEnv {
                host: &mut self.host,
                clock: &self.clock,
                budget: &mut self.budget,
                leases: &mut self.leases,
                executor: &mut self.executor,
            };
            scheduler.run_tick(tick, &mut env)
        }
    }

    fn row(len: i32, state: u32) -> Vec<MutationOperation> {
        (0..len)
            .map(|x| MutationOperation {
                position: Position::new(x, 0, 0),
                target: CellState(state),
                kind: OpKind::Write,
            })
            .collect()
    }

    fn job(
        fixture: &mut Fixture,
        id: u64,
        policy: SchedulePolicy,
        ops: Vec<MutationOperation>,
        log: &Rc<RefCell<Vec<(u64, JobStatus)>>>,
    ) -> (Job, JobHandle) {
        let handle = JobHandle::new(JobId(id));
        let leases = fixture.leases.acquire(&mut fixture.host, &[RegionId::new(0, 0, 0)]);
        let log = Rc::clone(log);
        let job = Job::new(
            JobId(id),
            JobKind::Build,
            policy,
            ops,
            leases,
            handle.flag(),
            Box::new(move |status| log.borrow_mut().push((id, status))),
        );
        (job, handle)
    }

    #[test]
    fn free_operations_finish_in_one_tick() {
        let mut fixture = Fixture::new();
        let mut scheduler = MutationScheduler::new(4);
        let log = Rc::new(RefCell::new(Vec::new()));
        let (job, _) = job(&mut fixture, 1, SchedulePolicy::Shared, row(10, 2), &log);
        scheduler.submit(job);
        assert_eq!(scheduler.count_in_state(JobState::Pending), 1);

        let report = fixture.tick(&mut scheduler, 1);
        assert_eq!(report.batches, 3);
        assert_eq!(report.writes, 10);
        assert_eq!(report.finished, vec![(JobId(1), JobStatus::Completed)]);
        assert_eq!(*log.borrow(), vec![(1, JobStatus::Completed)]);
        assert!(scheduler.is_empty());
        assert!(fixture.leases.is_empty());
    }

    #[test]
    fn exhausted_budget_defers_everything() {
        let mut fixture = Fixture::new();
        let mut scheduler = MutationScheduler::new(4);
        let log = Rc::new(RefCell::new(Vec::new()));
        let (job, _) = job(&mut fixture, 1, SchedulePolicy::Shared, row(10, 2), &log);
        scheduler.submit(job);

        fixture.budget.current_budget_nanos(5, || 20.0);
        fixture.budget.record_spend(u64::MAX);
        let report = fixture.tick(&mut scheduler, 5);
        assert!(report.starved);
        assert_eq!(report.applied, 0);
        assert_eq!(report.waiting, 1);
        assert!(log.borrow().is_empty());

        let report = fixture.tick(&mut scheduler, 6);
        assert!(!report.starved);
        assert_eq!(report.applied, 10);
    }

    #[test]
    fn cancelled_job_fires_once_and_releases() {
        let mut fixture = Fixture::new();
        let mut scheduler = MutationScheduler::new(4);
        let log = Rc::new(RefCell::new(Vec::new()));
        let (job, handle) = job(&mut fixture, 9, SchedulePolicy::Shared, row(10, 2), &log);
        scheduler.submit(job);
        handle.cancel();
        assert!(handle.is_cancelled());

        let report = fixture.tick(&mut scheduler, 1);
        assert_eq!(report.applied, 0);
        fixture.tick(&mut scheduler, 2);
        assert_eq!(*log.borrow(), vec![(9, JobStatus::Cancelled)]);
        assert!(fixture.leases.is_empty());
        assert_eq!(fixture.host.stats().writes, 0);
    }

    #[test]
    fn cancel_all_finishes_every_job() {
        let mut fixture = Fixture::new();
        let mut scheduler = MutationScheduler::new(4);
        let log = Rc::new(RefCell::new(Vec::new()));
        for id in 0..3 {
            let policy = if id == 0 { SchedulePolicy::Exclusive } else { SchedulePolicy::Shared };
            let (job, _) = job(&mut fixture, id, policy, row(10, 2), &log);
            scheduler.submit(job);
        }
        assert_eq!(fixture.leases.refcount(RegionId::new(0, 0, 0)), 3);
        let cancelled = scheduler.cancel_all(&mut fixture.host, &mut fixture.leases);
        assert_eq!(cancelled, vec![JobId(0), JobId(1), JobId(2)]);
        assert_eq!(log.borrow().len(), 3);
        assert!(fixture.leases.is_empty());
    }

    #[test]
    fn stuck_region_does_not_spin_the_tick() {
        struct NeverResident(MemoryGrid);
        impl Host for NeverResident {
            fn is_region_resident(&self, _region: RegionId) -> bool {
                false
            }
            fn mark_resident(&mut self, region: RegionId) {
                self.0.mark_resident(region)
            }
            fn unmark_resident(&mut self, region: RegionId) {
                self.0.unmark_resident(region)
            }
            fn read_cell(&mut self, position: Position) -> CellState {
                self.0.read_cell(position)
            }
            fn write_cell(&mut self, position: Position, state: CellState) {
                self.0.write_cell(position, state)
            }
            fn sample_load_metric(&mut self) -> f64 {
                20.0
            }
        }

        let mut fixture = Fixture::new();
        let mut scheduler = MutationScheduler::new(4);
        let log = Rc::new(RefCell::new(Vec::new()));
        let (job, _) = job(&mut fixture, 1, SchedulePolicy::Exclusive, row(4, 2), &log);
        scheduler.submit(job);

        let mut host = NeverResident(MemoryGrid::new(RegionLayout::new(16), 4));
        let mut env = TickEnv {
            host: &mut host,
            clock: &fixture.clock,
            budget: &mut fixture.budget,
            leases: &mut fixture.leases,
            executor: &mut fixture.executor,
        };
        let report = scheduler.run_tick(1, &mut env);
        assert_eq!(report.applied, 0);
        assert_eq!(report.batches, 1);
        assert_eq!(report.waiting, 1);
        assert_eq!(fixture.executor.stats().deferrals, 1);
    }
}
