//! Resolves templates against target origins into absolute operation lists.
//!
//! This is the only stage allowed to run off the mutation thread: it reads
//! immutable templates and produces an independent result.

use crate::engine::scheduler::JobId;
use crate::engine::template::{Template, TemplateError, TemplateStore};
use crate::telemetry::logging;
use crate::world::grid::CellState;
use crate::world::position::{BoundingBox, Position};
use crate::world::region::{RegionId, RegionLayout};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Build,
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Write,
    Clear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationOperation {
    pub position: Position,
    pub target: CellState,
    pub kind: OpKind,
}

/// Cells an operation list touches: the exact box, and that box rounded out
/// to whole regions for leasing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Footprint {
    pub touched: BoundingBox,
    pub regions: Vec<RegionId>,
}

#[derive(Debug, Clone, Default)]
pub struct PrecomputeResult {
    pub operations: Vec<MutationOperation>,
    pub footprint: Option<Footprint>,
}

impl PrecomputeResult {
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// Builds the operation list for `template` placed so that its origin lands
/// on `origin`. Build jobs skip cells holding the template's empty marker;
/// clear jobs turn every listed cell into a clear to that marker.
pub fn precompute(
    template: &Template,
    origin: Position,
    kind: JobKind,
    layout: &RegionLayout,
) -> PrecomputeResult {
    let empty = template.empty();
    let mut operations = Vec::with_capacity(template.cell_count().min(1 << 20) as usize);
    let mut touched: Option<BoundingBox> = None;
    let mut dropped = 0u64;

    for (relative, state) in template.cells() {
        let op = match kind {
            JobKind::Build if state == empty => continue,
            JobKind::Build => (state, OpKind::Write),
            JobKind::Clear => (empty, OpKind::Clear),
        };
        let Some(position) = relative
            .delta_from(template.origin())
            .and_then(|delta| origin.offset(delta))
        else {
            dropped += 1;
            continue;
        };
        match touched.as_mut() {
            Some(bounds) => bounds.include(position),
            None => touched = Some(BoundingBox::point(position)),
        }
        operations.push(MutationOperation {
            position,
            target: op.0,
            kind: op.1,
        });
    }

    if dropped > 0 {
        logging::log_error(&format!(
            "template '{}' at {}: {} cells fall outside the coordinate range",
            template.name(),
            origin,
            dropped
        ));
    }

    let footprint = touched.map(|touched| Footprint {
        regions: layout.regions_covering(&touched),
        touched,
    });
    PrecomputeResult {
        operations,
        footprint,
    }
}

/// Looks `name` up and precomputes it. A template that cannot be loaded
/// yields an empty result.
pub fn resolve(
    store: &TemplateStore,
    name: &str,
    origin: Position,
    kind: JobKind,
    layout: &RegionLayout,
) -> PrecomputeResult {
    match store.get(name) {
        Ok(template) => precompute(&template, origin, kind, layout),
        Err(err) => {
            log_template_error(name, &err);
            PrecomputeResult::default()
        }
    }
}

/// `resolve` for a queued request. A panic while resolving yields an empty
/// result, so the request still reaches the rendezvous.
fn resolve_request(
    store: &TemplateStore,
    request: &PrecomputeRequest,
    layout: &RegionLayout,
) -> PrecomputeResult {
    let resolved = panic::catch_unwind(AssertUnwindSafe(|| {
        resolve(store, &request.template, request.origin, request.kind, layout)
    }));
    resolved.unwrap_or_else(|_| {
        logging::log_error(&format!(
            "{} precompute of '{}' panicked, treating as empty",
            request.job, request.template
        ));
        PrecomputeResult::default()
    })
}

fn log_template_error(name: &str, err: &TemplateError) {
    logging::log_error(&format!("template '{}' unavailable: {}", name, err));
}

#[derive(Debug, Clone)]
pub struct PrecomputeRequest {
    pub job: JobId,
    pub template: String,
    pub origin: Position,
    pub kind: JobKind,
}

#[derive(Debug)]
pub struct PrecomputeDone {
    pub job: JobId,
    pub result: PrecomputeResult,
}

/// Runs `resolve` on a pool of worker threads, or inline when the pool is
/// empty. Results are collected on the mutation thread with `drain`.
pub struct Precomputer {
    store: Arc<TemplateStore>,
    layout: RegionLayout,
    requests: Option<Sender<PrecomputeRequest>>,
    results: Receiver<PrecomputeDone>,
    result_tx: Sender<PrecomputeDone>,
    ready: VecDeque<PrecomputeDone>,
    workers: Vec<JoinHandle<()>>,
    in_flight: usize,
}

impl Precomputer {
    pub fn new(store: Arc<TemplateStore>, layout: RegionLayout, workers: usize) -> Self {
        let (result_tx, results) = mpsc::channel();
        let mut precomputer = Precomputer {
            store,
            layout,
            requests: None,
            results,
            result_tx,
            ready: VecDeque::new(),
            workers: Vec::new(),
            in_flight: 0,
        };
        if workers > 0 {
            precomputer.spawn_workers(workers);
        }
        precomputer
    }

    fn spawn_workers(&mut self, count: usize) {
        let (tx, rx) = mpsc::channel::<PrecomputeRequest>();
        let rx = Arc::new(Mutex::new(rx));
        for index in 0..count {
            let rx = Arc::clone(&rx);
            let results = self.result_tx.clone();
            let store = Arc::clone(&self.store);
            let layout = self.layout;
            let spawned = thread::Builder::new()
                .name(format!("precompute-{}", index))
                .spawn(move || loop {
                    let request = match rx.lock() {
                        Ok(rx) => match rx.recv() {
                            Ok(request) => request,
                            Err(_) => return,
                        },
                        Err(_) => return,
                    };
                    let result = resolve_request(&store, &request, &layout);
                    if results.send(PrecomputeDone { job: request.job, result }).is_err() {
                        return;
                    }
                });
            match spawned {
                Ok(handle) => self.workers.push(handle),
                Err(err) => logging::log_error(&format!("precompute worker spawn failed: {}", err)),
            }
        }
        if !self.workers.is_empty() {
            self.requests = Some(tx);
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Requests submitted and not yet drained.
    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn submit(&mut self, request: PrecomputeRequest) {
        self.in_flight += 1;
        let request = match self.requests.as_ref() {
            Some(tx) => match tx.send(request) {
                Ok(()) => return,
                Err(mpsc::SendError(request)) => {
                    logging::log_error("precompute workers gone, resolving inline");
                    self.requests = None;
                    request
                }
            },
            None => request,
        };
        let result = resolve_request(&self.store, &request, &self.layout);
        self.ready.push_back(PrecomputeDone {
            job: request.job,
            result,
        });
    }

    /// Every result finished so far, without blocking.
    pub fn drain(&mut self) -> Vec<PrecomputeDone> {
        let mut done: Vec<PrecomputeDone> = self.ready.drain(..).collect();
        done.extend(self.results.try_iter());
        self.in_flight = self.in_flight.saturating_sub(done.len());
        done
    }
}

impl Drop for Precomputer {
    fn drop(&mut self) {
        self.requests = None;
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::template::CellEntry;
    use std::time::{Duration, Instant};

    fn template() -> Template {
        // 3x1x1 row with one explicit empty cell in the middle.
        Template::new(
            "row",
            Position::new(1, 0, 0),
            BoundingBox::new(Position::new(0, 0, 0), Position::new(2, 0, 0)),
            CellState::EMPTY,
            vec![
                CellEntry::Single(0, 0, 0, CellState(4)),
                CellEntry::Single(1, 0, 0, CellState::EMPTY),
                CellEntry::Single(2, 0, 0, CellState(5)),
            ],
        )
        .unwrap()
    }

    #[test]
    fn build_skips_empty_cells_and_offsets_by_origin() {
        let layout = RegionLayout::new(16);
        let result = precompute(&template(), Position::new(100, 64, -3), JobKind::Build, &layout);
        assert_eq!(
            result.operations,
            vec![
                MutationOperation {
                    position: Position::new(99, 64, -3),
                    target: CellState(4),
                    kind: OpKind::Write,
                },
                MutationOperation {
                    position: Position::new(101, 64, -3),
                    target: CellState(5),
                    kind: OpKind::Write,
                },
            ]
        );
        let footprint = result.footprint.unwrap();
        assert_eq!(footprint.touched.min, Position::new(99, 64, -3));
        assert_eq!(footprint.touched.max, Position::new(101, 64, -3));
        assert_eq!(footprint.regions, vec![RegionId::new(6, 4, -1)]);
    }

    #[test]
    fn clear_covers_every_listed_cell() {
        let layout = RegionLayout::new(16);
        let result = precompute(&template(), Position::new(15, 0, 0), JobKind::Clear, &layout);
        assert_eq!(result.operations.len(), 3);
        assert!(result
            .operations
            .iter()
            .all(|op| op.kind == OpKind::Clear && op.target == CellState::EMPTY));
        assert_eq!(result.operations[1].position, Position::new(15, 0, 0));
        let regions = result.footprint.unwrap().regions;
        assert_eq!(regions, vec![RegionId::new(0, 0, 0), RegionId::new(1, 0, 0)]);
    }

    #[test]
    fn all_empty_build_has_no_footprint() {
        let empty = Template::new(
            "air",
            Position::new(0, 0, 0),
            BoundingBox::point(Position::new(0, 0, 0)),
            CellState::EMPTY,
            vec![CellEntry::Single(0, 0, 0, CellState::EMPTY)],
        )
        .unwrap();
        let result = precompute(&empty, Position::new(0, 0, 0), JobKind::Build, &RegionLayout::default());
        assert!(result.is_empty());
        assert!(result.footprint.is_none());
    }

    #[test]
    fn missing_template_resolves_empty() {
        let store = TemplateStore::new(std::env::temp_dir().join("gridstamp-no-such-dir"));
        let result = resolve(&store, "ghost", Position::new(0, 0, 0), JobKind::Build, &RegionLayout::default());
        assert!(result.is_empty());
    }

    #[test]
    fn inline_results_are_ready_immediately() {
        let store = Arc::new(TemplateStore::new(std::env::temp_dir()));
        store.insert(template()).unwrap();
        let mut precomputer = Precomputer::new(store, RegionLayout::default(), 0);
        precomputer.submit(PrecomputeRequest {
            job: JobId(1),
            template: "row".to_string(),
            origin: Position::new(1, 0, 0),
            kind: JobKind::Build,
        });
        assert_eq!(precomputer.in_flight(), 1);
        let done = precomputer.drain();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].job, JobId(1));
        assert_eq!(done[0].result.operations.len(), 2);
        assert_eq!(precomputer.in_flight(), 0);
    }

    #[test]
    fn workers_deliver_every_request() {
        let store = Arc::new(TemplateStore::new(std::env::temp_dir()));
        store.insert(template()).unwrap();
        let mut precomputer = Precomputer::new(store, RegionLayout::default(), 3);
        assert_eq!(precomputer.worker_count(), 3);
        for id in 0..10 {
            precomputer.submit(PrecomputeRequest {
                job: JobId(id),
                template: "row".to_string(),
                origin: Position::new(id as i32 * 3, 0, 0),
                kind: JobKind::Clear,
            });
        }
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut done = Vec::new();
        while done.len() < 10 && Instant::now() < deadline {
            done.extend(precomputer.drain());
            std::thread::sleep(Duration::from_millis(1));
        }
        let mut ids: Vec<u64> = done.iter().map(|d| d.job.0).collect();
        ids.sort();
        assert_eq!(ids, (0..10).collect::<Vec<_>>());
        assert!(done.iter().all(|d| d.result.operations.len() == 3));
    }
}
