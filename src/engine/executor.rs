use crate::engine::lease::LeaseSet;
use crate::engine::precompute::MutationOperation;
use crate::telemetry::logging;
use crate::world::grid::Host;
use crate::world::region::RegionLayout;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Written,
    /// The cell already held the target value.
    Unchanged,
    /// The leased region was not resident; residency was re-requested and the
    /// operation must be retried in a later batch.
    Deferred,
}

impl ApplyOutcome {
    pub fn did_work(self) -> bool {
        self == ApplyOutcome::Written
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecutorStats {
    pub writes: u64,
    pub unchanged: u64,
    pub deferrals: u64,
}

/// Applies single operations to the host grid. Must only run on the mutation thread.
#[derive(Debug)]
pub struct MutationExecutor {
    layout: RegionLayout,
    stats: ExecutorStats,
}

impl MutationExecutor {
    pub fn new(layout: RegionLayout) -> Self {
        MutationExecutor {
            layout,
            stats: ExecutorStats::default(),
        }
    }

    pub fn apply<H: Host + ?Sized>(
        &mut self,
        host: &mut H,
        op: &MutationOperation,
        leases: &LeaseSet,
    ) -> ApplyOutcome {
        let region = self.layout.region_of(op.position);
        if leases.contains(region) && !host.is_region_resident(region) {
            logging::log_error(&format!(
                "leased {} not resident at {}, re-requesting",
                region, op.position
            ));
            host.mark_resident(region);
            self.stats.deferrals += 1;
            return ApplyOutcome::Deferred;
        }
        if host.read_cell(op.position) == op.target {
            self.stats.unchanged += 1;
            return ApplyOutcome::Unchanged;
        }
        host.write_cell(op.position, op.target);
        self.stats.writes += 1;
        ApplyOutcome::Written
    }

    pub fn stats(&self) -> &ExecutorStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::lease::RegionLeaseManager;
    use crate::engine::precompute::OpKind;
    use crate::world::grid::{CellState, MemoryGrid};
    use crate::world::position::{BoundingBox, Position};
    use crate::world::region::RegionId;

    fn op(x: i32, state: u32) -> MutationOperation {
        MutationOperation {
            position: Position::new(x, 0, 0),
            target: CellState(state),
            kind: OpKind::Write,
        }
    }

    fn setup() -> (MutationExecutor, RegionLeaseManager, MemoryGrid) {
        let layout = RegionLayout::new(16);
        let grid = BoundingBox::new(Position::new(-256, -256, -256), Position::new(255, 255, 255));
        (
            MutationExecutor::new(layout),
            RegionLeaseManager::new(layout, grid),
            MemoryGrid::new(layout, 8),
        )
    }

    #[test]
    fn matching_cells_are_not_rewritten() {
        let (mut executor, mut leases, mut host) = setup();
        let set = leases.acquire(&mut host, &[RegionId::new(0, 0, 0)]);
        assert_eq!(executor.apply(&mut host, &op(1, 3), &set), ApplyOutcome::Written);
        assert_eq!(executor.apply(&mut host, &op(1, 3), &set), ApplyOutcome::Unchanged);
        assert_eq!(host.stats().writes, 1);
        assert_eq!(executor.stats().unchanged, 1);
        leases.release(&mut host, set);
    }

    #[test]
    fn evicted_leased_region_defers_and_recovers() {
        let (mut executor, mut leases, mut host) = setup();
        let region = RegionId::new(0, 0, 0);
        let set = leases.acquire(&mut host, &[region]);
        host.force_evict(region);

        let outcome = executor.apply(&mut host, &op(2, 8), &set);
        assert_eq!(outcome, ApplyOutcome::Deferred);
        assert!(!outcome.did_work());
        assert_eq!(host.peek(Position::new(2, 0, 0)), CellState::EMPTY);
        assert!(host.is_region_resident(region));

        assert_eq!(executor.apply(&mut host, &op(2, 8), &set), ApplyOutcome::Written);
        assert_eq!(executor.stats().deferrals, 1);
        leases.release(&mut host, set);
    }

    #[test]
    fn unleased_regions_are_written_without_residency_checks() {
        let (mut executor, _leases, mut host) = setup();
        let unleased = LeaseSet::default();
        assert_eq!(executor.apply(&mut host, &op(40, 1), &unleased), ApplyOutcome::Written);
        assert_eq!(host.peek(Position::new(40, 0, 0)), CellState(1));
    }
}
