//! Background fill planning
//!
//! Between frames the loader tops up low-priority work so that a grid
//! completes even when the user never scrolls. Each tick picks a few
//! unresolved cells, preferring the ones just below the visible area and
//! wrapping around to the earliest unresolved cell.

use crate::viewport::CellId;

/// Result of one background tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillStep {
    /// Unresolved cells remain; tick again next frame
    Continue,

    /// Every cell is resolved, or the working set was replaced
    Done,
}

/// One grid cell as seen by the planner, in grid order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FillSlot {
    pub cell: CellId,

    /// The cell already received its image or a final failure
    pub resolved: bool,

    /// A fetch for this cell is queued or running
    pub in_progress: bool,
}

/// Picks the next cells for background admission
#[derive(Debug, Clone)]
pub struct FillPlanner {
    batch_size: usize,
}

impl FillPlanner {
    pub fn new(batch_size: usize) -> Self {
        Self { batch_size }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Choose up to `batch_size - outstanding` cells to admit.
    ///
    /// `anchor` is the grid index of the last visible (or lookahead) cell;
    /// scanning starts right after it. Returns indices into `slots`.
    pub fn plan(&self, slots: &[FillSlot], anchor: Option<usize>, outstanding: usize) -> Vec<usize> {
        let budget = self.batch_size.saturating_sub(outstanding);
        if budget == 0 || slots.is_empty() {
            return Vec::new();
        }

        let start = anchor.map_or(0, |a| (a + 1).min(slots.len()));
        (start..slots.len())
            .chain(0..start)
            .filter(|&i| !slots[i].resolved && !slots[i].in_progress)
            .take(budget)
            .collect()
    }

    /// Whether every slot is resolved
    pub fn is_complete(slots: &[FillSlot]) -> bool {
        slots.iter().all(|slot| slot.resolved)
    }
}
