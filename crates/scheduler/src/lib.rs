//! Thumbgrid Scheduler Library
//!
//! Admission ordering, concurrency limits and visibility tiers for the
//! thumbnail loader.
//!
//! Keys wait in three FIFO lanes (urgent, high, low) and are admitted in tier
//! order whenever a concurrency slot frees. Tiers come from viewport
//! visibility; a background planner tops up low-priority work between frames;
//! generations and cancellation tokens invalidate work when the displayed
//! collection is replaced.
//!
//! # Example
//!
//! ```
//! use thumbgrid_scheduler::{AdmissionQueue, ConcurrencyLimit, GenerationScope, Tier};
//!
//! let mut queue = AdmissionQueue::new();
//! let mut limit = ConcurrencyLimit::new(1, 0);
//! let mut scope = GenerationScope::new();
//!
//! queue.push("lot1/wafer_007.png", Tier::Low);
//! queue.push("lot1/wafer_001.png", Tier::Urgent);
//!
//! // The urgent key takes the only slot
//! let (key, tier) = limit.admit_next(&mut queue).unwrap();
//! assert_eq!((key, tier), ("lot1/wafer_001.png", Tier::Urgent));
//!
//! // Switching folders drops queued work and cancels the running fetch's token
//! let token = scope.token();
//! queue.clear();
//! scope.advance();
//! assert!(token.is_cancelled());
//! ```

mod cancel;
mod concurrency;
mod filler;
mod priority;
mod viewport;

pub use cancel::{CancellationToken, Generation, GenerationScope};
pub use concurrency::{ConcurrencyLimit, SlotGrant};
pub use filler::{FillPlanner, FillSlot, FillStep};
pub use priority::{AdmissionQueue, Enqueued, Tier};
pub use viewport::{
    CellId, LayoutOracle, Rect, Viewport, Visibility, VisibilityEvent, VisibilityOracle,
    URGENT_RATIO,
};
