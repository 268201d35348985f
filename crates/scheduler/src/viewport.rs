//! Viewport-aware tier assignment
//!
//! Grid cells are classified by how much of them is inside the viewport:
//! 1. Urgent - more than 40% of the cell is visible
//! 2. High - partially visible, or inside the lookahead margin around the viewport
//! 3. Low - off-screen
//!
//! Hosts deliver visibility through a [`VisibilityOracle`]. [`LayoutOracle`]
//! computes it from cell rectangles and a scroll viewport for hosts without a
//! native intersection mechanism.

use crate::priority::Tier;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Intersection ratio above which a cell is urgent
pub const URGENT_RATIO: f32 = 0.4;

/// Opaque identifier of one grid cell
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellId(pub u64);

impl fmt::Display for CellId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cell#{}", self.0)
    }
}

/// Axis-aligned rectangle in layout pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rect {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Rect {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Area shared with `other` (zero when disjoint)
    pub fn intersection_area(&self, other: &Rect) -> f32 {
        let w = (self.x + self.width).min(other.x + other.width) - self.x.max(other.x);
        let h = (self.y + self.height).min(other.y + other.height) - self.y.max(other.y);
        if w <= 0.0 || h <= 0.0 {
            0.0
        } else {
            w * h
        }
    }

    /// This rectangle grown by `margin` on every side
    pub fn expanded(&self, margin: f32) -> Rect {
        Rect::new(
            self.x - margin,
            self.y - margin,
            self.width + 2.0 * margin,
            self.height + 2.0 * margin,
        )
    }
}

/// Visible region of the scroll container, in the same space as cell rects
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub bounds: Rect,
}

impl Viewport {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            bounds: Rect::new(x, y, width, height),
        }
    }

    /// The same viewport scrolled to `y`
    pub fn scrolled_to(mut self, y: f32) -> Self {
        self.bounds.y = y;
        self
    }
}

/// Measured visibility of one cell
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Visibility {
    /// Visible fraction of the cell area (0.0 to 1.0)
    pub ratio: f32,

    /// Whether the cell touches the viewport grown by the lookahead margin
    pub within_lookahead: bool,
}

impl Visibility {
    pub fn measure(cell: &Rect, viewport: &Viewport, lookahead_px: f32) -> Self {
        let area = cell.area();
        let ratio = if area > 0.0 {
            (cell.intersection_area(&viewport.bounds) / area).clamp(0.0, 1.0)
        } else {
            0.0
        };
        let within_lookahead =
            ratio > 0.0 || cell.intersection_area(&viewport.bounds.expanded(lookahead_px)) > 0.0;
        Self {
            ratio,
            within_lookahead,
        }
    }

    /// Map a measurement to a tier
    pub fn tier(&self) -> Tier {
        if self.ratio > URGENT_RATIO {
            Tier::Urgent
        } else if self.ratio > 0.0 || self.within_lookahead {
            Tier::High
        } else {
            Tier::Low
        }
    }
}

/// A change in a cell's tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VisibilityEvent {
    pub cell: CellId,
    pub tier: Tier,
}

/// Source of visibility changes for observed cells
///
/// Implementations report each observed cell's tier the first time it is
/// known and again whenever it changes.
pub trait VisibilityOracle: Send {
    /// Start reporting on `cell`
    fn observe(&mut self, cell: CellId);

    /// Stop reporting on `cell`
    fn unobserve(&mut self, cell: CellId);

    /// Stop reporting on every cell
    fn disconnect(&mut self);

    /// Drain pending tier changes
    fn poll_events(&mut self) -> Vec<VisibilityEvent>;
}

#[derive(Debug, Default)]
struct LayoutState {
    lookahead_px: f32,
    viewport: Option<Viewport>,
    rects: HashMap<CellId, Rect>,
    observed: HashMap<CellId, Option<Tier>>,
}

/// Layout-driven oracle
///
/// A shared handle: the host keeps a clone to place cells and move the
/// viewport, while the loader polls it for events.
///
/// # Example
///
/// ```
/// use thumbgrid_scheduler::{CellId, LayoutOracle, Rect, Tier, Viewport, VisibilityOracle};
///
/// let oracle = LayoutOracle::new(100.0);
/// oracle.place(CellId(1), Rect::new(0.0, 0.0, 100.0, 100.0));
/// oracle.place(CellId(2), Rect::new(0.0, 1000.0, 100.0, 100.0));
/// oracle.set_viewport(Viewport::new(0.0, 0.0, 800.0, 600.0));
///
/// let mut polled = oracle.clone();
/// polled.observe(CellId(1));
/// polled.observe(CellId(2));
///
/// let events = polled.poll_events();
/// assert_eq!(events[0].tier, Tier::Urgent);
/// assert_eq!(events[1].tier, Tier::Low);
/// ```
#[derive(Debug, Clone)]
pub struct LayoutOracle {
    state: Arc<Mutex<LayoutState>>,
}

impl LayoutOracle {
    pub fn new(lookahead_px: f32) -> Self {
        Self {
            state: Arc::new(Mutex::new(LayoutState {
                lookahead_px,
                ..Default::default()
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LayoutState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set or move a cell's rectangle
    pub fn place(&self, cell: CellId, rect: Rect) {
        self.lock().rects.insert(cell, rect);
    }

    /// Forget a cell's rectangle
    pub fn remove(&self, cell: CellId) {
        self.lock().rects.remove(&cell);
    }

    pub fn set_viewport(&self, viewport: Viewport) {
        self.lock().viewport = Some(viewport);
    }

    pub fn viewport(&self) -> Option<Viewport> {
        self.lock().viewport
    }

    pub fn set_lookahead(&self, lookahead_px: f32) {
        self.lock().lookahead_px = lookahead_px;
    }

    /// Number of cells currently observed
    pub fn observed_len(&self) -> usize {
        self.lock().observed.len()
    }

    /// Current tier of a placed cell, regardless of observation
    pub fn tier_of(&self, cell: CellId) -> Option<Tier> {
        let state = self.lock();
        let viewport = state.viewport?;
        let rect = state.rects.get(&cell)?;
        Some(Visibility::measure(rect, &viewport, state.lookahead_px).tier())
    }
}

impl VisibilityOracle for LayoutOracle {
    fn observe(&mut self, cell: CellId) {
        self.lock().observed.entry(cell).or_insert(None);
    }

    fn unobserve(&mut self, cell: CellId) {
        self.lock().observed.remove(&cell);
    }

    fn disconnect(&mut self) {
        self.lock().observed.clear();
    }

    /// Events come out in reading order (top to bottom, left to right).
    fn poll_events(&mut self) -> Vec<VisibilityEvent> {
        let mut state = self.lock();
        let Some(viewport) = state.viewport else {
            return Vec::new();
        };
        let lookahead = state.lookahead_px;

        let mut changed: Vec<(Rect, VisibilityEvent)> = Vec::new();
        let LayoutState {
            rects, observed, ..
        } = &mut *state;
        for (cell, last) in observed.iter_mut() {
            let Some(rect) = rects.get(cell) else {
                continue;
            };
            let tier = Visibility::measure(rect, &viewport, lookahead).tier();
            if *last != Some(tier) {
                *last = Some(tier);
                changed.push((*rect, VisibilityEvent { cell: *cell, tier }));
            }
        }

        changed.sort_by(|(a, ea), (b, eb)| {
            a.y.total_cmp(&b.y)
                .then(a.x.total_cmp(&b.x))
                .then(ea.cell.cmp(&eb.cell))
        });
        changed.into_iter().map(|(_, event)| event).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cell_at(row: u32) -> Rect {
        Rect::new(0.0, row as f32 * 100.0, 100.0, 100.0)
    }

    #[test]
    fn test_rect_intersection() {
        let a = Rect::new(0.0, 0.0, 100.0, 100.0);
        let b = Rect::new(50.0, 50.0, 100.0, 100.0);
        assert_eq!(a.intersection_area(&b), 2500.0);
        assert_eq!(a.intersection_area(&Rect::new(200.0, 0.0, 10.0, 10.0)), 0.0);
        // Touching edges do not intersect
        assert_eq!(a.intersection_area(&Rect::new(100.0, 0.0, 10.0, 10.0)), 0.0);
    }

    #[test]
    fn test_classification_thresholds() {
        let tier = |ratio, within_lookahead| {
            Visibility {
                ratio,
                within_lookahead,
            }
            .tier()
        };
        assert_eq!(tier(1.0, true), Tier::Urgent);
        assert_eq!(tier(0.41, true), Tier::Urgent);
        assert_eq!(tier(0.4, true), Tier::High);
        assert_eq!(tier(0.1, true), Tier::High);
        assert_eq!(tier(0.0, true), Tier::High);
        assert_eq!(tier(0.0, false), Tier::Low);
    }

    #[test]
    fn test_measure() {
        let viewport = Viewport::new(0.0, 0.0, 800.0, 600.0);

        let fully = Visibility::measure(&cell_at(0), &viewport, 200.0);
        assert_eq!(fully.ratio, 1.0);
        assert_eq!(fully.tier(), Tier::Urgent);

        // Rows 5..6 straddle the bottom edge at 600
        let straddling = Visibility::measure(&Rect::new(0.0, 570.0, 100.0, 100.0), &viewport, 200.0);
        assert!((straddling.ratio - 0.3).abs() < 1e-6);
        assert_eq!(straddling.tier(), Tier::High);

        let lookahead = Visibility::measure(&cell_at(7), &viewport, 200.0);
        assert_eq!(lookahead.ratio, 0.0);
        assert!(lookahead.within_lookahead);
        assert_eq!(lookahead.tier(), Tier::High);

        let far = Visibility::measure(&cell_at(20), &viewport, 200.0);
        assert_eq!(far.tier(), Tier::Low);
    }

    #[test]
    fn test_zero_area_cell_is_not_visible() {
        let viewport = Viewport::new(0.0, 0.0, 800.0, 600.0);
        let empty = Rect::new(10.0, 10.0, 0.0, 0.0);
        assert_eq!(Visibility::measure(&empty, &viewport, 0.0).ratio, 0.0);
    }

    #[test]
    fn test_oracle_reports_only_changes() {
        let mut oracle = LayoutOracle::new(100.0);
        for row in 0..20 {
            oracle.place(CellId(row as u64), cell_at(row));
            oracle.observe(CellId(row as u64));
        }
        // No viewport yet: nothing to report
        assert!(oracle.poll_events().is_empty());

        oracle.set_viewport(Viewport::new(0.0, 0.0, 100.0, 300.0));
        let events = oracle.poll_events();
        assert_eq!(events.len(), 20);
        assert_eq!(events[0], VisibilityEvent { cell: CellId(0), tier: Tier::Urgent });
        assert_eq!(events[3].tier, Tier::High);
        assert_eq!(events[19].tier, Tier::Low);

        assert!(oracle.poll_events().is_empty());

        // Scroll down by two rows
        oracle.set_viewport(Viewport::new(0.0, 200.0, 100.0, 300.0));
        let events = oracle.poll_events();
        let tiers: HashMap<CellId, Tier> = events.iter().map(|e| (e.cell, e.tier)).collect();
        assert_eq!(tiers.get(&CellId(0)), Some(&Tier::Low));
        assert_eq!(tiers.get(&CellId(1)), Some(&Tier::High));
        assert_eq!(tiers.get(&CellId(4)), Some(&Tier::Urgent));
        assert_eq!(tiers.get(&CellId(5)), Some(&Tier::High));
        // Row 6 was low before and still is
        assert!(!tiers.contains_key(&CellId(6)));
        assert!(!tiers.contains_key(&CellId(19)));
    }

    #[test]
    fn test_events_in_reading_order() {
        let mut oracle = LayoutOracle::new(0.0);
        oracle.set_viewport(Viewport::new(0.0, 0.0, 1000.0, 1000.0));
        oracle.place(CellId(3), Rect::new(100.0, 100.0, 100.0, 100.0));
        oracle.place(CellId(2), Rect::new(0.0, 100.0, 100.0, 100.0));
        oracle.place(CellId(1), Rect::new(100.0, 0.0, 100.0, 100.0));
        for id in [3, 2, 1] {
            oracle.observe(CellId(id));
        }

        let cells: Vec<CellId> = oracle.poll_events().into_iter().map(|e| e.cell).collect();
        assert_eq!(cells, vec![CellId(1), CellId(2), CellId(3)]);
    }

    #[test]
    fn test_unobserve_and_disconnect() {
        let mut oracle = LayoutOracle::new(0.0);
        oracle.set_viewport(Viewport::new(0.0, 0.0, 100.0, 100.0));
        oracle.place(CellId(1), cell_at(0));
        oracle.place(CellId(2), cell_at(0));
        oracle.observe(CellId(1));
        oracle.observe(CellId(2));

        oracle.unobserve(CellId(1));
        assert_eq!(oracle.poll_events().len(), 1);

        oracle.disconnect();
        assert_eq!(oracle.observed_len(), 0);
        oracle.observe(CellId(1));
        // Re-observed cells report their tier again
        assert_eq!(oracle.poll_events().len(), 1);
    }

    #[test]
    fn test_tier_of_without_observation() {
        let oracle = LayoutOracle::new(0.0);
        oracle.place(CellId(1), cell_at(0));
        assert_eq!(oracle.tier_of(CellId(1)), None);
        oracle.set_viewport(Viewport::new(0.0, 0.0, 100.0, 100.0));
        assert_eq!(oracle.tier_of(CellId(1)), Some(Tier::Urgent));
        assert_eq!(oracle.viewport().map(|v| v.scrolled_to(50.0).bounds.y), Some(50.0));
    }
}
