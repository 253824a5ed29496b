//! Viewport lookahead
//!
//! When an item scrolls into view, the next few items after it are preloaded.
//! Dense list rows scroll past faster than grid cells, so they get a wider
//! window.

use std::ops::Range;

/// Layout of the visible item list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewDensity {
    List,
    Grid,
}

impl ViewDensity {
    /// Items to preload ahead of the one that just appeared
    pub fn lookahead(self) -> usize {
        match self {
            ViewDensity::List => 12,
            ViewDensity::Grid => 6,
        }
    }
}

/// Indices of the `window` items following `current`, clipped to `len`
pub fn lookahead(len: usize, current: usize, window: usize) -> Range<usize> {
    let start = current.saturating_add(1).min(len);
    let end = start.saturating_add(window).min(len);
    start..end
}
