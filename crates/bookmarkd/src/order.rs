//! Sibling ordering via lazy fractional indexing
//!
//! An insertion picks an `ord` between its neighbours and never rewrites the
//! existing siblings. Repeated splits of the same gap lose precision, so the
//! allocator reports when the gap it would split is narrower than
//! [`ORD_EPSILON`] and the caller renumbers the sibling list first.

/// Minimum gap between neighbours before the sibling list is renumbered
pub const ORD_EPSILON: f64 = 1e-6;

/// Outcome of an allocation request
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Allocation {
    /// Use this ord for the inserted node
    Ord(f64),
    /// The neighbours at the target position are too close together
    NeedsRebalance,
}

/// Resolve an optional, possibly out-of-range index to an insertion position
pub fn insertion_position(sibling_count: usize, index: Option<i64>) -> usize {
    match index {
        None => sibling_count,
        Some(i) if i <= 0 => 0,
        Some(i) => (i as usize).min(sibling_count),
    }
}

/// Compute the ord for a node inserted at `index` among `siblings`
///
/// `siblings` must be ascending.
pub fn allocate(siblings: &[f64], index: Option<i64>) -> Allocation {
    let pos = insertion_position(siblings.len(), index);

    if siblings.is_empty() {
        return Allocation::Ord(0.0);
    }
    if pos == 0 {
        return Allocation::Ord(siblings[0] - 1.0);
    }
    if pos == siblings.len() {
        return Allocation::Ord(siblings[siblings.len() - 1] + 1.0);
    }

    let (before, after) = (siblings[pos - 1], siblings[pos]);
    if after - before < ORD_EPSILON {
        return Allocation::NeedsRebalance;
    }
    Allocation::Ord(midpoint(before, after))
}

pub fn midpoint(a: f64, b: f64) -> f64 {
    (a + b) / 2.0
}

/// Evenly spaced ords for `count` siblings, preserving their current order
pub fn renumbered(count: usize) -> Vec<f64> {
    (0..count).map(|i| i as f64).collect()
}
