use std::ops::Range;

/// Columns of a `cols`-wide matrix reduced by `rank` in a `world`-sized group.
///
/// Stripes are contiguous, disjoint, cover every column, and differ in width
/// by at most one. A rank gets an empty range when `cols < world`.
pub fn stripe_columns(cols: usize, world: usize, rank: usize) -> Range<usize> {
    if world == 0 {
        return 0..0;
    }
    cols * rank / world..cols * (rank + 1) / world
}
