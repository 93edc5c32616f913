//! Complete-quadtree indexing math
//!
//! Stubs of a quadtree TOC live in one flat array, level by level from the
//! root. Within a level, node `(x, y)` sits at `(x << level) + y`.

use crate::core::types::UVec2;

/// Deepest tree a TOC may declare. A depth-12 tree already has ~5.6M stubs.
pub const MAX_TREE_DEPTH: u32 = 12;

/// Order in which a TOC gathers the four children of a node, as (x, y)
/// offsets from `2 * pos`.
///
/// Generation passes children to the chunk codec in exactly this order.
pub const CHILD_CORNERS: [[u32; 2]; 4] = [
    [0, 0],
    [0, 1],
    [1, 0],
    [1, 1],
];

/// Number of nodes in a complete quadtree of `depth` levels: (4^D - 1) / 3
///
/// # Examples
/// ```
/// use quadatlas::streaming::quadtree::node_count;
///
/// assert_eq!(node_count(0), 0);
/// assert_eq!(node_count(1), 1);
/// assert_eq!(node_count(3), 21);
/// ```
pub fn node_count(depth: u32) -> usize {
    ((1usize << (2 * depth)) - 1) / 3
}

/// Number of nodes on all levels above `level`
pub fn nodes_before(level: u32) -> usize {
    node_count(level)
}

/// Nodes along one side of `level`
pub fn level_width(level: u32) -> u32 {
    1 << level
}

/// Leaf tiles along one side of a tree of `depth` levels
pub fn leaf_tiles(depth: u32) -> u32 {
    if depth == 0 { 0 } else { level_width(depth - 1) }
}

/// Flat index of the node at `(level, pos)`
pub fn node_index(level: u32, pos: UVec2) -> usize {
    debug_assert!(pos.x < level_width(level) && pos.y < level_width(level));
    nodes_before(level) + ((pos.x as usize) << level) + pos.y as usize
}

/// Inverse of [`node_index`]
pub fn node_position(index: usize) -> (u32, UVec2) {
    let mut level = 0;
    while node_count(level + 1) <= index {
        level += 1;
    }
    let local = index - nodes_before(level);
    let mask = (1usize << level) - 1;
    (level, UVec2::new((local >> level) as u32, (local & mask) as u32))
}

/// Children of `(level, pos)` in [`CHILD_CORNERS`] order
pub fn children(level: u32, pos: UVec2) -> [(u32, UVec2); 4] {
    CHILD_CORNERS.map(|[dx, dy]| (level + 1, UVec2::new(pos.x * 2 + dx, pos.y * 2 + dy)))
}

/// Parent of `(level, pos)`, or `None` for the root
pub fn parent(level: u32, pos: UVec2) -> Option<(u32, UVec2)> {
    if level == 0 {
        None
    } else {
        Some((level - 1, UVec2::new(pos.x / 2, pos.y / 2)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_node_count_formula() {
        for depth in 1..=MAX_TREE_DEPTH {
            let expected = (4usize.pow(depth) - 1) / 3;
            assert_eq!(node_count(depth), expected, "depth {}", depth);
        }
    }

    #[test]
    fn test_node_index_injective_and_dense() {
        for depth in 1..=6 {
            let mut seen = HashSet::new();
            for level in 0..depth {
                for x in 0..level_width(level) {
                    for y in 0..level_width(level) {
                        let idx = node_index(level, UVec2::new(x, y));
                        assert!(idx < node_count(depth));
                        assert!(seen.insert(idx), "duplicate index {} at depth {}", idx, depth);
                    }
                }
            }
            assert_eq!(seen.len(), node_count(depth));
        }
    }

    #[test]
    fn test_node_position_roundtrip() {
        for index in 0..node_count(5) {
            let (level, pos) = node_position(index);
            assert_eq!(node_index(level, pos), index);
        }
    }

    #[test]
    fn test_children_order() {
        let kids = children(1, UVec2::new(1, 0));
        assert_eq!(kids[0], (2, UVec2::new(2, 0)));
        assert_eq!(kids[1], (2, UVec2::new(2, 1)));
        assert_eq!(kids[2], (2, UVec2::new(3, 0)));
        assert_eq!(kids[3], (2, UVec2::new(3, 1)));
        for (level, pos) in kids {
            assert_eq!(parent(level, pos), Some((1, UVec2::new(1, 0))));
        }
        assert_eq!(parent(0, UVec2::ZERO), None);
    }

    #[test]
    fn test_leaf_tiles() {
        assert_eq!(leaf_tiles(0), 0);
        assert_eq!(leaf_tiles(1), 1);
        assert_eq!(leaf_tiles(3), 4);
    }
}
