//! Integer rectangles in leaf-tile space

/// Rectangle given by its top-left point and extent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RectI {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl RectI {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self { x, y, width, height }
    }

    /// Square covering every leaf tile of a tree with `leaf_tiles` per side
    pub fn full(leaf_tiles: u32) -> Self {
        Self::new(0, 0, leaf_tiles as i32, leaf_tiles as i32)
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// Cells of size `cell` touched by this rectangle, as half-open ranges
    /// `(x_start..x_end, y_start..y_end)`, clamped to `[0, limit)`.
    ///
    /// The start is floored and the end ceiled, so partially covered cells
    /// are included.
    pub fn cell_span(&self, cell: u32, limit: u32) -> (std::ops::Range<u32>, std::ops::Range<u32>) {
        let cell = cell.max(1) as i64;
        let limit = limit as i64;
        let span = |start: i32, extent: i32| {
            let lo = (start as i64).div_euclid(cell);
            let hi = (start as i64 + extent as i64 + cell - 1).div_euclid(cell);
            let lo = lo.clamp(0, limit) as u32;
            let hi = hi.clamp(0, limit) as u32;
            lo..hi.max(lo)
        };
        (span(self.x, self.width), span(self.y, self.height))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_span_rounds_outward() {
        let rect = RectI::new(1, 2, 2, 1);
        let (xs, ys) = rect.cell_span(2, 4);
        assert_eq!(xs, 0..2);
        assert_eq!(ys, 1..2);
    }

    #[test]
    fn test_cell_span_clamps() {
        let rect = RectI::new(-5, -5, 100, 3);
        let (xs, ys) = rect.cell_span(4, 2);
        assert_eq!(xs, 0..2);
        assert_eq!(ys, 0..0);
    }

    #[test]
    fn test_full_rect() {
        let rect = RectI::full(4);
        let (xs, ys) = rect.cell_span(1, 4);
        assert_eq!(xs, 0..4);
        assert_eq!(ys, 0..4);
        assert!(!rect.is_empty());
        assert!(RectI::new(0, 0, 0, 5).is_empty());
    }
}
