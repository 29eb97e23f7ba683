//! Raster value generators with predictable, verifiable patterns.

/// Creates a grid where each cell is `col * 1000 + row`.
///
/// Row-major order (row 0 first).
///
/// ```
/// use test_utils::create_test_grid;
///
/// let grid = create_test_grid(10, 5);
/// assert_eq!(grid.len(), 50);
/// assert_eq!(grid[1], 1000.0); // col=1, row=0
/// assert_eq!(grid[10], 1.0);   // col=0, row=1
/// ```
pub fn create_test_grid(width: usize, height: usize) -> Vec<f32> {
    let mut data = Vec::with_capacity(width * height);
    for row in 0..height {
        for col in 0..width {
            data.push((col * 1000 + row) as f32);
        }
    }
    data
}

/// Creates a grid filled with a constant value.
pub fn create_constant_grid(width: usize, height: usize, value: f32) -> Vec<f32> {
    vec![value; width * height]
}

/// Creates a grid where every `nth` cell holds `fill` (a nodata value or NaN)
/// and the rest count up from 0.
pub fn create_grid_with_fill(width: usize, height: usize, nth: usize, fill: f32) -> Vec<f32> {
    (0..width * height)
        .map(|i| {
            if nth > 0 && i % nth == 0 {
                fill
            } else {
                i as f32
            }
        })
        .collect()
}
