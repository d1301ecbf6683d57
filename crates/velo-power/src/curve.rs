//! Monotonic piecewise-linear lookup.
//!
//! Tables are `(x, y)` pairs sorted by ascending `x`. Between two points the
//! value is linearly interpolated; beyond either end the nearest segment is
//! extended linearly.

pub fn interp(points: &[(f32, f32)], x: f32) -> f32 {
    debug_assert!(points.len() >= 2);
    let seg = if x <= points[1].0 {
        (points[0], points[1])
    } else if x >= points[points.len() - 2].0 {
        (points[points.len() - 2], points[points.len() - 1])
    } else {
        let i = points.windows(2).position(|w| x < w[1].0).unwrap_or(points.len() - 2);
        (points[i], points[i + 1])
    };
    let ((x0, y0), (x1, y1)) = seg;
    y0 + (x - x0) * (y1 - y0) / (x1 - x0)
}
