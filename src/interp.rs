// 折线表插值
// Breakpoint-table interpolation used by all derating sources

/// Piecewise-linear interpolation over a breakpoint table.
///
/// Breakpoints may be listed ascending or descending; inputs outside the
/// table clamp to the first/last output. A single-point table returns that
/// point's output everywhere.
///
/// # Arguments
/// * `x` - Input value
/// * `xs` - Breakpoint inputs, monotonic in either direction
/// * `ys` - Breakpoint outputs, same length as `xs`
pub fn interpolate_linear(x: f64, xs: &[f64], ys: &[f64]) -> f64 {
    debug_assert_eq!(xs.len(), ys.len());
    if xs.is_empty() {
        return 0.0;
    }
    if xs.len() == 1 {
        return ys[0];
    }
    let (lo, hi, t) = bracket(x, xs);
    if lo == hi {
        return ys[lo];
    }
    let (yl, yh) = (ys[lo], ys[hi]);
    // interpolate, then constrain to the bracketing outputs
    (yl + t * (yh - yl)).clamp(yl.min(yh), yl.max(yh))
}

/// Step interpolation over a breakpoint table: returns one of the two
/// bracketing outputs unmodified.
///
/// `prefer_lower` selects the output at the upper breakpoint (the
/// conservative direction for tables whose output falls as the input
/// rises); `false` selects the output at the lower breakpoint.
pub fn interpolate_step(x: f64, xs: &[f64], ys: &[f64], prefer_lower: bool) -> f64 {
    debug_assert_eq!(xs.len(), ys.len());
    if xs.is_empty() {
        return 0.0;
    }
    if xs.len() == 1 {
        return ys[0];
    }
    let (lo, hi, _) = bracket(x, xs);
    if lo == hi {
        return ys[lo];
    }
    if prefer_lower {
        ys[hi]
    } else {
        ys[lo]
    }
}

/// Find the indices bracketing `x` after normalizing the table direction.
///
/// Returns `(lo, hi, t)` with `xs[lo] <= x < xs[hi]` in ascending terms and
/// `t` the fractional position between them. Out-of-range inputs return
/// `lo == hi` pointing at the clamped endpoint.
fn bracket(x: f64, xs: &[f64]) -> (usize, usize, f64) {
    let n = xs.len();
    let descending = xs[0] > xs[n - 1];
    // map a logical ascending index to the physical index
    let idx = |i: usize| if descending { n - 1 - i } else { i };

    if x <= xs[idx(0)] {
        return (idx(0), idx(0), 0.0);
    }
    if x >= xs[idx(n - 1)] {
        return (idx(n - 1), idx(n - 1), 0.0);
    }

    // binary search for the last logical index with xs <= x
    let mut lo = 0;
    let mut hi = n - 1;
    while hi - lo > 1 {
        let mid = (lo + hi) / 2;
        if xs[idx(mid)] <= x {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    let (xl, xh) = (xs[idx(lo)], xs[idx(hi)]);
    (idx(lo), idx(hi), (x - xl) / (xh - xl))
}
