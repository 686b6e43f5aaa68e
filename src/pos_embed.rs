use ndarray::{Array2, Axis, s};
use tracing::info;

use crate::errors::{ModelError, Result};

/// Side length of a square grid holding `tokens` positions
pub fn grid_side(tokens: usize) -> Result<usize> {
    let side = (tokens as f64).sqrt().round() as usize;
    if tokens == 0 || side * side != tokens {
        return Err(ModelError::NonSquareGrid { tokens });
    }
    Ok(side)
}

/// Source coordinate of output index `o` when resizing `old -> new` samples
/// with the end points aligned
fn source_coordinate(o: usize, old: usize, new: usize) -> (usize, usize, f32) {
    if new <= 1 || old <= 1 {
        return (0, 0, 0.0);
    }
    let coord = o as f64 * (old - 1) as f64 / (new - 1) as f64;
    let lo = (coord.floor() as usize).min(old - 1);
    let hi = (lo + 1).min(old - 1);
    (lo, hi, (coord - lo as f64) as f32)
}

/// Resize a `[tokens, hidden]` position embedding table to `target_tokens`.
///
/// The optional class-token row is copied verbatim; the remaining rows are
/// treated as a square grid and resampled with order-1 (bilinear) spline
/// interpolation, corners aligned. Both the old and the new grid must be
/// square.
pub fn resize_position_embedding(
    posemb: &Array2<f32>,
    target_tokens: usize,
    has_class_token: bool,
) -> Result<Array2<f32>> {
    let (old_tokens, hidden) = posemb.dim();
    let extra = usize::from(has_class_token);
    if old_tokens < extra || target_tokens < extra {
        return Err(ModelError::shape_mismatch(
            "position embedding tokens",
            format!(">= {}", extra),
            (old_tokens, target_tokens),
        ));
    }

    let gs_old = grid_side(old_tokens - extra)?;
    let gs_new = grid_side(target_tokens - extra)?;
    info!(gs_old, gs_new, hidden, "resizing position embedding grid");

    let grid = posemb.slice(s![extra.., ..]);
    let grid = grid.to_shape((gs_old, gs_old, hidden))?;

    let mut resized = Array2::<f32>::zeros((target_tokens, hidden));
    if has_class_token {
        resized.row_mut(0).assign(&posemb.row(0));
    }

    for i in 0..gs_new {
        let (y0, y1, fy) = source_coordinate(i, gs_old, gs_new);
        for j in 0..gs_new {
            let (x0, x1, fx) = source_coordinate(j, gs_old, gs_new);
            let top = &grid.slice(s![y0, x0, ..]) * (1.0 - fx) + &grid.slice(s![y0, x1, ..]) * fx;
            let bottom =
                &grid.slice(s![y1, x0, ..]) * (1.0 - fx) + &grid.slice(s![y1, x1, ..]) * fx;
            resized
                .index_axis_mut(Axis(0), extra + i * gs_new + j)
                .assign(&(top * (1.0 - fy) + bottom * fy));
        }
    }

    Ok(resized)
}
