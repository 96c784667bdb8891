//! Small statistics helpers for cross-sectional factor blending.

/// Standard deviations at or below this are treated as zero variance.
pub const MIN_STD_THRESHOLD: f64 = 1e-10;

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Sample standard deviation (N-1 denominator). `None` for fewer than 2 values.
pub fn sample_std(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let m = mean(values)?;
    let var = values.iter().map(|x| (x - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    Some(var.sqrt())
}

/// Z-scores, or `None` when the input has no usable variance.
pub fn zscores(values: &[f64]) -> Option<Vec<f64>> {
    if values.iter().any(|v| !v.is_finite()) {
        return None;
    }
    let m = mean(values)?;
    let sd = sample_std(values)?;
    if sd <= MIN_STD_THRESHOLD {
        return None;
    }
    Some(values.iter().map(|x| (x - m) / sd).collect())
}
