//! Small numeric helpers for window features.

/// Arithmetic mean, 0.0 for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Nearest-rank percentile of an ascending-sorted slice; `p` in [0, 1].
///
/// Returns 0.0 for an empty slice.
pub fn percentile(sorted: &[f64], p: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let p = p.clamp(0.0, 1.0);
    let rank = (p * sorted.len() as f64).ceil() as usize;
    sorted[rank.saturating_sub(1).min(sorted.len() - 1)]
}

/// Sort latencies ascending; NaN samples are discarded.
pub fn sorted_samples(mut values: Vec<f64>) -> Vec<f64> {
    values.retain(|v| !v.is_nan());
    values.sort_by(f64::total_cmp);
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean() {
        assert_eq!(mean(&[]), 0.0);
        assert_eq!(mean(&[1.0, 2.0, 3.0, 4.0, 5.0]), 3.0);
    }

    #[test]
    fn test_percentile_nearest_rank() {
        let values = sorted_samples((1..=100).map(|v| v as f64).collect());
        assert_eq!(percentile(&values, 0.50), 50.0);
        assert_eq!(percentile(&values, 0.95), 95.0);
        assert_eq!(percentile(&values, 1.0), 100.0);
        assert_eq!(percentile(&values, 0.0), 1.0);
    }

    #[test]
    fn test_percentile_small_sets() {
        assert_eq!(percentile(&[], 0.5), 0.0);
        assert_eq!(percentile(&[7.0], 0.95), 7.0);
        assert_eq!(percentile(&[1.0, 9.0], 0.5), 1.0);
        assert_eq!(percentile(&[1.0, 9.0], 0.95), 9.0);
    }

    #[test]
    fn test_nan_discarded() {
        let v = sorted_samples(vec![3.0, f64::NAN, 1.0]);
        assert_eq!(v, vec![1.0, 3.0]);
    }
}
