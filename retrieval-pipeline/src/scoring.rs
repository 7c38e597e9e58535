use std::cmp::Ordering;

/// Euclidean norm accumulated in `f64`, so heavily weighted vectors do not
/// overflow while squaring.
pub fn l2_norm(v: &[f32]) -> f64 {
    v.iter()
        .map(|x| {
            let x = f64::from(*x);
            x * x
        })
        .sum::<f64>()
        .sqrt()
}

/// Cosine similarity with both norms supplied by the caller, so norms can be
/// computed once per vector and reused across every pairing.
///
/// Returns 0.0 when either vector has zero norm.
pub fn cosine_with_norms(a: &[f32], b: &[f32], norm_a: f64, norm_b: f64) -> f32 {
    debug_assert_eq!(a.len(), b.len(), "dimension mismatch in cosine");
    let denominator = norm_a * norm_b;
    if denominator == 0.0 || !denominator.is_finite() {
        return 0.0;
    }
    let dot: f64 = a
        .iter()
        .zip(b.iter())
        .map(|(x, y)| f64::from(*x) * f64::from(*y))
        .sum();
    (dot / denominator) as f32
}

/// Descending comparator for scores. NaN compares equal so sorting never panics.
pub fn score_desc(a: f32, b: f32) -> Ordering {
    b.partial_cmp(&a).unwrap_or(Ordering::Equal)
}
