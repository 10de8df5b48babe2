use std::cmp::Ordering;

pub mod metrics;
pub mod validation;

pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Descending score, ties broken by ascending index.
pub fn score_order(a: &(u32, f32), b: &(u32, f32)) -> Ordering {
    b.1.total_cmp(&a.1).then(a.0.cmp(&b.0))
}

/// The `k` best `(index, score)` pairs in [`score_order`].
pub fn top_k(mut scored: Vec<(u32, f32)>, k: usize) -> Vec<(u32, f32)> {
    if k == 0 {
        return Vec::new();
    }
    if scored.len() > k {
        scored.select_nth_unstable_by(k - 1, score_order);
        scored.truncate(k);
    }
    scored.sort_unstable_by(score_order);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dot_and_sigmoid() {
        assert_eq!(dot(&[1.0, 2.0], &[3.0, 4.0]), 11.0);
        assert!((sigmoid(0.0) - 0.5).abs() < 1e-7);
        assert!(sigmoid(40.0) <= 1.0);
    }

    #[test]
    fn test_top_k_ties_by_index() {
        let scored = vec![(4, 0.5), (2, 0.9), (3, 0.5), (1, 0.1), (5, 0.9)];
        assert_eq!(top_k(scored.clone(), 3), vec![(2, 0.9), (5, 0.9), (3, 0.5)]);
        assert_eq!(top_k(scored.clone(), 10).len(), 5);
        assert!(top_k(scored, 0).is_empty());
    }
}
