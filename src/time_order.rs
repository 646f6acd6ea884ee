//! Epsilon-tolerant time comparisons
//!
//! Timestamps are seconds since the session epoch. Every predicate takes the tolerance
//! explicitly. Two timestamps within `2 * eps` of each other compare `eq`; `lt`/`gt` require a
//! separation of more than `eps`. The pairs (`lt`, `ge`) and (`gt`, `le`) are exact complements,
//! and `lt`/`gt` are transitive.

use std::cmp::Ordering;

#[inline]
pub fn lt(t0: f64, t1: f64, eps: f64) -> bool {
    t0 < t1 - eps
}

#[inline]
pub fn le(t0: f64, t1: f64, eps: f64) -> bool {
    t0 <= t1 + eps
}

#[inline]
pub fn gt(t0: f64, t1: f64, eps: f64) -> bool {
    t0 > t1 + eps
}

#[inline]
pub fn ge(t0: f64, t1: f64, eps: f64) -> bool {
    t0 >= t1 - eps
}

#[inline]
pub fn eq(t0: f64, t1: f64, eps: f64) -> bool {
    (t0 - t1).abs() <= 2.0 * eps
}

#[inline]
pub fn ne(t0: f64, t1: f64, eps: f64) -> bool {
    (t0 - t1).abs() > 2.0 * eps
}

/// True once `newest` is far enough past `t` that no arrival still accepted (i.e. not `lt`
/// `newest`) can compare `eq` to `t`.
#[inline]
pub fn settled(t: f64, newest: f64, eps: f64) -> bool {
    newest - t > 3.0 * eps
}

/// Integer key ordering timestamps the way `f64::total_cmp` does, for use inside `Ord` ranks
#[inline]
pub fn order_key(t: f64) -> i64 {
    let bits = t.to_bits() as i64;
    bits ^ ((((bits >> 63) as u64) >> 1) as i64)
}

/// Sort `items` into deterministic dispatch order.
///
/// Items are first ordered by raw timestamp, then split into groups: a group is a maximal run
/// whose members are all `eq` to the group's first member. Inside a group `rank` decides, so
/// measurements landing within tolerance of one another never depend on arrival timing.
pub fn sort_tolerant<T, K, F, R>(items: &mut [T], eps: f64, time_of: F, rank: R)
where
    F: Fn(&T) -> f64,
    R: Fn(&T) -> K,
    K: Ord,
{
    items.sort_by(|a, b| {
        time_of(a)
            .partial_cmp(&time_of(b))
            .unwrap_or(Ordering::Equal)
    });

    let mut start = 0;
    while start < items.len() {
        let anchor = time_of(&items[start]);
        let mut end = start + 1;
        while end < items.len() && eq(anchor, time_of(&items[end]), eps) {
            end += 1;
        }
        items[start..end].sort_by_key(|item| rank(item));
        start = end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-4;

    #[test]
    fn test_order_key_follows_time() {
        let times = [-1.5, -0.0, 0.0, 0.5, 0.50008, 1e9];
        for w in times.windows(2) {
            assert!(order_key(w[0]) < order_key(w[1]), "{} vs {}", w[0], w[1]);
        }
    }

    #[test]
    fn test_within_two_eps_is_eq() {
        for k in 0..=20 {
            let d = 2.0 * EPS * (k as f64) / 20.0 * 0.999;
            assert!(eq(10.0, 10.0 + d, EPS));
            assert!(eq(10.0 + d, 10.0, EPS));
            assert!(!ne(10.0, 10.0 + d, EPS));
        }
        assert!(ne(10.0, 10.0 + 2.5 * EPS, EPS));
    }

    #[test]
    fn test_complements() {
        let samples = [0.0, 0.5 * EPS, EPS, 1.5 * EPS, 3.0 * EPS, -0.7 * EPS, -4.0 * EPS];
        for &a in &samples {
            for &b in &samples {
                assert_eq!(lt(a, b, EPS), !ge(a, b, EPS));
                assert_eq!(gt(a, b, EPS), !le(a, b, EPS));
                assert_eq!(lt(a, b, EPS), gt(b, a, EPS));
                assert_eq!(le(a, b, EPS), ge(b, a, EPS));
                assert_eq!(eq(a, b, EPS), !ne(a, b, EPS));
            }
        }
    }

    #[test]
    fn test_strict_order_is_transitive() {
        let grid: Vec<f64> = (0..40).map(|i| i as f64 * 0.6 * EPS).collect();
        for &a in &grid {
            for &b in &grid {
                for &c in &grid {
                    if lt(a, b, EPS) && lt(b, c, EPS) {
                        assert!(lt(a, c, EPS));
                    }
                    if gt(a, b, EPS) && gt(b, c, EPS) {
                        assert!(gt(a, c, EPS));
                    }
                    if lt(a, b, EPS) && le(b, c, EPS) {
                        assert!(le(a, c, EPS));
                    }
                }
            }
        }
    }

    #[test]
    fn test_settled_excludes_late_eq_arrivals() {
        let t = 1.0;
        let newest = t + 3.1 * EPS;
        assert!(settled(t, newest, EPS));
        // Earliest arrival still accepted against `newest`
        let arrival = newest - EPS;
        assert!(!lt(arrival, newest, EPS));
        assert!(ne(t, arrival, EPS));
    }

    #[test]
    fn test_sort_tolerant_uses_rank_inside_group() {
        // (time, rank)
        let mut items = vec![(1.0 + 0.5 * EPS, 1u8), (1.0, 2u8), (0.5, 9u8), (1.0 + EPS, 0u8)];
        sort_tolerant(&mut items, EPS, |i| i.0, |i| i.1);
        let ranks: Vec<u8> = items.iter().map(|i| i.1).collect();
        assert_eq!(ranks, vec![9, 0, 1, 2]);
    }
}
