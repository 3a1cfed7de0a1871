// ---------------------------------------------------------------------------
// Cheap randomness based on std, avoids pulling in the `rand` crate.
// Uses a simple xorshift seeded from the current time; fine for jitter and
// picking a user agent, not for anything security related.
// ---------------------------------------------------------------------------

use std::sync::atomic::{AtomicU64, Ordering};

static STATE: AtomicU64 = AtomicU64::new(0);

/// Next pseudo-random value.
pub fn random_u64() -> u64 {
    let mut x = STATE.load(Ordering::Relaxed);
    if x == 0 {
        x = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64
            | 1;
    }
    // xorshift64
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    STATE.store(x, Ordering::Relaxed);
    x
}

/// Uniform-ish value in `[0, max)`; 0 when `max` is 0.
pub fn random_below(max: u64) -> u64 {
    if max == 0 {
        return 0;
    }
    random_u64() % max
}

/// Pick one element of a non-empty slice.
pub fn pick<T>(items: &[T]) -> Option<&T> {
    let len = items.len() as u64;
    items.get(random_below(len) as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_below_is_bounded() {
        for _ in 0..1000 {
            assert!(random_below(7) < 7);
        }
        assert_eq!(random_below(0), 0);
    }

    #[test]
    fn test_values_change_between_calls() {
        let a = random_u64();
        let b = random_u64();
        assert_ne!(a, b);
    }

    #[test]
    fn test_pick() {
        let empty: [u8; 0] = [];
        assert_eq!(pick(&empty), None);
        let items = ["a", "b", "c"];
        for _ in 0..50 {
            assert!(items.contains(pick(&items).unwrap()));
        }
    }
}
