//! Time-ordered sequence tokens
//!
//! A hybrid logical clock packed into one atomic: the high 48 bits carry Unix
//! millis, the low 16 bits a counter. Every token handed out is strictly
//! greater than the previous one, even when the wall clock stalls or steps
//! back, so tokens are unique within the process and sort by issue time.

use std::sync::atomic::{AtomicU64, Ordering};

const COUNTER_BITS: u32 = 16;
const COUNTER_MASK: u64 = (1 << COUNTER_BITS) - 1;

/// Generator of unique, approximately time-ordered sequence tokens
#[derive(Debug, Default)]
pub struct SequenceGenerator {
    last: AtomicU64,
}

impl SequenceGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next token, e.g. `0001420070400123-00000`
    pub fn next_token(&self) -> String {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        Self::render(self.next_at(now))
    }

    fn next_at(&self, now_ms: u64) -> u64 {
        let candidate = now_ms << COUNTER_BITS;
        let previous = self
            .last
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |last| {
                Some(if candidate > last { candidate } else { last + 1 })
            })
            .unwrap_or_else(|last| last);
        if candidate > previous {
            candidate
        } else {
            previous + 1
        }
    }

    fn render(packed: u64) -> String {
        format!(
            "{:016}-{:05}",
            packed >> COUNTER_BITS,
            packed & COUNTER_MASK
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_tokens_increase_within_same_millisecond() {
        let generator = SequenceGenerator::new();
        let a = generator.next_at(1_000);
        let b = generator.next_at(1_000);
        let c = generator.next_at(1_000);
        assert!(a < b && b < c);
        assert_eq!(SequenceGenerator::render(a), "0000000000001000-00000");
        assert_eq!(SequenceGenerator::render(c), "0000000000001000-00002");
    }

    #[test]
    fn test_clock_step_back_stays_monotonic() {
        let generator = SequenceGenerator::new();
        let a = generator.next_at(5_000);
        let b = generator.next_at(4_000);
        assert!(b > a);
        let c = generator.next_at(6_000);
        assert_eq!(SequenceGenerator::render(c), "0000000000006000-00000");
    }

    #[test]
    fn test_rendered_tokens_sort_by_issue_order() {
        let generator = SequenceGenerator::new();
        let tokens: Vec<String> = (0..100).map(|_| generator.next_token()).collect();
        let mut sorted = tokens.clone();
        sorted.sort();
        assert_eq!(tokens, sorted);
    }

    #[test]
    fn test_concurrent_tokens_are_unique() {
        let generator = Arc::new(SequenceGenerator::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let generator = generator.clone();
                std::thread::spawn(move || {
                    (0..1_000).map(|_| generator.next_token()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for token in handle.join().unwrap() {
                assert!(seen.insert(token), "duplicate sequence token");
            }
        }
        assert_eq!(seen.len(), 8_000);
    }
}
