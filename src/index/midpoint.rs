// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::entry::IndexKey;

/// A cached entry of a table, used to narrow down binary searches
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Midpoint {
    /// Key of the entry
    pub key: IndexKey,

    /// Index of the entry in the table
    pub index: u64,
}

/// Amount of midpoints cached for a table of `entry_count` entries
#[must_use]
pub fn required_midpoint_count(entry_count: u64, depth: u32) -> u64 {
    if entry_count == 0 {
        return 0;
    }

    if entry_count == 1 {
        return 2;
    }

    (1u64 << depth.min(62)).min(entry_count).max(2)
}

/// Yields evenly spaced entry indices for midpoints
///
/// The `k`-th index is `floor(k * (n - 1) / (m - 1))`, computed incrementally
/// so no intermediate product can overflow. The first index is always 0 and the
/// last one is always `n - 1`.
///
/// A single entry yields `[0, 0]`. The midpoint count is clamped to
/// `[2, n]` otherwise, so indices are strictly increasing.
#[derive(Clone, Debug)]
#[allow(clippy::module_name_repetitions)]
pub struct MidpointIndexCalculator {
    remaining: u64,
    current: u64,
    quotient: u64,
    remainder: u64,
    divisor: u64,
    carry: u64,
    is_first: bool,
}

impl MidpointIndexCalculator {
    /// Creates a calculator for `entry_count` entries and `midpoint_count` midpoints
    #[must_use]
    pub fn new(entry_count: u64, midpoint_count: u64) -> Self {
        let midpoint_count = match entry_count {
            0 => 0,
            _ if midpoint_count == 0 => 0,
            1 => 2,
            n => midpoint_count.clamp(2, n),
        };

        let span = entry_count.saturating_sub(1);
        let divisor = midpoint_count.saturating_sub(1).max(1);

        Self {
            remaining: midpoint_count,
            current: 0,
            quotient: span / divisor,
            remainder: span % divisor,
            divisor,
            carry: 0,
            is_first: true,
        }
    }
}

impl Iterator for MidpointIndexCalculator {
    type Item = u64;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        if self.is_first {
            self.is_first = false;
            return Some(0);
        }

        self.current += self.quotient;
        self.carry += self.remainder;

        if self.carry >= self.divisor {
            self.carry -= self.divisor;
            self.current += 1;
        }

        Some(self.current)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = usize::try_from(self.remaining).unwrap_or(usize::MAX);
        (remaining, Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn midpoints_empty() {
        assert_eq!(0, MidpointIndexCalculator::new(0, 10).count());
        assert_eq!(0, MidpointIndexCalculator::new(10, 0).count());
    }

    #[test]
    fn midpoints_single_entry() {
        assert_eq!(
            vec![0, 0],
            MidpointIndexCalculator::new(1, 2).collect::<Vec<_>>()
        );
        assert_eq!(
            vec![0, 0],
            MidpointIndexCalculator::new(1, 100).collect::<Vec<_>>()
        );
    }

    #[test]
    fn midpoints_span_all_entries() {
        assert_eq!(
            vec![0, 9],
            MidpointIndexCalculator::new(10, 2).collect::<Vec<_>>()
        );
        assert_eq!(
            vec![0, 4, 9],
            MidpointIndexCalculator::new(10, 3).collect::<Vec<_>>()
        );
        assert_eq!(
            (0..10).collect::<Vec<_>>(),
            MidpointIndexCalculator::new(10, 10).collect::<Vec<_>>()
        );

        // More midpoints than entries
        assert_eq!(
            (0..5).collect::<Vec<_>>(),
            MidpointIndexCalculator::new(5, 1_000).collect::<Vec<_>>()
        );
    }

    #[test]
    fn midpoints_match_formula() {
        for n in 2..200u64 {
            for m in 2..=n.min(40) {
                let expected = (0..m).map(|k| k * (n - 1) / (m - 1)).collect::<Vec<_>>();
                let actual = MidpointIndexCalculator::new(n, m).collect::<Vec<_>>();
                assert_eq!(expected, actual, "n={n}, m={m}");
            }
        }
    }

    #[test]
    fn midpoints_huge_table() {
        let n = 46_000_000_000;
        let m = 1 << 28;

        let mut calculator = MidpointIndexCalculator::new(n, m);
        assert_eq!((m as usize, Some(m as usize)), calculator.size_hint());
        assert_eq!(Some(0), calculator.next());

        let mut last = 0;
        let mut second_last = 0;
        let mut count = 1;

        for index in calculator {
            assert!(index > last);
            second_last = last;
            last = index;
            count += 1;
        }

        assert_eq!(m, count);
        assert_eq!(45_999_999_827, second_last);
        assert_eq!(45_999_999_999, last);
    }

    #[test]
    fn midpoint_count() {
        assert_eq!(0, required_midpoint_count(0, 16));
        assert_eq!(2, required_midpoint_count(1, 16));
        assert_eq!(2, required_midpoint_count(2, 0));
        assert_eq!(100, required_midpoint_count(100, 16));
        assert_eq!(65_536, required_midpoint_count(1_000_000, 16));
    }
}
