//! Splitting a time budget into near-equal parts

/// Divides an interval of `length` units into `count` consecutive parts
/// whose sizes differ by at most one and add up to `length` exactly.
#[derive(Debug, Clone, Default)]
pub struct IntervalSplitter {
    length: u64,
    count: u64,
    current: u64,
    index: u64,
}

impl IntervalSplitter {
    pub fn new(length: u64) -> Self {
        Self {
            length,
            ..Self::default()
        }
    }

    pub fn with_count(length: u64, count: u64) -> Self {
        Self {
            length,
            count,
            ..Self::default()
        }
    }

    /// Start a new round of `count` parts
    pub fn reset(&mut self, count: u64) {
        self.count = count;
        self.current = 0;
        self.index = 0;
    }

    /// Start a new round with a different total length
    pub fn reset_with(&mut self, length: u64, count: u64) {
        self.length = length;
        self.reset(count);
    }

    pub fn has_next(&self) -> bool {
        self.index < self.count
    }

    /// Size of the next part; zero once the round is over
    pub fn next_part(&mut self) -> u64 {
        if !self.has_next() {
            return 0;
        }
        self.index += 1;
        let prev = self.current;
        let fraction = self.index as f64 / self.count as f64;
        self.current = (self.length as f64 * fraction).round() as u64;
        self.current - prev
    }
}

impl Iterator for IntervalSplitter {
    type Item = u64;

    fn next(&mut self) -> Option<u64> {
        if self.has_next() {
            Some(self.next_part())
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_even_split() {
        let mut splitter = IntervalSplitter::with_count(1000, 4);
        let parts: Vec<u64> = splitter.by_ref().collect();
        assert_eq!(parts, vec![250, 250, 250, 250]);
        assert!(!splitter.has_next());
    }

    #[test]
    fn test_parts_sum_to_length() {
        for (length, count) in [(10, 3), (7, 7), (3, 8), (1001, 13), (0, 5)] {
            let splitter = IntervalSplitter::with_count(length, count);
            let parts: Vec<u64> = splitter.collect();
            assert_eq!(parts.len() as u64, count);
            assert_eq!(parts.iter().sum::<u64>(), length);
            let min = parts.iter().min().copied().unwrap_or(0);
            let max = parts.iter().max().copied().unwrap_or(0);
            assert!(max - min <= 1, "{:?}", parts);
        }
    }

    #[test]
    fn test_reset_restarts_round() {
        let mut splitter = IntervalSplitter::new(10);
        assert!(!splitter.has_next());
        assert_eq!(splitter.next_part(), 0);

        splitter.reset(2);
        assert_eq!(splitter.next_part(), 5);
        splitter.reset(3);
        assert_eq!(splitter.by_ref().sum::<u64>(), 10);

        splitter.reset_with(100, 1);
        assert_eq!(splitter.next(), Some(100));
        assert_eq!(splitter.next(), None);
    }
}
