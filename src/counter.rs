/// Counts the payload bytes exchanged with a single peer.
///
/// Besides the running total, the counter keeps a tumbling per-window tally
/// that the preferred-neighbor scheduler uses to rank neighbors by their
/// download contribution: the scheduler reads the window at each tick and
/// then resets it, so the window always covers the time since the previous
/// tick.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct Counter {
    total: u64,
    window: u64,
}

impl Counter {
    /// Records the given number of transferred bytes.
    pub fn record(&mut self, bytes: u64) {
        self.total += bytes;
        self.window += bytes;
    }

    /// The bytes recorded since the counter was created.
    pub fn total(&self) -> u64 {
        self.total
    }

    /// The bytes recorded since the last window reset.
    pub fn window(&self) -> u64 {
        self.window
    }

    /// Starts a new window. The total is unaffected.
    pub fn reset_window(&mut self) {
        self.window = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_tumbles_independently_of_total() {
        let mut counter = Counter::default();
        counter.record(100);
        counter.record(50);
        assert_eq!(counter.total(), 150);
        assert_eq!(counter.window(), 150);

        counter.reset_window();
        assert_eq!(counter.total(), 150);
        assert_eq!(counter.window(), 0);

        counter.record(8);
        assert_eq!(counter.total(), 158);
        assert_eq!(counter.window(), 8);
    }
}
