//! Millisecond tick counter since profiler start

use rtprof_shared::Ticks;
use std::time::Instant;

#[derive(Debug, Clone, Copy)]
pub struct TickClock {
    origin: Instant,
}

impl TickClock {
    pub fn start() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    /// Milliseconds since start; wraps after about 49 days
    pub fn ticks(&self) -> Ticks {
        self.origin.elapsed().as_millis() as Ticks
    }
}

impl Default for TickClock {
    fn default() -> Self {
        Self::start()
    }
}
