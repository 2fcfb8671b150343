//! Small self-contained helpers

pub mod clock;
pub mod interval;
pub mod sigaction;

pub use clock::TickClock;
pub use interval::IntervalSplitter;
pub use sigaction::SigAction;
