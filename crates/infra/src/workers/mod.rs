//! Background workers.

pub mod cleanup_sweeper;

pub use cleanup_sweeper::{CleanupSweeper, SweepStats, SweeperHandle};
