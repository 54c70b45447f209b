//! Register allocation: spilling, live-range splitting, copy insertion,
//! coloring, coalescing and phi lowering.

pub mod coalescing;
pub mod coloring;
pub mod copy_insertion;
pub mod interference;
pub mod phi_lowering;
pub mod register_set;
pub mod spilling;
pub mod split;

pub use self::register_set::RegisterSet;
