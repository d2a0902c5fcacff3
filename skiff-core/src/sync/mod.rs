//! Concurrency primitives shared by the connection components

pub mod single_flight;
pub mod timer;

pub use single_flight::{Flight, SingleFlightLock};
pub use timer::{spawn_periodic, TaskHandle};
