//! Worker process: wires storage, cache, handlers and timers around one scheduler.

pub mod services;
