//! Message dispatch engine.
//!
//! Per queue, a lease loop pulls batches from the backend into a bounded
//! work channel. A fixed pool of workers takes messages off the channel,
//! runs the registered handler and resolves each lease as ack, retry or
//! dead-letter.

pub mod dispatcher;
mod worker;

pub use dispatcher::{Dispatcher, DispatcherBuilder, Health, RunStats};
