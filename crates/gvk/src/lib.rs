//! Tollgate GVK bookkeeping: which kinds sources require, and which kinds are watched.

#![forbid(unsafe_code)]

pub mod aggregator;
pub mod watch_set;

pub use aggregator::{AggregatorError, GvkAggregator};
pub use watch_set::{Transition, WatchSet};
