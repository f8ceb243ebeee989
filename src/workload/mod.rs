//! Converts workload names to worker implementations.
//!
//! Worker images usually hard-wire a single workload, but keeping them
//! behind names lets one image serve several jobs.

use anyhow::{bail, Result};

use crate::worker::JobWorker;

pub mod wordcount;

/// Gets the workload named `name`.
///
/// Returns [`None`] if no workload with the given name was found.
pub fn try_named(name: &str) -> Option<Box<dyn JobWorker>> {
    match name {
        "wordcount" => Some(Box::new(wordcount::WordCount::default())),
        _ => None,
    }
}

/// Gets the workload named `name`, or an error naming the miss.
pub fn named(name: &str) -> Result<Box<dyn JobWorker>> {
    match try_named(name) {
        Some(worker) => Ok(worker),
        None => bail!("No workload named `{}` found.", name),
    }
}
