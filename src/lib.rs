//! A map-reduce orchestrator that runs on top of Kubernetes.
//!
//! Users submit a `MapReduceJob` resource naming a list of input URIs, a pod
//! template for the workers and a desired parallelism. The operator breaks
//! the job into one map task per input, workers claim tasks through
//! compare-and-swap JSON patches (or through the embedded coordination
//! server), and intermediate data moves through an S3-compatible object
//! store. Workers never talk to each other directly.

use std::hash::Hasher;

pub mod cmd;
pub mod job;
pub mod jsonpatch;
pub mod k8s;
pub mod operator;
pub mod s3;
pub mod worker;
pub mod workload;

/// Hashes an intermediate key. Compute a partition for a given key
/// by calculating `ihash(key) % n_partitions`.
pub fn ihash(key: &[u8]) -> u32 {
    let mut hasher = fnv::FnvHasher::with_key(0);
    hasher.write(key);
    let value = hasher.finish() & 0x7fffffff;
    u32::try_from(value).expect("Failed to compute ihash of value")
}
