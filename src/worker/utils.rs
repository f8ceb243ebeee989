//! The capability set handed to user map/reduce code.
//!
//! Deliberately tiny: user code can upload a local file into the job's
//! object prefix and read back URIs the job produced. Nothing else.

use std::path::Path;

use anyhow::Result;
use aws_sdk_s3::primitives::ByteStream;

use crate::s3::ObjectStore;

pub struct Utilities {
    store: ObjectStore,
}

impl Utilities {
    pub fn new(store: ObjectStore) -> Self {
        Self { store }
    }

    /// Uploads the file at `src` under the job's prefix and returns the
    /// fully-qualified URI to hand back as a task output.
    pub async fn upload(&self, key: &str, src: impl AsRef<Path>) -> Result<String> {
        self.store.upload(key, src).await
    }

    /// Streams an object previously produced by this job. URIs outside the
    /// job's bucket and prefix are rejected before any network traffic.
    pub async fn get(&self, uri: &str) -> Result<ByteStream> {
        self.store.get(uri).await
    }
}
