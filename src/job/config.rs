//! Environment configuration shared by the operator, launcher and workers.
//!
//! Everything rides on the `KUBEMR_*` variables the operator stamps into
//! worker pods; the operator itself is configured the same way.

use std::collections::BTreeMap;
use std::env;

use anyhow::{bail, Result};
use k8s_openapi::api::core::v1::EnvVar;

/// Object-store wiring plus the coordination URL (in-process mode only).
/// Not passed to user code.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// S3 region for intermediate objects
    pub s3_region: String,
    /// Overrides the region endpoint (MinIO etc.)
    pub s3_endpoint: String,
    /// A pre-existing bucket
    pub bucket_name: String,
    /// Prepended to all keys, to reduce clutter in the bucket root
    pub bucket_prefix: String,
    /// URL of the embedded coordination server; empty in CRD mode
    pub job_url: String,
}

fn getenv(key: &str) -> String {
    env::var(key).unwrap_or_default()
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            s3_region: getenv("KUBEMR_S3_REGION"),
            s3_endpoint: getenv("KUBEMR_S3_ENDPOINT"),
            bucket_name: getenv("KUBEMR_S3_BUCKET_NAME"),
            bucket_prefix: getenv("KUBEMR_S3_BUCKET_PREFIX"),
            job_url: getenv("KUBEMR_JOB_URL"),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.bucket_name.is_empty() {
            bail!("BucketName must be provided");
        }
        if self.s3_region.is_empty() && self.s3_endpoint.is_empty() {
            bail!("One of region or endpoint must be provided");
        }
        Ok(())
    }

    /// The base prefix with a guaranteed trailing slash.
    pub fn base_prefix(&self) -> String {
        let mut prefix = self.bucket_prefix.clone();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        prefix
    }

    /// Key prefix owned by a single job.
    pub fn job_prefix(&self, jobname: &str) -> String {
        format!("{}{}/", self.base_prefix(), jobname)
    }

    /// Environment stamped into worker containers in in-process mode, where
    /// everything travels as plain values and the user's template is
    /// expected to carry the credentials itself.
    pub fn pod_env(&self, job_name: &str, namespace: &str) -> Vec<EnvVar> {
        let var = |name: &str, value: &str| EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            value_from: None,
        };
        vec![
            var("KUBEMR_JOB_NAME", job_name),
            var("KUBEMR_JOB_NAMESPACE", namespace),
            var("KUBEMR_JOB_URL", &self.job_url),
            var("KUBEMR_S3_REGION", &self.s3_region),
            var("KUBEMR_S3_ENDPOINT", &self.s3_endpoint),
            var("KUBEMR_S3_BUCKET_NAME", &self.bucket_name),
            var("KUBEMR_S3_BUCKET_PREFIX", &self.bucket_prefix),
        ]
    }

    /// Data for the per-namespace `kubemr` configmap.
    pub fn configmap_data(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("s3region".to_string(), self.s3_region.clone()),
            ("s3endpoint".to_string(), self.s3_endpoint.clone()),
            ("bucketname".to_string(), self.bucket_name.clone()),
            ("bucketprefix".to_string(), self.bucket_prefix.clone()),
        ])
    }
}

/// Object-store credentials, kept apart from [`Config`] so they only ever
/// travel through the `kubemr` secret.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl Credentials {
    pub fn from_env() -> Self {
        Self {
            access_key_id: getenv("KUBEMR_S3_ACCESS_KEY_ID"),
            secret_access_key: getenv("KUBEMR_S3_SECRET_ACCESS_KEY"),
        }
    }

    /// Data for the per-namespace `kubemr` secret.
    pub fn secret_data(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("S3_ACCESS_KEY_ID".to_string(), self.access_key_id.clone()),
            (
                "S3_SECRET_ACCESS_KEY".to_string(),
                self.secret_access_key.clone(),
            ),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_prefix_normalizes_the_slash() {
        let cfg = Config {
            bucket_prefix: "kubemr".into(),
            ..Default::default()
        };
        assert_eq!(cfg.job_prefix("wordcount"), "kubemr/wordcount/");
        let cfg = Config {
            bucket_prefix: "kubemr/".into(),
            ..Default::default()
        };
        assert_eq!(cfg.job_prefix("wordcount"), "kubemr/wordcount/");
    }

    #[test]
    fn validation_needs_a_bucket() {
        let cfg = Config {
            s3_region: "us-east-1".into(),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
