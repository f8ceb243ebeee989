//! Object-store adapter for an S3-compatible backend (AWS or MinIO).
//!
//! All keys live under a configured `bucket` + `prefix`; the adapter never
//! reads or writes outside of them. Fully-qualified URIs use the scheme
//! `s3://<bucket>/<key>` and are validated before any network call.

use std::path::Path;

use anyhow::{bail, Context, Result};
use aws_sdk_s3::config::{BehaviorVersion, Builder, Credentials as S3Credentials, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use futures::{stream, StreamExt};
use tracing::{debug, warn};

use crate::job::{Config, Credentials};

/// Number of concurrent deletions while pruning a prefix.
pub const DELETE_WORKERS: usize = 10;

/// One page of a bucket listing, keys relative to the adapter prefix.
#[derive(Debug, Default)]
pub struct Listing {
    pub keys: Vec<String>,
    pub common_prefixes: Vec<String>,
    pub truncated: bool,
}

#[derive(Clone)]
pub struct ObjectStore {
    client: Client,
    bucket: String,
    prefix: String,
}

impl ObjectStore {
    /// Builds a client for the configured endpoint. `prefix` is the key
    /// prefix this adapter owns (the per-job prefix for workers, the base
    /// prefix for the operator).
    pub fn new(cfg: &Config, creds: &Credentials, prefix: impl Into<String>) -> Self {
        let mut prefix = prefix.into();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        let region = if cfg.s3_region.is_empty() {
            "us-east-1".to_string()
        } else {
            cfg.s3_region.clone()
        };
        let credentials = S3Credentials::new(
            creds.access_key_id.clone(),
            creds.secret_access_key.clone(),
            None,
            None,
            "kubemr",
        );
        let mut builder = Builder::new()
            .region(Region::new(region))
            .credentials_provider(credentials)
            .behavior_version(BehaviorVersion::latest());
        if !cfg.s3_endpoint.is_empty() {
            // MinIO and friends want path-style addressing
            builder = builder.endpoint_url(&cfg.s3_endpoint).force_path_style(true);
        }
        Self {
            client: Client::from_conf(builder.build()),
            bucket: cfg.bucket_name.clone(),
            prefix,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Canonical URI for a key under this adapter's prefix.
    pub fn uri(&self, key: &str) -> String {
        format!("s3://{}/{}{}", self.bucket, self.prefix, key)
    }

    /// Resolves a fully-qualified URI back into a bucket key, rejecting
    /// anything outside `s3://{bucket}/{prefix}`. Performs no I/O.
    pub fn key_for(&self, uri: &str) -> Result<String> {
        let base = format!("s3://{}/{}", self.bucket, self.prefix);
        match uri.strip_prefix(&base) {
            Some(rest) if !rest.is_empty() => Ok(format!("{}{}", self.prefix, rest)),
            _ => bail!("{uri} is not a kubemr managed object belonging to this job"),
        }
    }

    /// Creates the bucket if it is missing. Losing the race to another
    /// creator is fine; anything else (including transport failures)
    /// surfaces as an error.
    pub async fn ensure_bucket(&self) -> Result<()> {
        match self.client.create_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(()),
            Err(err) => {
                let already_there = err.as_service_error().is_some_and(|service| {
                    service.is_bucket_already_owned_by_you() || service.is_bucket_already_exists()
                });
                if already_there {
                    Ok(())
                } else {
                    Err(err.into())
                }
            }
        }
    }

    /// Uploads a local file under `prefix + key` and returns its URI.
    pub async fn upload(&self, key: &str, src: impl AsRef<Path>) -> Result<String> {
        let src = src.as_ref();
        let full_key = format!("{}{}", self.prefix, key);
        let body = ByteStream::from_path(src)
            .await
            .with_context(|| format!("reading {}", src.display()))?;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&full_key)
            .content_type("application/octet-stream")
            .body(body)
            .send()
            .await
            .with_context(|| format!("uploading {full_key}"))?;
        Ok(format!("s3://{}/{}", self.bucket, full_key))
    }

    /// Streams the object behind a URI owned by this adapter.
    pub async fn get(&self, uri: &str) -> Result<ByteStream> {
        let key = self.key_for(uri)?;
        let obj = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .with_context(|| format!("fetching {uri}"))?;
        Ok(obj.body)
    }

    /// Lists the first page of keys under `prefix + suffix`.
    pub async fn list(&self, suffix: &str, delimiter: Option<&str>) -> Result<Listing> {
        let (listing, _) = self.list_from(suffix, delimiter, None).await?;
        Ok(listing)
    }

    /// Lists one page starting at `token`, returning the continuation token
    /// when more pages remain.
    pub async fn list_from(
        &self,
        suffix: &str,
        delimiter: Option<&str>,
        token: Option<String>,
    ) -> Result<(Listing, Option<String>)> {
        let mut req = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(format!("{}{}", self.prefix, suffix));
        if let Some(d) = delimiter {
            req = req.delimiter(d);
        }
        if let Some(t) = token {
            req = req.continuation_token(t);
        }
        let resp = req.send().await.context("listing objects")?;
        let strip = |key: String| {
            key.strip_prefix(&self.prefix)
                .map(str::to_string)
                .unwrap_or(key)
        };
        let keys = resp
            .contents
            .unwrap_or_default()
            .into_iter()
            .filter_map(|o| o.key)
            .map(strip)
            .collect();
        let common_prefixes = resp
            .common_prefixes
            .unwrap_or_default()
            .into_iter()
            .filter_map(|p| p.prefix)
            .map(strip)
            .collect();
        let truncated = resp.is_truncated.unwrap_or(false);
        let listing = Listing {
            keys,
            common_prefixes,
            truncated,
        };
        Ok((listing, resp.next_continuation_token))
    }

    /// Deletes a single key under the adapter prefix.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(format!("{}{}", self.prefix, key))
            .send()
            .await
            .with_context(|| format!("deleting {key}"))?;
        Ok(())
    }

    /// Recursively deletes every key under `prefix + suffix` with a bounded
    /// pool of workers. Individual failures are logged and skipped so a
    /// flaky backend cannot wedge garbage collection.
    pub async fn delete_prefix(&self, suffix: &str) -> Result<()> {
        let mut token = None;
        loop {
            let (page, next) = self.list_from(suffix, None, token).await?;
            debug!(suffix, count = page.keys.len(), "pruning object page");
            stream::iter(page.keys)
                .for_each_concurrent(DELETE_WORKERS, |key| async move {
                    if let Err(err) = self.delete(&key).await {
                        warn!("failed to delete {key}: {err:#}");
                    }
                })
                .await;
            match next {
                Some(t) => token = Some(t),
                None => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> ObjectStore {
        let cfg = Config {
            s3_region: "us-east-1".into(),
            s3_endpoint: "http://127.0.0.1:9000".into(),
            bucket_name: "kubemr".into(),
            bucket_prefix: "tmp/".into(),
            job_url: String::new(),
        };
        let creds = Credentials {
            access_key_id: "id".into(),
            secret_access_key: "secret".into(),
        };
        ObjectStore::new(&cfg, &creds, "tmp/wordcount")
    }

    #[test]
    fn prefix_gets_a_trailing_slash() {
        assert_eq!(store().prefix(), "tmp/wordcount/");
    }

    #[test]
    fn uri_and_key_round_trip() {
        let s = store();
        let uri = s.uri("map/0-1.txt");
        assert_eq!(uri, "s3://kubemr/tmp/wordcount/map/0-1.txt");
        assert_eq!(s.key_for(&uri).unwrap(), "tmp/wordcount/map/0-1.txt");
    }

    #[test]
    fn foreign_uris_are_rejected_without_io() {
        let s = store();
        // wrong bucket
        assert!(s.key_for("s3://other/tmp/wordcount/map/0-1.txt").is_err());
        // right bucket, wrong prefix
        assert!(s.key_for("s3://kubemr/elsewhere/map/0-1.txt").is_err());
        // bare base with no key
        assert!(s.key_for("s3://kubemr/tmp/wordcount/").is_err());
        // not even a URI
        assert!(s.key_for("map/0-1.txt").is_err());
    }
}
