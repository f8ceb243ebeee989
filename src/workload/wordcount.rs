//! Word count, the canonical map-reduce demo.
//!
//! Map treats its input as an HTTP URL, tokenizes the body and spreads
//! `word\t1` lines across partition files by hash. Reduce merges its
//! partition's files, sorts, folds runs of equal words into counts and
//! uploads one `word\tcount` file.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use async_trait::async_trait;
use uuid::Uuid;

use crate::ihash;
use crate::worker::{kvgroup, JobWorker, Utilities};

/// Partitions each map fans its words into. Every map of a job must use
/// the same count or the reduce tables will not line up.
const PARTITIONS: u32 = 5;

pub struct WordCount {
    partitions: u32,
}

impl Default for WordCount {
    fn default() -> Self {
        Self {
            partitions: PARTITIONS,
        }
    }
}

impl WordCount {
    pub fn with_partitions(partitions: u32) -> Self {
        Self { partitions }
    }
}

/// Buckets the words of `text` into per-partition `word\t1` line blobs.
/// Every partition is present even when empty, so all maps emit the same
/// partition set.
fn bucket_words(text: &str, partitions: u32) -> BTreeMap<u32, String> {
    let mut buckets: BTreeMap<u32, String> =
        (0..partitions).map(|p| (p, String::new())).collect();
    for word in text
        .split(|c: char| !c.is_alphabetic())
        .filter(|w| !w.is_empty())
    {
        let word = word.to_lowercase();
        let partition = ihash(word.as_bytes()) % partitions;
        let bucket = buckets.entry(partition).or_default();
        bucket.push_str(&word);
        bucket.push_str("\t1\n");
    }
    buckets
}

/// Folds sorted `word\tcount` lines into one total per word.
fn fold_counts(mut lines: Vec<String>) -> String {
    lines.sort_unstable();
    let mut out = String::new();
    for (word, counts) in kvgroup::group_sorted(lines, '\t') {
        let total: u64 = counts.iter().filter_map(|c| c.parse::<u64>().ok()).sum();
        out.push_str(&word);
        out.push('\t');
        out.push_str(&total.to_string());
        out.push('\n');
    }
    out
}

fn scratch_file() -> PathBuf {
    std::env::temp_dir().join(format!("kubemr-{}", Uuid::new_v4()))
}

#[async_trait]
impl JobWorker for WordCount {
    async fn map(
        &self,
        id: usize,
        input: &str,
        utils: &Utilities,
    ) -> Result<BTreeMap<u32, String>> {
        let body = reqwest::get(input)
            .await
            .with_context(|| format!("fetching {input}"))?
            .error_for_status()?
            .text()
            .await?;
        let mut outputs = BTreeMap::new();
        for (partition, content) in bucket_words(&body, self.partitions) {
            let path = scratch_file();
            tokio::fs::write(&path, content).await?;
            let upload = utils.upload(&format!("map/{id}-{partition}.txt"), &path).await;
            let _ = tokio::fs::remove_file(&path).await;
            outputs.insert(partition, upload?);
        }
        Ok(outputs)
    }

    async fn reduce(&self, id: u32, inputs: &[String], utils: &Utilities) -> Result<String> {
        let mut lines = Vec::new();
        for input in inputs {
            let body: bytes::Bytes = utils.get(input).await?.collect().await?.into_bytes();
            let text =
                String::from_utf8(body.to_vec()).context("map output is not valid utf-8")?;
            lines.extend(text.lines().map(str::to_string));
        }
        let folded = fold_counts(lines);
        let path = scratch_file();
        tokio::fs::write(&path, folded).await?;
        let upload = utils.upload(&format!("reduce/{id}.txt"), &path).await;
        let _ = tokio::fs::remove_file(&path).await;
        upload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_partition_is_emitted() {
        let buckets = bucket_words("one tiny input", 5);
        assert_eq!(buckets.len(), 5);
    }

    #[test]
    fn words_are_normalized_and_counted_once_per_occurrence() {
        let buckets = bucket_words("Word word WORD", 1);
        assert_eq!(buckets[&0], "word\t1\nword\t1\nword\t1\n");
    }

    #[test]
    fn same_word_always_lands_in_the_same_partition() {
        let a = bucket_words("kubernetes", 5);
        let b = bucket_words("kubernetes kubernetes", 5);
        let pa = a.iter().find(|(_, v)| !v.is_empty()).unwrap().0;
        let pb = b.iter().find(|(_, v)| !v.is_empty()).unwrap().0;
        assert_eq!(pa, pb);
    }

    #[test]
    fn fold_sums_across_inputs() {
        let lines = vec![
            "b\t1".to_string(),
            "a\t1".to_string(),
            "a\t1".to_string(),
            "a\t1".to_string(),
        ];
        assert_eq!(fold_counts(lines), "a\t3\nb\t1\n");
    }

    #[test]
    fn fold_of_nothing_is_empty() {
        assert_eq!(fold_counts(Vec::new()), "");
    }
}
