//! Ordered JSON-patch documents used for compare-and-swap updates.
//!
//! Every concurrent mutation in the system goes through one of these: a
//! sequence of RFC 6902 operations, usually opening with one or more `test`
//! ops. The API server evaluates the whole document atomically, so a failed
//! `test` aborts the mutation and the caller knows it lost the race.

use anyhow::Result;
use serde::Serialize;
use serde_json::Value;

/// A single item in a [`Patch`].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PatchItem {
    pub op: &'static str,
    pub path: String,
    pub value: Value,
}

/// An ordered list of JSON-patch operations.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(transparent)]
pub struct Patch(Vec<PatchItem>);

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(mut self, op: &'static str, path: impl Into<String>, value: Value) -> Self {
        self.0.push(PatchItem {
            op,
            path: path.into(),
            value,
        });
        self
    }

    /// Guard: the document must hold `value` at `path`, else the whole
    /// patch is rejected.
    pub fn test(self, path: impl Into<String>, value: Value) -> Self {
        self.push("test", path, value)
    }

    pub fn add(self, path: impl Into<String>, value: Value) -> Self {
        self.push("add", path, value)
    }

    pub fn replace(self, path: impl Into<String>, value: Value) -> Self {
        self.push("replace", path, value)
    }

    pub fn remove(self, path: impl Into<String>) -> Self {
        self.push("remove", path, Value::Null)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Converts into an RFC 6902 document type, typically the one
    /// `kube::api::Patch::Json` wraps or a patch applier's input.
    pub fn build<T: serde::de::DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(serde_json::to_value(self)?)?)
    }
}
