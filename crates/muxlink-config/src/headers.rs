//! Ordered, case-preserving header container.

use serde::{Deserialize, Serialize};

/// How incoming entries combine with existing ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderMerge {
    /// Drop everything, then take the incoming entries.
    Replace,
    /// Replace buckets whose lowercase key matches, keep the rest.
    #[default]
    Patch,
    /// Append incoming entries, skipping exact duplicates.
    Append,
}

impl HeaderMerge {
    pub fn from_level(level: u8) -> Self {
        match level {
            0 => HeaderMerge::Replace,
            2 => HeaderMerge::Append,
            _ => HeaderMerge::Patch,
        }
    }
}

/// Header multimap: buckets keyed by lowercase name, each bucket an ordered
/// list of original-case (name, value) pairs. Bucket order and in-bucket
/// order both follow insertion.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Headers {
    buckets: Vec<(String, Vec<(String, String)>)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries<I, N, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: Into<String>,
    {
        let mut headers = Self::new();
        for (name, value) in entries {
            headers.append(name.into(), value.into());
        }
        headers
    }

    fn bucket_mut(&mut self, key: &str) -> &mut Vec<(String, String)> {
        if let Some(at) = self.buckets.iter().position(|(k, _)| k == key) {
            return &mut self.buckets[at].1;
        }
        self.buckets.push((key.to_string(), Vec::new()));
        let last = self.buckets.len() - 1;
        &mut self.buckets[last].1
    }

    /// Append one entry, preserving the original case of `name`.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        let key = name.to_ascii_lowercase();
        self.bucket_mut(&key).push((name, value));
    }

    /// Replace the bucket for `name` with a single entry.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        let key = name.to_ascii_lowercase();
        let bucket = self.bucket_mut(&key);
        bucket.clear();
        bucket.push((name, value));
    }

    /// Entries under the lowercase form of `name`, in insertion order.
    pub fn get(&self, name: &str) -> Option<&[(String, String)]> {
        let key = name.to_ascii_lowercase();
        self.buckets
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, bucket)| bucket.as_slice())
    }

    /// First value under the lowercase form of `name`.
    pub fn get_first(&self, name: &str) -> Option<&str> {
        self.get(name)
            .and_then(|bucket| bucket.first())
            .map(|(_, value)| value.as_str())
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn remove(&mut self, name: &str) {
        let key = name.to_ascii_lowercase();
        self.buckets.retain(|(k, _)| *k != key);
    }

    /// All entries flattened in bucket-then-insertion order.
    pub fn entries(&self) -> Vec<(String, String)> {
        self.buckets
            .iter()
            .flat_map(|(_, bucket)| bucket.iter().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(|(_, bucket)| bucket.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Merge `entries` into this container under the given mode.
    pub fn extend<I, N, V>(&mut self, entries: I, mode: HeaderMerge)
    where
        I: IntoIterator<Item = (N, V)>,
        N: Into<String>,
        V: Into<String>,
    {
        match mode {
            HeaderMerge::Replace => {
                self.buckets.clear();
                for (name, value) in entries {
                    self.append(name.into(), value.into());
                }
            }
            HeaderMerge::Patch => {
                let incoming = Self::from_entries(entries);
                for (key, bucket) in incoming.buckets {
                    if let Some(at) = self.buckets.iter().position(|(k, _)| *k == key) {
                        self.buckets[at].1 = bucket;
                    } else {
                        self.buckets.push((key, bucket));
                    }
                }
            }
            HeaderMerge::Append => {
                for (name, value) in entries {
                    let name = name.into();
                    let value = value.into();
                    let key = name.to_ascii_lowercase();
                    let bucket = self.bucket_mut(&key);
                    if !bucket.iter().any(|(n, v)| *n == name && *v == value) {
                        bucket.push((name, value));
                    }
                }
            }
        }
    }
}
